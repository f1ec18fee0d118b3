use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;

use crate::model::OccupancyCountRow;
use crate::store::{HistoryStore, StorageError};

/// How often a spot has been seen occupied, and where it is.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OccupancyCount {
    pub times_occupied: u64,
    pub longitude: Option<f64>,
    pub latitude: Option<f64>,
}

impl From<&OccupancyCountRow> for OccupancyCount {
    fn from(row: &OccupancyCountRow) -> Self {
        Self {
            times_occupied: row.times_occupied,
            longitude: row.coordinates.map(|c| c.longitude),
            latitude: row.coordinates.map(|c| c.latitude),
        }
    }
}

/// Read-side reporting over the history store.
pub struct Aggregator {
    store: Arc<dyn HistoryStore>,
}

impl Aggregator {
    pub fn new(store: Arc<dyn HistoryStore>) -> Self {
        Self { store }
    }

    /// Occupied-record count per spot name, for every registered spot.
    pub async fn occupancy_counts(&self) -> Result<BTreeMap<String, OccupancyCount>, StorageError> {
        let rows = self.store.aggregate_occupancy_counts().await?;
        Ok(rows
            .iter()
            .map(|row| (row.name.clone(), OccupancyCount::from(row)))
            .collect())
    }
}
