use async_trait::async_trait;
use ulid::Ulid;

use crate::model::*;

use super::{HistoryStore, SharedHistory, StorageError, Store};

impl Store {
    fn existing_history(&self, spot_id: &SpotId) -> Option<SharedHistory> {
        self.histories.get(spot_id).map(|e| e.value().clone())
    }
}

#[async_trait]
impl HistoryStore for Store {
    async fn append(
        &self,
        spot_id: SpotId,
        occupied: bool,
        occupied_since: Option<Ms>,
    ) -> Result<HistoryRecord, StorageError> {
        if !self.spots.contains_key(&spot_id) {
            return Err(StorageError::UnknownSpot(spot_id));
        }
        let _gate = self.gate.read().await;
        let history = self.history_for(spot_id);
        let mut guard = history.write().await;

        // updated_at is strictly increasing per spot, even within one
        // millisecond, and never precedes the streak start it records.
        let mut updated_at = now_ms().max(occupied_since.unwrap_or(Ms::MIN));
        if let Some(prev) = guard.last() {
            updated_at = updated_at.max(prev.updated_at + 1);
        }
        let record = HistoryRecord::try_from(HistoryRow {
            history_id: Ulid::new(),
            spot_id,
            occupied,
            occupied_since,
            updated_at,
        })?;

        self.wal_append(&Event::HistoryAppended(HistoryRow::from(&record)))
            .await?;
        guard.push(record.clone());
        metrics::counter!(crate::observability::HISTORY_APPENDS_TOTAL).increment(1);
        Ok(record)
    }

    async fn latest(&self, spot_id: SpotId) -> Result<Option<HistoryRecord>, StorageError> {
        let Some(history) = self.existing_history(&spot_id) else {
            return Ok(None);
        };
        let guard = history.read().await;
        Ok(guard.last().cloned())
    }

    async fn all(&self, spot_id: SpotId) -> Result<Option<Vec<HistoryRecord>>, StorageError> {
        let Some(history) = self.existing_history(&spot_id) else {
            return Ok(None);
        };
        let guard = history.read().await;
        if guard.is_empty() {
            return Ok(None);
        }
        Ok(Some(guard.iter().rev().cloned().collect()))
    }

    async fn aggregate_occupancy_counts(&self) -> Result<Vec<OccupancyCountRow>, StorageError> {
        let spots: Vec<(SpotId, String, Option<Coordinates>)> = self
            .spots
            .iter()
            .map(|e| (e.spot_id, e.name.clone(), e.coordinates))
            .collect();

        let mut rows = Vec::with_capacity(spots.len());
        for (spot_id, name, coordinates) in spots {
            let times_occupied = match self.existing_history(&spot_id) {
                Some(history) => history.read().await.iter().filter(|r| r.occupied).count() as u64,
                None => 0,
            };
            rows.push(OccupancyCountRow {
                name,
                times_occupied,
                coordinates,
            });
        }
        rows.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(rows)
    }
}
