use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use serde::Deserialize;
use ulid::Ulid;

use crate::model::*;

use super::{SpotDirectory, StorageError, Store};

/// One entry of the spots seed file.
#[derive(Debug, Clone, Deserialize)]
pub struct SpotSeed {
    pub name: String,
    pub longitude: Option<f64>,
    pub latitude: Option<f64>,
}

impl SpotSeed {
    fn coordinates(&self) -> Option<Coordinates> {
        match (self.longitude, self.latitude) {
            (Some(longitude), Some(latitude)) => Some(Coordinates { longitude, latitude }),
            _ => None,
        }
    }
}

impl Store {
    pub async fn register_spot(
        &self,
        name: &str,
        coordinates: Option<Coordinates>,
    ) -> Result<Spot, StorageError> {
        let id = Ulid::new();
        match self.names.entry(name.to_string()) {
            Entry::Occupied(_) => return Err(StorageError::DuplicateSpotName(name.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(id);
            }
        }
        let event = Event::SpotRegistered {
            id,
            name: name.to_string(),
            coordinates,
        };
        if let Err(e) = self.persist_and_apply(event).await {
            self.names.remove(name);
            return Err(e);
        }
        self.spot(&id).ok_or(StorageError::NotFound(id))
    }

    /// Register every seed whose name is not known yet. Returns how many were added.
    pub async fn seed_spots(&self, seeds: &[SpotSeed]) -> Result<usize, StorageError> {
        let mut added = 0;
        for seed in seeds {
            if self.names.contains_key(&seed.name) {
                continue;
            }
            self.register_spot(&seed.name, seed.coordinates()).await?;
            added += 1;
        }
        Ok(added)
    }

    pub fn spot(&self, id: &SpotId) -> Option<Spot> {
        self.spots.get(id).map(|e| e.value().clone())
    }

    pub fn list_spots(&self) -> Vec<Spot> {
        let mut spots: Vec<Spot> = self.spots.iter().map(|e| e.value().clone()).collect();
        spots.sort_by(|a, b| a.name.cmp(&b.name));
        spots
    }
}

#[async_trait]
impl SpotDirectory for Store {
    async fn spot_by_name(&self, name: &str) -> Result<Option<Spot>, StorageError> {
        let Some(id) = self.names.get(name).map(|e| *e.value()) else {
            return Ok(None);
        };
        Ok(self.spot(&id))
    }

    async fn update_occupancy(&self, spot_id: SpotId, occupied: bool) -> Result<(), StorageError> {
        if !self.spots.contains_key(&spot_id) {
            return Err(StorageError::UnknownSpot(spot_id));
        }
        self.persist_and_apply(Event::OccupancyUpdated { spot_id, occupied })
            .await
    }
}
