use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::debug;

use crate::model::*;
use crate::store::{HistoryStore, StorageError};

#[derive(Debug, thiserror::Error)]
#[error("reconciliation failed for spot {spot_id}: {source}")]
pub struct ReconciliationError {
    pub spot_id: SpotId,
    pub source: StorageError,
}

/// Start of the occupied streak that a new reading belongs to.
///
/// Depends only on the previous record: a vacant reading has no streak, an
/// occupied reading after an occupied record continues that streak, anything
/// else starts a new one at `now`.
pub fn next_occupied_since(last: Option<&HistoryRecord>, occupied_now: bool, now: Ms) -> Option<Ms> {
    if !occupied_now {
        return None;
    }
    match last {
        Some(prev) if prev.occupied => prev.occupied_since,
        _ => Some(now),
    }
}

/// Appends one history record per observed reading.
///
/// Read-latest-then-append runs under a per-spot mutex, so overlapping sync
/// cycles can't fork a spot's `occupied_since` chain. Different spots never
/// wait on each other.
pub struct Reconciler {
    store: Arc<dyn HistoryStore>,
    locks: DashMap<SpotId, Arc<Mutex<()>>>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn HistoryStore>) -> Self {
        Self {
            store,
            locks: DashMap::new(),
        }
    }

    fn spot_lock(&self, spot_id: SpotId) -> Arc<Mutex<()>> {
        self.locks.entry(spot_id).or_default().value().clone()
    }

    /// Always appends, even when the reading matches the latest record.
    pub async fn reconcile(
        &self,
        spot_id: SpotId,
        occupied_now: bool,
    ) -> Result<HistoryRecord, ReconciliationError> {
        let lock = self.spot_lock(spot_id);
        let _held = lock.lock().await;

        let last = self
            .store
            .latest(spot_id)
            .await
            .map_err(|source| ReconciliationError { spot_id, source })?;
        // A new streak starts strictly after the record it follows.
        let now = match &last {
            Some(prev) => now_ms().max(prev.updated_at + 1),
            None => now_ms(),
        };
        let occupied_since = next_occupied_since(last.as_ref(), occupied_now, now);
        let record = self
            .store
            .append(spot_id, occupied_now, occupied_since)
            .await
            .map_err(|source| ReconciliationError { spot_id, source })?;

        debug!(
            "spot {spot_id}: occupied={} since={:?}",
            record.occupied, record.occupied_since
        );
        Ok(record)
    }
}
