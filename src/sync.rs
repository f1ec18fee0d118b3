use std::sync::Arc;
use std::time::Instant;

use tracing::{info, warn};

use crate::notifications::Notifier;
use crate::provider::{FetchError, OccupancyProvider, SpotReading};
use crate::reconcile::{ReconciliationError, Reconciler};
use crate::store::{SpotDirectory, StorageError};

/// Why one reading could not be applied. Never aborts the cycle.
#[derive(Debug, thiserror::Error)]
pub enum SpotSyncError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Reconcile(#[from] ReconciliationError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub readings: usize,
    pub reconciled: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// One pull → reconcile → notify pass over the provider's snapshot.
pub struct Syncer {
    provider: Arc<dyn OccupancyProvider>,
    directory: Arc<dyn SpotDirectory>,
    reconciler: Arc<Reconciler>,
    notifier: Arc<dyn Notifier>,
}

impl Syncer {
    pub fn new(
        provider: Arc<dyn OccupancyProvider>,
        directory: Arc<dyn SpotDirectory>,
        reconciler: Arc<Reconciler>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            provider,
            directory,
            reconciler,
            notifier,
        }
    }

    /// A failed fetch returns before any spot is touched. Failures on single
    /// spots are logged and counted; the rest of the snapshot still applies.
    pub async fn run_cycle(&self) -> Result<SyncReport, FetchError> {
        let started = Instant::now();
        let snapshot = match self.provider.fetch_snapshot().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                metrics::counter!(crate::observability::SYNC_CYCLES_TOTAL, "status" => "fetch_failed")
                    .increment(1);
                return Err(e);
            }
        };

        let mut report = SyncReport::default();
        for (lot, readings) in &snapshot {
            for reading in readings {
                report.readings += 1;
                match self.apply_reading(reading).await {
                    Ok(true) => report.reconciled += 1,
                    Ok(false) => {
                        report.skipped += 1;
                        metrics::counter!(crate::observability::UNKNOWN_SPOTS_TOTAL).increment(1);
                        info!("unknown spot {} in lot {lot}, skipping", reading.name);
                    }
                    Err(e) => {
                        report.failed += 1;
                        metrics::counter!(crate::observability::RECONCILE_FAILURES_TOTAL).increment(1);
                        warn!("spot {} in lot {lot} not updated: {e}", reading.name);
                    }
                }
            }
        }

        self.notifier.notify_all().await;

        metrics::counter!(crate::observability::SYNC_CYCLES_TOTAL, "status" => "ok").increment(1);
        metrics::histogram!(crate::observability::SYNC_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());
        info!(
            "sync cycle: {} readings, {} reconciled, {} skipped, {} failed",
            report.readings, report.reconciled, report.skipped, report.failed
        );
        Ok(report)
    }

    /// `Ok(false)` when the provider names a spot we don't track.
    async fn apply_reading(&self, reading: &SpotReading) -> Result<bool, SpotSyncError> {
        let Some(spot) = self.directory.spot_by_name(&reading.name).await? else {
            return Ok(false);
        };
        self.directory
            .update_occupancy(spot.spot_id, reading.occupied)
            .await?;
        self.reconciler
            .reconcile(spot.spot_id, reading.occupied)
            .await?;
        Ok(true)
    }
}
