use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::{error, info};

use crate::store::Store;
use crate::sync::Syncer;

/// How often the compactor looks at the WAL.
pub const COMPACT_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Run a sync cycle every `every`, starting immediately. A failed fetch only
/// costs that cycle.
pub async fn run_syncer(syncer: Arc<Syncer>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        if let Err(e) = syncer.run_cycle().await {
            error!("sync cycle aborted: {e}");
        }
    }
}

/// Rewrite the WAL once `threshold` appends have piled up since the last
/// compaction.
pub async fn run_compactor(store: Arc<Store>, threshold: u64, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        let appends = store.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match store.compact_wal().await {
            Ok(events) => info!("compacted WAL: {appends} appends folded into {events} events"),
            Err(e) => error!("WAL compaction failed: {e}"),
        }
    }
}
