use std::net::SocketAddr;

// ── Sync pipeline ────────────────────────────────────────────────

/// Counter: sync cycles run. Labels: status (ok, fetch_failed).
pub const SYNC_CYCLES_TOTAL: &str = "spotwatch_sync_cycles_total";

/// Histogram: wall time of a completed sync cycle in seconds.
pub const SYNC_DURATION_SECONDS: &str = "spotwatch_sync_duration_seconds";

/// Counter: history records appended.
pub const HISTORY_APPENDS_TOTAL: &str = "spotwatch_history_appends_total";

/// Counter: readings that failed to apply to their spot.
pub const RECONCILE_FAILURES_TOTAL: &str = "spotwatch_reconcile_failures_total";

/// Counter: readings naming a spot we don't track.
pub const UNKNOWN_SPOTS_TOTAL: &str = "spotwatch_unknown_spots_total";

/// Counter: push messages attempted. Labels: status (ok, error).
pub const PUSH_MESSAGES_TOTAL: &str = "spotwatch_push_messages_total";

// ── HTTP ─────────────────────────────────────────────────────────

/// Counter: API requests served. Labels: route, status.
pub const HTTP_REQUESTS_TOTAL: &str = "spotwatch_http_requests_total";

// ── Storage ──────────────────────────────────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "spotwatch_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "spotwatch_wal_flush_batch_size";

/// Install the Prometheus exporter on `port`. No-op if port is None; an
/// exporter that fails to start is logged and the service runs without it.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics"),
        Err(e) => tracing::error!("failed to install Prometheus metrics exporter: {e}"),
    }
}
