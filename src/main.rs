use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use spotwatch::aggregate::Aggregator;
use spotwatch::api::{self, AppState};
use spotwatch::config::Config;
use spotwatch::notifications::NotificationService;
use spotwatch::notify::NotifyHub;
use spotwatch::provider::PpmClient;
use spotwatch::reconcile::Reconciler;
use spotwatch::store::{SpotSeed, Store};
use spotwatch::sync::Syncer;
use spotwatch::tasks;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let config = Config::from_env()?;
    spotwatch::observability::init(config.metrics_port);

    std::fs::create_dir_all(&config.data_dir)?;
    let store = Arc::new(Store::open(config.wal_path())?);

    if let Some(path) = &config.spots_file {
        let seeds: Vec<SpotSeed> = serde_json::from_slice(&std::fs::read(path)?)?;
        let added = store.seed_spots(&seeds).await?;
        info!("seeded {added} new spots from {}", path.display());
    }

    let hub = Arc::new(NotifyHub::new());
    let notifications = Arc::new(NotificationService::new(store.clone(), hub));
    let reconciler = Arc::new(Reconciler::new(store.clone()));
    let provider = Arc::new(PpmClient::new(&config.provider)?);
    let syncer = Arc::new(Syncer::new(
        provider,
        store.clone(),
        reconciler,
        notifications.clone(),
    ));

    let sync_task = tokio::spawn(tasks::run_syncer(syncer, config.sync_interval));
    let compact_task = tokio::spawn(tasks::run_compactor(
        store.clone(),
        config.compact_threshold,
        tasks::COMPACT_CHECK_INTERVAL,
    ));

    let state = AppState {
        store: store.clone(),
        notifications,
        aggregator: Arc::new(Aggregator::new(store)),
    };

    let addr = format!("{}:{}", config.bind, config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("spotwatch listening on {addr}");
    info!("  data_dir: {}", config.data_dir.display());
    info!("  provider: {}", config.provider.base_url);
    info!("  sync every {:?}", config.sync_interval);
    info!(
        "  metrics: {}",
        config
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    axum::serve(listener, api::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    sync_task.abort();
    compact_task.abort();
    info!("spotwatch stopped");
    Ok(())
}

/// Resolves on ctrl-c or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("failed to register SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received, draining requests");
}
