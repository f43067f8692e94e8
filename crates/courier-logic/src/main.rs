use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use courier_broker::{run_consumer, Broker, RemoteBroker};
use courier_logic::api::{self, AppState};
use courier_logic::{Dispatcher, LogicConfig, Stores, SyncCoordinator};
use courier_store::SqliteStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,courier_logic=debug")),
        )
        .init();

    info!("Starting courier logic tier v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = LogicConfig::from_env();
    info!(
        http_addr = %config.http_addr,
        broker_addr = %config.broker_addr,
        db_path = %config.db_path.display(),
        admin_enabled = config.admin_token.is_some(),
        "Loaded configuration"
    );

    // -----------------------------------------------------------------------
    // 3. Initialize subsystems
    // -----------------------------------------------------------------------
    let store = Arc::new(SqliteStore::open(&config.db_path)?);
    let stores = Stores::shared(store.clone());

    let broker: Arc<dyn Broker> = Arc::new(RemoteBroker::new(config.broker_addr.clone()));

    let dispatcher = Arc::new(Dispatcher::new(
        stores.clone(),
        broker.clone(),
        config.topics.clone(),
        config.offline_ttl,
    ));
    let coordinator = Arc::new(SyncCoordinator::new(
        stores.offline.clone(),
        broker.clone(),
        config.topics.clone(),
    ));

    let app_state = AppState {
        messages: stores.messages.clone(),
        groups: stores.groups.clone(),
        config: Arc::new(config.clone()),
    };

    // -----------------------------------------------------------------------
    // 4. Spawn consumers and background tasks
    // -----------------------------------------------------------------------
    let cancel = CancellationToken::new();

    let ingest = tokio::spawn(run_consumer(
        broker.clone(),
        config.topics.ingest.clone(),
        config.ingest_group.clone(),
        dispatcher,
        cancel.clone(),
    ));
    let sync = tokio::spawn(run_consumer(
        broker.clone(),
        config.topics.sync_request.clone(),
        config.sync_group.clone(),
        coordinator,
        cancel.clone(),
    ));

    // Periodic sweep of expired offline entries
    let offline = stores.offline.clone();
    let purge_interval = config.purge_interval;
    let purge_cancel = cancel.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(purge_interval);
        loop {
            tokio::select! {
                _ = purge_cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            match offline.purge_expired().await {
                Ok(0) => {}
                Ok(purged) => info!(purged, "Purged expired offline entries"),
                Err(e) => tracing::warn!(error = %e, "Offline purge failed"),
            }
        }
    });

    // -----------------------------------------------------------------------
    // 5. Run the HTTP API server until Ctrl+C
    // -----------------------------------------------------------------------
    let shutdown = {
        let cancel = cancel.clone();
        async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Received Ctrl+C, shutting down");
            cancel.cancel();
        }
    };

    if let Err(e) = api::serve(app_state, config.http_addr, shutdown).await {
        tracing::error!(error = %e, "HTTP server failed");
        cancel.cancel();
        return Err(e);
    }

    // Consumers finish their in-flight message before exiting
    let _ = tokio::join!(ingest, sync);
    info!("Logic tier stopped");
    Ok(())
}
