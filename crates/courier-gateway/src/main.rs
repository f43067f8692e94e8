use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use courier_broker::{run_consumer, Broker, RemoteBroker};
use courier_gateway::api::{self, AppState};
use courier_gateway::auth::Authenticator;
use courier_gateway::rate_limit::RateLimiter;
use courier_gateway::{DeliveryConsumer, GatewayConfig, Hub, IngestPublisher};
use courier_store::SqliteStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,courier_gateway=debug")),
        )
        .init();

    info!("Starting courier gateway v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = GatewayConfig::from_env();
    info!(?config, "Loaded configuration");

    // -----------------------------------------------------------------------
    // 3. Initialize subsystems
    // -----------------------------------------------------------------------

    // Presence and offline queues live in the shared database file
    let store = Arc::new(SqliteStore::open(&config.db_path)?);

    let broker: Arc<dyn Broker> = Arc::new(RemoteBroker::new(config.broker_addr.clone()));

    let hub = Hub::new(
        config.gateway_id.clone(),
        store.clone(),
        broker.clone(),
        &config.topics,
        config.outbound_queue,
    );

    let ingest = IngestPublisher::new(broker.clone(), config.topics.ingest.clone());

    // Delivery records and payloads a socket never took share one path
    let delivery_consumer = DeliveryConsumer::new(hub.clone(), store.clone(), config.offline_ttl);

    // Rate limiter: 10 req/s sustained, burst of 30
    let rate_limiter = RateLimiter::default();

    let app_state = AppState {
        hub: hub.clone(),
        ingest,
        delivery: delivery_consumer.clone(),
        auth: Arc::new(Authenticator::new(config.token_issuer_pubkey)),
        rate_limiter: rate_limiter.clone(),
        config: Arc::new(config.clone()),
    };

    // -----------------------------------------------------------------------
    // 4. Spawn background tasks
    // -----------------------------------------------------------------------
    let cancel = CancellationToken::new();

    // Periodic rate limiter cleanup (every 5 minutes, evict buckets idle >10 min)
    let rl = rate_limiter.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(300));
        loop {
            interval.tick().await;
            rl.purge_stale(Duration::from_secs(600)).await;
        }
    });

    // This gateway's delivery topic
    let delivery_topic = config.topics.delivery(&config.gateway_id);
    info!(topic = %delivery_topic, "Consuming delivery topic");
    let delivery = tokio::spawn(run_consumer(
        broker.clone(),
        delivery_topic,
        config.gateway_id.to_string(),
        Arc::new(delivery_consumer),
        cancel.clone(),
    ));

    // -----------------------------------------------------------------------
    // 5. Run the HTTP API server until Ctrl+C
    // -----------------------------------------------------------------------
    // On Ctrl+C: clear this gateway's presence and close every socket, then
    // stop consuming. Records that still arrive in between find no
    // connection and go to the offline store.
    let shutdown = {
        let hub = hub.clone();
        let cancel = cancel.clone();
        async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Received Ctrl+C, shutting down");
            let closed = hub.shutdown().await;
            info!(closed, "Closed client connections");
            cancel.cancel();
        }
    };

    if let Err(e) = api::serve(app_state, config.http_addr, shutdown).await {
        tracing::error!(error = %e, "HTTP server failed");
        hub.shutdown().await;
        cancel.cancel();
        return Err(e);
    }

    let _ = delivery.await;
    info!("Gateway stopped");
    Ok(())
}
