//! # courier-broker
//!
//! Standalone topic broker. Gateways publish ingested envelopes and sync
//! requests to it; the logic tier consumes those and publishes per-gateway
//! delivery records back.

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use courier_broker::{server, BrokerConfig, MemoryBroker};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,courier_broker=debug")),
        )
        .init();

    info!("Starting courier broker v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = BrokerConfig::from_env();
    info!(?config, "Loaded configuration");

    // -----------------------------------------------------------------------
    // 3. Serve until Ctrl+C
    // -----------------------------------------------------------------------
    let broker = MemoryBroker::new(config.subscription_buffer);
    let listener = TcpListener::bind(config.listen_addr).await?;
    let cancel = CancellationToken::new();

    let server = tokio::spawn(server::serve(listener, broker, cancel.clone()));

    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down");
    cancel.cancel();
    server.await??;

    Ok(())
}
