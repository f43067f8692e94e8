//! Gateway configuration loaded from environment variables.
//!
//! Everything except `GATEWAY_ID` and `TOKEN_ISSUER_PUBKEY` has a usable
//! default for local development.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use courier_shared::constants::{
    DEFAULT_BROKER_PORT, DEFAULT_GATEWAY_PORT, DEFAULT_OFFLINE_TTL_SECS, DEFAULT_OUTBOUND_QUEUE,
};
use courier_shared::token::parse_hex_key;
use courier_shared::{GatewayId, Topics};

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Stable identifier of this process; names its delivery topic.
    /// Env: `GATEWAY_ID`
    /// Default: `gw-<random>` (a restart then gets a new delivery topic).
    pub gateway_id: GatewayId,

    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:8081`
    pub http_addr: SocketAddr,

    /// Env: `BROKER_ADDR`
    /// Default: `127.0.0.1:7400`
    pub broker_addr: String,

    /// Shared SQLite file holding presence and offline queues.
    /// Env: `DB_PATH`
    /// Default: `./courier.db`
    pub db_path: PathBuf,

    /// Ed25519 public key of the token issuer (hex, 64 chars).
    /// Env: `TOKEN_ISSUER_PUBKEY`
    /// Default: all-zeros, which rejects every token.
    pub token_issuer_pubkey: [u8; 32],

    /// Per-connection outbound queue capacity.
    /// Env: `OUTBOUND_QUEUE`
    pub outbound_queue: usize,

    /// Max queued payloads coalesced into one socket write.
    /// Env: `WRITE_BATCH`
    pub write_batch: usize,

    /// Env: `PING_INTERVAL_SECS` (default 54)
    pub ping_interval: Duration,

    /// Connection is dropped after this long without any inbound frame.
    /// Env: `PONG_WAIT_SECS` (default 60)
    pub pong_wait: Duration,

    /// Env: `MAX_FRAME_BYTES` (default 64 KiB)
    pub max_frame_bytes: usize,

    /// Retention applied when a delivery falls back to the offline store.
    /// Env: `OFFLINE_TTL_SECS` (default 7 days)
    pub offline_ttl: Duration,

    /// Inbound envelopes per second per connection, and burst size.
    /// Env: `MESSAGE_RATE`, `MESSAGE_BURST`
    pub message_rate: f64,
    pub message_burst: f64,

    pub topics: Topics,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            gateway_id: random_gateway_id(),
            http_addr: ([0, 0, 0, 0], DEFAULT_GATEWAY_PORT).into(),
            broker_addr: format!("127.0.0.1:{DEFAULT_BROKER_PORT}"),
            db_path: PathBuf::from("./courier.db"),
            token_issuer_pubkey: [0u8; 32],
            outbound_queue: DEFAULT_OUTBOUND_QUEUE,
            write_batch: 64,
            ping_interval: Duration::from_secs(54),
            pong_wait: Duration::from_secs(60),
            max_frame_bytes: 64 * 1024,
            offline_ttl: Duration::from_secs(DEFAULT_OFFLINE_TTL_SECS as u64),
            message_rate: 20.0,
            message_burst: 40.0,
            topics: Topics::default(),
        }
    }
}

impl GatewayConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        match std::env::var("GATEWAY_ID") {
            Ok(id) if !id.trim().is_empty() => config.gateway_id = GatewayId::new(id.trim()),
            _ => tracing::warn!(
                gateway_id = %config.gateway_id,
                "GATEWAY_ID not set, using a random id"
            ),
        }

        if let Ok(addr) = std::env::var("HTTP_ADDR") {
            if let Ok(parsed) = addr.parse::<SocketAddr>() {
                config.http_addr = parsed;
            } else {
                tracing::warn!(value = %addr, "Invalid HTTP_ADDR, using default");
            }
        }

        if let Ok(addr) = std::env::var("BROKER_ADDR") {
            config.broker_addr = addr;
        }

        if let Ok(path) = std::env::var("DB_PATH") {
            config.db_path = PathBuf::from(path);
        }

        if let Ok(hex_key) = std::env::var("TOKEN_ISSUER_PUBKEY") {
            match parse_hex_key(&hex_key) {
                Ok(key) => config.token_issuer_pubkey = key,
                Err(e) => tracing::warn!(
                    error = %e,
                    "Invalid TOKEN_ISSUER_PUBKEY, every token will be rejected"
                ),
            }
        }

        if let Some(n) = env_parse::<usize>("OUTBOUND_QUEUE").filter(|n| *n > 0) {
            config.outbound_queue = n;
        }
        if let Some(n) = env_parse::<usize>("WRITE_BATCH").filter(|n| *n > 0) {
            config.write_batch = n;
        }
        if let Some(secs) = env_parse::<u64>("PING_INTERVAL_SECS").filter(|s| *s > 0) {
            config.ping_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("PONG_WAIT_SECS").filter(|s| *s > 0) {
            config.pong_wait = Duration::from_secs(secs);
        }
        if config.pong_wait <= config.ping_interval {
            tracing::warn!(
                ping = ?config.ping_interval,
                pong = ?config.pong_wait,
                "PONG_WAIT_SECS must exceed PING_INTERVAL_SECS, using defaults"
            );
            config.ping_interval = Duration::from_secs(54);
            config.pong_wait = Duration::from_secs(60);
        }
        if let Some(n) = env_parse::<usize>("MAX_FRAME_BYTES").filter(|n| *n > 0) {
            config.max_frame_bytes = n;
        }
        if let Some(secs) = env_parse::<u64>("OFFLINE_TTL_SECS") {
            config.offline_ttl = Duration::from_secs(secs);
        }
        if let Some(rate) = env_parse::<f64>("MESSAGE_RATE").filter(|r| *r > 0.0) {
            config.message_rate = rate;
        }
        if let Some(burst) = env_parse::<f64>("MESSAGE_BURST").filter(|b| *b >= 1.0) {
            config.message_burst = burst;
        }

        config.topics = Topics::from_env();
        config
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let value = std::env::var(name).ok()?;
    match value.parse::<T>() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            tracing::warn!(name, value = %value, "Invalid value, using default");
            None
        }
    }
}

fn random_gateway_id() -> GatewayId {
    let id = uuid::Uuid::new_v4().simple().to_string();
    GatewayId::new(format!("gw-{}", &id[..8]))
}
