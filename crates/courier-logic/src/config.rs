//! Logic tier configuration loaded from environment variables.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use courier_shared::constants::{DEFAULT_BROKER_PORT, DEFAULT_LOGIC_PORT, DEFAULT_OFFLINE_TTL_SECS};
use courier_shared::Topics;

/// Consumer group shared by every logic replica on the ingest topic.
pub const DEFAULT_INGEST_GROUP: &str = "logic_service_group";
/// Consumer group shared by every logic replica on the sync topic.
pub const DEFAULT_SYNC_GROUP: &str = "logic_sync_group";

#[derive(Debug, Clone)]
pub struct LogicConfig {
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:8080`
    pub http_addr: SocketAddr,

    /// Env: `BROKER_ADDR`
    /// Default: `127.0.0.1:7400`
    pub broker_addr: String,

    /// Shared SQLite file (messages, groups, presence, offline queues).
    /// Env: `DB_PATH`
    /// Default: `./courier.db`
    pub db_path: PathBuf,

    /// Bearer token for the group membership endpoints.
    /// Env: `ADMIN_TOKEN`
    /// Default: empty (membership endpoints disabled).
    pub admin_token: Option<String>,

    /// Env: `INGEST_GROUP`, `SYNC_GROUP`
    pub ingest_group: String,
    pub sync_group: String,

    /// Retention of offline queue entries written by the dispatcher.
    /// Env: `OFFLINE_TTL_SECS` (default 7 days)
    pub offline_ttl: Duration,

    /// How often expired offline entries are swept.
    /// Env: `PURGE_INTERVAL_SECS` (default 600)
    pub purge_interval: Duration,

    pub topics: Topics,
}

impl Default for LogicConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_LOGIC_PORT).into(),
            broker_addr: format!("127.0.0.1:{DEFAULT_BROKER_PORT}"),
            db_path: PathBuf::from("./courier.db"),
            admin_token: None,
            ingest_group: DEFAULT_INGEST_GROUP.to_string(),
            sync_group: DEFAULT_SYNC_GROUP.to_string(),
            offline_ttl: Duration::from_secs(DEFAULT_OFFLINE_TTL_SECS as u64),
            purge_interval: Duration::from_secs(600),
            topics: Topics::default(),
        }
    }
}

impl LogicConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();

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

        if let Ok(token) = std::env::var("ADMIN_TOKEN") {
            if !token.is_empty() {
                config.admin_token = Some(token);
            }
        }

        if let Ok(group) = std::env::var("INGEST_GROUP") {
            if !group.trim().is_empty() {
                config.ingest_group = group;
            }
        }
        if let Ok(group) = std::env::var("SYNC_GROUP") {
            if !group.trim().is_empty() {
                config.sync_group = group;
            }
        }

        if let Ok(val) = std::env::var("OFFLINE_TTL_SECS") {
            match val.parse::<u64>() {
                Ok(secs) => config.offline_ttl = Duration::from_secs(secs),
                Err(_) => tracing::warn!(value = %val, "Invalid OFFLINE_TTL_SECS, using default"),
            }
        }

        if let Ok(val) = std::env::var("PURGE_INTERVAL_SECS") {
            match val.parse::<u64>() {
                Ok(secs) if secs > 0 => config.purge_interval = Duration::from_secs(secs),
                _ => tracing::warn!(value = %val, "Invalid PURGE_INTERVAL_SECS, using default"),
            }
        }

        config.topics = Topics::from_env();
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = LogicConfig::default();
        assert_eq!(config.http_addr, ([0, 0, 0, 0], 8080).into());
        assert_eq!(config.ingest_group, "logic_service_group");
        assert_eq!(config.sync_group, "logic_sync_group");
        assert!(config.admin_token.is_none());
        assert_eq!(config.topics.ingest, "chat.ingest");
    }
}
