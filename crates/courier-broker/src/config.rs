//! Broker configuration loaded from environment variables.

use std::net::SocketAddr;

use courier_shared::constants::DEFAULT_BROKER_PORT;

use crate::memory::DEFAULT_SUBSCRIPTION_BUFFER;

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Env: `BROKER_ADDR`
    /// Default: `0.0.0.0:7400`
    pub listen_addr: SocketAddr,

    /// Messages buffered per subscription before publishers wait.
    /// Env: `BROKER_SUBSCRIPTION_BUFFER`
    pub subscription_buffer: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            listen_addr: ([0, 0, 0, 0], DEFAULT_BROKER_PORT).into(),
            subscription_buffer: DEFAULT_SUBSCRIPTION_BUFFER,
        }
    }
}

impl BrokerConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("BROKER_ADDR") {
            match addr.parse::<SocketAddr>() {
                Ok(parsed) => config.listen_addr = parsed,
                Err(_) => tracing::warn!(value = %addr, "Invalid BROKER_ADDR, using default"),
            }
        }

        if let Ok(val) = std::env::var("BROKER_SUBSCRIPTION_BUFFER") {
            match val.parse::<usize>() {
                Ok(n) if n > 0 => config.subscription_buffer = n,
                _ => tracing::warn!(
                    value = %val,
                    "Invalid BROKER_SUBSCRIPTION_BUFFER, using default"
                ),
            }
        }

        config
    }
}
