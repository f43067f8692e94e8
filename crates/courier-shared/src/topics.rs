use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_DELIVERY_PREFIX, DEFAULT_INGEST_TOPIC, DEFAULT_SYNC_TOPIC};
use crate::types::GatewayId;

/// Broker topic names used by the delivery pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topics {
    /// Single shared channel from gateways to the logic tier.
    pub ingest: String,
    /// Reconnect sync requests from gateways to the logic tier.
    pub sync_request: String,
    /// Prefix of the per-gateway delivery channels.
    pub delivery_prefix: String,
}

impl Default for Topics {
    fn default() -> Self {
        Self {
            ingest: DEFAULT_INGEST_TOPIC.to_string(),
            sync_request: DEFAULT_SYNC_TOPIC.to_string(),
            delivery_prefix: DEFAULT_DELIVERY_PREFIX.to_string(),
        }
    }
}

impl Topics {
    /// Read `INGEST_TOPIC`, `SYNC_TOPIC` and `DELIVERY_TOPIC_PREFIX`,
    /// falling back to the defaults.
    pub fn from_env() -> Self {
        let mut topics = Self::default();
        if let Ok(v) = std::env::var("INGEST_TOPIC") {
            topics.ingest = v;
        }
        if let Ok(v) = std::env::var("SYNC_TOPIC") {
            topics.sync_request = v;
        }
        if let Ok(v) = std::env::var("DELIVERY_TOPIC_PREFIX") {
            topics.delivery_prefix = v;
        }
        topics
    }

    /// The private delivery channel of one gateway.
    pub fn delivery(&self, gateway: &GatewayId) -> String {
        format!("{}{}", self.delivery_prefix, gateway)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delivery_topic_is_per_gateway() {
        let topics = Topics::default();
        assert_eq!(topics.delivery(&GatewayId::from("gw-2")), "chat.deliver.gw-2");
        assert_ne!(
            topics.delivery(&GatewayId::from("gw-1")),
            topics.delivery(&GatewayId::from("gw-2"))
        );
    }
}
