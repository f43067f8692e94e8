use bytes::Bytes;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::constants::SYNC_ACTION;
use crate::types::{GatewayId, UserId};

/// Offline-backlog drain request, produced by a gateway when a client
/// (re)connects and consumed by the logic tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRequest {
    pub action: String,
    pub identity: UserId,
    /// Gateway now holding the connection; the backlog is published to its
    /// delivery channel.
    pub gateway: GatewayId,
    /// Unix seconds.
    pub timestamp: i64,
}

impl SyncRequest {
    pub fn new(identity: UserId, gateway: GatewayId) -> Self {
        Self {
            action: SYNC_ACTION.to_string(),
            identity,
            gateway,
            timestamp: Utc::now().timestamp(),
        }
    }

    pub fn is_sync_offline(&self) -> bool {
        self.action == SYNC_ACTION
    }

    pub fn to_bytes(&self) -> Result<Bytes, serde_json::Error> {
        serde_json::to_vec(self).map(Bytes::from)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_request_wire_shape() {
        let req = SyncRequest::new(UserId::from("bob"), GatewayId::from("gw-2"));
        let bytes = req.to_bytes().unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(json["action"], "sync_offline");
        assert_eq!(json["identity"], "bob");
        assert_eq!(json["gateway"], "gw-2");
        assert!(SyncRequest::from_bytes(&bytes).unwrap().is_sync_offline());
    }
}
