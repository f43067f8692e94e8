//! Consumer of this gateway's private delivery topic.
//!
//! Each record is a binary envelope already addressed to one recipient. It
//! is handed to the hub; if the recipient is no longer connected here (or
//! was just evicted) the record goes to the recipient's offline queue so
//! the next reconnect sync picks it up.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, info, warn};

use courier_broker::{BrokerMessage, MessageHandler};
use courier_shared::codec::{decode, decode_binary, encode_binary};
use courier_shared::Envelope;
use courier_store::{with_retries, OfflineStore};

use crate::hub::Hub;

const OFFLINE_ATTEMPTS: u32 = 3;

/// What happened to one delivery record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    StoredOffline,
    Dropped,
}

#[derive(Clone)]
pub struct DeliveryConsumer {
    hub: Hub,
    offline: Arc<dyn OfflineStore>,
    offline_ttl: Duration,
}

impl DeliveryConsumer {
    pub fn new(hub: Hub, offline: Arc<dyn OfflineStore>, offline_ttl: Duration) -> Self {
        Self {
            hub,
            offline,
            offline_ttl,
        }
    }

    pub async fn process(&self, message: &BrokerMessage) -> DeliveryOutcome {
        let envelope = match decode_binary(&message.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(topic = %message.topic, error = %e, "Undecodable delivery record dropped");
                return DeliveryOutcome::Dropped;
            }
        };
        self.deliver(&envelope, message.payload.clone()).await
    }

    /// Take back payloads that were queued on a connection but never
    /// written to its socket. They are in that connection's wire format.
    /// Each one goes to the recipient's current connection here, if any,
    /// and to the offline store otherwise.
    pub async fn redeliver(&self, unsent: Vec<Bytes>) -> Vec<DeliveryOutcome> {
        let mut outcomes = Vec::with_capacity(unsent.len());
        for payload in unsent {
            let record = decode(&payload).and_then(|(envelope, _)| {
                let record = encode_binary(&envelope)?;
                Ok((envelope, record))
            });
            let outcome = match record {
                Ok((envelope, record)) => self.deliver(&envelope, record).await,
                Err(e) => {
                    warn!(error = %e, "Unsent payload could not be decoded, dropped");
                    DeliveryOutcome::Dropped
                }
            };
            outcomes.push(outcome);
        }
        outcomes
    }

    /// `record` is the binary form of `envelope`, as kept offline.
    async fn deliver(&self, envelope: &Envelope, record: Bytes) -> DeliveryOutcome {
        let Some(recipient) = envelope.recipient_id.clone() else {
            warn!(id = %envelope.id, "Delivery record without recipient dropped");
            return DeliveryOutcome::Dropped;
        };

        match self.hub.deliver_envelope(envelope).await {
            Ok(true) => {
                debug!(id = %envelope.id, user = %recipient, "Delivered");
                return DeliveryOutcome::Delivered;
            }
            Ok(false) => {
                debug!(id = %envelope.id, user = %recipient, "Recipient not connected here");
            }
            Err(e) => {
                warn!(id = %envelope.id, user = %recipient, error = %e, "Failed to encode for recipient");
            }
        }

        let offline = &self.offline;
        let ttl = self.offline_ttl;
        match with_retries("offline.append", OFFLINE_ATTEMPTS, || {
            offline.append(&recipient, record.clone(), ttl)
        })
        .await
        {
            Ok(()) => {
                info!(id = %envelope.id, user = %recipient, "Stored undeliverable message offline");
                DeliveryOutcome::StoredOffline
            }
            Err(e) => {
                warn!(id = %envelope.id, user = %recipient, error = %e, "Message lost: offline append failed");
                DeliveryOutcome::Dropped
            }
        }
    }
}

#[async_trait]
impl MessageHandler for DeliveryConsumer {
    async fn handle(&self, message: BrokerMessage) -> anyhow::Result<()> {
        self.process(&message).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use courier_broker::MemoryBroker;
    use courier_shared::codec::encode_text;
    use courier_shared::{Content, ConversationId, GatewayId, Topics, UserId, WireFormat};
    use courier_store::MemoryStore;

    use super::*;

    fn setup(capacity: usize) -> (Hub, MemoryStore, DeliveryConsumer) {
        let store = MemoryStore::new();
        let hub = Hub::new(
            GatewayId::from("gw-2"),
            Arc::new(store.clone()),
            Arc::new(MemoryBroker::default()),
            &Topics::default(),
            capacity,
        );
        let consumer = DeliveryConsumer::new(
            hub.clone(),
            Arc::new(store.clone()),
            Duration::from_secs(60),
        );
        (hub, store, consumer)
    }

    fn record(recipient: &str) -> BrokerMessage {
        let mut env = Envelope::private(
            ConversationId::from("p:alice:bob"),
            UserId::from(recipient),
            Content::text("hi"),
        );
        env.stamp(&UserId::from("alice"), 100);
        BrokerMessage {
            topic: "chat.deliver.gw-2".into(),
            key: Some(recipient.into()),
            payload: encode_binary(&env).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_connected_recipient_gets_the_message() {
        let (hub, store, consumer) = setup(8);
        let mut conn = hub.connect(UserId::from("bob"), WireFormat::Binary).await.unwrap();

        assert_eq!(consumer.process(&record("bob")).await, DeliveryOutcome::Delivered);
        assert!(conn.outbound.recv().await.is_some());
        assert_eq!(store.pending(&UserId::from("bob")).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_absent_recipient_falls_back_to_offline() {
        let (_hub, store, consumer) = setup(8);
        let message = record("bob");

        assert_eq!(consumer.process(&message).await, DeliveryOutcome::StoredOffline);
        assert_eq!(
            store.drain_all(&UserId::from("bob")).await.unwrap(),
            vec![message.payload]
        );
    }

    #[tokio::test]
    async fn test_overflow_eviction_falls_back_to_offline() {
        let (hub, store, consumer) = setup(1);
        let _conn = hub.connect(UserId::from("bob"), WireFormat::Binary).await.unwrap();

        assert_eq!(consumer.process(&record("bob")).await, DeliveryOutcome::Delivered);
        assert_eq!(consumer.process(&record("bob")).await, DeliveryOutcome::StoredOffline);
        assert!(!hub.is_connected(&UserId::from("bob")).await);
        assert_eq!(store.pending(&UserId::from("bob")).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_unsent_text_payload_is_kept_offline_in_binary() {
        let (_hub, store, consumer) = setup(8);
        let message = record("bob");
        let envelope = decode_binary(&message.payload).unwrap();

        let outcomes = consumer.redeliver(vec![encode_text(&envelope).unwrap()]).await;

        assert_eq!(outcomes, vec![DeliveryOutcome::StoredOffline]);
        assert_eq!(
            store.drain_all(&UserId::from("bob")).await.unwrap(),
            vec![message.payload]
        );
    }

    #[tokio::test]
    async fn test_unsent_payload_goes_to_current_connection() {
        let (hub, store, consumer) = setup(8);
        let mut conn = hub.connect(UserId::from("bob"), WireFormat::Binary).await.unwrap();

        let outcomes = consumer.redeliver(vec![record("bob").payload]).await;

        assert_eq!(outcomes, vec![DeliveryOutcome::Delivered]);
        assert!(conn.outbound.recv().await.is_some());
        assert_eq!(store.pending(&UserId::from("bob")).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_garbage_is_dropped() {
        let (_hub, _store, consumer) = setup(8);
        let message = BrokerMessage {
            topic: "chat.deliver.gw-2".into(),
            key: None,
            payload: Bytes::from_static(b"\x00\x01"),
        };
        assert_eq!(consumer.process(&message).await, DeliveryOutcome::Dropped);
    }
}
