//! Client -> broker path: stamp the envelope with the authenticated sender
//! and the gateway clock, then publish it on the shared ingest topic keyed
//! by conversation.

use std::sync::Arc;

use chrono::Utc;
use tracing::debug;

use courier_broker::Broker;
use courier_shared::codec::encode_for_broker;
use courier_shared::{Envelope, UserId};

use crate::error::GatewayError;

#[derive(Clone)]
pub struct IngestPublisher {
    broker: Arc<dyn Broker>,
    topic: String,
}

impl IngestPublisher {
    pub fn new(broker: Arc<dyn Broker>, topic: impl Into<String>) -> Self {
        Self {
            broker,
            topic: topic.into(),
        }
    }

    /// Returns the envelope id on success. Whatever the client put in
    /// `sender_id` and `send_at` is discarded.
    pub async fn publish(
        &self,
        sender: &UserId,
        mut envelope: Envelope,
    ) -> Result<String, GatewayError> {
        envelope.stamp(sender, Utc::now().timestamp());
        envelope.validate()?;

        let payload = encode_for_broker(&envelope)?;
        self.broker
            .publish(&self.topic, Some(envelope.conversation_id.as_str()), payload)
            .await?;

        debug!(
            id = %envelope.id,
            sender = %sender,
            conversation = %envelope.conversation_id,
            "Envelope ingested"
        );
        Ok(envelope.id)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use courier_broker::MemoryBroker;
    use courier_shared::codec::decode_binary;
    use courier_shared::{Content, ConversationId, ValidationError};

    use super::*;

    #[tokio::test]
    async fn test_publish_stamps_sender_and_time() {
        let broker = MemoryBroker::default();
        let mut ingest_sub = broker.subscribe("chat.ingest", "logic").await.unwrap();
        let publisher = IngestPublisher::new(Arc::new(broker.clone()), "chat.ingest");

        let mut env = Envelope::private(
            ConversationId::from("p:alice:bob"),
            UserId::from("bob"),
            Content::text("hi"),
        );
        env.sender_id = UserId::from("mallory");
        env.send_at = 1;

        let before = Utc::now().timestamp();
        let id = publisher.publish(&UserId::from("alice"), env).await.unwrap();

        let message = tokio::time::timeout(Duration::from_secs(1), ingest_sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.key.as_deref(), Some("p:alice:bob"));

        let published = decode_binary(&message.payload).unwrap();
        assert_eq!(published.id, id);
        assert_eq!(published.sender_id, UserId::from("alice"));
        assert!(published.send_at >= before);
        assert_eq!(published.content.as_text(), Some("hi"));
    }

    #[tokio::test]
    async fn test_invalid_envelope_is_not_published() {
        let broker = MemoryBroker::default();
        let publisher = IngestPublisher::new(Arc::new(broker), "chat.ingest");

        let mut env = Envelope::private(
            ConversationId::from("p:alice:bob"),
            UserId::from("bob"),
            Content::text("hi"),
        );
        env.recipient_id = None;

        assert!(matches!(
            publisher.publish(&UserId::from("alice"), env).await,
            Err(GatewayError::Validation(ValidationError::MissingRecipient))
        ));
    }
}
