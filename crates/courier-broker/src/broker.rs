use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::BrokerError;

/// One record on a topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerMessage {
    pub topic: String,
    /// Partitioning hint (conversation id, user id); informational only.
    pub key: Option<String>,
    pub payload: Bytes,
}

/// Publish/subscribe seam shared by the in-process and TCP brokers.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn publish(
        &self,
        topic: &str,
        key: Option<&str>,
        payload: Bytes,
    ) -> Result<(), BrokerError>;

    /// Join `group` on `topic`. Each message reaches exactly one member of
    /// every group subscribed to the topic.
    async fn subscribe(&self, topic: &str, group: &str) -> Result<Subscription, BrokerError>;
}

/// Receiving end of one group membership. Dropping it leaves the group.
#[derive(Debug)]
pub struct Subscription {
    topic: String,
    group: String,
    rx: mpsc::Receiver<BrokerMessage>,
}

impl Subscription {
    pub(crate) fn new(topic: &str, group: &str, rx: mpsc::Receiver<BrokerMessage>) -> Self {
        Self {
            topic: topic.to_string(),
            group: group.to_string(),
            rx,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    /// `None` once the broker side has gone away.
    pub async fn recv(&mut self) -> Option<BrokerMessage> {
        self.rx.recv().await
    }
}
