//! In-process topic table with consumer groups.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use crate::broker::{Broker, BrokerMessage, Subscription};
use crate::error::BrokerError;

/// Default per-subscription buffer. Publishers wait once it is full.
pub const DEFAULT_SUBSCRIPTION_BUFFER: usize = 1024;

struct Member {
    id: u64,
    tx: mpsc::Sender<BrokerMessage>,
}

#[derive(Default)]
struct Group {
    members: Vec<Member>,
    next: usize,
}

#[derive(Default)]
struct Topics {
    // topic -> group -> members
    groups: HashMap<String, HashMap<String, Group>>,
    next_member_id: u64,
}

#[derive(Clone)]
pub struct MemoryBroker {
    topics: Arc<Mutex<Topics>>,
    buffer: usize,
}

impl MemoryBroker {
    pub fn new(buffer: usize) -> Self {
        Self {
            topics: Arc::new(Mutex::new(Topics::default())),
            buffer: buffer.max(1),
        }
    }

    /// Live members across every group of `topic`.
    pub async fn subscriber_count(&self, topic: &str) -> usize {
        let topics = self.topics.lock().await;
        topics
            .groups
            .get(topic)
            .map(|groups| {
                groups
                    .values()
                    .flat_map(|g| g.members.iter())
                    .filter(|m| !m.tx.is_closed())
                    .count()
            })
            .unwrap_or(0)
    }

    // Round-robin pick; closed members are pruned on the way.
    async fn next_member(
        &self,
        topic: &str,
        group: &str,
    ) -> Option<(u64, mpsc::Sender<BrokerMessage>)> {
        let mut topics = self.topics.lock().await;
        let groups = topics.groups.get_mut(topic)?;
        let state = groups.get_mut(group)?;
        state.members.retain(|m| !m.tx.is_closed());

        if state.members.is_empty() {
            groups.remove(group);
            if groups.is_empty() {
                topics.groups.remove(topic);
            }
            return None;
        }

        let idx = state.next % state.members.len();
        state.next = state.next.wrapping_add(1);
        let member = &state.members[idx];
        Some((member.id, member.tx.clone()))
    }

    async fn remove_member(&self, topic: &str, group: &str, member_id: u64) {
        let mut topics = self.topics.lock().await;
        if let Some(groups) = topics.groups.get_mut(topic) {
            if let Some(state) = groups.get_mut(group) {
                state.members.retain(|m| m.id != member_id);
            }
        }
    }

    /// `false` if the group had no live member left to take the message.
    async fn deliver_to_group(&self, group: &str, mut message: BrokerMessage) -> bool {
        loop {
            let Some((member_id, tx)) = self.next_member(&message.topic, group).await else {
                debug!(topic = %message.topic, group, "Group has no live members");
                return false;
            };
            match tx.send(message).await {
                Ok(()) => return true,
                Err(mpsc::error::SendError(returned)) => {
                    // Member went away between the pick and the send.
                    self.remove_member(&returned.topic, group, member_id).await;
                    message = returned;
                }
            }
        }
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIPTION_BUFFER)
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(
        &self,
        topic: &str,
        key: Option<&str>,
        payload: Bytes,
    ) -> Result<(), BrokerError> {
        let groups: Vec<String> = {
            let topics = self.topics.lock().await;
            topics
                .groups
                .get(topic)
                .map(|g| g.keys().cloned().collect())
                .unwrap_or_default()
        };

        let message = BrokerMessage {
            topic: topic.to_string(),
            key: key.map(str::to_string),
            payload,
        };
        let mut accepted = false;
        for group in groups {
            accepted |= self.deliver_to_group(&group, message.clone()).await;
        }

        // Nobody would ever see the message; the publisher decides what to
        // do with it instead.
        if !accepted {
            debug!(topic, "No subscribers");
            return Err(BrokerError::NoSubscribers(topic.to_string()));
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str, group: &str) -> Result<Subscription, BrokerError> {
        let (tx, rx) = mpsc::channel(self.buffer);
        let mut topics = self.topics.lock().await;
        topics.next_member_id += 1;
        let id = topics.next_member_id;
        topics
            .groups
            .entry(topic.to_string())
            .or_default()
            .entry(group.to_string())
            .or_default()
            .members
            .push(Member { id, tx });

        debug!(topic, group, member = id, "Subscribed");
        Ok(Subscription::new(topic, group, rx))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    async fn next_payload(sub: &mut Subscription) -> Bytes {
        tokio::time::timeout(Duration::from_secs(1), sub.recv())
            .await
            .unwrap()
            .unwrap()
            .payload
    }

    #[tokio::test]
    async fn test_each_group_gets_every_message_once() {
        let broker = MemoryBroker::default();
        let mut logic = broker.subscribe("chat.ingest", "logic").await.unwrap();
        let mut audit = broker.subscribe("chat.ingest", "audit").await.unwrap();

        broker
            .publish("chat.ingest", Some("c1"), Bytes::from("m1"))
            .await
            .unwrap();

        assert_eq!(next_payload(&mut logic).await, Bytes::from("m1"));
        assert_eq!(next_payload(&mut audit).await, Bytes::from("m1"));
    }

    #[tokio::test]
    async fn test_members_of_one_group_share_the_stream() {
        let broker = MemoryBroker::default();
        let mut a = broker.subscribe("t", "g").await.unwrap();
        let mut b = broker.subscribe("t", "g").await.unwrap();

        for i in 0..4 {
            broker
                .publish("t", None, Bytes::from(format!("m{i}")))
                .await
                .unwrap();
        }

        assert_eq!(next_payload(&mut a).await, Bytes::from("m0"));
        assert_eq!(next_payload(&mut b).await, Bytes::from("m1"));
        assert_eq!(next_payload(&mut a).await, Bytes::from("m2"));
        assert_eq!(next_payload(&mut b).await, Bytes::from("m3"));
    }

    #[tokio::test]
    async fn test_dropped_member_is_skipped() {
        let broker = MemoryBroker::default();
        let gone = broker.subscribe("t", "g").await.unwrap();
        let mut alive = broker.subscribe("t", "g").await.unwrap();
        drop(gone);

        broker.publish("t", None, Bytes::from("x")).await.unwrap();
        broker.publish("t", None, Bytes::from("y")).await.unwrap();

        assert_eq!(next_payload(&mut alive).await, Bytes::from("x"));
        assert_eq!(next_payload(&mut alive).await, Bytes::from("y"));
        assert_eq!(broker.subscriber_count("t").await, 1);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_rejected() {
        let broker = MemoryBroker::default();
        assert!(matches!(
            broker
                .publish("chat.deliver.gw-9", Some("bob"), Bytes::from("lost"))
                .await,
            Err(BrokerError::NoSubscribers(topic)) if topic == "chat.deliver.gw-9"
        ));
    }

    #[tokio::test]
    async fn test_publish_after_last_member_left_is_rejected() {
        let broker = MemoryBroker::default();
        let sub = broker.subscribe("t", "g").await.unwrap();
        drop(sub);

        assert!(matches!(
            broker.publish("t", None, Bytes::from("x")).await,
            Err(BrokerError::NoSubscribers(_))
        ));
        assert_eq!(broker.subscriber_count("t").await, 0);
    }
}
