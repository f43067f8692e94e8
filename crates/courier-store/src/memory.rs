//! Process-local backend. Every trait is implemented over maps behind tokio
//! locks; one lock acquisition per operation keeps each call atomic.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::RwLock;

use courier_shared::{ConversationId, Envelope, GatewayId, GroupId, UserId};

use crate::conversations::{preview, ConversationMarker};
use crate::error::Result;
use crate::traits::{
    deadline_ms, now_ms, ConversationStore, DrainedBacklog, GroupDirectory, MessageStore,
    OfflineStore, PresenceRegistry,
};

#[derive(Default)]
struct Backlog {
    items: Vec<Bytes>,
    expires_at: i64,
}

#[derive(Default)]
struct Messages {
    by_id: HashMap<String, Envelope>,
    // conversation -> (send_at, insertion seq) -> id
    by_conversation: HashMap<ConversationId, BTreeMap<(i64, u64), String>>,
    seq: u64,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    presence: Arc<RwLock<HashMap<UserId, GatewayId>>>,
    offline: Arc<RwLock<HashMap<UserId, Backlog>>>,
    messages: Arc<RwLock<Messages>>,
    markers: Arc<RwLock<HashMap<ConversationId, ConversationMarker>>>,
    groups: Arc<RwLock<HashMap<GroupId, HashSet<UserId>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn conversation_marker(&self, conversation: &ConversationId) -> Option<ConversationMarker> {
        self.markers.read().await.get(conversation).cloned()
    }

    pub async fn message_count(&self) -> usize {
        self.messages.read().await.by_id.len()
    }
}

#[async_trait]
impl PresenceRegistry for MemoryStore {
    async fn set(&self, user: &UserId, gateway: &GatewayId) -> Result<()> {
        self.presence
            .write()
            .await
            .insert(user.clone(), gateway.clone());
        Ok(())
    }

    async fn get(&self, user: &UserId) -> Result<Option<GatewayId>> {
        Ok(self.presence.read().await.get(user).cloned())
    }

    async fn remove(&self, user: &UserId, gateway: &GatewayId) -> Result<bool> {
        let mut presence = self.presence.write().await;
        if presence.get(user) == Some(gateway) {
            presence.remove(user);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn clear_gateway(&self, gateway: &GatewayId) -> Result<usize> {
        let mut presence = self.presence.write().await;
        let before = presence.len();
        presence.retain(|_, gw| gw != gateway);
        Ok(before - presence.len())
    }
}

#[async_trait]
impl OfflineStore for MemoryStore {
    async fn append(&self, user: &UserId, payload: Bytes, ttl: Duration) -> Result<()> {
        let expires_at = deadline_ms(ttl);
        let mut offline = self.offline.write().await;
        let backlog = offline.entry(user.clone()).or_default();
        if backlog.expires_at <= now_ms() {
            backlog.items.clear();
        }
        backlog.items.push(payload);
        backlog.expires_at = expires_at;
        Ok(())
    }

    async fn drain_backlog(&self, user: &UserId) -> Result<DrainedBacklog> {
        let backlog = self.offline.write().await.remove(user);
        Ok(match backlog {
            Some(b) if b.expires_at > now_ms() => DrainedBacklog {
                payloads: b.items,
                expires_at_ms: b.expires_at,
            },
            _ => DrainedBacklog::default(),
        })
    }

    async fn restore(&self, user: &UserId, payloads: Vec<Bytes>, expires_at_ms: i64) -> Result<()> {
        if payloads.is_empty() {
            return Ok(());
        }
        let mut offline = self.offline.write().await;
        let backlog = offline.entry(user.clone()).or_default();
        if backlog.expires_at <= now_ms() {
            backlog.items.clear();
        }
        backlog.items.splice(0..0, payloads);
        backlog.expires_at = backlog.expires_at.max(expires_at_ms);
        Ok(())
    }

    async fn pending(&self, user: &UserId) -> Result<usize> {
        Ok(match self.offline.read().await.get(user) {
            Some(b) if b.expires_at > now_ms() => b.items.len(),
            _ => 0,
        })
    }

    async fn purge_expired(&self) -> Result<usize> {
        let now = now_ms();
        let mut offline = self.offline.write().await;
        let mut purged = 0;
        offline.retain(|_, b| {
            if b.expires_at <= now {
                purged += b.items.len();
                false
            } else {
                true
            }
        });
        Ok(purged)
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn persist(&self, envelope: &Envelope) -> Result<bool> {
        let mut messages = self.messages.write().await;
        if messages.by_id.contains_key(&envelope.id) {
            return Ok(false);
        }
        messages.seq += 1;
        let key = (envelope.send_at, messages.seq);
        messages
            .by_conversation
            .entry(envelope.conversation_id.clone())
            .or_default()
            .insert(key, envelope.id.clone());
        messages.by_id.insert(envelope.id.clone(), envelope.clone());
        Ok(true)
    }

    async fn find(&self, id: &str) -> Result<Option<Envelope>> {
        Ok(self.messages.read().await.by_id.get(id).cloned())
    }

    async fn history(
        &self,
        conversation: &ConversationId,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Envelope>> {
        let messages = self.messages.read().await;
        let Some(index) = messages.by_conversation.get(conversation) else {
            return Ok(Vec::new());
        };
        Ok(index
            .values()
            .rev()
            .skip(offset as usize)
            .take(limit as usize)
            .filter_map(|id| messages.by_id.get(id).cloned())
            .collect())
    }
}

#[async_trait]
impl ConversationStore for MemoryStore {
    async fn touch_last_message(&self, envelope: &Envelope) -> Result<()> {
        let mut markers = self.markers.write().await;
        if let Some(existing) = markers.get(&envelope.conversation_id) {
            if existing.last_message_at > envelope.send_at {
                return Ok(());
            }
        }
        markers.insert(
            envelope.conversation_id.clone(),
            ConversationMarker {
                conversation_id: envelope.conversation_id.to_string(),
                message_type: envelope.message_type.code(),
                last_message_id: envelope.id.clone(),
                last_sender_id: envelope.sender_id.to_string(),
                last_preview: preview(&envelope.content),
                last_message_at: envelope.send_at,
            },
        );
        Ok(())
    }
}

#[async_trait]
impl GroupDirectory for MemoryStore {
    async fn members(&self, group: &GroupId) -> Result<Vec<UserId>> {
        let mut members: Vec<UserId> = self
            .groups
            .read()
            .await
            .get(group)
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default();
        members.sort();
        Ok(members)
    }

    async fn add_member(&self, group: &GroupId, user: &UserId) -> Result<bool> {
        Ok(self
            .groups
            .write()
            .await
            .entry(group.clone())
            .or_default()
            .insert(user.clone()))
    }

    async fn remove_member(&self, group: &GroupId, user: &UserId) -> Result<bool> {
        let mut groups = self.groups.write().await;
        let Some(members) = groups.get_mut(group) else {
            return Ok(false);
        };
        let removed = members.remove(user);
        if members.is_empty() {
            groups.remove(group);
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use courier_shared::Content;

    use super::*;

    fn text(conv: &str, id: &str, at: i64) -> Envelope {
        let mut env = Envelope::private(
            ConversationId::from(conv),
            UserId::from("bob"),
            Content::text(format!("msg {id}")),
        );
        env.id = id.to_string();
        env.stamp(&UserId::from("alice"), at);
        env
    }

    #[tokio::test]
    async fn test_presence_last_writer_wins_and_compare_delete() {
        let store = MemoryStore::new();
        let bob = UserId::from("bob");
        let (gw1, gw2) = (GatewayId::from("gw-1"), GatewayId::from("gw-2"));

        store.set(&bob, &gw1).await.unwrap();
        store.set(&bob, &gw2).await.unwrap();
        assert!(!store.remove(&bob, &gw1).await.unwrap());
        assert_eq!(store.get(&bob).await.unwrap(), Some(gw2.clone()));

        assert_eq!(store.clear_gateway(&gw2).await.unwrap(), 1);
        assert_eq!(store.get(&bob).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_drain_returns_append_order_then_empty() {
        let store = MemoryStore::new();
        let bob = UserId::from("bob");
        for payload in ["a", "b", "c"] {
            store
                .append(&bob, Bytes::from(payload), Duration::from_secs(60))
                .await
                .unwrap();
        }

        assert_eq!(store.pending(&bob).await.unwrap(), 3);
        let drained = store.drain_all(&bob).await.unwrap();
        assert_eq!(drained, vec![Bytes::from("a"), Bytes::from("b"), Bytes::from("c")]);
        assert!(store.drain_all(&bob).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_restore_goes_ahead_of_later_appends() {
        let store = MemoryStore::new();
        let bob = UserId::from("bob");
        store
            .append(&bob, Bytes::from("a"), Duration::from_secs(60))
            .await
            .unwrap();
        let drained = store.drain_backlog(&bob).await.unwrap();
        store
            .append(&bob, Bytes::from("late"), Duration::from_secs(60))
            .await
            .unwrap();

        store
            .restore(&bob, drained.payloads, drained.expires_at_ms)
            .await
            .unwrap();
        assert_eq!(
            store.drain_all(&bob).await.unwrap(),
            vec![Bytes::from("a"), Bytes::from("late")]
        );
    }

    #[tokio::test]
    async fn test_restore_keeps_the_drained_deadline() {
        let store = MemoryStore::new();
        let bob = UserId::from("bob");

        // A deadline that has already passed stays passed.
        store
            .restore(&bob, vec![Bytes::from("old")], now_ms() - 1)
            .await
            .unwrap();
        assert_eq!(store.pending(&bob).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_zero_ttl_entry_is_already_expired() {
        let store = MemoryStore::new();
        let bob = UserId::from("bob");
        store
            .append(&bob, Bytes::from("gone"), Duration::ZERO)
            .await
            .unwrap();

        assert_eq!(store.pending(&bob).await.unwrap(), 0);
        assert_eq!(store.purge_expired().await.unwrap(), 1);
        assert!(store.drain_all(&bob).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_persist_is_idempotent_and_history_is_newest_first() {
        let store = MemoryStore::new();
        let first = text("c1", "m1", 10);
        let second = text("c1", "m2", 20);

        assert!(store.persist(&first).await.unwrap());
        assert!(store.persist(&second).await.unwrap());
        assert!(!store.persist(&first).await.unwrap());
        assert_eq!(store.message_count().await, 2);
        assert_eq!(store.find("m2").await.unwrap(), Some(second.clone()));
        assert_eq!(store.find("missing").await.unwrap(), None);

        let conv = ConversationId::from("c1");
        let page = store.history(&conv, 10, 0).await.unwrap();
        assert_eq!(page, vec![second.clone(), first.clone()]);
        assert_eq!(store.history(&conv, 1, 1).await.unwrap(), vec![first]);
    }

    #[tokio::test]
    async fn test_marker_never_moves_backwards() {
        let store = MemoryStore::new();
        let conv = ConversationId::from("c1");
        store.touch_last_message(&text("c1", "new", 20)).await.unwrap();
        store.touch_last_message(&text("c1", "old", 10)).await.unwrap();

        let marker = store.conversation_marker(&conv).await.unwrap();
        assert_eq!(marker.last_message_id, "new");
        assert_eq!(marker.last_preview, "msg new");
    }

    #[tokio::test]
    async fn test_group_membership() {
        let store = MemoryStore::new();
        let team = GroupId::from("team");
        assert!(store.add_member(&team, &UserId::from("bob")).await.unwrap());
        assert!(store.add_member(&team, &UserId::from("alice")).await.unwrap());
        assert!(!store.add_member(&team, &UserId::from("bob")).await.unwrap());

        assert_eq!(
            store.members(&team).await.unwrap(),
            vec![UserId::from("alice"), UserId::from("bob")]
        );
        assert!(store.remove_member(&team, &UserId::from("bob")).await.unwrap());
        assert!(!store.remove_member(&team, &UserId::from("bob")).await.unwrap());
    }
}
