//! SQLite implementation of every storage trait.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use courier_shared::{ConversationId, Envelope, GatewayId, GroupId, UserId};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::traits::{
    deadline_ms, now_ms, ConversationStore, DrainedBacklog, GroupDirectory, MessageStore,
    OfflineStore, PresenceRegistry,
};

/// Shared handle to one database file. Queries run on the blocking pool so
/// the async workers never wait on SQLite locks.
#[derive(Clone)]
pub struct SqliteStore {
    db: Arc<Mutex<Database>>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self::from_database(Database::open_at(path)?))
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::from_database(Database::open_in_memory()?))
    }

    pub fn from_database(db: Database) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
        }
    }

    async fn with_db<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Database) -> Result<T> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || {
            let mut guard = db.lock().map_err(|_| StoreError::Poisoned)?;
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("blocking task failed: {e}")))?
    }
}

#[async_trait]
impl PresenceRegistry for SqliteStore {
    async fn set(&self, user: &UserId, gateway: &GatewayId) -> Result<()> {
        let (user, gateway) = (user.to_string(), gateway.to_string());
        self.with_db(move |db| db.set_presence(&user, &gateway, now_ms()))
            .await
    }

    async fn get(&self, user: &UserId) -> Result<Option<GatewayId>> {
        let user = user.to_string();
        let gateway = self.with_db(move |db| db.get_presence(&user)).await?;
        Ok(gateway.map(GatewayId::from))
    }

    async fn remove(&self, user: &UserId, gateway: &GatewayId) -> Result<bool> {
        let (user, gateway) = (user.to_string(), gateway.to_string());
        self.with_db(move |db| db.remove_presence(&user, &gateway))
            .await
    }

    async fn clear_gateway(&self, gateway: &GatewayId) -> Result<usize> {
        let gateway = gateway.to_string();
        self.with_db(move |db| db.clear_gateway_presence(&gateway))
            .await
    }
}

#[async_trait]
impl OfflineStore for SqliteStore {
    async fn append(&self, user: &UserId, payload: Bytes, ttl: Duration) -> Result<()> {
        let user = user.to_string();
        let expires_at = deadline_ms(ttl);
        self.with_db(move |db| db.append_offline(&user, &payload, expires_at))
            .await
    }

    async fn drain_backlog(&self, user: &UserId) -> Result<DrainedBacklog> {
        let user = user.to_string();
        let (payloads, expires_at_ms) = self
            .with_db(move |db| db.drain_offline(&user, now_ms()))
            .await?;
        Ok(DrainedBacklog {
            payloads: payloads.into_iter().map(Bytes::from).collect(),
            expires_at_ms,
        })
    }

    async fn restore(&self, user: &UserId, payloads: Vec<Bytes>, expires_at_ms: i64) -> Result<()> {
        let user = user.to_string();
        let payloads: Vec<Vec<u8>> = payloads.iter().map(|p| p.to_vec()).collect();
        self.with_db(move |db| db.restore_offline(&user, &payloads, expires_at_ms, now_ms()))
            .await
    }

    async fn pending(&self, user: &UserId) -> Result<usize> {
        let user = user.to_string();
        self.with_db(move |db| db.count_offline(&user, now_ms()))
            .await
    }

    async fn purge_expired(&self) -> Result<usize> {
        self.with_db(|db| db.purge_expired_offline(now_ms())).await
    }
}

#[async_trait]
impl MessageStore for SqliteStore {
    async fn persist(&self, envelope: &Envelope) -> Result<bool> {
        let envelope = envelope.clone();
        self.with_db(move |db| db.insert_envelope(&envelope)).await
    }

    async fn find(&self, id: &str) -> Result<Option<Envelope>> {
        let id = id.to_string();
        self.with_db(move |db| db.get_envelope(&id)).await
    }

    async fn history(
        &self,
        conversation: &ConversationId,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Envelope>> {
        let conversation = conversation.to_string();
        self.with_db(move |db| db.get_envelopes_for_conversation(&conversation, limit, offset))
            .await
    }
}

#[async_trait]
impl ConversationStore for SqliteStore {
    async fn touch_last_message(&self, envelope: &Envelope) -> Result<()> {
        let envelope = envelope.clone();
        self.with_db(move |db| db.touch_conversation(&envelope)).await
    }
}

#[async_trait]
impl GroupDirectory for SqliteStore {
    async fn members(&self, group: &GroupId) -> Result<Vec<UserId>> {
        let group = group.to_string();
        let members = self
            .with_db(move |db| db.list_group_members(&group))
            .await?;
        Ok(members.into_iter().map(UserId::from).collect())
    }

    async fn add_member(&self, group: &GroupId, user: &UserId) -> Result<bool> {
        let (group, user) = (group.to_string(), user.to_string());
        self.with_db(move |db| db.add_group_member(&group, &user))
            .await
    }

    async fn remove_member(&self, group: &GroupId, user: &UserId) -> Result<bool> {
        let (group, user) = (group.to_string(), user.to_string());
        self.with_db(move |db| db.remove_group_member(&group, &user))
            .await
    }
}

#[cfg(test)]
mod tests {
    use courier_shared::Content;

    use super::*;

    #[tokio::test]
    async fn test_offline_roundtrip_through_trait() {
        let store = SqliteStore::open_in_memory().unwrap();
        let bob = UserId::from("bob");

        store
            .append(&bob, Bytes::from_static(b"m1"), Duration::from_secs(60))
            .await
            .unwrap();
        store
            .append(&bob, Bytes::from_static(b"m2"), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(store.pending(&bob).await.unwrap(), 2);

        let drained = store.drain_all(&bob).await.unwrap();
        assert_eq!(drained, vec![Bytes::from_static(b"m1"), Bytes::from_static(b"m2")]);
        assert!(store.drain_all(&bob).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_presence_through_trait() {
        let store = SqliteStore::open_in_memory().unwrap();
        let bob = UserId::from("bob");
        let gw = GatewayId::from("gw-2");

        store.set(&bob, &gw).await.unwrap();
        assert_eq!(store.get(&bob).await.unwrap(), Some(gw.clone()));
        assert!(store.remove(&bob, &gw).await.unwrap());
        assert_eq!(store.get(&bob).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_persist_and_read_history() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut env = Envelope::private(
            ConversationId::from("c1"),
            UserId::from("bob"),
            Content::text("hello"),
        );
        env.stamp(&UserId::from("alice"), 42);

        assert!(store.persist(&env).await.unwrap());
        store.touch_last_message(&env).await.unwrap();

        let history = store.history(&ConversationId::from("c1"), 10, 0).await.unwrap();
        assert_eq!(history, vec![env]);
    }

    #[tokio::test]
    async fn test_group_members_through_trait() {
        let store = SqliteStore::open_in_memory().unwrap();
        let team = GroupId::from("team");
        store.add_member(&team, &UserId::from("alice")).await.unwrap();
        store.add_member(&team, &UserId::from("bob")).await.unwrap();

        let mut members = store.members(&team).await.unwrap();
        members.sort();
        assert_eq!(members, vec![UserId::from("alice"), UserId::from("bob")]);
    }
}
