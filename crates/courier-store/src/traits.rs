//! Storage seams injected into the hub, the dispatcher and the sync
//! coordinator. Each method is one atomic operation against the backing
//! store; callers never compose multi-step transactions out of them.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use courier_shared::{ConversationId, Envelope, GatewayId, GroupId, UserId};

use crate::error::Result;

/// Shared `user -> gateway` map. Best-effort: a crashed gateway leaves
/// stale records behind until the user reconnects somewhere.
#[async_trait]
pub trait PresenceRegistry: Send + Sync {
    async fn set(&self, user: &UserId, gateway: &GatewayId) -> Result<()>;
    async fn get(&self, user: &UserId) -> Result<Option<GatewayId>>;
    /// Remove the record only if it still names `gateway`.
    async fn remove(&self, user: &UserId, gateway: &GatewayId) -> Result<bool>;
    /// Remove every record naming `gateway`.
    async fn clear_gateway(&self, gateway: &GatewayId) -> Result<usize>;
}

/// What one drain took out of a user's backlog.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainedBacklog {
    pub payloads: Vec<Bytes>,
    /// Retention deadline of the drained entry, unix millis. Zero when
    /// nothing was drained.
    pub expires_at_ms: i64,
}

/// Shared per-user backlog of binary envelopes.
#[async_trait]
pub trait OfflineStore: Send + Sync {
    /// Append and refresh the entry's retention to `ttl` from now.
    async fn append(&self, user: &UserId, payload: Bytes, ttl: Duration) -> Result<()>;
    /// Read every unexpired payload in append order and delete the entry.
    async fn drain_backlog(&self, user: &UserId) -> Result<DrainedBacklog>;
    /// Put `payloads` back at the head of the backlog, ahead of anything
    /// appended since they were drained. The entry keeps the later of its
    /// own deadline and `expires_at_ms`.
    async fn restore(&self, user: &UserId, payloads: Vec<Bytes>, expires_at_ms: i64) -> Result<()>;
    async fn drain_all(&self, user: &UserId) -> Result<Vec<Bytes>> {
        Ok(self.drain_backlog(user).await?.payloads)
    }
    async fn pending(&self, user: &UserId) -> Result<usize>;
    async fn purge_expired(&self) -> Result<usize>;
}

/// Durable message log.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Returns `false` if the id was already stored.
    async fn persist(&self, envelope: &Envelope) -> Result<bool>;
    async fn find(&self, id: &str) -> Result<Option<Envelope>>;
    async fn history(
        &self,
        conversation: &ConversationId,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Envelope>>;
}

#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn touch_last_message(&self, envelope: &Envelope) -> Result<()>;
}

/// Group membership as seen by the fan-out.
#[async_trait]
pub trait GroupDirectory: Send + Sync {
    async fn members(&self, group: &GroupId) -> Result<Vec<UserId>>;
    async fn add_member(&self, group: &GroupId, user: &UserId) -> Result<bool>;
    async fn remove_member(&self, group: &GroupId, user: &UserId) -> Result<bool>;
}

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub(crate) fn deadline_ms(ttl: Duration) -> i64 {
    now_ms().saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX))
}
