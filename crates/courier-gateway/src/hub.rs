//! Connection hub: the single authority in a gateway process over which
//! sockets are live.
//!
//! The table holds at most one connection per identity. Registration and
//! unregistration are applied by one event loop so their presence side
//! effects reach the shared registry in the same order as the table
//! changes. Delivery only takes the table lock and never waits on a socket:
//! a connection whose outbound queue is full is evicted instead. Eviction
//! drops the queue's sender, so the socket writer still flushes what was
//! already accepted before it closes the socket.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use courier_broker::Broker;
use courier_shared::{CodecError, Envelope, GatewayId, SyncRequest, Topics, UserId, WireFormat};
use courier_store::{with_retries, PresenceRegistry};

use crate::error::GatewayError;

const PRESENCE_ATTEMPTS: u32 = 3;

/// The socket-facing half of a registered connection.
#[derive(Debug)]
pub struct Connection {
    pub identity: UserId,
    pub id: u64,
    pub format: WireFormat,
    /// Closed when the hub evicts or replaces the connection.
    pub outbound: mpsc::Receiver<Bytes>,
    /// Fired on replacement and hub shutdown. Eviction only closes
    /// `outbound`.
    pub cancel: CancellationToken,
}

struct Entry {
    id: u64,
    format: WireFormat,
    tx: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
}

enum Command {
    Register {
        identity: UserId,
        entry: Entry,
        done: oneshot::Sender<()>,
    },
    Unregister {
        identity: UserId,
        id: u64,
        done: oneshot::Sender<bool>,
    },
    /// Sent after an eviction from the delivery path.
    ReleasePresence { identity: UserId },
    Shutdown { done: oneshot::Sender<usize> },
}

struct Shared {
    gateway: GatewayId,
    connections: Mutex<HashMap<UserId, Entry>>,
    presence: Arc<dyn PresenceRegistry>,
    broker: Arc<dyn Broker>,
    sync_topic: String,
    queue_capacity: usize,
    next_id: AtomicU64,
    closed: CancellationToken,
}

#[derive(Clone)]
pub struct Hub {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
}

impl Hub {
    /// Spawns the hub's event loop; must be called inside a tokio runtime.
    pub fn new(
        gateway: GatewayId,
        presence: Arc<dyn PresenceRegistry>,
        broker: Arc<dyn Broker>,
        topics: &Topics,
        queue_capacity: usize,
    ) -> Self {
        let shared = Arc::new(Shared {
            gateway,
            connections: Mutex::new(HashMap::new()),
            presence,
            broker,
            sync_topic: topics.sync_request.clone(),
            queue_capacity: queue_capacity.max(1),
            next_id: AtomicU64::new(1),
            closed: CancellationToken::new(),
        });
        let (commands, rx) = mpsc::unbounded_channel();
        tokio::spawn(run(Arc::clone(&shared), rx));
        Self { shared, commands }
    }

    pub fn gateway_id(&self) -> &GatewayId {
        &self.shared.gateway
    }

    /// Register a new connection for `identity`, replacing any connection
    /// the identity already has in this process. Returns once presence
    /// points at this gateway; the sync request is published afterwards.
    pub async fn connect(
        &self,
        identity: UserId,
        format: WireFormat,
    ) -> Result<Connection, GatewayError> {
        if self.shared.closed.is_cancelled() {
            return Err(GatewayError::HubClosed);
        }

        let (tx, outbound) = mpsc::channel(self.shared.queue_capacity);
        let cancel = self.shared.closed.child_token();
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);

        let (done, registered) = oneshot::channel();
        self.commands
            .send(Command::Register {
                identity: identity.clone(),
                entry: Entry {
                    id,
                    format,
                    tx,
                    cancel: cancel.clone(),
                },
                done,
            })
            .map_err(|_| GatewayError::HubClosed)?;
        registered.await.map_err(|_| GatewayError::HubClosed)?;

        Ok(Connection {
            identity,
            id,
            format,
            outbound,
            cancel,
        })
    }

    /// Remove the connection `id` of `identity`. A connection that was
    /// already replaced or evicted is a no-op and leaves presence alone.
    pub async fn unregister(&self, identity: &UserId, id: u64) -> bool {
        let (done, removed) = oneshot::channel();
        if self
            .commands
            .send(Command::Unregister {
                identity: identity.clone(),
                id,
                done,
            })
            .is_err()
        {
            return false;
        }
        removed.await.unwrap_or(false)
    }

    /// Queue `payload` on the identity's connection without waiting.
    /// Returns `false` if the identity has no connection here or its queue
    /// was full, in which case the connection has been closed and removed.
    pub async fn deliver(&self, identity: &UserId, payload: Bytes) -> bool {
        let mut connections = self.shared.connections.lock().await;
        self.offer(&mut connections, identity, payload)
    }

    /// Encode `envelope` in the recipient connection's wire format and
    /// deliver it to `envelope.recipient_id`.
    pub async fn deliver_envelope(&self, envelope: &Envelope) -> Result<bool, CodecError> {
        let Some(recipient) = envelope.recipient_id.as_ref() else {
            return Ok(false);
        };
        let mut connections = self.shared.connections.lock().await;
        let Some(format) = connections.get(recipient).map(|e| e.format) else {
            return Ok(false);
        };
        let payload = format.encode(envelope)?;
        Ok(self.offer(&mut connections, recipient, payload))
    }

    pub async fn connected_count(&self) -> usize {
        self.shared.connections.lock().await.len()
    }

    pub async fn is_connected(&self, identity: &UserId) -> bool {
        self.shared.connections.lock().await.contains_key(identity)
    }

    /// Close every connection, clear this gateway's presence records and
    /// stop the event loop. Returns the number of connections closed.
    pub async fn shutdown(&self) -> usize {
        let (done, closed) = oneshot::channel();
        if self.commands.send(Command::Shutdown { done }).is_err() {
            return 0;
        }
        closed.await.unwrap_or(0)
    }

    fn offer(
        &self,
        connections: &mut HashMap<UserId, Entry>,
        identity: &UserId,
        payload: Bytes,
    ) -> bool {
        let Some(entry) = connections.get(identity) else {
            return false;
        };

        let reason = match entry.tx.try_send(payload) {
            Ok(()) => return true,
            Err(TrySendError::Full(_)) => "outbound queue full",
            Err(TrySendError::Closed(_)) => "connection closing",
        };

        if let Some(evicted) = connections.remove(identity) {
            warn!(
                user = %identity,
                conn = evicted.id,
                reason,
                "Evicted connection"
            );
        }
        let _ = self.commands.send(Command::ReleasePresence {
            identity: identity.clone(),
        });
        false
    }
}

async fn run(shared: Arc<Shared>, mut commands: mpsc::UnboundedReceiver<Command>) {
    while let Some(command) = commands.recv().await {
        match command {
            Command::Register {
                identity,
                entry,
                done,
            } => {
                register(&shared, identity, entry).await;
                let _ = done.send(());
            }
            Command::Unregister { identity, id, done } => {
                let removed = unregister(&shared, &identity, id).await;
                let _ = done.send(removed);
            }
            Command::ReleasePresence { identity } => {
                release_presence(&shared, &identity).await;
            }
            Command::Shutdown { done } => {
                let closed = shutdown(&shared).await;
                let _ = done.send(closed);
                break;
            }
        }
    }
    debug!(gateway = %shared.gateway, "Hub event loop finished");
}

async fn register(shared: &Shared, identity: UserId, entry: Entry) {
    let id = entry.id;
    let previous = shared
        .connections
        .lock()
        .await
        .insert(identity.clone(), entry);

    if let Some(previous) = previous {
        // Dropping the old sender closes its queue.
        previous.cancel.cancel();
        info!(user = %identity, old = previous.id, new = id, "Replaced existing connection");
    }

    let presence = &shared.presence;
    let gateway = &shared.gateway;
    if let Err(e) = with_retries("presence.set", PRESENCE_ATTEMPTS, || {
        presence.set(&identity, gateway)
    })
    .await
    {
        warn!(user = %identity, error = %e, "Failed to record presence");
    }

    info!(user = %identity, conn = id, gateway = %gateway, "Connection registered");

    let request = SyncRequest::new(identity.clone(), gateway.clone());
    let broker = Arc::clone(&shared.broker);
    let topic = shared.sync_topic.clone();
    tokio::spawn(async move {
        let payload = match request.to_bytes() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(user = %request.identity, error = %e, "Failed to encode sync request");
                return;
            }
        };
        match broker
            .publish(&topic, Some(request.identity.as_str()), payload)
            .await
        {
            Ok(()) => debug!(user = %request.identity, "Sync request published"),
            Err(e) => warn!(user = %request.identity, error = %e, "Failed to publish sync request"),
        }
    });
}

async fn unregister(shared: &Shared, identity: &UserId, id: u64) -> bool {
    let removed = {
        let mut connections = shared.connections.lock().await;
        match connections.get(identity) {
            Some(entry) if entry.id == id => connections.remove(identity),
            _ => None,
        }
    };

    let Some(entry) = removed else {
        debug!(user = %identity, conn = id, "Unregister of stale connection ignored");
        return false;
    };
    entry.cancel.cancel();
    info!(user = %identity, conn = id, "Connection unregistered");
    release_presence(shared, identity).await;
    true
}

// Only clears presence if no newer connection for the identity has been
// registered here in the meantime.
async fn release_presence(shared: &Shared, identity: &UserId) {
    if shared.connections.lock().await.contains_key(identity) {
        return;
    }

    let presence = &shared.presence;
    let gateway = &shared.gateway;
    match with_retries("presence.remove", PRESENCE_ATTEMPTS, || {
        presence.remove(identity, gateway)
    })
    .await
    {
        Ok(true) => debug!(user = %identity, "Presence removed"),
        Ok(false) => debug!(user = %identity, "Presence already points elsewhere"),
        Err(e) => warn!(user = %identity, error = %e, "Failed to remove presence"),
    }
}

async fn shutdown(shared: &Shared) -> usize {
    shared.closed.cancel();
    let drained: Vec<(UserId, Entry)> = shared.connections.lock().await.drain().collect();
    for (_, entry) in &drained {
        entry.cancel.cancel();
    }

    let presence = &shared.presence;
    let gateway = &shared.gateway;
    match with_retries("presence.clear_gateway", PRESENCE_ATTEMPTS, || {
        presence.clear_gateway(gateway)
    })
    .await
    {
        Ok(cleared) => info!(gateway = %gateway, cleared, "Cleared gateway presence"),
        Err(e) => warn!(gateway = %gateway, error = %e, "Failed to clear gateway presence"),
    }

    info!(closed = drained.len(), "Hub shut down");
    drained.len()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use courier_broker::MemoryBroker;
    use courier_shared::codec::{decode_binary, decode_text};
    use courier_shared::{Content, ConversationId};
    use courier_store::MemoryStore;

    use super::*;

    struct Fixture {
        hub: Hub,
        store: MemoryStore,
        broker: MemoryBroker,
    }

    fn fixture(capacity: usize) -> Fixture {
        let store = MemoryStore::new();
        let broker = MemoryBroker::default();
        let hub = Hub::new(
            GatewayId::from("gw-1"),
            Arc::new(store.clone()),
            Arc::new(broker.clone()),
            &Topics::default(),
            capacity,
        );
        Fixture { hub, store, broker }
    }

    fn message_for(recipient: &str) -> Envelope {
        let mut env = Envelope::private(
            ConversationId::private_pair(&UserId::from("alice"), &UserId::from(recipient)),
            UserId::from(recipient),
            Content::text("hi"),
        );
        env.stamp(&UserId::from("alice"), 1_700_000_000);
        env
    }

    #[tokio::test]
    async fn test_connect_sets_presence_and_requests_sync() {
        let f = fixture(8);
        let mut sync = f.broker.subscribe("chat.sync", "test").await.unwrap();

        let conn = f
            .hub
            .connect(UserId::from("bob"), WireFormat::Binary)
            .await
            .unwrap();

        assert_eq!(f.store.get(&conn.identity).await.unwrap(), Some(GatewayId::from("gw-1")));
        let message = tokio::time::timeout(Duration::from_secs(1), sync.recv())
            .await
            .unwrap()
            .unwrap();
        let request = SyncRequest::from_bytes(&message.payload).unwrap();
        assert!(request.is_sync_offline());
        assert_eq!(request.identity, UserId::from("bob"));
        assert_eq!(request.gateway, GatewayId::from("gw-1"));
    }

    #[tokio::test]
    async fn test_second_connection_replaces_first() {
        let f = fixture(8);
        let bob = UserId::from("bob");
        let mut first = f.hub.connect(bob.clone(), WireFormat::Binary).await.unwrap();
        let second = f.hub.connect(bob.clone(), WireFormat::Binary).await.unwrap();

        assert!(first.cancel.is_cancelled());
        assert!(first.outbound.recv().await.is_none());
        assert_eq!(f.hub.connected_count().await, 1);

        // The replaced connection's teardown must not clear presence.
        assert!(!f.hub.unregister(&bob, first.id).await);
        assert_eq!(f.store.get(&bob).await.unwrap(), Some(GatewayId::from("gw-1")));

        assert!(f.hub.unregister(&bob, second.id).await);
        assert_eq!(f.store.get(&bob).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_deliver_to_unknown_identity_is_false() {
        let f = fixture(8);
        assert!(!f.hub.deliver(&UserId::from("nobody"), Bytes::from("x")).await);
    }

    #[tokio::test]
    async fn test_full_queue_evicts_without_blocking_others() {
        let f = fixture(2);
        let mut slow = f.hub.connect(UserId::from("slow"), WireFormat::Binary).await.unwrap();
        let mut fast = f.hub.connect(UserId::from("fast"), WireFormat::Binary).await.unwrap();

        assert!(f.hub.deliver(&slow.identity, Bytes::from("1")).await);
        assert!(f.hub.deliver(&slow.identity, Bytes::from("2")).await);
        assert!(!f.hub.deliver(&slow.identity, Bytes::from("3")).await);
        assert!(f.hub.deliver(&fast.identity, Bytes::from("ok")).await);

        // What was accepted before the eviction is still handed out.
        assert!(!slow.cancel.is_cancelled());
        assert_eq!(slow.outbound.recv().await, Some(Bytes::from("1")));
        assert_eq!(slow.outbound.recv().await, Some(Bytes::from("2")));
        assert_eq!(slow.outbound.recv().await, None);
        assert!(!f.hub.is_connected(&slow.identity).await);
        assert!(f.hub.is_connected(&fast.identity).await);
        assert_eq!(fast.outbound.recv().await, Some(Bytes::from("ok")));

        // Presence release goes through the event loop.
        for _ in 0..100 {
            if f.store.get(&slow.identity).await.unwrap().is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(f.store.get(&slow.identity).await.unwrap(), None);
        assert!(!f.hub.unregister(&slow.identity, slow.id).await);
    }

    #[tokio::test]
    async fn test_deliver_envelope_uses_connection_format() {
        let f = fixture(8);
        let mut binary = f.hub.connect(UserId::from("bob"), WireFormat::Binary).await.unwrap();
        let mut text = f.hub.connect(UserId::from("carol"), WireFormat::Text).await.unwrap();

        let to_bob = message_for("bob");
        let to_carol = message_for("carol");
        assert!(f.hub.deliver_envelope(&to_bob).await.unwrap());
        assert!(f.hub.deliver_envelope(&to_carol).await.unwrap());

        let raw = binary.outbound.recv().await.unwrap();
        assert_eq!(decode_binary(&raw).unwrap(), to_bob);
        let raw = text.outbound.recv().await.unwrap();
        assert_eq!(raw.first(), Some(&b'{'));
        assert_eq!(decode_text(&raw).unwrap(), to_carol);
    }

    #[tokio::test]
    async fn test_shutdown_closes_everything_and_clears_presence() {
        let f = fixture(8);
        let a = f.hub.connect(UserId::from("a"), WireFormat::Binary).await.unwrap();
        let b = f.hub.connect(UserId::from("b"), WireFormat::Text).await.unwrap();

        assert_eq!(f.hub.shutdown().await, 2);
        assert!(a.cancel.is_cancelled());
        assert!(b.cancel.is_cancelled());
        assert_eq!(f.store.get(&a.identity).await.unwrap(), None);
        assert!(matches!(
            f.hub.connect(UserId::from("c"), WireFormat::Binary).await,
            Err(GatewayError::HubClosed)
        ));
    }
}
