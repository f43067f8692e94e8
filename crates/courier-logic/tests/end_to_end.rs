//! Gateway + broker + logic tier wired together in one process.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use courier_broker::{consume, Broker, MemoryBroker, MessageHandler, Subscription};
use courier_gateway::{Connection, DeliveryConsumer, Hub, IngestPublisher};
use courier_logic::{DispatchError, Dispatcher, Stores, SyncCoordinator};
use courier_shared::codec::{decode, decode_text};
use courier_shared::{
    Content, ConversationId, Envelope, GatewayId, GroupId, Topics, UserId, WireFormat,
};
use courier_store::{
    GroupDirectory, MemoryStore, MessageStore, OfflineStore, PresenceRegistry, SqliteStore,
    StoreError,
};

const OFFLINE_TTL: Duration = Duration::from_secs(3600);

struct Cluster {
    stores: Stores,
    broker: MemoryBroker,
    topics: Topics,
    cancel: CancellationToken,
}

impl Cluster {
    /// Logic tier consumers are subscribed before this returns, so nothing
    /// published afterwards is dropped for lack of a consumer.
    async fn start(stores: Stores) -> Self {
        let broker = MemoryBroker::default();
        let topics = Topics::default();
        let cancel = CancellationToken::new();
        let shared: Arc<dyn Broker> = Arc::new(broker.clone());

        let dispatcher = Dispatcher::new(stores.clone(), shared.clone(), topics.clone(), OFFLINE_TTL);
        let ingest = broker
            .subscribe(&topics.ingest, "logic_service_group")
            .await
            .unwrap();
        spawn_consumer(ingest, dispatcher, cancel.clone());

        let coordinator = SyncCoordinator::new(stores.offline.clone(), shared, topics.clone());
        let sync = broker
            .subscribe(&topics.sync_request, "logic_sync_group")
            .await
            .unwrap();
        spawn_consumer(sync, coordinator, cancel.clone());

        Self {
            stores,
            broker,
            topics,
            cancel,
        }
    }

    async fn in_memory() -> (Self, MemoryStore) {
        let store = MemoryStore::new();
        (Self::start(Stores::shared(Arc::new(store.clone()))).await, store)
    }

    async fn gateway(&self, id: &str) -> Hub {
        let gateway = GatewayId::from(id);
        let hub = Hub::new(
            gateway.clone(),
            self.stores.presence.clone(),
            Arc::new(self.broker.clone()),
            &self.topics,
            16,
        );
        let delivery = self
            .broker
            .subscribe(&self.topics.delivery(&gateway), id)
            .await
            .unwrap();
        spawn_consumer(
            delivery,
            DeliveryConsumer::new(hub.clone(), self.stores.offline.clone(), OFFLINE_TTL),
            self.cancel.clone(),
        );
        hub
    }

    fn ingest(&self) -> IngestPublisher {
        IngestPublisher::new(Arc::new(self.broker.clone()), self.topics.ingest.clone())
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn spawn_consumer<H>(subscription: Subscription, handler: H, cancel: CancellationToken)
where
    H: MessageHandler + 'static,
{
    tokio::spawn(async move { consume(subscription, &cancel, &handler).await });
}

fn private(to: &str, text: &str) -> Envelope {
    Envelope::private(
        ConversationId::private_pair(&UserId::from("alice"), &UserId::from(to)),
        UserId::from(to),
        Content::text(text),
    )
}

async fn receive(conn: &mut Connection) -> Envelope {
    let payload = tokio::time::timeout(Duration::from_secs(2), conn.outbound.recv())
        .await
        .expect("nothing delivered")
        .expect("connection closed");
    decode(&payload).unwrap().0
}

async fn assert_quiet(conn: &mut Connection) {
    assert!(
        tokio::time::timeout(Duration::from_millis(150), conn.outbound.recv())
            .await
            .is_err(),
        "unexpected delivery"
    );
}

/// Poll until the user's offline queue holds `expected` entries.
async fn wait_pending(offline: &Arc<dyn OfflineStore>, user: &UserId, expected: usize) {
    for _ in 0..100 {
        if offline.pending(user).await.unwrap() == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("offline queue of {user} never reached {expected}");
}

#[tokio::test]
async fn test_alice_to_bob_on_gw2() {
    let (cluster, _store) = Cluster::in_memory().await;
    let gw2 = cluster.gateway("gw-2").await;
    let mut bob = gw2.connect(UserId::from("bob"), WireFormat::Binary).await.unwrap();

    let mut tap = cluster
        .broker
        .subscribe("chat.deliver.gw-2", "observer")
        .await
        .unwrap();

    cluster
        .ingest()
        .publish(&UserId::from("alice"), private("bob", "hi"))
        .await
        .unwrap();

    let published = tokio::time::timeout(Duration::from_secs(2), tap.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(published.key.as_deref(), Some("bob"));

    let delivered = receive(&mut bob).await;
    assert_eq!(delivered.sender_id, UserId::from("alice"));
    assert_eq!(delivered.recipient_id, Some(UserId::from("bob")));
    assert_eq!(delivered.content.as_text(), Some("hi"));
}

#[tokio::test]
async fn test_text_client_receives_json() {
    let (cluster, _store) = Cluster::in_memory().await;
    let gw = cluster.gateway("gw-1").await;
    let mut bob = gw.connect(UserId::from("bob"), WireFormat::Text).await.unwrap();

    cluster
        .ingest()
        .publish(&UserId::from("alice"), private("bob", "hi"))
        .await
        .unwrap();

    let payload = tokio::time::timeout(Duration::from_secs(2), bob.outbound.recv())
        .await
        .unwrap()
        .unwrap();
    let json: serde_json::Value = serde_json::from_slice(&payload).unwrap();
    assert_eq!(json["senderId"], "alice");
    assert_eq!(json["contentType"], 1);
    assert_eq!(decode_text(&payload).unwrap().content.as_text(), Some("hi"));
}

#[tokio::test]
async fn test_reconnect_drains_offline_backlog_exactly_once() {
    let (cluster, store) = Cluster::in_memory().await;
    let bob_id = UserId::from("bob");

    let mut sync_tap = cluster
        .broker
        .subscribe(&cluster.topics.sync_request, "observer")
        .await
        .unwrap();

    let gw1 = cluster.gateway("gw-1").await;
    let first = gw1.connect(bob_id.clone(), WireFormat::Binary).await.unwrap();
    // Let the first connection's (empty) sync run before anything is queued.
    tokio::time::timeout(Duration::from_secs(2), sync_tap.recv())
        .await
        .unwrap()
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(gw1.unregister(&bob_id, first.id).await);
    assert_eq!(store.get(&bob_id).await.unwrap(), None);

    let sent = cluster
        .ingest()
        .publish(&UserId::from("alice"), private("bob", "while you were out"))
        .await
        .unwrap();
    wait_pending(&cluster.stores.offline, &bob_id, 1).await;

    let gw2 = cluster.gateway("gw-2").await;
    let mut bob = gw2.connect(bob_id.clone(), WireFormat::Binary).await.unwrap();
    assert_eq!(store.get(&bob_id).await.unwrap(), Some(GatewayId::from("gw-2")));

    let delivered = receive(&mut bob).await;
    assert_eq!(delivered.id, sent);
    assert_eq!(delivered.content.as_text(), Some("while you were out"));
    assert_quiet(&mut bob).await;
    assert_eq!(store.pending(&bob_id).await.unwrap(), 0);
}

#[tokio::test]
async fn test_backlog_larger_than_outbound_queue_is_not_lost() {
    const BACKLOG: usize = 40;
    let (cluster, _store) = Cluster::in_memory().await;
    let bob_id = UserId::from("bob");
    for n in 0..BACKLOG {
        cluster
            .ingest()
            .publish(&UserId::from("alice"), private("bob", &format!("m{n}")))
            .await
            .unwrap();
    }
    wait_pending(&cluster.stores.offline, &bob_id, BACKLOG).await;

    // Nothing reads while the sync runs, so the 16-slot queue overflows.
    let gw = cluster.gateway("gw-1").await;
    let mut bob = gw.connect(bob_id.clone(), WireFormat::Binary).await.unwrap();
    for _ in 0..200 {
        if !gw.is_connected(&bob_id).await {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!gw.is_connected(&bob_id).await);

    // Everything the queue accepted before the eviction is still there.
    let mut received = Vec::new();
    while let Ok(Some(payload)) =
        tokio::time::timeout(Duration::from_secs(2), bob.outbound.recv()).await
    {
        received.push(decode(&payload).unwrap().0);
    }
    assert_eq!(received.len(), 16);

    let texts: Vec<String> = (0..received.len()).map(|n| format!("m{n}")).collect();
    let got: Vec<String> = received
        .iter()
        .filter_map(|env| env.content.as_text().map(str::to_string))
        .collect();
    assert_eq!(got, texts);
    wait_pending(&cluster.stores.offline, &bob_id, BACKLOG - received.len()).await;
}

#[tokio::test]
async fn test_group_fan_out_spans_gateways_and_skips_sender() {
    let (cluster, store) = Cluster::in_memory().await;
    let team = GroupId::from("team");
    for user in ["alice", "bob", "carol", "dave"] {
        store.add_member(&team, &UserId::from(user)).await.unwrap();
    }

    let gw1 = cluster.gateway("gw-1").await;
    let gw2 = cluster.gateway("gw-2").await;
    let mut alice = gw1.connect(UserId::from("alice"), WireFormat::Binary).await.unwrap();
    let mut bob = gw1.connect(UserId::from("bob"), WireFormat::Binary).await.unwrap();
    let mut carol = gw2.connect(UserId::from("carol"), WireFormat::Binary).await.unwrap();

    let env = Envelope::group(ConversationId::group(&team), team.clone(), Content::text("standup"));
    cluster.ingest().publish(&UserId::from("alice"), env).await.unwrap();

    assert_eq!(receive(&mut bob).await.recipient_id, Some(UserId::from("bob")));
    assert_eq!(receive(&mut carol).await.recipient_id, Some(UserId::from("carol")));
    wait_pending(&cluster.stores.offline, &UserId::from("dave"), 1).await;
    assert_quiet(&mut alice).await;
}

#[tokio::test]
async fn test_empty_backlog_sync_publishes_nothing() {
    let (cluster, _store) = Cluster::in_memory().await;
    let mut tap = cluster
        .broker
        .subscribe("chat.deliver.gw-1", "observer")
        .await
        .unwrap();

    let gw1 = cluster.gateway("gw-1").await;
    let _bob = gw1.connect(UserId::from("bob"), WireFormat::Binary).await.unwrap();

    assert!(
        tokio::time::timeout(Duration::from_millis(200), tap.recv())
            .await
            .is_err()
    );
}

struct FailingMessages;

#[async_trait]
impl MessageStore for FailingMessages {
    async fn persist(&self, _: &Envelope) -> Result<bool, StoreError> {
        Err(StoreError::Unavailable("disk full".into()))
    }

    async fn find(&self, _: &str) -> Result<Option<Envelope>, StoreError> {
        Ok(None)
    }

    async fn history(
        &self,
        _: &ConversationId,
        _: u32,
        _: u32,
    ) -> Result<Vec<Envelope>, StoreError> {
        Ok(Vec::new())
    }
}

#[tokio::test]
async fn test_persistence_failure_aborts_delivery() {
    let store = MemoryStore::new();
    let mut stores = Stores::shared(Arc::new(store.clone()));
    stores.messages = Arc::new(FailingMessages);
    let broker = MemoryBroker::default();
    store.set(&UserId::from("bob"), &GatewayId::from("gw-1")).await.unwrap();
    let mut gw1 = broker.subscribe("chat.deliver.gw-1", "gw-1").await.unwrap();

    let dispatcher = Dispatcher::new(stores, Arc::new(broker.clone()), Topics::default(), OFFLINE_TTL);
    let mut env = private("bob", "lost?");
    env.stamp(&UserId::from("alice"), 1_700_000_000);

    assert!(matches!(
        dispatcher.dispatch(&env).await,
        Err(DispatchError::Persist(_))
    ));
    assert!(
        tokio::time::timeout(Duration::from_millis(50), gw1.recv())
            .await
            .is_err()
    );
    assert_eq!(store.pending(&UserId::from("bob")).await.unwrap(), 0);
}

#[tokio::test]
async fn test_sqlite_backend_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(SqliteStore::open(&dir.path().join("courier.db")).unwrap());
    let cluster = Cluster::start(Stores::shared(store.clone())).await;
    let bob_id = UserId::from("bob");

    let sent = cluster
        .ingest()
        .publish(&UserId::from("alice"), private("bob", "stored on disk"))
        .await
        .unwrap();
    wait_pending(&cluster.stores.offline, &bob_id, 1).await;

    let conversation = ConversationId::private_pair(&UserId::from("alice"), &bob_id);
    let history = store.history(&conversation, 10, 0).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].id, sent);

    let gw = cluster.gateway("gw-1").await;
    let mut bob = gw.connect(bob_id.clone(), WireFormat::Binary).await.unwrap();
    assert_eq!(receive(&mut bob).await.id, sent);
    assert_eq!(store.pending(&bob_id).await.unwrap(), 0);
}
