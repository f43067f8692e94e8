//! [`Broker`] implementation that talks to a broker server over TCP.
//!
//! Publishes go through one long-lived connection owned by a background
//! task; callers hand it requests over a channel and wait for the server's
//! acknowledgement. Each subscription opens its own connection.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tracing::{debug, info, warn};

use crate::broker::{Broker, BrokerMessage, Subscription};
use crate::error::BrokerError;
use crate::memory::DEFAULT_SUBSCRIPTION_BUFFER;
use crate::wire::{codec, read_frame, send_frame, Frame};

struct PublishRequest {
    frame: Frame,
    reply: oneshot::Sender<Result<(), BrokerError>>,
}

#[derive(Clone)]
pub struct RemoteBroker {
    addr: String,
    requests: mpsc::Sender<PublishRequest>,
}

impl RemoteBroker {
    /// Must be called from within a tokio runtime. The connection is opened
    /// on first use and re-opened after failures.
    pub fn new(addr: impl Into<String>) -> Self {
        let addr = addr.into();
        let (requests, rx) = mpsc::channel(256);
        tokio::spawn(run_publisher(addr.clone(), rx));
        Self { addr, requests }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }
}

#[async_trait]
impl Broker for RemoteBroker {
    async fn publish(
        &self,
        topic: &str,
        key: Option<&str>,
        payload: Bytes,
    ) -> Result<(), BrokerError> {
        let (reply, reply_rx) = oneshot::channel();
        let frame = Frame::Publish {
            topic: topic.to_string(),
            key: key.map(str::to_string),
            payload,
        };
        self.requests
            .send(PublishRequest { frame, reply })
            .await
            .map_err(|_| BrokerError::Closed)?;
        reply_rx.await.map_err(|_| BrokerError::Closed)?
    }

    async fn subscribe(&self, topic: &str, group: &str) -> Result<Subscription, BrokerError> {
        let mut conn = Connection::open(&self.addr).await?;
        conn.request(&Frame::Subscribe {
            topic: topic.to_string(),
            group: group.to_string(),
        })
        .await?;

        let (tx, rx) = mpsc::channel(DEFAULT_SUBSCRIPTION_BUFFER);
        tokio::spawn(forward_messages(conn, tx, topic.to_string()));
        info!(addr = %self.addr, topic, group, "Subscribed to remote broker");
        Ok(Subscription::new(topic, group, rx))
    }
}

struct Connection {
    reader: FramedRead<OwnedReadHalf, LengthDelimitedCodec>,
    writer: FramedWrite<OwnedWriteHalf, LengthDelimitedCodec>,
}

impl Connection {
    async fn open(addr: &str) -> Result<Self, BrokerError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();
        Ok(Self {
            reader: FramedRead::new(read_half, codec()),
            writer: FramedWrite::new(write_half, codec()),
        })
    }

    async fn request(&mut self, frame: &Frame) -> Result<(), BrokerError> {
        send_frame(&mut self.writer, frame).await?;
        match read_frame(&mut self.reader).await? {
            Some(Frame::Ack) => Ok(()),
            Some(Frame::Error(reason)) => Err(BrokerError::Rejected(reason)),
            Some(other) => Err(BrokerError::UnexpectedFrame(other.kind())),
            None => Err(BrokerError::Closed),
        }
    }
}

async fn run_publisher(addr: String, mut requests: mpsc::Receiver<PublishRequest>) {
    let mut conn: Option<Connection> = None;

    while let Some(request) = requests.recv().await {
        let result = publish_with_reconnect(&addr, &mut conn, &request.frame).await;
        let _ = request.reply.send(result);
    }

    debug!(addr = %addr, "Publisher task finished");
}

// A pooled connection may have gone stale (broker restart); that case gets
// one retry on a fresh connection.
async fn publish_with_reconnect(
    addr: &str,
    conn: &mut Option<Connection>,
    frame: &Frame,
) -> Result<(), BrokerError> {
    if let Some(existing) = conn.as_mut() {
        match existing.request(frame).await {
            Ok(()) => return Ok(()),
            Err(BrokerError::Rejected(reason)) => return Err(BrokerError::Rejected(reason)),
            Err(e) => {
                debug!(addr, error = %e, "Broker connection stale, reconnecting");
                *conn = None;
            }
        }
    }

    let mut fresh = Connection::open(addr).await?;
    let result = fresh.request(frame).await;
    if result.is_ok() {
        *conn = Some(fresh);
    }
    result
}

async fn forward_messages(mut conn: Connection, tx: mpsc::Sender<BrokerMessage>, topic: String) {
    loop {
        tokio::select! {
            _ = tx.closed() => break,
            frame = read_frame(&mut conn.reader) => match frame {
                Ok(Some(Frame::Message(message))) => {
                    if tx.send(message).await.is_err() {
                        break;
                    }
                }
                Ok(Some(other)) => {
                    warn!(topic = %topic, kind = other.kind(), "Unexpected frame on subscription");
                    break;
                }
                Ok(None) => {
                    info!(topic = %topic, "Broker closed subscription");
                    break;
                }
                Err(e) => {
                    warn!(topic = %topic, error = %e, "Subscription read failed");
                    break;
                }
            },
        }
    }
}
