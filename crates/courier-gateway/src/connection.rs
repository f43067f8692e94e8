//! Per-socket reader and writer tasks.
//!
//! The two directions share nothing but the connection's outbound queue and
//! its cancellation token; whichever side fails first cancels the other.
//! Payloads the writer never got onto the socket are handed back to the
//! delivery path once the connection is unregistered.

use std::fmt::Display;
use std::time::Duration;

use axum::extract::ws::Message;
use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use courier_shared::codec::decode;
use courier_shared::{UserId, WireFormat};

use crate::config::GatewayConfig;
use crate::delivery::DeliveryConsumer;
use crate::hub::{Connection, Hub};
use crate::ingest::IngestPublisher;
use crate::rate_limit::MessageThrottle;

#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub ping_interval: Duration,
    pub pong_wait: Duration,
    pub max_frame_bytes: usize,
    pub write_batch: usize,
    pub message_rate: f64,
    pub message_burst: f64,
}

impl From<&GatewayConfig> for ConnectionSettings {
    fn from(config: &GatewayConfig) -> Self {
        Self {
            ping_interval: config.ping_interval,
            pong_wait: config.pong_wait,
            max_frame_bytes: config.max_frame_bytes,
            write_batch: config.write_batch,
            message_rate: config.message_rate,
            message_burst: config.message_burst,
        }
    }
}

/// Drive one registered connection until either side fails, then
/// unregister it from the hub.
pub async fn run_connection<W, R, E>(
    conn: Connection,
    sink: W,
    stream: R,
    hub: Hub,
    ingest: IngestPublisher,
    delivery: DeliveryConsumer,
    settings: ConnectionSettings,
) where
    W: Sink<Message> + Unpin + Send + 'static,
    W::Error: Display + Send,
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    let Connection {
        identity,
        id,
        format,
        outbound,
        cancel,
    } = conn;

    let writer = tokio::spawn(write_loop(
        sink,
        outbound,
        format,
        cancel.clone(),
        settings.clone(),
    ));

    read_loop(stream, &identity, &ingest, &cancel, &settings).await;

    cancel.cancel();
    let unsent = writer.await.unwrap_or_else(|e| {
        warn!(user = %identity, conn = id, error = %e, "Writer task failed");
        Vec::new()
    });
    hub.unregister(&identity, id).await;

    if !unsent.is_empty() {
        info!(user = %identity, conn = id, unsent = unsent.len(), "Handing back unsent payloads");
        delivery.redeliver(unsent).await;
    }
    info!(user = %identity, conn = id, "Connection closed");
}

async fn read_loop<R, E>(
    mut stream: R,
    identity: &UserId,
    ingest: &IngestPublisher,
    cancel: &CancellationToken,
    settings: &ConnectionSettings,
) where
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    let mut throttle = MessageThrottle::new(settings.message_rate, settings.message_burst);

    loop {
        // Any inbound frame, pongs included, resets the deadline.
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = tokio::time::timeout(settings.pong_wait, stream.next()) => next,
        };

        let frame = match next {
            Err(_) => {
                info!(user = %identity, "No frames within pong wait, closing");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                debug!(user = %identity, error = %e, "Socket read failed");
                break;
            }
            Ok(Some(Ok(frame))) => frame,
        };

        let data = match frame {
            Message::Binary(data) => data,
            Message::Text(text) => text.into_bytes(),
            Message::Ping(_) | Message::Pong(_) => continue,
            Message::Close(_) => break,
        };

        if data.len() > settings.max_frame_bytes {
            warn!(user = %identity, size = data.len(), "Inbound frame too large, dropped");
            continue;
        }
        if !throttle.allow() {
            warn!(user = %identity, "Inbound message rate exceeded, dropped");
            continue;
        }

        match decode(&data) {
            Ok((envelope, _)) => {
                if let Err(e) = ingest.publish(identity, envelope).await {
                    warn!(user = %identity, error = %e, "Failed to ingest message");
                }
            }
            Err(e) => debug!(user = %identity, error = %e, "Undecodable frame dropped"),
        }
    }
}

/// Returns what was accepted into the queue but not written.
async fn write_loop<W>(
    mut sink: W,
    mut outbound: mpsc::Receiver<Bytes>,
    format: WireFormat,
    cancel: CancellationToken,
    settings: ConnectionSettings,
) -> Vec<Bytes>
where
    W: Sink<Message> + Unpin,
    W::Error: Display + Send,
{
    let mut ping = interval_at(
        Instant::now() + settings.ping_interval,
        settings.ping_interval,
    );
    let mut unsent = Vec::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            first = outbound.recv() => {
                // Closed and empty: the hub evicted or replaced us and
                // everything it accepted has been written.
                let Some(first) = first else { break };
                let mut batch = vec![first];
                while batch.len() < settings.write_batch {
                    match outbound.try_recv() {
                        Ok(payload) => batch.push(payload),
                        Err(_) => break,
                    }
                }
                if let Err(e) = write_batch(&mut sink, format, &batch).await {
                    debug!(error = %e, "Socket write failed");
                    unsent = batch;
                    break;
                }
            }
            _ = ping.tick() => {
                if let Err(e) = sink.send(Message::Ping(Vec::new())).await {
                    debug!(error = %e, "Ping failed");
                    break;
                }
            }
        }
    }

    cancel.cancel();
    outbound.close();
    while let Ok(payload) = outbound.try_recv() {
        unsent.push(payload);
    }
    let _ = sink.send(Message::Close(None)).await;
    let _ = sink.close().await;
    unsent
}

/// Text connections get one newline-delimited frame per batch; binary
/// connections one frame per envelope.
async fn write_batch<W>(sink: &mut W, format: WireFormat, batch: &[Bytes]) -> Result<(), W::Error>
where
    W: Sink<Message> + Unpin,
{
    if format == WireFormat::Text {
        let joined = batch.join(&b'\n');
        match String::from_utf8(joined) {
            Ok(text) => return sink.send(Message::Text(text)).await,
            Err(_) => warn!("Text batch is not UTF-8, falling back to binary frames"),
        }
    }

    for payload in batch {
        sink.feed(Message::Binary(payload.to_vec())).await?;
    }
    sink.flush().await
}
