//! TCP front for a [`MemoryBroker`].
//!
//! A connection either carries publish requests (each answered with `Ack` or
//! `Error`) or, after a `Subscribe`, becomes a one-way stream of `Message`
//! frames for that membership.

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::broker::{Broker, Subscription};
use crate::error::BrokerError;
use crate::memory::MemoryBroker;
use crate::wire::{codec, read_frame, send_frame, Frame};

type Reader = FramedRead<OwnedReadHalf, LengthDelimitedCodec>;
type Writer = FramedWrite<OwnedWriteHalf, LengthDelimitedCodec>;

/// Accept connections until `cancel` fires.
pub async fn serve(
    listener: TcpListener,
    broker: MemoryBroker,
    cancel: CancellationToken,
) -> Result<(), BrokerError> {
    info!(addr = ?listener.local_addr().ok(), "Broker listening");

    loop {
        let (stream, peer) = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                    continue;
                }
            },
        };

        let broker = broker.clone();
        let cancel = cancel.child_token();
        tokio::spawn(async move {
            debug!(peer = %peer, "Broker client connected");
            if let Err(e) = handle_connection(stream, broker, cancel).await {
                debug!(peer = %peer, error = %e, "Broker client connection failed");
            }
        });
    }

    info!("Broker stopped accepting connections");
    Ok(())
}

async fn handle_connection(
    stream: TcpStream,
    broker: MemoryBroker,
    cancel: CancellationToken,
) -> Result<(), BrokerError> {
    stream.set_nodelay(true)?;
    let (read_half, write_half) = stream.into_split();
    let mut reader = FramedRead::new(read_half, codec());
    let mut writer = FramedWrite::new(write_half, codec());

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            frame = read_frame(&mut reader) => frame?,
        };

        match frame {
            None => return Ok(()),
            Some(Frame::Publish {
                topic,
                key,
                payload,
            }) => {
                let reply = match broker.publish(&topic, key.as_deref(), payload).await {
                    Ok(()) => Frame::Ack,
                    Err(e) => Frame::Error(e.to_string()),
                };
                send_frame(&mut writer, &reply).await?;
            }
            Some(Frame::Subscribe { topic, group }) => {
                let subscription = broker.subscribe(&topic, &group).await?;
                send_frame(&mut writer, &Frame::Ack).await?;
                info!(topic = %topic, group = %group, "Remote subscriber joined");
                return stream_subscription(subscription, reader, writer, cancel).await;
            }
            Some(other) => {
                let kind = other.kind();
                send_frame(&mut writer, &Frame::Error(format!("unexpected {kind} frame")))
                    .await?;
                return Err(BrokerError::UnexpectedFrame(kind));
            }
        }
    }
}

async fn stream_subscription(
    mut subscription: Subscription,
    mut reader: Reader,
    mut writer: Writer,
    cancel: CancellationToken,
) -> Result<(), BrokerError> {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            frame = read_frame(&mut reader) => match frame? {
                None => {
                    debug!(
                        topic = subscription.topic(),
                        group = subscription.group(),
                        "Remote subscriber left"
                    );
                    return Ok(());
                }
                Some(other) => return Err(BrokerError::UnexpectedFrame(other.kind())),
            },
            message = subscription.recv() => match message {
                Some(message) => send_frame(&mut writer, &Frame::Message(message)).await?,
                None => return Ok(()),
            },
        }
    }
}
