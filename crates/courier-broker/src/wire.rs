//! TCP framing: a 4-byte length prefix followed by one bincode [`Frame`].

use bytes::{Bytes, BytesMut};
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_util::codec::LengthDelimitedCodec;

use crate::broker::BrokerMessage;
use crate::error::BrokerError;

/// Upper bound on one frame; comfortably above the largest envelope.
pub const MAX_FRAME_LENGTH: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    /// client -> server; answered with `Ack` or `Error`.
    Publish {
        topic: String,
        key: Option<String>,
        payload: Bytes,
    },
    /// client -> server; answered with `Ack`, after which the connection only
    /// carries `Message` frames.
    Subscribe { topic: String, group: String },
    /// server -> client
    Message(BrokerMessage),
    Ack,
    Error(String),
}

impl Frame {
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Publish { .. } => "publish",
            Frame::Subscribe { .. } => "subscribe",
            Frame::Message(_) => "message",
            Frame::Ack => "ack",
            Frame::Error(_) => "error",
        }
    }
}

pub fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec()
}

pub async fn send_frame<S>(sink: &mut S, frame: &Frame) -> Result<(), BrokerError>
where
    S: Sink<Bytes, Error = std::io::Error> + Unpin,
{
    let encoded = bincode::serialize(frame)?;
    sink.send(Bytes::from(encoded)).await?;
    Ok(())
}

/// `Ok(None)` on a clean end of stream.
pub async fn read_frame<S>(stream: &mut S) -> Result<Option<Frame>, BrokerError>
where
    S: Stream<Item = Result<BytesMut, std::io::Error>> + Unpin,
{
    match stream.next().await {
        Some(Ok(buf)) => Ok(Some(bincode::deserialize(&buf)?)),
        Some(Err(e)) => Err(e.into()),
        None => Ok(None),
    }
}
