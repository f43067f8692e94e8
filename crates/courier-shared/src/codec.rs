//! Envelope wire codec.
//!
//! Two encodings share one [`Envelope`] shape:
//!
//! - **binary** (primary): `BINARY_MAGIC || BINARY_VERSION || bincode(envelope)`,
//!   used on the broker and by native clients;
//! - **text** (fallback): a camelCase JSON object whose `body` is interpreted
//!   according to `contentType`, used by browser clients.
//!
//! [`decode`] tries binary first and falls back to text. A frame that fails
//! both is reported as [`CodecError::Unrecognized`]; callers drop it and keep
//! the connection open.

use std::str::FromStr;

use bincode::Options;
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::constants::{BINARY_MAGIC, BINARY_VERSION, MAX_ENVELOPE_SIZE};
use crate::envelope::{Attachment, Content, ContentType, Envelope, MessageType, TextBody};
use crate::error::CodecError;
use crate::types::{ConversationId, GroupId, UserId};

/// Encoding negotiated per client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireFormat {
    #[default]
    Binary,
    Text,
}

impl WireFormat {
    pub fn encode(self, envelope: &Envelope) -> Result<Bytes, CodecError> {
        match self {
            WireFormat::Binary => encode_binary(envelope),
            WireFormat::Text => encode_text(envelope),
        }
    }
}

impl FromStr for WireFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "binary" | "bin" | "proto" => Ok(WireFormat::Binary),
            "text" | "json" => Ok(WireFormat::Text),
            other => Err(format!("unknown wire format '{other}'")),
        }
    }
}

fn binary_options() -> impl Options {
    bincode::DefaultOptions::new().with_limit(MAX_ENVELOPE_SIZE)
}

// ---------------------------------------------------------------------------
// Binary
// ---------------------------------------------------------------------------

pub fn encode_binary(envelope: &Envelope) -> Result<Bytes, CodecError> {
    let body = binary_options().serialize(envelope)?;
    let mut buf = BytesMut::with_capacity(body.len() + 2);
    buf.put_u8(BINARY_MAGIC);
    buf.put_u8(BINARY_VERSION);
    buf.extend_from_slice(&body);
    Ok(buf.freeze())
}

pub fn decode_binary(data: &[u8]) -> Result<Envelope, CodecError> {
    match data {
        [] => Err(CodecError::Empty),
        [magic, version, body @ ..] if *magic == BINARY_MAGIC => {
            if *version != BINARY_VERSION {
                return Err(CodecError::UnsupportedVersion(*version));
            }
            Ok(binary_options().deserialize(body)?)
        }
        _ => Err(CodecError::NotBinary),
    }
}

// ---------------------------------------------------------------------------
// Text
// ---------------------------------------------------------------------------

/// JSON shape of an envelope. Accepts the legacy `*UUID` / `conversationID`
/// key spellings on input.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TextEnvelope {
    #[serde(default)]
    id: String,
    #[serde(default, alias = "conversationID")]
    conversation_id: String,
    #[serde(default, alias = "senderUUID")]
    sender_id: String,
    #[serde(default, alias = "recipientUUID", skip_serializing_if = "Option::is_none")]
    recipient_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    group_id: Option<String>,
    #[serde(default)]
    send_at: i64,
    content_type: i64,
    #[serde(default)]
    body: Value,
    message_type: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sender_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    avatar: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    reply_to: Option<String>,
}

pub fn encode_text(envelope: &Envelope) -> Result<Bytes, CodecError> {
    Ok(Bytes::from(serde_json::to_vec(&text_envelope(envelope)?)?))
}

/// The text-schema JSON object of an envelope, for HTTP responses.
pub fn to_json(envelope: &Envelope) -> Result<Value, CodecError> {
    Ok(serde_json::to_value(text_envelope(envelope)?)?)
}

fn text_envelope(envelope: &Envelope) -> Result<TextEnvelope, CodecError> {
    let body = match &envelope.content {
        Content::Text(text) => serde_json::to_value(text)?,
        Content::Image(a) | Content::File(a) | Content::Voice(a) => serde_json::to_value(a)?,
    };

    Ok(TextEnvelope {
        id: envelope.id.clone(),
        conversation_id: envelope.conversation_id.to_string(),
        sender_id: envelope.sender_id.to_string(),
        recipient_id: envelope.recipient_id.as_ref().map(UserId::to_string),
        group_id: envelope.group_id.as_ref().map(GroupId::to_string),
        send_at: envelope.send_at,
        content_type: i64::from(envelope.content_type().code()),
        body,
        message_type: i64::from(envelope.message_type.code()),
        sender_name: envelope.sender_name.clone(),
        avatar: envelope.avatar.clone(),
        reply_to: envelope.reply_to.clone(),
    })
}

pub fn decode_text(data: &[u8]) -> Result<Envelope, CodecError> {
    if data.is_empty() {
        return Err(CodecError::Empty);
    }
    let text: TextEnvelope = serde_json::from_slice(data)?;

    let content_type = ContentType::from_code(text.content_type)
        .ok_or(CodecError::UnknownContentType(text.content_type))?;
    let message_type = MessageType::from_code(text.message_type)
        .ok_or(CodecError::UnknownMessageType(text.message_type))?;
    let content = body_to_content(content_type, text.body)?;

    let mut recipient_id = non_blank(text.recipient_id).map(UserId::from);
    let mut group_id = non_blank(text.group_id).map(GroupId::from);

    // Older clients address a group through `recipientId`.
    if message_type == MessageType::Group && group_id.is_none() {
        group_id = recipient_id.take().map(|r| GroupId(r.0));
    }

    Ok(Envelope {
        id: text.id,
        conversation_id: ConversationId::from(text.conversation_id),
        sender_id: UserId::from(text.sender_id),
        recipient_id,
        group_id,
        send_at: text.send_at,
        message_type,
        content,
        sender_name: non_blank(text.sender_name),
        avatar: non_blank(text.avatar),
        reply_to: non_blank(text.reply_to),
    })
}

/// Table-driven body conversion keyed by content type.
fn body_to_content(content_type: ContentType, body: Value) -> Result<Content, CodecError> {
    let invalid = |reason: String| CodecError::InvalidBody {
        content_type: content_type.code(),
        reason,
    };

    match content_type {
        ContentType::Text => {
            let text = match body {
                Value::String(content) => TextBody { content },
                other => serde_json::from_value::<TextBody>(other)
                    .map_err(|e| invalid(e.to_string()))?,
            };
            Ok(Content::Text(text))
        }
        ContentType::Image | ContentType::File | ContentType::Voice => {
            let attachment =
                serde_json::from_value::<Attachment>(body).map_err(|e| invalid(e.to_string()))?;
            if attachment.url.trim().is_empty() {
                return Err(invalid("missing url".into()));
            }
            Ok(match content_type {
                ContentType::Image => Content::Image(attachment),
                ContentType::File => Content::File(attachment),
                _ => Content::Voice(attachment),
            })
        }
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

// ---------------------------------------------------------------------------
// Combined decode
// ---------------------------------------------------------------------------

/// Decode a frame, binary first, text second. Also reports which encoding
/// matched so the gateway can answer in kind.
pub fn decode(data: &[u8]) -> Result<(Envelope, WireFormat), CodecError> {
    if data.is_empty() {
        return Err(CodecError::Empty);
    }

    let binary_err = match decode_binary(data) {
        Ok(envelope) => return Ok((envelope, WireFormat::Binary)),
        Err(e) => e,
    };

    match decode_text(data) {
        Ok(envelope) => Ok((envelope, WireFormat::Text)),
        // Keep the specific text error when the frame was clearly JSON.
        Err(text_err) if matches!(binary_err, CodecError::NotBinary) => Err(text_err),
        Err(text_err) => Err(CodecError::Unrecognized {
            binary: binary_err.to_string(),
            text: text_err.to_string(),
        }),
    }
}

/// Encode with the binary schema, enforcing the size limit up front so that
/// oversized payloads fail at the edge rather than at the broker.
pub fn encode_for_broker(envelope: &Envelope) -> Result<Bytes, CodecError> {
    let bytes = encode_binary(envelope)?;
    if bytes.len() as u64 > MAX_ENVELOPE_SIZE {
        return Err(CodecError::TooLarge {
            size: bytes.len(),
            max: MAX_ENVELOPE_SIZE,
        });
    }
    Ok(bytes)
}
