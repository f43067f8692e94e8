use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ValidationError;
use crate::types::{ConversationId, GroupId, UserId};

/// How `body` is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ContentType {
    Text = 1,
    Image = 2,
    File = 3,
    Voice = 4,
}

impl ContentType {
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(Self::Text),
            2 => Some(Self::Image),
            3 => Some(Self::File),
            4 => Some(Self::Voice),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        self as u8
    }
}

/// Selects the fan-out strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    Private = 1,
    Group = 2,
}

impl MessageType {
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(Self::Private),
            2 => Some(Self::Group),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        self as u8
    }
}

/// Body of a text message (`contentType = 1`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextBody {
    pub content: String,
}

/// Body of an image, file or voice message (`contentType = 2..=4`).
///
/// The payload itself lives in object storage; only its location and
/// metadata travel with the envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub url: String,
    #[serde(default)]
    pub file_name: String,
    /// Accepts the legacy `size` key on input.
    #[serde(default, alias = "size")]
    pub size_bytes: i64,
    #[serde(default)]
    pub mime_type: String,
}

/// Typed message body, one variant per content type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Content {
    Text(TextBody),
    Image(Attachment),
    File(Attachment),
    Voice(Attachment),
}

impl Content {
    pub fn text(content: impl Into<String>) -> Self {
        Content::Text(TextBody {
            content: content.into(),
        })
    }

    pub fn content_type(&self) -> ContentType {
        match self {
            Content::Text(_) => ContentType::Text,
            Content::Image(_) => ContentType::Image,
            Content::File(_) => ContentType::File,
            Content::Voice(_) => ContentType::Voice,
        }
    }

    /// The text of a text message, `None` for attachments.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Content::Text(body) => Some(&body.content),
            _ => None,
        }
    }

    pub fn attachment(&self) -> Option<&Attachment> {
        match self {
            Content::Text(_) => None,
            Content::Image(a) | Content::File(a) | Content::Voice(a) => Some(a),
        }
    }
}

/// The unit of transport and storage.
///
/// The same struct travels client -> gateway -> broker -> logic tier ->
/// broker -> gateway -> client, and is what the offline store keeps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Assigned at ingestion when the client leaves it blank.
    pub id: String,
    pub conversation_id: ConversationId,
    /// Always overwritten from the authenticated connection.
    pub sender_id: UserId,
    /// Target user for private messages; the resolved member on per-recipient
    /// copies of group messages.
    pub recipient_id: Option<UserId>,
    pub group_id: Option<GroupId>,
    /// Unix seconds, stamped by the ingesting gateway.
    pub send_at: i64,
    pub message_type: MessageType,
    pub content: Content,
    pub sender_name: Option<String>,
    pub avatar: Option<String>,
    pub reply_to: Option<String>,
}

impl Envelope {
    pub fn private(
        conversation_id: ConversationId,
        recipient_id: UserId,
        content: Content,
    ) -> Self {
        Self {
            id: String::new(),
            conversation_id,
            sender_id: UserId::default(),
            recipient_id: Some(recipient_id),
            group_id: None,
            send_at: 0,
            message_type: MessageType::Private,
            content,
            sender_name: None,
            avatar: None,
            reply_to: None,
        }
    }

    pub fn group(conversation_id: ConversationId, group_id: GroupId, content: Content) -> Self {
        Self {
            id: String::new(),
            conversation_id,
            sender_id: UserId::default(),
            recipient_id: None,
            group_id: Some(group_id),
            send_at: 0,
            message_type: MessageType::Group,
            content,
            sender_name: None,
            avatar: None,
            reply_to: None,
        }
    }

    pub fn content_type(&self) -> ContentType {
        self.content.content_type()
    }

    /// Overwrite the sender and send time, and assign an id if the client
    /// did not supply one.
    pub fn stamp(&mut self, sender: &UserId, now_secs: i64) {
        self.sender_id = sender.clone();
        self.send_at = now_secs;
        if self.id.trim().is_empty() {
            self.id = Uuid::new_v4().to_string();
        }
    }

    /// Same message apart from the ingest timestamp.
    pub fn same_message(&self, other: &Envelope) -> bool {
        let restamped = Envelope {
            send_at: other.send_at,
            ..self.clone()
        };
        restamped == *other
    }

    /// A per-recipient copy: identical content, `recipient_id` rewritten.
    pub fn for_recipient(&self, recipient: &UserId) -> Envelope {
        let mut copy = self.clone();
        copy.recipient_id = Some(recipient.clone());
        copy
    }

    /// Required-field check run before fan-out.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.sender_id.is_empty() {
            return Err(ValidationError::MissingSender);
        }
        if self.conversation_id.is_empty() {
            return Err(ValidationError::MissingConversation);
        }
        match self.message_type {
            MessageType::Private => {
                if self.recipient_id.as_ref().map_or(true, UserId::is_empty) {
                    return Err(ValidationError::MissingRecipient);
                }
            }
            MessageType::Group => {
                if self.group_id.as_ref().map_or(true, GroupId::is_empty) {
                    return Err(ValidationError::MissingGroup);
                }
            }
        }
        Ok(())
    }
}
