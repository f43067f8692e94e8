//! Conversation last-message markers.
//!
//! The conversation list itself is owned by another service; the delivery
//! core only keeps the marker used to sort it.

use chrono::Utc;
use rusqlite::params;
use serde::{Deserialize, Serialize};

use courier_shared::{Content, Envelope};

use crate::database::Database;
use crate::error::{Result, StoreError};

/// Latest-message marker of one conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConversationMarker {
    pub conversation_id: String,
    pub message_type: u8,
    pub last_message_id: String,
    pub last_sender_id: String,
    /// Text for text messages, the file name otherwise.
    pub last_preview: String,
    /// Unix seconds of the last message.
    pub last_message_at: i64,
}

/// Short human-readable summary of a message body.
pub fn preview(content: &Content) -> String {
    const MAX: usize = 120;
    let text = match content {
        Content::Text(body) => body.content.as_str(),
        Content::Image(a) | Content::File(a) | Content::Voice(a) => a.file_name.as_str(),
    };
    text.chars().take(MAX).collect()
}

impl Database {
    /// Move the conversation's marker forward to `envelope`. Older messages
    /// never overwrite a newer marker.
    pub fn touch_conversation(&self, envelope: &Envelope) -> Result<()> {
        self.conn().execute(
            "INSERT INTO conversations
                (id, message_type, last_message_id, last_sender_id, last_preview,
                 last_message_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET
                last_message_id = excluded.last_message_id,
                last_sender_id  = excluded.last_sender_id,
                last_preview    = excluded.last_preview,
                last_message_at = excluded.last_message_at,
                updated_at      = excluded.updated_at
             WHERE excluded.last_message_at >= conversations.last_message_at",
            params![
                envelope.conversation_id.as_str(),
                envelope.message_type.code(),
                envelope.id,
                envelope.sender_id.as_str(),
                preview(&envelope.content),
                envelope.send_at,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_conversation_marker(&self, conversation_id: &str) -> Result<ConversationMarker> {
        self.conn()
            .query_row(
                "SELECT id, message_type, last_message_id, last_sender_id,
                        last_preview, last_message_at
                 FROM conversations WHERE id = ?1",
                params![conversation_id],
                |row| {
                    Ok(ConversationMarker {
                        conversation_id: row.get(0)?,
                        message_type: row.get(1)?,
                        last_message_id: row.get(2)?,
                        last_sender_id: row.get(3)?,
                        last_preview: row.get(4)?,
                        last_message_at: row.get(5)?,
                    })
                },
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }
}
