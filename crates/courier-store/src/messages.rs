use rusqlite::{params, OptionalExtension};

use courier_shared::codec::{decode_binary, encode_binary};
use courier_shared::Envelope;

use crate::database::Database;
use crate::error::Result;

impl Database {
    /// Persist an envelope. Returns `false` when a message with the same id
    /// was already stored (broker redelivery).
    pub fn insert_envelope(&self, envelope: &Envelope) -> Result<bool> {
        let encoded = encode_binary(envelope)?;
        let affected = self.conn().execute(
            "INSERT OR IGNORE INTO messages
                (id, conversation_id, sender_id, recipient_id, group_id,
                 message_type, content_type, send_at, envelope)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                envelope.id,
                envelope.conversation_id.as_str(),
                envelope.sender_id.as_str(),
                envelope.recipient_id.as_ref().map(|r| r.as_str()),
                envelope.group_id.as_ref().map(|g| g.as_str()),
                envelope.message_type.code(),
                envelope.content_type().code(),
                envelope.send_at,
                encoded.as_ref(),
            ],
        )?;
        Ok(affected > 0)
    }

    pub fn get_envelope(&self, id: &str) -> Result<Option<Envelope>> {
        let encoded: Option<Vec<u8>> = self
            .conn()
            .query_row(
                "SELECT envelope FROM messages WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        match encoded {
            Some(bytes) => Ok(Some(decode_binary(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Newest-first page of a conversation's history.
    pub fn get_envelopes_for_conversation(
        &self,
        conversation_id: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Envelope>> {
        let mut stmt = self.conn().prepare(
            "SELECT envelope
             FROM messages
             WHERE conversation_id = ?1
             ORDER BY send_at DESC, rowid DESC
             LIMIT ?2 OFFSET ?3",
        )?;

        let rows = stmt.query_map(params![conversation_id, limit, offset], |row| {
            row.get::<_, Vec<u8>>(0)
        })?;

        let mut envelopes = Vec::new();
        for row in rows {
            envelopes.push(decode_binary(&row?)?);
        }
        Ok(envelopes)
    }

    pub fn count_messages(&self) -> Result<u64> {
        let count: i64 = self
            .conn()
            .query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}
