//! Presence map and offline backlog tables.
//!
//! Every function here is one statement or one transaction, so concurrent
//! processes sharing the file never observe a half-applied update.

use rusqlite::{params, OptionalExtension, TransactionBehavior};

use crate::database::Database;
use crate::error::Result;

impl Database {
    // ------------------------------------------------------------------
    // Presence
    // ------------------------------------------------------------------

    /// Point `user_id` at `gateway_id`, replacing any previous gateway.
    pub fn set_presence(&self, user_id: &str, gateway_id: &str, now_ms: i64) -> Result<()> {
        self.conn().execute(
            "INSERT INTO presence (user_id, gateway_id, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(user_id) DO UPDATE SET
                gateway_id = excluded.gateway_id,
                updated_at = excluded.updated_at",
            params![user_id, gateway_id, now_ms],
        )?;
        Ok(())
    }

    pub fn get_presence(&self, user_id: &str) -> Result<Option<String>> {
        Ok(self
            .conn()
            .query_row(
                "SELECT gateway_id FROM presence WHERE user_id = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// Compare-and-delete: only removes the record if it still names
    /// `gateway_id`.
    pub fn remove_presence(&self, user_id: &str, gateway_id: &str) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM presence WHERE user_id = ?1 AND gateway_id = ?2",
            params![user_id, gateway_id],
        )?;
        Ok(affected > 0)
    }

    /// Drop every presence record owned by a gateway (used on its shutdown).
    pub fn clear_gateway_presence(&self, gateway_id: &str) -> Result<usize> {
        Ok(self.conn().execute(
            "DELETE FROM presence WHERE gateway_id = ?1",
            params![gateway_id],
        )?)
    }

    // ------------------------------------------------------------------
    // Offline backlog
    // ------------------------------------------------------------------

    /// Append to the user's backlog and refresh the retention deadline of
    /// the whole entry.
    pub fn append_offline(&mut self, user_id: &str, payload: &[u8], expires_at_ms: i64) -> Result<()> {
        let tx = self
            .conn_mut()
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "UPDATE offline_messages SET expires_at = ?2 WHERE user_id = ?1",
            params![user_id, expires_at_ms],
        )?;
        tx.execute(
            "INSERT INTO offline_messages (user_id, payload, expires_at)
             VALUES (?1, ?2, ?3)",
            params![user_id, payload, expires_at_ms],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Read the unexpired backlog in append order and delete the entry, in
    /// one transaction. Also returns the entry's deadline (0 if empty).
    pub fn drain_offline(&mut self, user_id: &str, now_ms: i64) -> Result<(Vec<Vec<u8>>, i64)> {
        let tx = self
            .conn_mut()
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut expires_at = 0;
        let payloads = {
            let mut stmt = tx.prepare(
                "SELECT payload, expires_at FROM offline_messages
                 WHERE user_id = ?1 AND expires_at > ?2
                 ORDER BY seq ASC",
            )?;
            let rows = stmt.query_map(params![user_id, now_ms], |row| {
                Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, i64>(1)?))
            })?;
            let mut payloads = Vec::new();
            for row in rows {
                let (payload, deadline) = row?;
                expires_at = expires_at.max(deadline);
                payloads.push(payload);
            }
            payloads
        };

        tx.execute(
            "DELETE FROM offline_messages WHERE user_id = ?1",
            params![user_id],
        )?;
        tx.commit()?;
        Ok((payloads, expires_at))
    }

    /// Re-insert drained payloads ahead of the user's current backlog. Rows
    /// take sequence numbers below the smallest one in the table.
    pub fn restore_offline(
        &mut self,
        user_id: &str,
        payloads: &[Vec<u8>],
        expires_at_ms: i64,
        now_ms: i64,
    ) -> Result<()> {
        if payloads.is_empty() {
            return Ok(());
        }
        let tx = self
            .conn_mut()
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        tx.execute(
            "DELETE FROM offline_messages WHERE user_id = ?1 AND expires_at <= ?2",
            params![user_id, now_ms],
        )?;
        let current: Option<i64> = tx.query_row(
            "SELECT MAX(expires_at) FROM offline_messages WHERE user_id = ?1",
            params![user_id],
            |row| row.get(0),
        )?;
        let expires_at = current.map_or(expires_at_ms, |c| c.max(expires_at_ms));
        tx.execute(
            "UPDATE offline_messages SET expires_at = ?2 WHERE user_id = ?1",
            params![user_id, expires_at],
        )?;

        let lowest: Option<i64> =
            tx.query_row("SELECT MIN(seq) FROM offline_messages", [], |row| row.get(0))?;
        let first = lowest.unwrap_or(1).min(1) - payloads.len() as i64;
        {
            let mut insert = tx.prepare(
                "INSERT INTO offline_messages (seq, user_id, payload, expires_at)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for (offset, payload) in payloads.iter().enumerate() {
                insert.execute(params![first + offset as i64, user_id, payload, expires_at])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn count_offline(&self, user_id: &str, now_ms: i64) -> Result<usize> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM offline_messages WHERE user_id = ?1 AND expires_at > ?2",
            params![user_id, now_ms],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    pub fn purge_expired_offline(&self, now_ms: i64) -> Result<usize> {
        Ok(self.conn().execute(
            "DELETE FROM offline_messages WHERE expires_at <= ?1",
            params![now_ms],
        )?)
    }
}
