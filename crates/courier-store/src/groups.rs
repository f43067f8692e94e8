//! Group membership, read by the dispatcher to expand group messages.

use chrono::Utc;
use rusqlite::params;

use crate::database::Database;
use crate::error::Result;

impl Database {
    /// Add a member. Returns `false` if they already were one.
    pub fn add_group_member(&self, group_id: &str, user_id: &str) -> Result<bool> {
        let affected = self.conn().execute(
            "INSERT OR IGNORE INTO group_members (group_id, user_id, joined_at)
             VALUES (?1, ?2, ?3)",
            params![group_id, user_id, Utc::now().to_rfc3339()],
        )?;
        Ok(affected > 0)
    }

    /// Remove a member. Returns `true` if a row was deleted.
    pub fn remove_group_member(&self, group_id: &str, user_id: &str) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM group_members WHERE group_id = ?1 AND user_id = ?2",
            params![group_id, user_id],
        )?;
        Ok(affected > 0)
    }

    /// Current member list, ordered by join time.
    pub fn list_group_members(&self, group_id: &str) -> Result<Vec<String>> {
        let mut stmt = self.conn().prepare(
            "SELECT user_id FROM group_members
             WHERE group_id = ?1
             ORDER BY joined_at ASC, user_id ASC",
        )?;

        let rows = stmt.query_map(params![group_id], |row| row.get::<_, String>(0))?;

        let mut members = Vec::new();
        for row in rows {
            members.push(row?);
        }
        Ok(members)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_membership_add_list_remove() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.add_group_member("team", "alice").unwrap());
        assert!(db.add_group_member("team", "bob").unwrap());
        assert!(!db.add_group_member("team", "bob").unwrap());
        db.add_group_member("other", "carol").unwrap();

        let mut members = db.list_group_members("team").unwrap();
        members.sort();
        assert_eq!(members, vec!["alice", "bob"]);

        assert!(db.remove_group_member("team", "alice").unwrap());
        assert!(!db.remove_group_member("team", "alice").unwrap());
        assert_eq!(db.list_group_members("team").unwrap(), vec!["bob"]);
    }

    #[test]
    fn test_unknown_group_has_no_members() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.list_group_members("ghost").unwrap().is_empty());
    }
}
