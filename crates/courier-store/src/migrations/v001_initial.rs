//! v001 -- Initial schema creation.
//!
//! Creates the durable message log, conversation markers, group membership,
//! the presence map and the offline backlog.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Messages (durability boundary of the dispatcher)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    id              TEXT PRIMARY KEY NOT NULL,
    conversation_id TEXT NOT NULL,
    sender_id       TEXT NOT NULL,
    recipient_id    TEXT,
    group_id        TEXT,
    message_type    INTEGER NOT NULL,        -- 1=private, 2=group
    content_type    INTEGER NOT NULL,        -- 1=text, 2=image, 3=file, 4=voice
    send_at         INTEGER NOT NULL,        -- unix seconds
    envelope        BLOB NOT NULL            -- binary-encoded envelope
);

CREATE INDEX IF NOT EXISTS idx_messages_conversation_ts
    ON messages(conversation_id, send_at DESC);

-- ----------------------------------------------------------------
-- Conversations (last-message marker only)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS conversations (
    id                TEXT PRIMARY KEY NOT NULL,
    message_type      INTEGER NOT NULL,
    last_message_id   TEXT NOT NULL,
    last_sender_id    TEXT NOT NULL,
    last_preview      TEXT NOT NULL,
    last_message_at   INTEGER NOT NULL,
    updated_at        TEXT NOT NULL          -- RFC-3339
);

-- ----------------------------------------------------------------
-- Group membership
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS group_members (
    group_id  TEXT NOT NULL,
    user_id   TEXT NOT NULL,
    joined_at TEXT NOT NULL,

    PRIMARY KEY (group_id, user_id)
);

-- ----------------------------------------------------------------
-- Presence: user -> gateway holding the live connection
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS presence (
    user_id    TEXT PRIMARY KEY NOT NULL,
    gateway_id TEXT NOT NULL,
    updated_at INTEGER NOT NULL              -- unix millis
);

-- ----------------------------------------------------------------
-- Offline backlog: ordered per-user list of binary envelopes
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS offline_messages (
    seq        INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id    TEXT NOT NULL,
    payload    BLOB NOT NULL,
    expires_at INTEGER NOT NULL              -- unix millis
);

CREATE INDEX IF NOT EXISTS idx_offline_user_seq
    ON offline_messages(user_id, seq);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
