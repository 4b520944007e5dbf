//! v001 -- Initial schema creation.
//!
//! Creates `conversations`, `conversation_participants` and `messages`.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Conversations
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS conversations (
    key                  TEXT PRIMARY KEY NOT NULL,
    kind                 TEXT NOT NULL,            -- 'direct' | 'group'
    title                TEXT,
    avatar_ref           TEXT,
    last_message_preview TEXT,
    last_message_at      INTEGER,                  -- unix nanoseconds
    pending              INTEGER NOT NULL DEFAULT 0 -- boolean 0/1
);

CREATE TABLE IF NOT EXISTS conversation_participants (
    conversation_key TEXT NOT NULL,                -- FK -> conversations(key)
    user_id          TEXT NOT NULL,

    PRIMARY KEY (conversation_key, user_id),
    FOREIGN KEY (conversation_key) REFERENCES conversations(key) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_participants_user
    ON conversation_participants(user_id);

-- ----------------------------------------------------------------
-- Messages
--
-- No foreign key to conversations: a message snapshot may arrive before
-- the conversation summary does. Conversation deletion removes messages
-- explicitly in the same transaction.
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    conversation_key TEXT NOT NULL,
    remote_key       TEXT,                         -- NULL while pending
    local_key        TEXT,                         -- UUID v4, NULL for foreign messages
    sender_id        TEXT NOT NULL,
    content          TEXT NOT NULL,
    content_type     TEXT NOT NULL,                -- 'text' | 'image'
    media_ref        TEXT,
    timestamp        INTEGER NOT NULL,             -- unix nanoseconds
    delivery_status  TEXT NOT NULL,
    read_by          TEXT NOT NULL DEFAULT '[]',   -- JSON array of user ids

    CHECK (remote_key IS NOT NULL OR local_key IS NOT NULL)
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_messages_remote
    ON messages(conversation_key, remote_key);

CREATE UNIQUE INDEX IF NOT EXISTS idx_messages_local
    ON messages(conversation_key, local_key);

CREATE INDEX IF NOT EXISTS idx_messages_conversation_ts
    ON messages(conversation_key, timestamp ASC);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
