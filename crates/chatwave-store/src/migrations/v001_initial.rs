//! v001 -- Initial schema creation.
//!
//! Creates the commit counter, `users`, `chats`, the `chat_members` and
//! `dm_pairs` indexes, and `messages`.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Commit version counter
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS meta (
    key   TEXT PRIMARY KEY NOT NULL,
    value INTEGER NOT NULL
);

INSERT OR IGNORE INTO meta (key, value) VALUES ('commit_version', 0);

-- ----------------------------------------------------------------
-- Users
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS users (
    id         TEXT PRIMARY KEY NOT NULL,   -- auth provider uid
    name       TEXT NOT NULL,
    avatar     TEXT NOT NULL,
    bio        TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL,               -- RFC-3339, microseconds, UTC
    version    INTEGER NOT NULL
);

-- ----------------------------------------------------------------
-- Chats
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS chats (
    id              TEXT PRIMARY KEY NOT NULL,   -- UUID v4
    kind            TEXT NOT NULL CHECK (kind IN ('dm', 'group')),
    name            TEXT NOT NULL,
    description     TEXT,
    avatar          TEXT,
    created_by      TEXT NOT NULL,
    created_at      TEXT NOT NULL,
    last_message_at TEXT,
    message_seq     INTEGER NOT NULL DEFAULT 0,  -- last seq handed to a message
    version         INTEGER NOT NULL,

    FOREIGN KEY (created_by) REFERENCES users(id)
);

CREATE TABLE IF NOT EXISTS chat_members (
    chat_id TEXT NOT NULL,
    user_id TEXT NOT NULL,

    PRIMARY KEY (chat_id, user_id),
    FOREIGN KEY (chat_id) REFERENCES chats(id) ON DELETE CASCADE,
    FOREIGN KEY (user_id) REFERENCES users(id)
);

CREATE INDEX IF NOT EXISTS idx_chat_members_user ON chat_members(user_id);

-- One DM per unordered pair of users.
CREATE TABLE IF NOT EXISTS dm_pairs (
    pair_key TEXT PRIMARY KEY NOT NULL,      -- JSON array of the sorted pair
    chat_id  TEXT NOT NULL UNIQUE,

    FOREIGN KEY (chat_id) REFERENCES chats(id) ON DELETE CASCADE
);

-- ----------------------------------------------------------------
-- Messages
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    id         TEXT PRIMARY KEY NOT NULL,   -- UUID v4
    chat_id    TEXT NOT NULL,
    seq        INTEGER NOT NULL,
    author_id  TEXT NOT NULL,
    content    TEXT,
    attachment TEXT,                        -- JSON-encoded Attachment
    created_at TEXT NOT NULL,
    edited_at  TEXT,
    version    INTEGER NOT NULL,

    UNIQUE (chat_id, seq),
    FOREIGN KEY (chat_id) REFERENCES chats(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_messages_chat_version
    ON messages(chat_id, version);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
