//! v002 -- Message tombstones.
//!
//! Deleted messages leave a `(message_id, version)` row behind so a stream
//! resumed from an older cursor can still learn about the removal.

use rusqlite::Connection;

const UP_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS message_tombstones (
    message_id TEXT PRIMARY KEY NOT NULL,
    chat_id    TEXT NOT NULL,
    version    INTEGER NOT NULL,

    FOREIGN KEY (chat_id) REFERENCES chats(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_tombstones_chat_version
    ON message_tombstones(chat_id, version);
"#;

pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
