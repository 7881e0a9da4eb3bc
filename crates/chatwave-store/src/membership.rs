//! Membership index: which users participate in which chats.
//!
//! Membership rows are only ever written inside the transaction that creates
//! a chat or edits its member set, so readers never see a chat without its
//! members. The `dm_pairs` table is the uniqueness index for direct messages:
//! its primary key is the sorted member pair.

use std::collections::BTreeSet;

use chatwave_shared::{ChatId, UserId};
use rusqlite::{params, Connection, OptionalExtension};

use crate::database::Database;
use crate::error::Result;
use crate::rows::parse_uuid;

impl Database {
    /// Whether `user` currently belongs to `chat`.
    pub fn is_member(&self, chat: &ChatId, user: &UserId) -> Result<bool> {
        is_member(self.conn(), chat, user)
    }

    /// Current member set of a chat (empty if the chat does not exist).
    pub fn members_of(&self, chat: &ChatId) -> Result<BTreeSet<UserId>> {
        members_of(self.conn(), chat)
    }
}

pub(crate) fn is_member(conn: &Connection, chat: &ChatId, user: &UserId) -> Result<bool> {
    let mut stmt =
        conn.prepare_cached("SELECT 1 FROM chat_members WHERE chat_id = ?1 AND user_id = ?2")?;
    Ok(stmt.exists(params![chat.to_string(), user.as_str()])?)
}

pub(crate) fn members_of(conn: &Connection, chat: &ChatId) -> Result<BTreeSet<UserId>> {
    let mut stmt = conn.prepare_cached("SELECT user_id FROM chat_members WHERE chat_id = ?1")?;
    let rows = stmt.query_map(params![chat.to_string()], |row| row.get::<_, String>(0))?;

    let mut members = BTreeSet::new();
    for row in rows {
        members.insert(UserId(row?));
    }
    Ok(members)
}

/// Replace the member set of `chat` with `members`.
pub(crate) fn set_members(conn: &Connection, chat: &ChatId, members: &BTreeSet<UserId>) -> Result<()> {
    conn.execute(
        "DELETE FROM chat_members WHERE chat_id = ?1",
        params![chat.to_string()],
    )?;
    let mut stmt =
        conn.prepare_cached("INSERT INTO chat_members (chat_id, user_id) VALUES (?1, ?2)")?;
    for member in members {
        stmt.execute(params![chat.to_string(), member.as_str()])?;
    }
    Ok(())
}

/// Order-independent key of a DM member pair.
pub(crate) fn dm_pair_key(a: &UserId, b: &UserId) -> String {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    // JSON keeps the encoding unambiguous whatever characters the ids hold.
    serde_json::json!([lo.as_str(), hi.as_str()]).to_string()
}

pub(crate) fn find_dm(conn: &Connection, pair_key: &str) -> Result<Option<ChatId>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT chat_id FROM dm_pairs WHERE pair_key = ?1",
            params![pair_key],
            |row| row.get(0),
        )
        .optional()?;
    Ok(raw
        .map(|s| parse_uuid(0, &s).map(ChatId))
        .transpose()?)
}

pub(crate) fn register_dm(conn: &Connection, pair_key: &str, chat: &ChatId) -> Result<()> {
    conn.execute(
        "INSERT INTO dm_pairs (pair_key, chat_id) VALUES (?1, ?2)",
        params![pair_key, chat.to_string()],
    )?;
    Ok(())
}
