//! The per-chat message log.
//!
//! Appends serialize on the database write lock, which gives every chat a
//! total order: `seq` counts up from 1 and `created_at` is the commit time,
//! bumped by a microsecond whenever the clock has not moved past the previous
//! message. The parent chat's `last_message_at` is written in the same
//! transaction as the message itself.

use std::collections::BTreeSet;

use chatwave_shared::validate;
use chatwave_shared::{Attachment, Chat, ChatError, ChatId, Message, MessageId, NewMessage, UserId};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::chats::load_chat;
use crate::database::{commit_now, current_version, next_version, Database};
use crate::error::{Result, StoreError};
use crate::rows::{conversion_error, parse_opt_ts, parse_ts, parse_uuid, ts_to_sql};

const MESSAGE_COLUMNS: &str =
    "id, chat_id, seq, author_id, content, attachment, created_at, edited_at, version";

/// A committed append: the new message and its parent chat as of the same
/// commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Appended {
    pub message: Message,
    pub chat: Chat,
}

/// An edited or deleted message with the members of its chat at the commit.
#[derive(Debug, Clone)]
pub struct MessageChange {
    pub message: Message,
    pub audience: BTreeSet<UserId>,
}

/// Messages visible to a reader, plus removals it has not seen yet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageBatch {
    /// Ordered by `seq` ascending.
    pub messages: Vec<Message>,
    /// Messages deleted after the requested cursor.
    pub removed: Vec<MessageId>,
    /// Commit version the batch is consistent with.
    pub cursor: u64,
}

impl Database {
    /// Append a message to a chat the author belongs to.
    pub fn append_message(&self, chat_id: &ChatId, author: &UserId, new: &NewMessage) -> Result<Appended> {
        let content = validate::message_content(new.content.as_deref())?;
        let attachment = new.attachment.as_ref().map(normalize_attachment).transpose()?;
        if content.is_none() && attachment.is_none() {
            return Err(StoreError::invalid("a message needs text or an attachment"));
        }

        let tx = self.write_tx()?;
        let mut chat = load_chat(&tx, chat_id)?
            .ok_or_else(|| StoreError::not_found(format!("chat {chat_id}")))?;
        if !chat.is_member(author) {
            return Err(StoreError::forbidden(format!(
                "user {author} is not a member of this chat"
            )));
        }

        let last_seq: i64 = tx.query_row(
            "SELECT message_seq FROM chats WHERE id = ?1",
            params![chat_id.to_string()],
            |row| row.get(0),
        )?;

        let message = Message {
            id: MessageId::new(),
            chat_id: *chat_id,
            author_id: author.clone(),
            content,
            attachment,
            created_at: next_commit_time(chat.last_message_at),
            edited_at: None,
            seq: last_seq as u64 + 1,
            version: next_version(&tx)?,
        };

        tx.execute(
            "INSERT INTO messages (id, chat_id, seq, author_id, content, attachment, created_at, version)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                message.id.to_string(),
                chat_id.to_string(),
                message.seq as i64,
                author.as_str(),
                message.content,
                message.attachment.as_ref().map(serde_json::to_string).transpose()?,
                ts_to_sql(&message.created_at),
                message.version as i64,
            ],
        )?;
        tx.execute(
            "UPDATE chats SET message_seq = ?1, last_message_at = ?2, version = ?3 WHERE id = ?4",
            params![
                message.seq as i64,
                ts_to_sql(&message.created_at),
                message.version as i64,
                chat_id.to_string(),
            ],
        )?;
        tx.commit()?;

        chat.last_message_at = Some(message.created_at);
        chat.version = message.version;

        tracing::debug!(
            chat = %chat_id,
            message = %message.id,
            seq = message.seq,
            version = message.version,
            "message appended"
        );
        Ok(Appended { message, chat })
    }

    /// Replace a message's text. Author only; attachments are immutable.
    ///
    /// With `expected_version`, the edit fails `Conflict` if another commit
    /// touched the message since the caller read it.
    pub fn edit_message(
        &self,
        chat_id: &ChatId,
        message_id: &MessageId,
        content: &str,
        actor: &UserId,
        expected_version: Option<u64>,
    ) -> Result<MessageChange> {
        let content = validate::message_content(Some(content))?;

        let tx = self.write_tx()?;
        let mut message = require_message(&tx, chat_id, message_id)?;
        if &message.author_id != actor {
            return Err(StoreError::forbidden("only the author can edit a message"));
        }
        if !crate::membership::is_member(&tx, chat_id, actor)? {
            return Err(StoreError::forbidden(format!(
                "user {actor} is not a member of this chat"
            )));
        }
        if let Some(expected) = expected_version {
            if expected != message.version {
                return Err(ChatError::Conflict(format!(
                    "message was changed concurrently (version {} != {expected})",
                    message.version
                ))
                .into());
            }
        }
        if content.is_none() && message.attachment.is_none() {
            return Err(StoreError::invalid("a message needs text or an attachment"));
        }

        message.content = content;
        message.edited_at = Some(commit_now());
        message.version = next_version(&tx)?;

        tx.execute(
            "UPDATE messages SET content = ?1, edited_at = ?2, version = ?3 WHERE id = ?4",
            params![
                message.content,
                message.edited_at.as_ref().map(ts_to_sql),
                message.version as i64,
                message_id.to_string(),
            ],
        )?;
        let audience = crate::membership::members_of(&tx, chat_id)?;
        tx.commit()?;

        tracing::debug!(chat = %chat_id, message = %message_id, version = message.version, "message edited");
        Ok(MessageChange { message, audience })
    }

    /// Permanently remove a message. Allowed for its author (while still a
    /// member) and for the chat admin.
    ///
    /// Returns the removed message stamped with the deletion's version.
    pub fn delete_message(
        &self,
        chat_id: &ChatId,
        message_id: &MessageId,
        actor: &UserId,
    ) -> Result<MessageChange> {
        let tx = self.write_tx()?;
        let mut message = require_message(&tx, chat_id, message_id)?;
        let chat = load_chat(&tx, chat_id)?
            .ok_or_else(|| StoreError::not_found(format!("chat {chat_id}")))?;

        let is_author = &message.author_id == actor && chat.is_member(actor);
        if !is_author && !chat.is_admin(actor) {
            return Err(StoreError::forbidden(
                "only the author or the chat admin can delete a message",
            ));
        }

        message.version = next_version(&tx)?;
        tx.execute(
            "DELETE FROM messages WHERE id = ?1",
            params![message_id.to_string()],
        )?;
        tx.execute(
            "INSERT INTO message_tombstones (message_id, chat_id, version) VALUES (?1, ?2, ?3)",
            params![message_id.to_string(), chat_id.to_string(), message.version as i64],
        )?;
        tx.commit()?;

        tracing::debug!(chat = %chat_id, message = %message_id, version = message.version, "message deleted");
        Ok(MessageChange {
            message,
            audience: chat.member_ids,
        })
    }

    pub fn get_message(&self, chat_id: &ChatId, message_id: &MessageId) -> Result<Message> {
        require_message(self.conn(), chat_id, message_id)
    }

    /// Read a chat's log on behalf of `viewer`.
    ///
    /// Without a cursor the whole log is returned. With one, only messages
    /// added or edited after it, and the ids of messages deleted after it.
    pub fn messages_since(&self, chat_id: &ChatId, viewer: &UserId, since: Option<u64>) -> Result<MessageBatch> {
        let conn = self.conn();
        if load_chat(conn, chat_id)?.is_none() {
            return Err(StoreError::not_found(format!("chat {chat_id}")));
        }
        if !crate::membership::is_member(conn, chat_id, viewer)? {
            return Err(StoreError::forbidden(format!(
                "user {viewer} is not a member of this chat"
            )));
        }

        let after = since.unwrap_or(0) as i64;
        let mut stmt = conn.prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE chat_id = ?1 AND version > ?2
             ORDER BY seq ASC"
        ))?;
        let rows = stmt.query_map(params![chat_id.to_string(), after], row_to_message)?;
        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }

        let mut removed = Vec::new();
        if since.is_some() {
            let mut stmt = conn.prepare(
                "SELECT message_id FROM message_tombstones
                 WHERE chat_id = ?1 AND version > ?2
                 ORDER BY version ASC",
            )?;
            let rows = stmt.query_map(params![chat_id.to_string(), after], |row| {
                let raw: String = row.get(0)?;
                parse_uuid(0, &raw).map(MessageId)
            })?;
            for row in rows {
                removed.push(row?);
            }
        }

        Ok(MessageBatch {
            messages,
            removed,
            cursor: current_version(conn)?,
        })
    }

    /// Number of messages currently in a chat's log.
    pub fn message_count(&self, chat_id: &ChatId) -> Result<u64> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM messages WHERE chat_id = ?1",
            params![chat_id.to_string()],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Commit time strictly after the chat's previous message.
fn next_commit_time(previous: Option<DateTime<Utc>>) -> DateTime<Utc> {
    let now = commit_now();
    match previous {
        Some(prev) if now <= prev => prev + Duration::microseconds(1),
        _ => now,
    }
}

fn normalize_attachment(attachment: &Attachment) -> Result<Attachment> {
    let name = attachment.name.trim();
    if name.is_empty() {
        return Err(StoreError::invalid("attachment needs a file name"));
    }
    if attachment.locator.trim().is_empty() {
        return Err(StoreError::invalid("attachment needs a locator"));
    }
    let mime_type = match attachment.mime_type.trim() {
        "" => "application/octet-stream".to_string(),
        mime => mime.to_ascii_lowercase(),
    };
    Ok(Attachment {
        name: name.to_string(),
        size_bytes: attachment.size_bytes,
        mime_type,
        locator: attachment.locator.clone(),
    })
}

fn require_message(conn: &Connection, chat_id: &ChatId, message_id: &MessageId) -> Result<Message> {
    conn.query_row(
        &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1 AND chat_id = ?2"),
        params![message_id.to_string(), chat_id.to_string()],
        row_to_message,
    )
    .optional()?
    .ok_or_else(|| StoreError::not_found(format!("message {message_id}")))
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let id_str: String = row.get(0)?;
    let chat_id_str: String = row.get(1)?;
    let seq: i64 = row.get(2)?;
    let author: String = row.get(3)?;
    let attachment_json: Option<String> = row.get(5)?;
    let created_str: String = row.get(6)?;
    let edited_str: Option<String> = row.get(7)?;
    let version: i64 = row.get(8)?;

    let attachment = attachment_json
        .map(|raw| serde_json::from_str::<Attachment>(&raw))
        .transpose()
        .map_err(|e| conversion_error(5, e))?;

    Ok(Message {
        id: MessageId(parse_uuid(0, &id_str)?),
        chat_id: ChatId(parse_uuid(1, &chat_id_str)?),
        author_id: UserId(author),
        content: row.get(4)?,
        attachment,
        created_at: parse_ts(6, &created_str)?,
        edited_at: parse_opt_ts(7, edited_str)?,
        seq: seq as u64,
        version: version as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatwave_shared::{NewChat, NewUser};

    fn uid(s: &str) -> UserId {
        UserId::from(s)
    }

    fn rejected(err: StoreError) -> ChatError {
        match err {
            StoreError::Rejected(e) => e,
            other => panic!("unexpected backend error: {other}"),
        }
    }

    fn team() -> (Database, Chat) {
        let db = Database::open_in_memory().unwrap();
        for (id, name) in [("a", "Alice"), ("b", "Bob"), ("c", "Charlie"), ("x", "Mallory")] {
            db.create_user(&NewUser {
                id: uid(id),
                name: name.into(),
                avatar: None,
                bio: None,
            })
            .unwrap();
        }
        let (chat, _) = db
            .create_chat(&NewChat::group("Team", [uid("b"), uid("c")]), &uid("a"))
            .unwrap();
        (db, chat)
    }

    #[test]
    fn test_append_updates_chat_atomically() {
        let (db, chat) = team();
        let appended = db
            .append_message(&chat.id, &uid("a"), &NewMessage::text("hello"))
            .unwrap();

        assert_eq!(appended.message.seq, 1);
        assert_eq!(appended.chat.last_message_at, Some(appended.message.created_at));
        assert_eq!(appended.chat.version, appended.message.version);

        let stored = db.get_chat(&chat.id).unwrap();
        assert_eq!(stored.last_message_at, Some(appended.message.created_at));
    }

    #[test]
    fn test_created_at_strictly_increasing() {
        let (db, chat) = team();
        let mut last = None;
        for i in 0..50 {
            let m = db
                .append_message(&chat.id, &uid("b"), &NewMessage::text(format!("m{i}")))
                .unwrap()
                .message;
            if let Some((seq, at)) = last {
                assert!(m.seq > seq);
                assert!(m.created_at > at);
            }
            last = Some((m.seq, m.created_at));
        }
    }

    #[test]
    fn test_non_member_append_forbidden_and_log_untouched() {
        let (db, chat) = team();
        db.append_message(&chat.id, &uid("a"), &NewMessage::text("hi")).unwrap();

        let err = db
            .append_message(&chat.id, &uid("x"), &NewMessage::text("spam"))
            .unwrap_err();
        assert!(matches!(rejected(err), ChatError::Forbidden(_)));
        assert_eq!(db.message_count(&chat.id).unwrap(), 1);
    }

    #[test]
    fn test_empty_message_rejected() {
        let (db, chat) = team();
        let err = db
            .append_message(&chat.id, &uid("a"), &NewMessage::text("   "))
            .unwrap_err();
        assert!(matches!(rejected(err), ChatError::InvalidArgument(_)));
    }

    #[test]
    fn test_attachment_only_message() {
        let (db, chat) = team();
        let file = Attachment {
            name: "Meeting_Notes.docx".into(),
            size_bytes: 45 * 1024,
            mime_type: "".into(),
            locator: "https://files.example/notes".into(),
        };
        let m = db
            .append_message(&chat.id, &uid("c"), &NewMessage::file(file))
            .unwrap()
            .message;
        let stored = db.get_message(&chat.id, &m.id).unwrap();
        assert_eq!(
            stored.attachment.map(|a| a.mime_type),
            Some("application/octet-stream".to_string())
        );
    }

    #[test]
    fn test_edit_author_only_with_conflict_check() {
        let (db, chat) = team();
        let m = db
            .append_message(&chat.id, &uid("a"), &NewMessage::text("hello"))
            .unwrap()
            .message;

        let err = db
            .edit_message(&chat.id, &m.id, "hijack", &uid("b"), None)
            .unwrap_err();
        assert!(matches!(rejected(err), ChatError::Forbidden(_)));

        let edited = db
            .edit_message(&chat.id, &m.id, "hello world", &uid("a"), Some(m.version))
            .unwrap()
            .message;
        assert_eq!(edited.content.as_deref(), Some("hello world"));
        assert!(edited.edited_at.is_some());

        let err = db
            .edit_message(&chat.id, &m.id, "stale", &uid("a"), Some(m.version))
            .unwrap_err();
        assert!(matches!(rejected(err), ChatError::Conflict(_)));
        assert_eq!(
            db.get_message(&chat.id, &m.id).unwrap().content.as_deref(),
            Some("hello world")
        );
    }

    #[test]
    fn test_edit_and_delete_report_audience_at_commit() {
        let (db, chat) = team();
        let m = db
            .append_message(&chat.id, &uid("b"), &NewMessage::text("draft"))
            .unwrap()
            .message;
        let members = BTreeSet::from([uid("a"), uid("b"), uid("c")]);

        let edited = db.edit_message(&chat.id, &m.id, "final", &uid("b"), None).unwrap();
        assert_eq!(edited.audience, members);
        assert_eq!(edited.message.version, db.current_version().unwrap());

        let deleted = db.delete_message(&chat.id, &m.id, &uid("a")).unwrap();
        assert_eq!(deleted.audience, members);
        assert_eq!(deleted.message.version, db.current_version().unwrap());
    }

    #[test]
    fn test_delete_by_admin_and_tombstone() {
        let (db, chat) = team();
        let m = db
            .append_message(&chat.id, &uid("b"), &NewMessage::text("oops"))
            .unwrap()
            .message;
        let cursor = db.current_version().unwrap();

        let err = db.delete_message(&chat.id, &m.id, &uid("c")).unwrap_err();
        assert!(matches!(rejected(err), ChatError::Forbidden(_)));

        db.delete_message(&chat.id, &m.id, &uid("a")).unwrap();
        let err = db.get_message(&chat.id, &m.id).unwrap_err();
        assert!(matches!(rejected(err), ChatError::NotFound(_)));

        let batch = db.messages_since(&chat.id, &uid("c"), Some(cursor)).unwrap();
        assert!(batch.messages.is_empty());
        assert_eq!(batch.removed, vec![m.id]);

        let fresh = db.messages_since(&chat.id, &uid("c"), None).unwrap();
        assert!(fresh.messages.is_empty());
        assert!(fresh.removed.is_empty());
    }

    #[test]
    fn test_messages_since_cursor() {
        let (db, chat) = team();
        let first = db
            .append_message(&chat.id, &uid("a"), &NewMessage::text("one"))
            .unwrap()
            .message;
        let cursor = db.current_version().unwrap();
        db.append_message(&chat.id, &uid("b"), &NewMessage::text("two")).unwrap();
        db.edit_message(&chat.id, &first.id, "one!", &uid("a"), None).unwrap();

        let batch = db.messages_since(&chat.id, &uid("c"), Some(cursor)).unwrap();
        let contents: Vec<_> = batch
            .messages
            .iter()
            .map(|m| m.content.clone().unwrap_or_default())
            .collect();
        assert_eq!(contents, vec!["one!", "two"]);
        assert_eq!(batch.cursor, db.current_version().unwrap());

        let err = db.messages_since(&chat.id, &uid("x"), None).unwrap_err();
        assert!(matches!(rejected(err), ChatError::Forbidden(_)));
    }

    #[test]
    fn test_delete_chat_cascades_messages() {
        let (db, chat) = team();
        db.append_message(&chat.id, &uid("a"), &NewMessage::text("bye")).unwrap();
        db.delete_chat(&chat.id, &uid("a")).unwrap();
        assert_eq!(db.message_count(&chat.id).unwrap(), 0);
    }
}
