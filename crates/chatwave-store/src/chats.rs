//! CRUD operations for [`Chat`] records.
//!
//! Authorization lives here rather than in callers: only the creator may
//! edit details, edit members or delete a group, and a DM's member pair is
//! fixed for its whole life.

use std::collections::BTreeSet;

use chatwave_shared::validate;
use chatwave_shared::{Chat, ChatId, ChatKind, ChatPatch, NewChat, UserId};
use rusqlite::{params, Connection, OptionalExtension};

use crate::database::{commit_now, next_version, Database};
use crate::error::{Result, StoreError};
use crate::membership::{dm_pair_key, find_dm, members_of, register_dm, set_members};
use crate::rows::{parse_opt_ts, parse_ts, parse_uuid, ts_to_sql};
use crate::users::missing_users;

const CHAT_COLUMNS: &str =
    "id, kind, name, description, avatar, created_by, created_at, last_message_at, version";

/// Result of a committed member-set edit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipChange {
    pub chat: Chat,
    pub added: BTreeSet<UserId>,
    pub removed: BTreeSet<UserId>,
}

impl Database {
    // ------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------

    /// Create a chat on behalf of `creator`.
    ///
    /// For a DM, an existing chat with the same member pair is returned
    /// instead of creating a second one; the lookup and the insert share one
    /// write transaction. The boolean is `true` when a chat was created.
    pub fn create_chat(&self, new: &NewChat, creator: &UserId) -> Result<(Chat, bool)> {
        let mut members = new.member_ids.clone();
        members.insert(creator.clone());

        let (name, description, avatar) = match new.kind {
            ChatKind::Group => {
                let name = validate::group_name(&new.name)?;
                if members.len() < 2 {
                    return Err(StoreError::invalid(
                        "You must select at least one other member",
                    ));
                }
                let description = validate::description(new.description.as_deref().unwrap_or_default())?;
                let avatar = new
                    .avatar
                    .as_deref()
                    .map(str::trim)
                    .filter(|a| !a.is_empty())
                    .map(str::to_string)
                    .unwrap_or_else(|| validate::default_avatar(&name));
                (name, description, Some(avatar))
            }
            ChatKind::Dm => {
                if members.len() != 2 {
                    return Err(StoreError::invalid(
                        "a direct message needs exactly one other participant",
                    ));
                }
                (String::new(), None, None)
            }
        };

        let tx = self.write_tx()?;

        if let Some(missing) = missing_users(&tx, &members)?.first() {
            return Err(StoreError::not_found(format!("user {missing}")));
        }

        let pair_key = match new.kind {
            ChatKind::Dm => {
                let mut pair = members.iter();
                match (pair.next(), pair.next()) {
                    (Some(a), Some(b)) => Some(dm_pair_key(a, b)),
                    _ => None,
                }
            }
            ChatKind::Group => None,
        };

        if let Some(key) = &pair_key {
            if let Some(existing) = find_dm(&tx, key)? {
                let chat = load_chat(&tx, &existing)?
                    .ok_or_else(|| StoreError::not_found(format!("chat {existing}")))?;
                tracing::debug!(chat = %chat.id, "direct message already exists");
                return Ok((chat, false));
            }
        }

        let chat = Chat {
            id: ChatId::new(),
            kind: new.kind,
            name,
            description,
            avatar,
            member_ids: members,
            created_by: creator.clone(),
            created_at: commit_now(),
            last_message_at: None,
            version: next_version(&tx)?,
        };

        tx.execute(
            "INSERT INTO chats (id, kind, name, description, avatar, created_by, created_at, version)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                chat.id.to_string(),
                chat.kind.as_str(),
                chat.name,
                chat.description,
                chat.avatar,
                chat.created_by.as_str(),
                ts_to_sql(&chat.created_at),
                chat.version as i64,
            ],
        )?;
        set_members(&tx, &chat.id, &chat.member_ids)?;
        if let Some(key) = &pair_key {
            register_dm(&tx, key, &chat.id)?;
        }
        tx.commit()?;

        tracing::info!(
            chat = %chat.id,
            kind = chat.kind.as_str(),
            members = chat.member_ids.len(),
            version = chat.version,
            "chat created"
        );
        Ok((chat, true))
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    /// Fetch a single chat with its members.
    pub fn get_chat(&self, id: &ChatId) -> Result<Chat> {
        load_chat(self.conn(), id)?.ok_or_else(|| StoreError::not_found(format!("chat {id}")))
    }

    /// Chats `user` belongs to, most recently active first.
    pub fn list_chats_for_user(&self, user: &UserId) -> Result<Vec<Chat>> {
        let mut stmt = self.conn().prepare(
            "SELECT c.id, c.kind, c.name, c.description, c.avatar, c.created_by,
                    c.created_at, c.last_message_at, c.version
             FROM chats c
             JOIN chat_members m ON m.chat_id = c.id
             WHERE m.user_id = ?1
             ORDER BY COALESCE(c.last_message_at, c.created_at) DESC, c.id ASC",
        )?;

        let rows = stmt.query_map(params![user.as_str()], row_to_chat)?;

        let mut chats = Vec::new();
        for row in rows {
            let mut chat = row?;
            chat.member_ids = members_of(self.conn(), &chat.id)?;
            chats.push(chat);
        }
        Ok(chats)
    }

    // ------------------------------------------------------------------
    // Update
    // ------------------------------------------------------------------

    /// Change a group's name, description or avatar. Creator only.
    pub fn update_chat_details(&self, id: &ChatId, patch: &ChatPatch, actor: &UserId) -> Result<Chat> {
        let tx = self.write_tx()?;
        let mut chat = require_admin_of_group(&tx, id, actor, "edit group settings")?;
        if patch.is_empty() {
            return Err(StoreError::invalid("group settings patch is empty"));
        }

        if let Some(name) = &patch.name {
            chat.name = validate::group_name(name)?;
        }
        if let Some(description) = &patch.description {
            chat.description = validate::description(description)?;
        }
        if let Some(avatar) = &patch.avatar {
            let avatar = avatar.trim();
            chat.avatar = Some(if avatar.is_empty() {
                validate::default_avatar(&chat.name)
            } else {
                avatar.to_string()
            });
        }
        chat.version = next_version(&tx)?;

        tx.execute(
            "UPDATE chats SET name = ?1, description = ?2, avatar = ?3, version = ?4 WHERE id = ?5",
            params![
                chat.name,
                chat.description,
                chat.avatar,
                chat.version as i64,
                id.to_string()
            ],
        )?;
        tx.commit()?;

        tracing::info!(chat = %id, version = chat.version, "group details updated");
        Ok(chat)
    }

    /// Replace a group's member set. Creator only; the creator must stay.
    pub fn update_chat_members(
        &self,
        id: &ChatId,
        members: &BTreeSet<UserId>,
        actor: &UserId,
    ) -> Result<MembershipChange> {
        let tx = self.write_tx()?;
        let mut chat = require_admin_of_group(&tx, id, actor, "manage members")?;
        if members.is_empty() {
            return Err(StoreError::invalid("a chat needs at least one member"));
        }

        if !members.contains(&chat.created_by) {
            return Err(StoreError::invalid("the group creator cannot be removed"));
        }
        if let Some(missing) = missing_users(&tx, members)?.first() {
            return Err(StoreError::not_found(format!("user {missing}")));
        }

        let added: BTreeSet<UserId> = members.difference(&chat.member_ids).cloned().collect();
        let removed: BTreeSet<UserId> = chat.member_ids.difference(members).cloned().collect();

        set_members(&tx, id, members)?;
        chat.member_ids = members.clone();
        chat.version = next_version(&tx)?;
        tx.execute(
            "UPDATE chats SET version = ?1 WHERE id = ?2",
            params![chat.version as i64, id.to_string()],
        )?;
        tx.commit()?;

        tracing::info!(
            chat = %id,
            added = added.len(),
            removed = removed.len(),
            version = chat.version,
            "group members updated"
        );
        Ok(MembershipChange {
            chat,
            added,
            removed,
        })
    }

    // ------------------------------------------------------------------
    // Delete
    // ------------------------------------------------------------------

    /// Delete a group and every message it owns. Creator only.
    ///
    /// Returns the chat as it was, stamped with the deletion's version.
    pub fn delete_chat(&self, id: &ChatId, actor: &UserId) -> Result<Chat> {
        let tx = self.write_tx()?;
        let mut chat = require_admin_of_group(&tx, id, actor, "delete the group")?;

        chat.version = next_version(&tx)?;
        // Messages, members, tombstones and the DM index cascade.
        tx.execute("DELETE FROM chats WHERE id = ?1", params![id.to_string()])?;
        tx.commit()?;

        tracing::info!(chat = %id, version = chat.version, "chat deleted");
        Ok(chat)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

pub(crate) fn load_chat(conn: &Connection, id: &ChatId) -> Result<Option<Chat>> {
    let chat = conn
        .query_row(
            &format!("SELECT {CHAT_COLUMNS} FROM chats WHERE id = ?1"),
            params![id.to_string()],
            row_to_chat,
        )
        .optional()?;

    match chat {
        Some(mut chat) => {
            chat.member_ids = members_of(conn, id)?;
            Ok(Some(chat))
        }
        None => Ok(None),
    }
}

fn require_admin_of_group(conn: &Connection, id: &ChatId, actor: &UserId, action: &str) -> Result<Chat> {
    let chat = load_chat(conn, id)?.ok_or_else(|| StoreError::not_found(format!("chat {id}")))?;
    if chat.kind == ChatKind::Dm {
        return Err(StoreError::invalid(format!(
            "cannot {action} of a direct message"
        )));
    }
    if !chat.is_admin(actor) {
        return Err(StoreError::forbidden(format!(
            "only the group creator can {action}"
        )));
    }
    Ok(chat)
}

/// Map a `rusqlite::Row` to a [`Chat`] without its members.
fn row_to_chat(row: &rusqlite::Row<'_>) -> rusqlite::Result<Chat> {
    let id_str: String = row.get(0)?;
    let kind_str: String = row.get(1)?;
    let created_by: String = row.get(5)?;
    let created_str: String = row.get(6)?;
    let last_str: Option<String> = row.get(7)?;
    let version: i64 = row.get(8)?;

    let kind = ChatKind::parse(&kind_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            1,
            rusqlite::types::Type::Text,
            format!("unknown chat kind {kind_str:?}").into(),
        )
    })?;

    Ok(Chat {
        id: ChatId(parse_uuid(0, &id_str)?),
        kind,
        name: row.get(2)?,
        description: row.get(3)?,
        avatar: row.get(4)?,
        member_ids: BTreeSet::new(),
        created_by: UserId(created_by),
        created_at: parse_ts(6, &created_str)?,
        last_message_at: parse_opt_ts(7, last_str)?,
        version: version as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatwave_shared::{ChatError, NewUser};

    fn seeded() -> Database {
        let db = Database::open_in_memory().unwrap();
        for (id, name) in [("u1", "Alice"), ("u2", "Bob"), ("u3", "Charlie"), ("u4", "Diana")] {
            db.create_user(&NewUser {
                id: UserId::from(id),
                name: name.into(),
                avatar: None,
                bio: None,
            })
            .unwrap();
        }
        db
    }

    fn uid(s: &str) -> UserId {
        UserId::from(s)
    }

    fn rejected(err: StoreError) -> ChatError {
        match err {
            StoreError::Rejected(e) => e,
            other => panic!("unexpected backend error: {other}"),
        }
    }

    #[test]
    fn test_create_group_includes_creator() {
        let db = seeded();
        let (chat, created) = db
            .create_chat(&NewChat::group("Team", [uid("u2"), uid("u3")]), &uid("u1"))
            .unwrap();

        assert!(created);
        assert_eq!(chat.member_ids.len(), 3);
        assert!(chat.is_member(&uid("u1")));
        assert_eq!(chat.avatar.as_deref(), Some("https://placehold.co/100x100?text=T"));
        assert_eq!(db.get_chat(&chat.id).unwrap(), chat);
    }

    #[test]
    fn test_group_validation() {
        let db = seeded();
        let err = db
            .create_chat(&NewChat::group("ab", [uid("u2")]), &uid("u1"))
            .unwrap_err();
        assert!(matches!(rejected(err), ChatError::InvalidArgument(_)));

        let err = db
            .create_chat(&NewChat::group("Solo", []), &uid("u1"))
            .unwrap_err();
        assert!(matches!(rejected(err), ChatError::InvalidArgument(_)));

        let err = db
            .create_chat(&NewChat::group("Team", [uid("ghost")]), &uid("u1"))
            .unwrap_err();
        assert!(matches!(rejected(err), ChatError::NotFound(_)));
    }

    #[test]
    fn test_dm_is_unique_per_pair() {
        let db = seeded();
        let (first, created) = db.create_chat(&NewChat::dm(uid("u2")), &uid("u1")).unwrap();
        assert!(created);

        let (second, created) = db.create_chat(&NewChat::dm(uid("u1")), &uid("u2")).unwrap();
        assert!(!created);
        assert_eq!(first.id, second.id);

        let count: i64 = db
            .conn()
            .query_row("SELECT COUNT(*) FROM chats WHERE kind = 'dm'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_dm_with_self_rejected() {
        let db = seeded();
        let err = db.create_chat(&NewChat::dm(uid("u1")), &uid("u1")).unwrap_err();
        assert!(matches!(rejected(err), ChatError::InvalidArgument(_)));
    }

    #[test]
    fn test_update_members_reports_diff() {
        let db = seeded();
        let (chat, _) = db
            .create_chat(&NewChat::group("Team", [uid("u2"), uid("u3")]), &uid("u1"))
            .unwrap();

        let next = BTreeSet::from([uid("u1"), uid("u2"), uid("u4")]);
        let change = db.update_chat_members(&chat.id, &next, &uid("u1")).unwrap();

        assert_eq!(change.added, BTreeSet::from([uid("u4")]));
        assert_eq!(change.removed, BTreeSet::from([uid("u3")]));
        assert_eq!(db.members_of(&chat.id).unwrap(), next);
        assert!(change.chat.version > chat.version);
    }

    #[test]
    fn test_update_members_authorization() {
        let db = seeded();
        let (chat, _) = db
            .create_chat(&NewChat::group("Team", [uid("u2")]), &uid("u1"))
            .unwrap();

        let err = db
            .update_chat_members(&chat.id, &BTreeSet::from([uid("u2")]), &uid("u2"))
            .unwrap_err();
        assert!(matches!(rejected(err), ChatError::Forbidden(_)));

        let err = db
            .update_chat_members(&chat.id, &BTreeSet::new(), &uid("u2"))
            .unwrap_err();
        assert!(matches!(rejected(err), ChatError::Forbidden(_)));

        let err = db
            .update_chat_members(&chat.id, &BTreeSet::new(), &uid("u1"))
            .unwrap_err();
        assert!(matches!(rejected(err), ChatError::InvalidArgument(_)));

        let err = db
            .update_chat_members(&chat.id, &BTreeSet::from([uid("u2")]), &uid("u1"))
            .unwrap_err();
        assert!(matches!(rejected(err), ChatError::InvalidArgument(_)));
    }

    #[test]
    fn test_update_details() {
        let db = seeded();
        let (chat, _) = db
            .create_chat(&NewChat::group("Team", [uid("u2")]), &uid("u1"))
            .unwrap();

        let patch = ChatPatch {
            name: Some("Project Alpha".into()),
            description: Some("Central hub".into()),
            avatar: None,
        };
        let err = db.update_chat_details(&chat.id, &patch, &uid("u2")).unwrap_err();
        assert!(matches!(rejected(err), ChatError::Forbidden(_)));

        let updated = db.update_chat_details(&chat.id, &patch, &uid("u1")).unwrap();
        assert_eq!(updated.name, "Project Alpha");
        assert_eq!(updated.description.as_deref(), Some("Central hub"));
    }

    #[test]
    fn test_empty_details_patch_checks_admin_first() {
        let db = seeded();
        let (chat, _) = db
            .create_chat(&NewChat::group("Team", [uid("u2")]), &uid("u1"))
            .unwrap();
        let empty = ChatPatch::default();

        let err = db.update_chat_details(&chat.id, &empty, &uid("u2")).unwrap_err();
        assert!(matches!(rejected(err), ChatError::Forbidden(_)));

        let err = db.update_chat_details(&chat.id, &empty, &uid("u1")).unwrap_err();
        assert!(matches!(rejected(err), ChatError::InvalidArgument(_)));
    }

    #[test]
    fn test_dm_cannot_be_managed() {
        let db = seeded();
        let (dm, _) = db.create_chat(&NewChat::dm(uid("u2")), &uid("u1")).unwrap();

        let err = db.delete_chat(&dm.id, &uid("u1")).unwrap_err();
        assert!(matches!(rejected(err), ChatError::InvalidArgument(_)));
    }

    #[test]
    fn test_delete_chat_creator_only_and_terminal() {
        let db = seeded();
        let (chat, _) = db
            .create_chat(&NewChat::group("Team", [uid("u2")]), &uid("u1"))
            .unwrap();

        let err = db.delete_chat(&chat.id, &uid("u2")).unwrap_err();
        assert!(matches!(rejected(err), ChatError::Forbidden(_)));

        db.delete_chat(&chat.id, &uid("u1")).unwrap();
        let err = db.get_chat(&chat.id).unwrap_err();
        assert!(matches!(rejected(err), ChatError::NotFound(_)));
        assert!(db.members_of(&chat.id).unwrap().is_empty());
    }

    #[test]
    fn test_list_chats_for_user_membership_only() {
        let db = seeded();
        let (team, _) = db
            .create_chat(&NewChat::group("Team", [uid("u2")]), &uid("u1"))
            .unwrap();
        db.create_chat(&NewChat::group("Other", [uid("u3")]), &uid("u4"))
            .unwrap();

        let chats = db.list_chats_for_user(&uid("u2")).unwrap();
        assert_eq!(chats.len(), 1);
        assert_eq!(chats[0].id, team.id);
        assert_eq!(chats[0].member_ids.len(), 2);
    }
}
