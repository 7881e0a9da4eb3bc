//! Identity store: CRUD operations for [`User`] records.

use chatwave_shared::validate;
use chatwave_shared::{AuthProfile, ChatError, NewUser, User, UserId, UserPatch};
use rusqlite::{params, Connection, OptionalExtension};

use crate::database::{commit_now, next_version, Database};
use crate::error::{Result, StoreError};
use crate::rows::{parse_ts, ts_to_sql};

const USER_COLUMNS: &str = "id, name, avatar, bio, created_at, version";

impl Database {
    // ------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------

    /// Register a new user. Fails `AlreadyExists` if the id is taken.
    pub fn create_user(&self, new: &NewUser) -> Result<User> {
        let name = validate::user_name(&new.name)?;
        let bio = validate::bio(new.bio.as_deref().unwrap_or_default())?;
        let avatar = non_blank(new.avatar.as_deref())
            .unwrap_or_else(|| validate::default_avatar(&name));

        let tx = self.write_tx()?;
        if load_user(&tx, &new.id)?.is_some() {
            return Err(ChatError::AlreadyExists(format!("user {} already exists", new.id)).into());
        }
        let user = insert_user(&tx, &new.id, name, avatar, bio)?;
        tx.commit()?;

        tracing::info!(user = %user.id, version = user.version, "user created");
        Ok(user)
    }

    /// Create the record for a signed-in account if it does not exist yet.
    ///
    /// Returns the stored user and whether it was created by this call.
    pub fn ensure_user(&self, profile: &AuthProfile) -> Result<(User, bool)> {
        let tx = self.write_tx()?;
        if let Some(existing) = load_user(&tx, &profile.id)? {
            return Ok((existing, false));
        }

        let name = profile.derived_name();
        let avatar = non_blank(profile.photo_url.as_deref())
            .unwrap_or_else(|| validate::default_avatar(&name));
        let user = insert_user(&tx, &profile.id, name, avatar, String::new())?;
        tx.commit()?;

        tracing::info!(user = %user.id, "user record created on sign-in");
        Ok((user, true))
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    pub fn get_user(&self, id: &UserId) -> Result<Option<User>> {
        load_user(self.conn(), id)
    }

    /// All users, ordered by name.
    pub fn list_users(&self) -> Result<Vec<User>> {
        let mut stmt = self
            .conn()
            .prepare(&format!("SELECT {USER_COLUMNS} FROM users ORDER BY name ASC, id ASC"))?;

        let rows = stmt.query_map([], row_to_user)?;

        let mut users = Vec::new();
        for row in rows {
            users.push(row?);
        }
        Ok(users)
    }

    // ------------------------------------------------------------------
    // Update
    // ------------------------------------------------------------------

    /// Apply a profile patch. Only the owner may edit a profile.
    pub fn update_user(&self, actor: &UserId, id: &UserId, patch: &UserPatch) -> Result<User> {
        let tx = self.write_tx()?;
        let mut user =
            load_user(&tx, id)?.ok_or_else(|| StoreError::not_found(format!("user {id}")))?;
        if actor != id {
            return Err(StoreError::forbidden("only the owner may edit a profile"));
        }
        if patch.is_empty() {
            return Err(StoreError::invalid("profile patch is empty"));
        }

        if let Some(name) = &patch.name {
            user.name = validate::user_name(name)?;
        }
        if let Some(bio) = &patch.bio {
            user.bio = validate::bio(bio)?;
        }
        if let Some(avatar) = &patch.avatar {
            user.avatar =
                non_blank(Some(avatar)).unwrap_or_else(|| validate::default_avatar(&user.name));
        }
        user.version = next_version(&tx)?;

        tx.execute(
            "UPDATE users SET name = ?1, avatar = ?2, bio = ?3, version = ?4 WHERE id = ?5",
            params![user.name, user.avatar, user.bio, user.version as i64, id.as_str()],
        )?;
        tx.commit()?;

        tracing::info!(user = %id, version = user.version, "user updated");
        Ok(user)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn non_blank(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn insert_user(
    conn: &Connection,
    id: &UserId,
    name: String,
    avatar: String,
    bio: String,
) -> Result<User> {
    let user = User {
        id: id.clone(),
        name,
        avatar,
        bio,
        created_at: commit_now(),
        version: next_version(conn)?,
    };
    conn.execute(
        "INSERT INTO users (id, name, avatar, bio, created_at, version)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            user.id.as_str(),
            user.name,
            user.avatar,
            user.bio,
            ts_to_sql(&user.created_at),
            user.version as i64,
        ],
    )?;
    Ok(user)
}

pub(crate) fn load_user(conn: &Connection, id: &UserId) -> Result<Option<User>> {
    Ok(conn
        .query_row(
            &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
            params![id.as_str()],
            row_to_user,
        )
        .optional()?)
}

/// Ids from `ids` that have no user record.
pub(crate) fn missing_users<'a>(
    conn: &Connection,
    ids: impl IntoIterator<Item = &'a UserId>,
) -> Result<Vec<UserId>> {
    let mut stmt = conn.prepare("SELECT 1 FROM users WHERE id = ?1")?;
    let mut missing = Vec::new();
    for id in ids {
        if !stmt.exists(params![id.as_str()])? {
            missing.push(id.clone());
        }
    }
    Ok(missing)
}

fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    let id: String = row.get(0)?;
    let created_str: String = row.get(4)?;
    let version: i64 = row.get(5)?;

    Ok(User {
        id: UserId(id),
        name: row.get(1)?,
        avatar: row.get(2)?,
        bio: row.get(3)?,
        created_at: parse_ts(4, &created_str)?,
        version: version as u64,
    })
}
