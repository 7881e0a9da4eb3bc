//! Database connection management.
//!
//! The [`Database`] struct owns a [`rusqlite::Connection`] and guarantees that
//! migrations are run before any other operation. It also owns the global
//! commit version counter that orders every mutation the store accepts.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, SubsecRound, Utc};
use directories::ProjectDirs;
use rusqlite::{Connection, Transaction, TransactionBehavior};

use crate::error::{Result, StoreError};
use crate::migrations;

/// Wrapper around a [`rusqlite::Connection`].
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open (or create) the default application database.
    ///
    /// The database file is placed in the platform-appropriate data directory:
    /// - Linux:   `~/.local/share/chatwave/chatwave.db`
    /// - macOS:   `~/Library/Application Support/com.chatwave.chatwave/chatwave.db`
    /// - Windows: `{FOLDERID_RoamingAppData}\chatwave\chatwave\data\chatwave.db`
    pub fn new() -> Result<Self> {
        Self::open_at(&Self::default_path()?)
    }

    /// Path used by [`Database::new`].
    pub fn default_path() -> Result<PathBuf> {
        let project_dirs =
            ProjectDirs::from("com", "chatwave", "chatwave").ok_or(StoreError::NoDataDir)?;

        let data_dir = project_dirs.data_dir();
        std::fs::create_dir_all(data_dir)?;

        Ok(data_dir.join("chatwave.db"))
    }

    /// Open (or create) a database at an explicit path.
    pub fn open_at(path: &Path) -> Result<Self> {
        tracing::info!(path = %path.display(), "opening database");

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::prepare(conn)
    }

    /// Open a private in-memory database. Nothing survives the handle.
    pub fn open_in_memory() -> Result<Self> {
        Self::prepare(Connection::open_in_memory()?)
    }

    fn prepare(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(Duration::from_secs(5))?;

        migrations::run_migrations(&conn)?;

        Ok(Self { conn })
    }

    /// Return a reference to the underlying `rusqlite::Connection`.
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Return the filesystem path of the open database (if any).
    pub fn path(&self) -> Option<PathBuf> {
        self.conn
            .path()
            .filter(|p| !p.is_empty())
            .map(PathBuf::from)
    }

    /// Begin a write transaction that takes the database write lock up front,
    /// so read-check-write sequences inside it cannot interleave.
    pub(crate) fn write_tx(&self) -> Result<Transaction<'_>> {
        Ok(Transaction::new_unchecked(
            &self.conn,
            TransactionBehavior::Immediate,
        )?)
    }

    /// Latest commit version handed out. Used as a snapshot cursor.
    pub fn current_version(&self) -> Result<u64> {
        current_version(&self.conn)
    }
}

pub(crate) fn current_version(conn: &Connection) -> Result<u64> {
    let value: i64 = conn.query_row(
        "SELECT value FROM meta WHERE key = 'commit_version'",
        [],
        |row| row.get(0),
    )?;
    Ok(value as u64)
}

/// Draw the next commit version. Must be called inside a write transaction.
pub(crate) fn next_version(conn: &Connection) -> Result<u64> {
    conn.execute(
        "UPDATE meta SET value = value + 1 WHERE key = 'commit_version'",
        [],
    )?;
    current_version(conn)
}

/// Wall-clock commit time at the precision timestamps are stored with.
pub(crate) fn commit_now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}
