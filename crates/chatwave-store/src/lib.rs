//! # chatwave-store
//!
//! Durable state of the messaging core, backed by SQLite.
//!
//! The crate exposes a synchronous [`Database`] handle wrapping a
//! `rusqlite::Connection`. Every mutation runs in its own `IMMEDIATE`
//! transaction, draws a fresh commit version from the `meta` table and
//! returns the committed records so the caller can fan them out.
//!
//! - [`users`]: the identity store
//! - [`membership`]: chat ↔ participant index and the DM pair index
//! - [`chats`]: chat metadata, member edits, cascading deletes
//! - [`messages`]: the per-chat ordered message log

pub mod chats;
pub mod database;
pub mod membership;
pub mod messages;
pub mod migrations;
pub mod users;

mod error;
mod rows;

pub use chats::MembershipChange;
pub use database::Database;
pub use error::{Result, StoreError};
pub use messages::{Appended, MessageBatch, MessageChange};
