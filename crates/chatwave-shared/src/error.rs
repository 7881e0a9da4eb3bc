use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure taxonomy surfaced by every store and service operation.
///
/// Each variant carries a human-readable reason that is safe to show to the
/// end user. Backend internals never appear in it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChatError {
    /// A chat, user or message does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The actor is not a member, not the author or not the chat admin.
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Malformed input: empty message, empty member set, bad patch.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The record already exists (duplicate user id).
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// A concurrent mutation won the race for the same record.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The backing store is unreachable or failed. Retryable.
    #[error("Service unavailable: {0}")]
    Unavailable(String),
}

/// Machine-readable tag of a [`ChatError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    Forbidden,
    InvalidArgument,
    AlreadyExists,
    Conflict,
    Unavailable,
}

impl ErrorKind {
    /// Same spelling as the serialized form.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::InvalidArgument => "invalid_argument",
            ErrorKind::AlreadyExists => "already_exists",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Unavailable => "unavailable",
        }
    }
}

impl ChatError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ChatError::NotFound(_) => ErrorKind::NotFound,
            ChatError::Forbidden(_) => ErrorKind::Forbidden,
            ChatError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            ChatError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            ChatError::Conflict(_) => ErrorKind::Conflict,
            ChatError::Unavailable(_) => ErrorKind::Unavailable,
        }
    }

    /// Only backend outages are worth retrying unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ChatError::Unavailable(_))
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        ChatError::NotFound(what.into())
    }

    pub fn forbidden(why: impl Into<String>) -> Self {
        ChatError::Forbidden(why.into())
    }

    pub fn invalid(why: impl Into<String>) -> Self {
        ChatError::InvalidArgument(why.into())
    }
}
