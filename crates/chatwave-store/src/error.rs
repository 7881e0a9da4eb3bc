use chatwave_shared::ChatError;
use thiserror::Error;

/// Errors produced by the store layer.
#[derive(Error, Debug)]
pub enum StoreError {
    /// SQLite error.
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Failed to determine a platform data directory.
    #[error("Could not determine application data directory")]
    NoDataDir,

    /// Generic I/O error (e.g. creating the database directory).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Migration failure.
    #[error("Migration error: {0}")]
    Migration(String),

    /// Embedded JSON column could not be encoded or decoded.
    #[error("JSON column error: {0}")]
    Json(#[from] serde_json::Error),

    /// The operation was refused on domain grounds.
    #[error(transparent)]
    Rejected(#[from] ChatError),
}

impl StoreError {
    pub(crate) fn not_found(what: impl Into<String>) -> Self {
        StoreError::Rejected(ChatError::NotFound(what.into()))
    }

    pub(crate) fn forbidden(why: impl Into<String>) -> Self {
        StoreError::Rejected(ChatError::Forbidden(why.into()))
    }

    pub(crate) fn invalid(why: impl Into<String>) -> Self {
        StoreError::Rejected(ChatError::InvalidArgument(why.into()))
    }
}

impl From<StoreError> for ChatError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Rejected(e) => e,
            other => {
                tracing::error!(error = %other, "storage backend failure");
                ChatError::Unavailable("storage backend failure, please retry".to_string())
            }
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;
