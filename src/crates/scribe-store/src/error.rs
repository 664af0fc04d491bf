//! Error types for cache and snapshot persistence.

use thiserror::Error;

/// Convenience result type using [`StoreError`].
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors raised by the persistence layer.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Filesystem operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization or deserialization failed.
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// Binary serialization or deserialization failed.
    #[error("binary serialization error: {0}")]
    Bincode(#[from] bincode::Error),

    /// A snapshot directory is missing one of its required files.
    #[error("snapshot at '{dir}' is incomplete: missing {file}")]
    IncompleteSnapshot {
        /// Snapshot directory that was inspected
        dir: String,
        /// File that was expected but absent
        file: String,
    },

    /// The computation backing an in-flight cache entry was dropped
    /// without resolving, so waiters can never observe a result.
    #[error("in-flight cache computation for '{0}' was abandoned")]
    Abandoned(String),
}

impl StoreError {
    /// Create an [`StoreError::IncompleteSnapshot`] for a missing file.
    pub fn incomplete(dir: impl Into<String>, file: impl Into<String>) -> Self {
        Self::IncompleteSnapshot {
            dir: dir.into(),
            file: file.into(),
        }
    }
}
