//! Error types for the store module.

use batch_anchor_core::{AnchorStatus, BatchId};
use thiserror::Error;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database error from SQLite.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Row serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Batch not found.
    #[error("batch not found: {0}")]
    NotFound(BatchId),

    /// A batch with the same id but a different hash already exists.
    #[error("batch {id} already stored with a different hash")]
    Conflict { id: BatchId },

    /// Attempt to move a batch out of `confirmed` or `failed`.
    #[error("batch {id} is already {status}")]
    TerminalStatus { id: BatchId, status: AnchorStatus },

    /// The claim on a batch expired and was taken by someone else.
    #[error("claim on batch {0} was lost")]
    ClaimLost(BatchId),

    /// Invalid data in storage.
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// Migration error.
    #[error("migration error: {0}")]
    Migration(String),

    /// Connection mutex poisoned by a panicking writer.
    #[error("connection lock poisoned: {0}")]
    Poisoned(String),

    /// Blocking task failed to complete.
    #[error("blocking task failed: {0}")]
    Join(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
