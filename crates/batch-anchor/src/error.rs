//! Error types for the anchoring service.

use batch_anchor_core::{CoreError, ValidationError};
use batch_anchor_ledger::LedgerError;
use batch_anchor_store::StoreError;
use thiserror::Error;

/// Errors that can occur while running the service.
#[derive(Debug, Error)]
pub enum AnchorError {
    /// A stream entry failed validation.
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Batch or window construction failed.
    #[error("core error: {0}")]
    Core(#[from] CoreError),

    /// Storage error.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    /// Ledger error.
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    /// Invalid or missing configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// The message source failed.
    #[error("message source error: {0}")]
    Source(String),

    /// A background task panicked or was cancelled.
    #[error("task failed: {0}")]
    Task(String),

    /// I/O error from the inbound stream.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for AnchorError {
    fn from(e: config::ConfigError) -> Self {
        AnchorError::Config(e.to_string())
    }
}

/// Result type for service operations.
pub type Result<T> = std::result::Result<T, AnchorError>;
