//! Error types for the batch anchor core.

use thiserror::Error;

/// Core errors that can occur while building batches and windows.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("cannot seal an empty batch")]
    EmptyBatch,

    #[error("invalid window length: {0:?}")]
    InvalidWindow(std::time::Duration),

    #[error("timestamp out of range: {0}")]
    TimestampOutOfRange(i64),

    #[error("unknown anchor status: {0}")]
    UnknownStatus(String),

    #[error("invalid hash: {0}")]
    InvalidHash(String),

    #[error("invalid batch id: {0}")]
    InvalidBatchId(String),
}

/// Reasons a stream entry is rejected at the ingestion boundary.
///
/// A rejected entry is dropped and acknowledged; it is never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("unparseable receivedAt: {0}")]
    InvalidTimestamp(String),

    #[error("invalid location: {0}")]
    InvalidLocation(String),
}
