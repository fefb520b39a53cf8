//! Ledger errors and the anchoring failure taxonomy.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from talking to the ledger or decoding what it returns.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// HTTP or connection level failure.
    #[error("network error: {0}")]
    Transport(String),

    /// The request did not complete in time.
    #[error("request timed out: {0}")]
    Timeout(String),

    /// JSON-RPC error object returned by the node.
    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },

    /// A response, transaction, or memo could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),

    /// The wallet secret is malformed.
    #[error("invalid keypair: {0}")]
    Keypair(String),

    /// A transaction the caller asked about does not exist.
    #[error("transaction not found: {0}")]
    NotFound(String),
}

impl LedgerError {
    /// Classify for retry handling.
    pub fn kind(&self) -> AnchorErrorKind {
        match self {
            LedgerError::Timeout(_) => AnchorErrorKind::Timeout,
            other => AnchorErrorKind::classify(&other.to_string()),
        }
    }
}

impl From<reqwest::Error> for LedgerError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            LedgerError::Timeout(e.to_string())
        } else if e.is_decode() {
            LedgerError::Decode(e.to_string())
        } else {
            LedgerError::Transport(e.to_string())
        }
    }
}

impl From<serde_json::Error> for LedgerError {
    fn from(e: serde_json::Error) -> Self {
        LedgerError::Decode(e.to_string())
    }
}

/// Result type for ledger operations.
pub type Result<T> = std::result::Result<T, LedgerError>;

/// Why an anchoring attempt did not confirm.
///
/// The wire name is what gets persisted as a batch's last error tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AnchorErrorKind {
    ClientUnhealthy,
    Timeout,
    RateLimited,
    NetworkError,
    ExpiredReference,
    PayloadTooLarge,
    InsufficientFunds,
    InvalidTransaction,
    Unknown,
}

impl AnchorErrorKind {
    /// Classify a failure message by substring, first match wins.
    pub fn classify(message: &str) -> Self {
        let m = message.to_lowercase();
        let has = |needle: &str| m.contains(needle);

        if has("timeout") || has("timed out") {
            AnchorErrorKind::Timeout
        } else if has("429") || has("rate limit") {
            AnchorErrorKind::RateLimited
        } else if has("network") || has("connection") {
            AnchorErrorKind::NetworkError
        } else if has("blockhash") {
            AnchorErrorKind::ExpiredReference
        } else if has("insufficient") || has("balance") {
            AnchorErrorKind::InsufficientFunds
        } else if has("invalid") || has("failed") {
            AnchorErrorKind::InvalidTransaction
        } else {
            AnchorErrorKind::Unknown
        }
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            AnchorErrorKind::PayloadTooLarge
                | AnchorErrorKind::InsufficientFunds
                | AnchorErrorKind::InvalidTransaction
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AnchorErrorKind::ClientUnhealthy => "CLIENT_UNHEALTHY",
            AnchorErrorKind::Timeout => "TIMEOUT",
            AnchorErrorKind::RateLimited => "RATE_LIMITED",
            AnchorErrorKind::NetworkError => "NETWORK_ERROR",
            AnchorErrorKind::ExpiredReference => "EXPIRED_REFERENCE",
            AnchorErrorKind::PayloadTooLarge => "PAYLOAD_TOO_LARGE",
            AnchorErrorKind::InsufficientFunds => "INSUFFICIENT_FUNDS",
            AnchorErrorKind::InvalidTransaction => "INVALID_TRANSACTION",
            AnchorErrorKind::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for AnchorErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
