//! Strong type definitions for the batch anchor pipeline.
//!
//! Identifiers and hashes are newtypes to prevent misuse at compile time.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::CoreError;

/// Identifier of a batch (random UUID v4, assigned when the batch opens).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BatchId(pub Uuid);

impl BatchId {
    /// Generate a fresh random batch id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    pub const fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// Hyphenated lowercase form, as stored and anchored.
    pub fn to_hyphenated(&self) -> String {
        self.0.hyphenated().to_string()
    }
}

impl Default for BatchId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BatchId({})", self.0)
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for BatchId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| CoreError::InvalidBatchId(s.to_string()))
    }
}

/// A 32-byte SHA-256 content hash.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentHash(pub [u8; 32]);

impl ContentHash {
    /// Compute the SHA-256 hash of data.
    pub fn hash(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Self(hasher.finalize().into())
    }

    /// Create from raw bytes.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get raw bytes.
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex, 64 characters.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from a 64-character hex string.
    pub fn from_hex(s: &str) -> Result<Self, CoreError> {
        let bytes = hex::decode(s).map_err(|_| CoreError::InvalidHash(s.to_string()))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CoreError::InvalidHash(s.to_string()))?;
        Ok(Self(arr))
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({}...)", &self.to_hex()[..12])
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for ContentHash {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Anchoring status of a batch.
///
/// Transitions are monotone: `None`/`Pending` may move to `Confirmed` or
/// `Failed`; those two are sinks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnchorStatus {
    /// Never attempted.
    None,
    /// At least one attempt failed with a retryable error.
    Pending,
    /// Anchored and confirmed on the ledger.
    Confirmed,
    /// Given up; requires operator intervention.
    Failed,
}

impl AnchorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnchorStatus::None => "none",
            AnchorStatus::Pending => "pending",
            AnchorStatus::Confirmed => "confirmed",
            AnchorStatus::Failed => "failed",
        }
    }

    /// Whether no record ever leaves this status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, AnchorStatus::Confirmed | AnchorStatus::Failed)
    }

    /// Whether moving from `self` to `next` respects monotonicity.
    pub fn can_transition_to(&self, next: AnchorStatus) -> bool {
        match (self, next) {
            (AnchorStatus::Confirmed, _) | (AnchorStatus::Failed, _) => false,
            (AnchorStatus::Pending, AnchorStatus::None) => false,
            _ => true,
        }
    }
}

impl fmt::Display for AnchorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AnchorStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(AnchorStatus::None),
            "pending" => Ok(AnchorStatus::Pending),
            "confirmed" => Ok(AnchorStatus::Confirmed),
            "failed" => Ok(AnchorStatus::Failed),
            other => Err(CoreError::UnknownStatus(other.to_string())),
        }
    }
}

/// Per-batch anchoring record, embedded in the batch row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnchorRecord {
    pub status: AnchorStatus,
    /// Ledger transaction signature once confirmed.
    pub signature: Option<String>,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub confirmed_at: Option<DateTime<Utc>>,
}

impl AnchorRecord {
    /// A record for a batch that has never been attempted.
    pub fn new() -> Self {
        Self {
            status: AnchorStatus::None,
            signature: None,
            retry_count: 0,
            last_error: None,
            confirmed_at: None,
        }
    }
}

impl Default for AnchorRecord {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_hash_hex_roundtrip() {
        let h = ContentHash::hash(b"hello");
        let recovered = ContentHash::from_hex(&h.to_hex()).unwrap();
        assert_eq!(h, recovered);
        assert_eq!(h.to_hex().len(), 64);
    }

    #[test]
    fn test_content_hash_known_vector() {
        let h = ContentHash::hash(b"abc");
        assert_eq!(
            h.to_hex(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_content_hash_rejects_short_hex() {
        assert!(ContentHash::from_hex("abcd").is_err());
    }

    #[test]
    fn test_batch_id_parse() {
        let id = BatchId::new();
        let parsed: BatchId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!("not-a-uuid".parse::<BatchId>().is_err());
    }

    #[test]
    fn test_status_terminal_sinks() {
        for next in [
            AnchorStatus::None,
            AnchorStatus::Pending,
            AnchorStatus::Confirmed,
            AnchorStatus::Failed,
        ] {
            assert!(!AnchorStatus::Confirmed.can_transition_to(next));
            assert!(!AnchorStatus::Failed.can_transition_to(next));
        }
        assert!(AnchorStatus::None.can_transition_to(AnchorStatus::Pending));
        assert!(AnchorStatus::Pending.can_transition_to(AnchorStatus::Confirmed));
        assert!(AnchorStatus::Pending.can_transition_to(AnchorStatus::Failed));
        assert!(!AnchorStatus::Pending.can_transition_to(AnchorStatus::None));
    }

    #[test]
    fn test_status_string_roundtrip() {
        for s in ["none", "pending", "confirmed", "failed"] {
            assert_eq!(s.parse::<AnchorStatus>().unwrap().as_str(), s);
        }
        assert!("in-progress".parse::<AnchorStatus>().is_err());
    }
}
