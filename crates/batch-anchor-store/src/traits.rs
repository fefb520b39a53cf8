//! BatchStore trait: the abstract interface for batch persistence.
//!
//! This trait allows the service to be storage-agnostic. Implementations
//! include SQLite (primary) and in-memory (for tests).

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use batch_anchor_core::{AnchorStatus, BatchId, Message, SealedBatch, StoredBatch, TimeWindow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;

/// Result of saving a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveResult {
    /// Batch and messages were written.
    Inserted,
    /// The identical batch was already stored (idempotent - not an error).
    AlreadyExists,
}

/// An anchor status change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnchorUpdate {
    /// Anchored: store the signature and confirmation time.
    Confirmed {
        signature: String,
        at: DateTime<Utc>,
    },
    /// Retryable failure: increment retry count, stay `pending`.
    Retry { error: String },
    /// Terminal failure: increment retry count, move to `failed`.
    Failed { error: String },
}

impl AnchorUpdate {
    /// Status the batch ends up in.
    pub fn target_status(&self) -> AnchorStatus {
        match self {
            AnchorUpdate::Confirmed { .. } => AnchorStatus::Confirmed,
            AnchorUpdate::Retry { .. } => AnchorStatus::Pending,
            AnchorUpdate::Failed { .. } => AnchorStatus::Failed,
        }
    }
}

/// Opaque token proving ownership of a claim.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClaimToken(pub Uuid);

impl ClaimToken {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ClaimToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ClaimToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClaimToken({})", self.0)
    }
}

impl fmt::Display for ClaimToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A leased right to attempt anchoring one batch.
///
/// While the lease is live no other claimant can select the batch.
#[derive(Debug, Clone, PartialEq)]
pub struct Claim {
    pub token: ClaimToken,
    pub batch: StoredBatch,
    pub expires_at: DateTime<Utc>,
}

/// Which pool a claim selects from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimScope {
    /// `pending` batches, oldest first, up to `limit` (retry reconciliation).
    Pending { limit: usize },
    /// Batches with status `none` or `pending` whose start falls inside
    /// `window`. `failed` is terminal: a failed batch is never selected, even
    /// with `retry_count` below the ceiling.
    Window(TimeWindow),
    /// One never-confirmed batch, by id.
    Batch(BatchId),
}

/// Anchor status counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnchorStats {
    pub none: u64,
    pub pending: u64,
    pub confirmed: u64,
    pub failed: u64,
    /// Pending batches still under the retry ceiling.
    pub retry_queue: u64,
    /// Batches currently held under a live claim.
    pub claimed: u64,
}

/// The BatchStore trait: async interface for batch persistence.
///
/// # Design Notes
///
/// - **Atomic batches**: `save_batch` writes the batch row and all message
///   rows in one transaction. On failure nothing is written.
/// - **Idempotent saves**: saving the identical batch twice returns
///   `AlreadyExists`; a different hash under the same id is a `Conflict`.
/// - **Monotone status**: `confirmed` and `failed` are never left.
/// - **Claim before attempt**: anchoring workers claim batches with a lease
///   and finalize through the claim token, so two workers never attempt the
///   same batch concurrently.
#[async_trait]
pub trait BatchStore: Send + Sync {
    // ─────────────────────────────────────────────────────────────────────────
    // Batch Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Persist a sealed batch and its messages atomically.
    async fn save_batch(&self, batch: &SealedBatch) -> Result<SaveResult>;

    /// Get a batch by id.
    async fn get_batch(&self, id: &BatchId) -> Result<Option<StoredBatch>>;

    /// List batches, newest first (by end timestamp).
    async fn list_batches(&self, limit: usize, offset: usize) -> Result<Vec<StoredBatch>>;

    /// Get a message by its id. If redelivery stored it twice, the earliest wins.
    async fn get_message(&self, id: &str) -> Result<Option<Message>>;

    /// Messages of a batch, in arrival order.
    async fn list_messages(&self, batch_id: &BatchId) -> Result<Vec<Message>>;

    // ─────────────────────────────────────────────────────────────────────────
    // Anchor Status Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Apply a status change outside the claim protocol.
    ///
    /// Fails with `TerminalStatus` if the batch is already confirmed or failed.
    async fn update_anchor_status(&self, id: &BatchId, update: AnchorUpdate) -> Result<()>;

    /// Batches eligible for a first attempt in `window` (read only).
    ///
    /// Eligible: start inside the window, status `none` or `pending`,
    /// `retry_count < max_retries`. Oldest first.
    async fn find_due(&self, window: &TimeWindow, max_retries: u32) -> Result<Vec<StoredBatch>>;

    /// Atomically claim eligible batches for `lease`.
    ///
    /// Batches under a live claim are skipped. Each returned claim carries a
    /// fresh token that must be presented to `complete_claim`.
    async fn claim(
        &self,
        scope: ClaimScope,
        now: DateTime<Utc>,
        lease: Duration,
        max_retries: u32,
    ) -> Result<Vec<Claim>>;

    /// Claim up to `limit` oldest `pending` batches (the retry queue).
    async fn claim_pending(
        &self,
        now: DateTime<Utc>,
        lease: Duration,
        max_retries: u32,
        limit: usize,
    ) -> Result<Vec<Claim>> {
        self.claim(ClaimScope::Pending { limit }, now, lease, max_retries)
            .await
    }

    /// Claim every never-confirmed batch starting inside `window`.
    async fn claim_window(
        &self,
        window: &TimeWindow,
        now: DateTime<Utc>,
        lease: Duration,
        max_retries: u32,
    ) -> Result<Vec<Claim>> {
        self.claim(ClaimScope::Window(*window), now, lease, max_retries)
            .await
    }

    /// Claim one batch by id, if it is eligible and unclaimed.
    async fn claim_batch(
        &self,
        id: &BatchId,
        now: DateTime<Utc>,
        lease: Duration,
        max_retries: u32,
    ) -> Result<Option<Claim>> {
        let claims = self
            .claim(ClaimScope::Batch(*id), now, lease, max_retries)
            .await?;
        Ok(claims.into_iter().next())
    }

    /// Apply the outcome of an attempt and clear the claim.
    ///
    /// Fails with `ClaimLost` if the token no longer owns the batch.
    async fn complete_claim(&self, claim: &Claim, update: AnchorUpdate) -> Result<()>;

    /// Extend a claim to `now + lease`, proving the token still owns the
    /// batch. Works on an expired lease nobody has taken over.
    ///
    /// Fails with `ClaimLost` if the token no longer owns the batch and with
    /// `TerminalStatus` if the batch was finalized.
    async fn renew_claim(
        &self,
        claim: &Claim,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Claim>;

    /// Drop a claim without recording an attempt.
    async fn release_claim(&self, claim: &Claim) -> Result<()>;

    /// Status counts.
    async fn statistics(&self, now: DateTime<Utc>, max_retries: u32) -> Result<AnchorStats>;
}

/// Whether a stored batch is eligible under `scope`, ignoring claims.
///
/// No scope ever selects a `confirmed` or `failed` batch.
pub(crate) fn eligible(batch: &StoredBatch, scope: &ClaimScope, max_retries: u32) -> bool {
    if batch.anchor.retry_count >= max_retries {
        return false;
    }
    match scope {
        ClaimScope::Pending { .. } => batch.anchor.status == AnchorStatus::Pending,
        ClaimScope::Window(window) => {
            window.contains(&batch.start)
                && matches!(batch.anchor.status, AnchorStatus::None | AnchorStatus::Pending)
        }
        ClaimScope::Batch(id) => {
            batch.id == *id
                && matches!(batch.anchor.status, AnchorStatus::None | AnchorStatus::Pending)
        }
    }
}

/// Expiry of a lease taken at `now`.
pub(crate) fn lease_expiry(now: DateTime<Utc>, lease: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(lease)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
