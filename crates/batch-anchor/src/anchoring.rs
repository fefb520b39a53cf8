//! Claim-before-attempt anchoring.
//!
//! The reconciler and the scheduler both anchor through an [`AnchorWorker`].
//! A batch is only attempted under a claim taken from the store, and the
//! outcome is written back through the same claim, so two passes over the
//! same pool never submit the same batch twice.
//!
//! Right before submitting, the worker renews its claim. Renewal fails if
//! the lease lapsed and another claimant took the batch, and the fresh lease
//! must outlast a worst-case attempt; otherwise nothing is sent.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use batch_anchor_core::{BatchId, StoredBatch, TimeWindow};
use batch_anchor_ledger::{AnchoringClient, RecordOutcome};
use batch_anchor_store::{AnchorUpdate, BatchStore, Claim, StoreError};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::clock::Clock;
use crate::error::Result;

/// What became of one claimed batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Confirmed { signature: String },
    /// Retryable failure, still `pending`.
    Retry { error: String },
    /// Terminal failure.
    Failed { error: String },
    /// The claim expired and someone else finalized or re-claimed the batch.
    Lost,
    /// Not attempted: another claimant holds the batch.
    Held,
    /// Not attempted: the lease cannot cover a full attempt. The claim was
    /// released.
    Skipped,
}

/// Totals of one anchoring pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PassReport {
    pub claimed: usize,
    pub confirmed: usize,
    pub retried: usize,
    pub failed: usize,
    pub lost: usize,
}

impl PassReport {
    fn record(&mut self, disposition: &Disposition) {
        match disposition {
            Disposition::Confirmed { .. } => self.confirmed += 1,
            Disposition::Retry { .. } => self.retried += 1,
            Disposition::Failed { .. } => self.failed += 1,
            Disposition::Lost | Disposition::Held | Disposition::Skipped => self.lost += 1,
        }
    }
}

/// Result of asking for a pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassOutcome {
    /// Another pass of the same kind is still running.
    Busy,
    /// The ledger failed its health check; nothing was claimed.
    Unhealthy,
    Completed(PassReport),
}

/// Most recent anchoring failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LastError {
    pub batch_id: BatchId,
    pub error: String,
    pub at: DateTime<Utc>,
}

/// Process-lifetime anchoring counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStats {
    pub total_attempts: u64,
    pub total_success: u64,
    pub total_failed: u64,
    /// Attempts on batches that had failed before.
    pub total_retries: u64,
    pub last_error: Option<LastError>,
    pub last_success: Option<DateTime<Utc>>,
}

pub struct AnchorWorker {
    store: Arc<dyn BatchStore>,
    client: Arc<AnchoringClient>,
    clock: Arc<dyn Clock>,
    max_retries: u32,
    lease: Duration,
    attempt_budget: Duration,
    stats: Mutex<WorkerStats>,
}

impl AnchorWorker {
    pub fn new(
        store: Arc<dyn BatchStore>,
        client: Arc<AnchoringClient>,
        clock: Arc<dyn Clock>,
        max_retries: u32,
        lease: Duration,
    ) -> Self {
        Self {
            store,
            client,
            clock,
            max_retries,
            lease,
            attempt_budget: Duration::ZERO,
            stats: Mutex::new(WorkerStats::default()),
        }
    }

    /// Refuse to submit unless the renewed lease outlasts `budget`.
    pub fn with_attempt_budget(mut self, budget: Duration) -> Self {
        self.attempt_budget = budget;
        self
    }

    pub fn client(&self) -> &AnchoringClient {
        &self.client
    }

    pub fn store(&self) -> &Arc<dyn BatchStore> {
        &self.store
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn stats(&self) -> WorkerStats {
        self.lock_stats().clone()
    }

    fn lock_stats(&self) -> MutexGuard<'_, WorkerStats> {
        self.stats.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Refresh the ledger health. Passes do not claim anything while the
    /// ledger is unhealthy, so retry budgets are not burned on outages.
    pub async fn ready(&self) -> bool {
        let report = self.client.check_health().await;
        if !report.healthy {
            tracing::warn!(
                error = report.error.as_deref().unwrap_or("unknown"),
                "ledger unhealthy, skipping anchoring pass"
            );
        }
        report.healthy
    }

    /// Claim up to `limit` of the oldest `pending` batches.
    pub async fn claim_pending(&self, limit: usize) -> Result<Vec<Claim>> {
        Ok(self
            .store
            .claim_pending(self.clock.now(), self.lease, self.max_retries, limit)
            .await?)
    }

    /// Claim every never-confirmed batch that started in `window`.
    pub async fn claim_window(&self, window: &TimeWindow) -> Result<Vec<Claim>> {
        Ok(self
            .store
            .claim_window(window, self.clock.now(), self.lease, self.max_retries)
            .await?)
    }

    pub async fn claim_batch(&self, id: &BatchId) -> Result<Option<Claim>> {
        Ok(self
            .store
            .claim_batch(id, self.clock.now(), self.lease, self.max_retries)
            .await?)
    }

    /// Attempt claimed batches one at a time, `pacing` apart.
    pub async fn process(&self, claims: Vec<Claim>, pacing: Duration) -> PassReport {
        let mut report = PassReport {
            claimed: claims.len(),
            ..PassReport::default()
        };
        for (i, claim) in claims.iter().enumerate() {
            if i > 0 && !pacing.is_zero() {
                tokio::time::sleep(pacing).await;
            }
            let disposition = self.attempt(claim).await;
            report.record(&disposition);
        }
        report
    }

    /// Anchor one claimed batch and write the outcome through the claim.
    pub async fn attempt(&self, claim: &Claim) -> Disposition {
        let batch = &claim.batch;
        let now = self.clock.now();
        let renewed = match self.store.renew_claim(claim, now, self.lease).await {
            Ok(renewed) => renewed,
            Err(StoreError::ClaimLost(_)) | Err(StoreError::TerminalStatus { .. }) => {
                tracing::warn!(batch_id = %batch.id, "claim lost before submission");
                return Disposition::Lost;
            }
            Err(e) => {
                tracing::error!(batch_id = %batch.id, error = %e, "failed to renew claim");
                return Disposition::Lost;
            }
        };

        let deadline = chrono::Duration::from_std(self.attempt_budget)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        if renewed.expires_at <= deadline {
            tracing::warn!(
                batch_id = %batch.id,
                lease_secs = self.lease.as_secs(),
                attempt_budget_secs = self.attempt_budget.as_secs(),
                "lease too short for an attempt, releasing claim"
            );
            if let Err(e) = self.store.release_claim(&renewed).await {
                tracing::error!(batch_id = %batch.id, error = %e, "failed to release claim");
            }
            return Disposition::Skipped;
        }

        let outcome = self.client.record_batch(batch, now).await;
        let update = self.update_for(batch, &outcome);
        let disposition = match &update {
            AnchorUpdate::Confirmed { signature, .. } => Disposition::Confirmed {
                signature: signature.clone(),
            },
            AnchorUpdate::Retry { error } => Disposition::Retry {
                error: error.clone(),
            },
            AnchorUpdate::Failed { error } => Disposition::Failed {
                error: error.clone(),
            },
        };

        match self.store.complete_claim(&renewed, update).await {
            Ok(()) => {
                self.count(batch, &disposition);
                match &disposition {
                    Disposition::Retry { error } => tracing::info!(
                        batch_id = %batch.id,
                        retry_count = batch.anchor.retry_count + 1,
                        max_retries = self.max_retries,
                        error = %error,
                        "anchoring will be retried"
                    ),
                    Disposition::Failed { error } => tracing::error!(
                        batch_id = %batch.id,
                        error = %error,
                        "batch anchoring failed permanently"
                    ),
                    _ => {}
                }
                disposition
            }
            Err(StoreError::ClaimLost(_)) | Err(StoreError::TerminalStatus { .. }) => {
                tracing::warn!(
                    batch_id = %batch.id,
                    "claim lost before the outcome was recorded"
                );
                Disposition::Lost
            }
            Err(e) => {
                // The lease lapses and the batch is picked up again.
                tracing::error!(batch_id = %batch.id, error = %e, "failed to record anchoring outcome");
                Disposition::Lost
            }
        }
    }

    /// Status change for an attempt outcome, applying the retry ceiling.
    pub fn update_for(&self, batch: &StoredBatch, outcome: &RecordOutcome) -> AnchorUpdate {
        match outcome {
            RecordOutcome::Confirmed { signature, .. } => AnchorUpdate::Confirmed {
                signature: signature.clone(),
                at: self.clock.now(),
            },
            RecordOutcome::Failed { failure, .. } => {
                let error = format!("{}: {}", failure.kind, failure.message);
                if !failure.is_retryable() {
                    AnchorUpdate::Failed { error }
                } else if batch.anchor.retry_count + 1 >= self.max_retries {
                    AnchorUpdate::Failed {
                        error: format!(
                            "Max retries ({}) reached. Last error: {error}",
                            self.max_retries
                        ),
                    }
                } else {
                    AnchorUpdate::Retry { error }
                }
            }
        }
    }

    fn count(&self, batch: &StoredBatch, disposition: &Disposition) {
        let now = self.clock.now();
        let mut stats = self.lock_stats();
        stats.total_attempts += 1;
        if batch.anchor.retry_count > 0 {
            stats.total_retries += 1;
        }
        match disposition {
            Disposition::Confirmed { .. } => {
                stats.total_success += 1;
                stats.last_success = Some(now);
            }
            Disposition::Retry { error } | Disposition::Failed { error } => {
                if matches!(disposition, Disposition::Failed { .. }) {
                    stats.total_failed += 1;
                }
                stats.last_error = Some(LastError {
                    batch_id: batch.id,
                    error: error.clone(),
                    at: now,
                });
            }
            Disposition::Lost | Disposition::Held | Disposition::Skipped => {}
        }
    }
}
