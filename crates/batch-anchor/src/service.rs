//! Service wiring.
//!
//! [`AnchorService`] is built once at process start from its collaborators
//! (store, ledger, wallet, clock) and hands the same instances to every
//! component. [`AnchorService::start`] spawns the accumulator, reconciler
//! and scheduler as tokio tasks sharing one shutdown signal.

use std::sync::Arc;
use std::time::Duration;

use batch_anchor_core::{AnchorStatus, BatchId, StoredBatch};
use batch_anchor_ledger::{
    AnchoringClient, HealthReport, Keypair, LedgerClient, VerifiedRecord,
};
use batch_anchor_store::{AnchorStats, BatchStore, StoreError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::accumulator::{Accumulator, IngestStats};
use crate::anchoring::{AnchorWorker, Disposition, WorkerStats};
use crate::clock::Clock;
use crate::config::AnchorConfig;
use crate::error::{AnchorError, Result};
use crate::reconciler::Reconciler;
use crate::scheduler::{Scheduler, SchedulerStatus};
use crate::source::MessageSource;

/// Sleep for `duration` unless shutdown is signalled first.
///
/// Returns true if the caller should stop.
pub(crate) async fn sleep_or_shutdown(
    shutdown: &mut watch::Receiver<bool>,
    duration: Duration,
) -> bool {
    if *shutdown.borrow() {
        return true;
    }
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        changed = shutdown.changed() => shutdown_signalled(changed, shutdown),
    }
}

/// Whether a `watch::Receiver::changed` result means stop. A dropped sender
/// counts as a stop.
pub(crate) fn shutdown_signalled(
    changed: std::result::Result<(), watch::error::RecvError>,
    shutdown: &watch::Receiver<bool>,
) -> bool {
    changed.is_err() || *shutdown.borrow()
}

/// Field-by-field comparison of an on-chain record with the stored batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldMatches {
    pub batch_id: bool,
    pub message_count: bool,
    pub batch_hash: bool,
}

impl FieldMatches {
    pub fn all(&self) -> bool {
        self.batch_id && self.message_count && self.batch_hash
    }
}

/// Result of checking a stored batch against the ledger.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchVerification {
    /// No signature recorded yet.
    NotAnchored {
        status: AnchorStatus,
        last_error: Option<String>,
    },
    Anchored {
        verified: bool,
        matches: FieldMatches,
        on_chain: VerifiedRecord,
        confirmed_at: Option<DateTime<Utc>>,
    },
}

/// Everything the service can report about itself.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStats {
    pub ledger_healthy: bool,
    pub network: String,
    pub database: AnchorStats,
    pub anchoring: WorkerStats,
    pub scheduler: SchedulerStatus,
}

pub struct AnchorService {
    config: AnchorConfig,
    store: Arc<dyn BatchStore>,
    client: Arc<AnchoringClient>,
    worker: Arc<AnchorWorker>,
    reconciler: Arc<Reconciler>,
    scheduler: Arc<Scheduler>,
    clock: Arc<dyn Clock>,
}

impl AnchorService {
    pub fn new(
        config: AnchorConfig,
        store: Arc<dyn BatchStore>,
        ledger: Arc<dyn LedgerClient>,
        wallet: Keypair,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;

        let client = Arc::new(AnchoringClient::new(ledger, wallet, config.anchoring()));
        let worker = Arc::new(AnchorWorker::new(
            store.clone(),
            client.clone(),
            clock.clone(),
            config.reconciler.max_retries,
            config.claim.lease,
        )
        .with_attempt_budget(config.ledger.attempt_budget()));
        let reconciler = Arc::new(Reconciler::new(worker.clone(), config.reconciler.clone()));
        let scheduler = Arc::new(Scheduler::new(worker.clone(), config.scheduler.clone()));

        Ok(Self {
            config,
            store,
            client,
            worker,
            reconciler,
            scheduler,
            clock,
        })
    }

    pub fn config(&self) -> &AnchorConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn BatchStore> {
        &self.store
    }

    pub fn client(&self) -> &Arc<AnchoringClient> {
        &self.client
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// A fresh accumulator over `source`, sharing this service's store and clock.
    pub fn accumulator(&self, source: Arc<dyn MessageSource>) -> Accumulator {
        Accumulator::new(
            self.store.clone(),
            source,
            self.clock.clone(),
            self.config.batching.clone(),
        )
    }

    pub async fn get_batch(&self, id: &BatchId) -> Result<Option<StoredBatch>> {
        Ok(self.store.get_batch(id).await?)
    }

    /// Batches, newest first.
    pub async fn list_batches(&self, limit: usize, offset: usize) -> Result<Vec<StoredBatch>> {
        Ok(self.store.list_batches(limit, offset).await?)
    }

    pub async fn check_health(&self) -> HealthReport {
        self.client.check_health().await
    }

    /// Anchor one batch now, under a claim like any scheduled attempt.
    ///
    /// A batch that is already terminal reports its recorded outcome.
    pub async fn record_batch(&self, id: &BatchId) -> Result<Disposition> {
        if let Some(claim) = self.worker.claim_batch(id).await? {
            return Ok(self.worker.attempt(&claim).await);
        }

        let batch = self
            .store
            .get_batch(id)
            .await?
            .ok_or(StoreError::NotFound(*id))?;
        let anchor = batch.anchor;
        Ok(match anchor.status {
            AnchorStatus::Confirmed => Disposition::Confirmed {
                signature: anchor.signature.unwrap_or_default(),
            },
            AnchorStatus::Failed => Disposition::Failed {
                error: anchor.last_error.unwrap_or_default(),
            },
            _ if anchor.retry_count >= self.worker.max_retries() => Disposition::Failed {
                error: anchor.last_error.unwrap_or_default(),
            },
            _ => Disposition::Held,
        })
    }

    /// Fetch and decode the proof recorded under `signature`.
    pub async fn verify_batch(&self, signature: &str) -> Result<VerifiedRecord> {
        Ok(self.client.verify_batch(signature).await?)
    }

    /// Compare a stored batch with the proof recorded for it on the ledger.
    pub async fn verify_stored_batch(&self, id: &BatchId) -> Result<BatchVerification> {
        let batch = self
            .store
            .get_batch(id)
            .await?
            .ok_or(StoreError::NotFound(*id))?;

        let Some(signature) = batch.anchor.signature.clone() else {
            return Ok(BatchVerification::NotAnchored {
                status: batch.anchor.status,
                last_error: batch.anchor.last_error,
            });
        };

        let on_chain = self.verify_batch(&signature).await?;
        let record = &on_chain.record;
        let matches = FieldMatches {
            batch_id: record.batch_id == batch.id,
            message_count: record.message_count == batch.message_count,
            batch_hash: record.batch_hash == batch.hash,
        };
        if !matches.all() {
            tracing::error!(
                batch_id = %id,
                signature = %signature,
                ?matches,
                "ledger record does not match stored batch"
            );
        }
        Ok(BatchVerification::Anchored {
            verified: matches.all(),
            matches,
            on_chain,
            confirmed_at: batch.anchor.confirmed_at,
        })
    }

    pub async fn statistics(&self) -> Result<ServiceStats> {
        let database = self
            .store
            .statistics(self.clock.now(), self.config.reconciler.max_retries)
            .await?;
        Ok(ServiceStats {
            ledger_healthy: self.client.is_healthy(),
            network: self.config.ledger.network.clone(),
            database,
            anchoring: self.worker.stats(),
            scheduler: self.scheduler.status(),
        })
    }

    /// Check ledger health once, then spawn the background tasks.
    ///
    /// An unhealthy ledger does not stop the service: anchoring passes
    /// re-check health and skip until it recovers.
    pub async fn start(&self, source: Arc<dyn MessageSource>) -> ServiceHandle {
        let health = self.check_health().await;
        if health.healthy {
            tracing::info!(
                wallet = %health.wallet,
                balance_sol = ?health.balance_sol,
                network = %health.network,
                "ledger healthy"
            );
        } else {
            tracing::warn!(
                error = health.error.as_deref().unwrap_or("unknown"),
                "ledger unhealthy at start, anchoring deferred"
            );
        }

        let (shutdown, rx) = watch::channel(false);
        let ingest = tokio::spawn(self.accumulator(source).run(rx.clone()));
        let reconciler = tokio::spawn(self.reconciler.clone().run(rx.clone()));
        let scheduler = self
            .config
            .scheduler
            .enabled
            .then(|| tokio::spawn(self.scheduler.clone().run(rx)));

        tracing::info!(scheduler = self.config.scheduler.enabled, "anchor service started");
        ServiceHandle {
            shutdown,
            ingest,
            reconciler,
            scheduler,
        }
    }
}

/// Handles of the running service tasks.
pub struct ServiceHandle {
    shutdown: watch::Sender<bool>,
    ingest: JoinHandle<Result<IngestStats>>,
    reconciler: JoinHandle<()>,
    scheduler: Option<JoinHandle<()>>,
}

impl ServiceHandle {
    /// Signal every task to stop after its current step.
    pub fn shutdown(&self) {
        // Receivers live inside the tasks; an error means all have exited.
        let _ = self.shutdown.send(true);
    }

    /// Whether ingestion has ended (source closed or failed).
    pub fn ingest_finished(&self) -> bool {
        self.ingest.is_finished()
    }

    /// Signal shutdown and wait for every task.
    pub async fn stop(self) -> Result<IngestStats> {
        self.shutdown();
        let stats = self
            .ingest
            .await
            .map_err(|e| AnchorError::Task(e.to_string()))?;
        self.reconciler
            .await
            .map_err(|e| AnchorError::Task(e.to_string()))?;
        if let Some(scheduler) = self.scheduler {
            scheduler
                .await
                .map_err(|e| AnchorError::Task(e.to_string()))?;
        }
        tracing::info!("anchor service stopped");
        stats
    }
}
