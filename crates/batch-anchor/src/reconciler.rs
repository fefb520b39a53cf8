//! Retry reconciler.
//!
//! Sweeps the retry queue (`pending` batches under the retry ceiling) on a
//! fixed interval. There is no separate queue structure: the store's status
//! column is the queue, and claims keep concurrent sweeps apart.

use std::sync::Arc;

use tokio::sync::{watch, Mutex};
use tokio::time::MissedTickBehavior;

use crate::anchoring::{AnchorWorker, PassOutcome};
use crate::config::ReconcilerConfig;
use crate::error::Result;
use crate::service::{shutdown_signalled, sleep_or_shutdown};

pub struct Reconciler {
    worker: Arc<AnchorWorker>,
    config: ReconcilerConfig,
    running: Mutex<()>,
}

impl Reconciler {
    pub fn new(worker: Arc<AnchorWorker>, config: ReconcilerConfig) -> Self {
        Self {
            worker,
            config,
            running: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    /// Run one pass unless one is already in progress.
    pub async fn run_once(&self) -> Result<PassOutcome> {
        let Ok(_running) = self.running.try_lock() else {
            tracing::debug!("reconciliation pass already running");
            return Ok(PassOutcome::Busy);
        };

        if !self.worker.ready().await {
            return Ok(PassOutcome::Unhealthy);
        }

        let claims = self.worker.claim_pending(self.config.batch_limit).await?;
        if claims.is_empty() {
            tracing::debug!("retry queue empty");
            return Ok(PassOutcome::Completed(Default::default()));
        }

        tracing::info!(count = claims.len(), "reconciling pending batches");
        let report = self.worker.process(claims, self.config.pacing).await;
        tracing::info!(
            confirmed = report.confirmed,
            retried = report.retried,
            failed = report.failed,
            lost = report.lost,
            "reconciliation pass finished"
        );
        Ok(PassOutcome::Completed(report))
    }

    async fn pass(&self) {
        if let Err(e) = self.run_once().await {
            tracing::error!(error = %e, "reconciliation pass failed");
        }
    }

    /// One pass shortly after start, then one per interval until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            interval_ms = self.config.interval.as_millis() as u64,
            max_retries = self.worker.max_retries(),
            "reconciler started"
        );

        if !sleep_or_shutdown(&mut shutdown, self.config.startup_delay).await {
            self.pass().await;

            let mut interval = tokio::time::interval(self.config.interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = interval.tick() => self.pass().await,
                    changed = shutdown.changed() => {
                        if shutdown_signalled(changed, &shutdown) {
                            break;
                        }
                    }
                }
            }
        }
        tracing::info!("reconciler stopped");
    }
}
