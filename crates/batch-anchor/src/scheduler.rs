//! Windowed scheduler.
//!
//! Time is cut into boundary-aligned windows of fixed length. At each
//! boundary the scheduler claims the never-confirmed batches that started
//! in the window that just elapsed and anchors them one at a time. This
//! keeps ledger traffic proportional to the number of windows rather than
//! to the message rate.

use std::sync::{Arc, Mutex as StdMutex, MutexGuard};

use batch_anchor_core::TimeWindow;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{watch, Mutex};

use crate::anchoring::{AnchorWorker, PassOutcome};
use crate::config::SchedulerConfig;
use crate::error::Result;
use crate::service::sleep_or_shutdown;

/// Scheduler progress.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerStatus {
    pub enabled: bool,
    pub last_run: Option<DateTime<Utc>>,
    pub last_window: Option<TimeWindow>,
    /// Batches confirmed by scheduler passes since start.
    pub batches_recorded: u64,
    pub next_run: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct SchedulerState {
    last_run: Option<DateTime<Utc>>,
    last_window: Option<TimeWindow>,
    batches_recorded: u64,
}

pub struct Scheduler {
    worker: Arc<AnchorWorker>,
    config: SchedulerConfig,
    running: Mutex<()>,
    state: StdMutex<SchedulerState>,
}

impl Scheduler {
    pub fn new(worker: Arc<AnchorWorker>, config: SchedulerConfig) -> Self {
        Self {
            worker,
            config,
            running: Mutex::new(()),
            state: StdMutex::new(SchedulerState::default()),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    fn state(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The window containing `now`.
    pub fn current_window(&self, now: DateTime<Utc>) -> Result<TimeWindow> {
        Ok(TimeWindow::containing(now, self.config.window)?)
    }

    /// The window a tick at `now` processes: the last one fully elapsed.
    pub fn due_window(&self, now: DateTime<Utc>) -> Result<TimeWindow> {
        Ok(TimeWindow::elapsed_before(now, self.config.window)?)
    }

    /// The range a tick processes for `due`: the due window widened by the
    /// configured number of earlier windows, so batches persisted after
    /// their own window's tick still get a first attempt.
    pub fn selection(&self, due: TimeWindow) -> Result<TimeWindow> {
        let mut first = due;
        for _ in 0..self.config.catch_up_windows {
            first = first.previous()?;
        }
        Ok(TimeWindow {
            start: first.start,
            end: due.end,
        })
    }

    /// The next window boundary after `now`.
    pub fn next_run(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
        Ok(TimeWindow::next_boundary(now, self.config.window)?)
    }

    pub fn status(&self) -> SchedulerStatus {
        let state = self.state();
        SchedulerStatus {
            enabled: self.config.enabled,
            last_run: state.last_run,
            last_window: state.last_window,
            batches_recorded: state.batches_recorded,
            next_run: self.next_run(self.worker.now()).ok(),
        }
    }

    /// Claim and anchor the batches that started in `window`.
    pub async fn run_window(&self, window: TimeWindow) -> Result<PassOutcome> {
        let Ok(_running) = self.running.try_lock() else {
            tracing::debug!("scheduler pass already running");
            return Ok(PassOutcome::Busy);
        };

        if !self.worker.ready().await {
            return Ok(PassOutcome::Unhealthy);
        }

        let claims = self.worker.claim_window(&window).await?;
        let report = if claims.is_empty() {
            tracing::info!(
                window_start = %window.start,
                window_end = %window.end,
                "no batches due in window"
            );
            Default::default()
        } else {
            tracing::info!(
                window_start = %window.start,
                window_end = %window.end,
                count = claims.len(),
                "anchoring window"
            );
            self.worker.process(claims, self.config.pacing).await
        };

        let now = self.worker.now();
        {
            let mut state = self.state();
            state.last_run = Some(now);
            state.last_window = Some(window);
            state.batches_recorded += report.confirmed as u64;
        }
        tracing::info!(
            window_start = %window.start,
            confirmed = report.confirmed,
            retried = report.retried,
            failed = report.failed,
            next_run = ?self.next_run(now).ok(),
            "scheduled anchoring finished"
        );
        Ok(PassOutcome::Completed(report))
    }

    /// Process the window that elapsed most recently.
    pub async fn tick(&self) -> Result<PassOutcome> {
        let due = self.due_window(self.worker.now())?;
        self.run_window(self.selection(due)?).await
    }

    /// Run the same selection and anchoring as a periodic tick, now.
    pub async fn trigger_manual(&self) -> Result<PassOutcome> {
        tracing::info!("manual anchoring triggered");
        self.tick().await
    }

    /// Tick at every window boundary until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            window_ms = self.config.window.as_millis() as u64,
            next_run = ?self.next_run(self.worker.now()).ok(),
            "scheduler started"
        );

        if self.config.record_on_startup {
            if let Err(e) = self.tick().await {
                tracing::error!(error = %e, "startup anchoring failed");
            }
        }

        loop {
            let now = self.worker.now();
            let boundary = match self.next_run(now) {
                Ok(boundary) => boundary,
                Err(e) => {
                    tracing::error!(error = %e, "cannot compute next window boundary");
                    break;
                }
            };
            let wait = (boundary - now).to_std().unwrap_or_default();
            if sleep_or_shutdown(&mut shutdown, wait).await {
                break;
            }

            // Timers may fire early by a hair; select by the boundary we
            // slept toward, not the clock reading.
            let result = match self
                .due_window(boundary.max(self.worker.now()))
                .and_then(|due| self.selection(due))
            {
                Ok(window) => self.run_window(window).await,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                tracing::error!(error = %e, "scheduled anchoring failed");
            }
        }
        tracing::info!("scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use batch_anchor_ledger::{AnchoringClient, AnchoringConfig, Keypair, MemoryLedger};
    use batch_anchor_store::MemoryStore;
    use batch_anchor_testkit::fixtures;
    use std::time::Duration;

    fn scheduler(clock: Arc<ManualClock>) -> Scheduler {
        let client = AnchoringClient::new(
            Arc::new(MemoryLedger::funded()),
            Keypair::from_seed(&[3u8; 32]),
            AnchoringConfig::default(),
        );
        let worker = AnchorWorker::new(
            Arc::new(MemoryStore::new()),
            Arc::new(client),
            clock,
            10,
            Duration::from_secs(600),
        );
        Scheduler::new(Arc::new(worker), SchedulerConfig::default())
    }

    #[tokio::test]
    async fn test_windows_align_to_boundaries() {
        // 16:03:20 on a 10 minute grid.
        let now = fixtures::at_ms(fixtures::BASE_MS + 200_000);
        let s = scheduler(Arc::new(ManualClock::new(now)));

        let current = s.current_window(now).unwrap();
        assert_eq!(current.start, fixtures::at_ms(fixtures::BASE_MS));
        assert_eq!(current.end, fixtures::at_ms(fixtures::BASE_MS + 600_000));

        let due = s.due_window(now).unwrap();
        assert_eq!(due.end, current.start);
        assert_eq!(s.next_run(now).unwrap(), current.end);

        let selection = s.selection(due).unwrap();
        assert_eq!(selection.end, due.end);
        assert_eq!(selection.start, due.previous().unwrap().start);

        // Exactly on a boundary, the next run is the following boundary.
        assert_eq!(
            s.next_run(current.end).unwrap(),
            fixtures::at_ms(fixtures::BASE_MS + 1_200_000)
        );
    }

    #[tokio::test]
    async fn test_status_tracks_runs() {
        let now = fixtures::at_ms(fixtures::BASE_MS + 600_000);
        let clock = Arc::new(ManualClock::new(now));
        let s = scheduler(clock.clone());
        assert_eq!(s.status().last_run, None);

        let outcome = s.trigger_manual().await.unwrap();
        assert_eq!(outcome, PassOutcome::Completed(Default::default()));

        let status = s.status();
        assert_eq!(status.last_run, Some(now));
        let window = status.last_window.unwrap();
        assert_eq!(window.end, fixtures::at_ms(fixtures::BASE_MS + 600_000));
        // One catch-up window by default.
        assert_eq!(window.start, fixtures::at_ms(fixtures::BASE_MS - 600_000));
        assert_eq!(status.batches_recorded, 0);
        assert_eq!(status.next_run, Some(fixtures::at_ms(fixtures::BASE_MS + 1_200_000)));
    }
}
