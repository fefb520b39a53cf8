//! Batch accumulator: groups validated messages into batches.
//!
//! One accumulator owns the open batch. A batch closes when it reaches the
//! size threshold or has been open for the configured timeout. Closing
//! seals it (hash and aggregates), persists it, and only then acknowledges
//! its deliveries to the source.
//!
//! A sealed batch that fails to persist is queued and retried unchanged, in
//! order, before the accumulator pulls more entries. Its deliveries stay
//! unacknowledged until the write succeeds.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use batch_anchor_core::{Batch, BatchId, SealedBatch};
use batch_anchor_store::{BatchStore, SaveResult};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;

use crate::clock::Clock;
use crate::config::BatchingConfig;
use crate::error::Result;
use crate::service::sleep_or_shutdown;
use crate::source::{Delivery, DeliveryId, MessageSource};

/// Ingestion counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestStats {
    pub received: u64,
    /// Malformed entries, acknowledged and discarded.
    pub dropped: u64,
    pub batches_committed: u64,
    pub messages_committed: u64,
    pub commit_failures: u64,
}

struct OpenBatch {
    batch: Batch,
    opened_at: DateTime<Utc>,
    deliveries: Vec<DeliveryId>,
}

struct PendingCommit {
    sealed: SealedBatch,
    deliveries: Vec<DeliveryId>,
}

pub struct Accumulator {
    store: Arc<dyn BatchStore>,
    source: Arc<dyn MessageSource>,
    clock: Arc<dyn Clock>,
    config: BatchingConfig,
    open: Option<OpenBatch>,
    pending: VecDeque<PendingCommit>,
    stats: IngestStats,
}

impl Accumulator {
    pub fn new(
        store: Arc<dyn BatchStore>,
        source: Arc<dyn MessageSource>,
        clock: Arc<dyn Clock>,
        config: BatchingConfig,
    ) -> Self {
        Self {
            store,
            source,
            clock,
            config,
            open: None,
            pending: VecDeque::new(),
            stats: IngestStats::default(),
        }
    }

    pub fn stats(&self) -> &IngestStats {
        &self.stats
    }

    /// Messages in the open batch.
    pub fn open_count(&self) -> usize {
        self.open.as_ref().map_or(0, |o| o.batch.message_count())
    }

    /// Sealed batches waiting to be persisted.
    pub fn pending_commits(&self) -> usize {
        self.pending.len()
    }

    /// When the open batch times out.
    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        let open = self.open.as_ref()?;
        let timeout = chrono::Duration::from_std(self.config.timeout).ok()?;
        open.opened_at.checked_add_signed(timeout)
    }

    /// Room left in the open batch before the size trigger.
    pub fn room(&self) -> usize {
        self.config.size_threshold.saturating_sub(self.open_count())
    }

    /// Validate and append one delivery.
    ///
    /// Malformed entries are acknowledged and dropped. Returns the id of the
    /// batch this message closed, if it hit the size threshold.
    pub async fn add(&mut self, delivery: Delivery) -> Result<Option<BatchId>> {
        self.stats.received += 1;

        let message = match delivery.entry {
            Ok(entry) => entry.into_message().map_err(|e| e.to_string()),
            Err(reason) => Err(reason),
        };
        let message = match message {
            Ok(message) => message,
            Err(reason) => {
                self.stats.dropped += 1;
                tracing::warn!(delivery = delivery.id, error = %reason, "dropping malformed entry");
                self.ack(delivery.id).await;
                return Ok(None);
            }
        };

        let now = self.clock.now();
        let open = self.open.get_or_insert_with(|| OpenBatch {
            batch: Batch::new(),
            opened_at: now,
            deliveries: Vec::new(),
        });
        open.batch.push(message);
        open.deliveries.push(delivery.id);

        if open.batch.message_count() >= self.config.size_threshold {
            return self.close().await;
        }
        Ok(None)
    }

    /// Close the open batch if its deadline has passed.
    pub async fn poll_timeout(&mut self, now: DateTime<Utc>) -> Result<Option<BatchId>> {
        match self.deadline() {
            Some(deadline) if now >= deadline => self.close().await,
            _ => Ok(None),
        }
    }

    /// Seal and persist the open batch, if any.
    ///
    /// On a store error the sealed batch stays queued and the error is
    /// returned; [`flush_pending`](Self::flush_pending) retries it.
    pub async fn close(&mut self) -> Result<Option<BatchId>> {
        let Some(open) = self.open.take() else {
            self.flush_pending().await?;
            return Ok(None);
        };

        let sealed = open.batch.seal()?;
        let id = sealed.id;
        tracing::info!(
            batch_id = %id,
            count = sealed.message_count(),
            hash = %sealed.hash,
            "batch closed"
        );
        self.pending.push_back(PendingCommit {
            sealed,
            deliveries: open.deliveries,
        });
        self.flush_pending().await?;
        Ok(Some(id))
    }

    /// Persist queued batches in order, acknowledging each one's deliveries.
    pub async fn flush_pending(&mut self) -> Result<usize> {
        let mut committed = 0;
        while let Some(front) = self.pending.front() {
            match self.store.save_batch(&front.sealed).await {
                Ok(result) => {
                    if result == SaveResult::AlreadyExists {
                        tracing::debug!(batch_id = %front.sealed.id, "batch already stored");
                    }
                    let Some(done) = self.pending.pop_front() else {
                        break;
                    };
                    for id in &done.deliveries {
                        self.ack(*id).await;
                    }
                    self.stats.batches_committed += 1;
                    self.stats.messages_committed += done.sealed.message_count() as u64;
                    committed += 1;
                }
                Err(e) => {
                    self.stats.commit_failures += 1;
                    tracing::warn!(
                        batch_id = %front.sealed.id,
                        error = %e,
                        "batch commit failed, will retry"
                    );
                    return Err(e.into());
                }
            }
        }
        Ok(committed)
    }

    async fn ack(&self, id: DeliveryId) {
        if let Err(e) = self.source.ack(id).await {
            tracing::warn!(delivery = id, error = %e, "acknowledgement failed");
        }
    }

    fn wait_budget(&self, now: DateTime<Utc>) -> Duration {
        let until_deadline = self
            .deadline()
            .and_then(|d| (d - now).to_std().ok())
            .unwrap_or(self.config.poll_wait);
        self.config.poll_wait.min(until_deadline)
    }

    /// Pull from the source until it closes or shutdown is signalled, then
    /// commit whatever is open. Source read errors are logged and retried
    /// after the commit backoff.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<IngestStats> {
        tracing::info!(
            size_threshold = self.config.size_threshold,
            timeout_ms = self.config.timeout.as_millis() as u64,
            "accumulator started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            if !self.pending.is_empty() && self.flush_pending().await.is_err() {
                if sleep_or_shutdown(&mut shutdown, self.config.commit_backoff).await {
                    break;
                }
                continue;
            }

            let now = self.clock.now();
            if self.poll_timeout(now).await.is_err() {
                continue;
            }

            let deliveries = match self
                .source
                .next_batch(self.room(), self.wait_budget(now))
                .await
            {
                Ok(deliveries) => deliveries,
                Err(e) => {
                    tracing::warn!(error = %e, "message source read failed, backing off");
                    if sleep_or_shutdown(&mut shutdown, self.config.commit_backoff).await {
                        break;
                    }
                    continue;
                }
            };
            let pulled = deliveries.len();
            for delivery in deliveries {
                // A failed commit stays queued and is retried at the top.
                let _ = self.add(delivery).await;
            }

            if pulled == 0 && self.source.is_closed() {
                tracing::info!("message source closed");
                break;
            }
        }

        self.close().await?;
        tracing::info!(
            batches = self.stats.batches_committed,
            messages = self.stats.messages_committed,
            dropped = self.stats.dropped,
            "accumulator stopped"
        );
        Ok(self.stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::AnchorError;
    use crate::source::{JsonLinesSource, MemorySource};
    use async_trait::async_trait;
    use batch_anchor_core::{Message, StoredBatch, TimeWindow};
    use batch_anchor_store::{
        AnchorStats, AnchorUpdate, Claim, ClaimScope, MemoryStore, StoreError,
    };
    use batch_anchor_testkit::fixtures;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// MemoryStore whose writes can be made to fail.
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryStore,
        failing: AtomicBool,
    }

    #[async_trait]
    impl BatchStore for FlakyStore {
        async fn save_batch(&self, batch: &SealedBatch) -> batch_anchor_store::Result<SaveResult> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(StoreError::InvalidData("disk full".into()));
            }
            self.inner.save_batch(batch).await
        }
        async fn get_batch(&self, id: &BatchId) -> batch_anchor_store::Result<Option<StoredBatch>> {
            self.inner.get_batch(id).await
        }
        async fn list_batches(
            &self,
            limit: usize,
            offset: usize,
        ) -> batch_anchor_store::Result<Vec<StoredBatch>> {
            self.inner.list_batches(limit, offset).await
        }
        async fn get_message(&self, id: &str) -> batch_anchor_store::Result<Option<Message>> {
            self.inner.get_message(id).await
        }
        async fn list_messages(&self, id: &BatchId) -> batch_anchor_store::Result<Vec<Message>> {
            self.inner.list_messages(id).await
        }
        async fn update_anchor_status(
            &self,
            id: &BatchId,
            update: AnchorUpdate,
        ) -> batch_anchor_store::Result<()> {
            self.inner.update_anchor_status(id, update).await
        }
        async fn find_due(
            &self,
            window: &TimeWindow,
            max_retries: u32,
        ) -> batch_anchor_store::Result<Vec<StoredBatch>> {
            self.inner.find_due(window, max_retries).await
        }
        async fn claim(
            &self,
            scope: ClaimScope,
            now: DateTime<Utc>,
            lease: Duration,
            max_retries: u32,
        ) -> batch_anchor_store::Result<Vec<Claim>> {
            self.inner.claim(scope, now, lease, max_retries).await
        }
        async fn complete_claim(
            &self,
            claim: &Claim,
            update: AnchorUpdate,
        ) -> batch_anchor_store::Result<()> {
            self.inner.complete_claim(claim, update).await
        }
        async fn renew_claim(
            &self,
            claim: &Claim,
            now: DateTime<Utc>,
            lease: Duration,
        ) -> batch_anchor_store::Result<Claim> {
            self.inner.renew_claim(claim, now, lease).await
        }
        async fn release_claim(&self, claim: &Claim) -> batch_anchor_store::Result<()> {
            self.inner.release_claim(claim).await
        }
        async fn statistics(
            &self,
            now: DateTime<Utc>,
            max_retries: u32,
        ) -> batch_anchor_store::Result<AnchorStats> {
            self.inner.statistics(now, max_retries).await
        }
    }

    struct Harness {
        store: Arc<FlakyStore>,
        source: Arc<MemorySource>,
        clock: Arc<ManualClock>,
        acc: Accumulator,
    }

    fn harness(size_threshold: usize, timeout: Duration) -> Harness {
        let store = Arc::new(FlakyStore::default());
        let source = Arc::new(MemorySource::new());
        let clock = Arc::new(ManualClock::new(fixtures::at_ms(fixtures::BASE_MS)));
        let acc = Accumulator::new(
            store.clone(),
            source.clone(),
            clock.clone(),
            BatchingConfig {
                size_threshold,
                timeout,
                poll_wait: Duration::from_millis(10),
                commit_backoff: Duration::from_millis(10),
            },
        );
        Harness {
            store,
            source,
            clock,
            acc,
        }
    }

    async fn feed(h: &mut Harness, n: usize) -> Vec<BatchId> {
        for i in 0..n {
            h.source.push(fixtures::entry(i));
        }
        let mut closed = Vec::new();
        for d in h.source.next_batch(n, Duration::ZERO).await.unwrap() {
            if let Some(id) = h.acc.add(d).await.unwrap() {
                closed.push(id);
            }
        }
        closed
    }

    #[tokio::test]
    async fn test_size_trigger_closes_and_acks() {
        let mut h = harness(5, Duration::from_secs(300));
        let closed = feed(&mut h, 7).await;

        assert_eq!(closed.len(), 1);
        assert_eq!(h.acc.open_count(), 2);
        assert_eq!(h.source.acked(), vec![1, 2, 3, 4, 5]);

        let stored = h.store.get_batch(&closed[0]).await.unwrap().unwrap();
        assert_eq!(stored.message_count, 5);
        let messages = h.store.list_messages(&closed[0]).await.unwrap();
        assert_eq!(messages[0].id, "msg-00000");
        assert_eq!(messages[4].id, "msg-00004");
    }

    #[tokio::test]
    async fn test_timeout_trigger_uses_open_time() {
        let mut h = harness(100, Duration::from_secs(60));
        feed(&mut h, 3).await;

        let opened = h.clock.now();
        assert_eq!(h.acc.deadline(), Some(opened + chrono::Duration::seconds(60)));

        h.clock.advance(Duration::from_secs(59));
        assert_eq!(h.acc.poll_timeout(h.clock.now()).await.unwrap(), None);

        h.clock.advance(Duration::from_secs(1));
        let id = h.acc.poll_timeout(h.clock.now()).await.unwrap().unwrap();
        assert_eq!(h.store.get_batch(&id).await.unwrap().unwrap().message_count, 3);
        assert_eq!(h.acc.deadline(), None);
        assert_eq!(h.source.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_malformed_entry_acked_immediately() {
        let mut h = harness(10, Duration::from_secs(60));
        let bad = h.source.push(fixtures::malformed_entry());
        let undecodable = h.source.push_undecodable("expected value at line 1");
        let good = h.source.push(fixtures::entry(0));

        for d in h.source.next_batch(10, Duration::ZERO).await.unwrap() {
            h.acc.add(d).await.unwrap();
        }
        assert_eq!(h.source.acked(), vec![bad, undecodable]);
        assert_eq!(h.acc.stats().dropped, 2);
        assert_eq!(h.acc.open_count(), 1);

        h.acc.close().await.unwrap();
        assert_eq!(h.source.acked(), vec![bad, undecodable, good]);
    }

    #[tokio::test]
    async fn test_failed_commit_retries_same_batch() {
        let mut h = harness(3, Duration::from_secs(60));
        h.store.failing.store(true, Ordering::SeqCst);

        for i in 0..3 {
            h.source.push(fixtures::entry(i));
        }
        let deliveries = h.source.next_batch(3, Duration::ZERO).await.unwrap();
        let mut result = Ok(None);
        for d in deliveries {
            result = h.acc.add(d).await;
        }
        assert!(result.is_err());
        assert_eq!(h.acc.pending_commits(), 1);
        assert!(h.source.acked().is_empty());
        assert_eq!(h.source.in_flight(), 3);

        // Still failing: nothing changes.
        assert!(h.acc.flush_pending().await.is_err());
        assert_eq!(h.acc.pending_commits(), 1);

        h.store.failing.store(false, Ordering::SeqCst);
        assert_eq!(h.acc.flush_pending().await.unwrap(), 1);
        assert_eq!(h.source.acked(), vec![1, 2, 3]);

        let batches = h.store.list_batches(10, 0).await.unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].message_count, 3);
    }

    #[tokio::test]
    async fn test_run_drains_closed_source() {
        let h = harness(10, Duration::from_secs(300));
        for i in 0..25 {
            h.source.push(fixtures::entry(i));
        }
        h.source.close();

        let (_tx, rx) = watch::channel(false);
        let stats = h.acc.run(rx).await.unwrap();
        assert_eq!(stats.batches_committed, 3);
        assert_eq!(stats.messages_committed, 25);
        assert_eq!(h.source.acked().len(), 25);

        let counts: Vec<usize> = h
            .store
            .list_batches(10, 0)
            .await
            .unwrap()
            .iter()
            .map(|b| b.message_count)
            .collect();
        assert_eq!(counts.iter().sum::<usize>(), 25);
        assert!(counts.contains(&5));
    }

    fn config(size_threshold: usize) -> BatchingConfig {
        BatchingConfig {
            size_threshold,
            timeout: Duration::from_secs(300),
            poll_wait: Duration::from_millis(10),
            commit_backoff: Duration::from_millis(10),
        }
    }

    #[tokio::test]
    async fn test_run_continues_past_invalid_utf8() {
        let entry = |i| serde_json::to_string(&fixtures::entry(i)).unwrap();
        let mut input = Vec::new();
        input.extend_from_slice(entry(0).as_bytes());
        input.extend_from_slice(b"\n\xff\xfe\xfd\n");
        input.extend_from_slice(entry(1).as_bytes());
        input.push(b'\n');

        let store = Arc::new(MemoryStore::new());
        let acc = Accumulator::new(
            store.clone(),
            Arc::new(JsonLinesSource::new(std::io::Cursor::new(input))),
            Arc::new(ManualClock::new(fixtures::at_ms(fixtures::BASE_MS))),
            config(1),
        );

        let (_tx, rx) = watch::channel(false);
        let stats = acc.run(rx).await.unwrap();
        assert_eq!(stats.received, 3);
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.batches_committed, 2);
        assert_eq!(store.list_batches(10, 0).await.unwrap().len(), 2);
    }

    /// MemorySource whose first reads fail.
    struct BrokenSource {
        inner: MemorySource,
        failures: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl MessageSource for BrokenSource {
        async fn next_batch(&self, max: usize, wait: Duration) -> Result<Vec<Delivery>> {
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(AnchorError::Source("connection reset".into()));
            }
            self.inner.next_batch(max, wait).await
        }
        async fn ack(&self, id: DeliveryId) -> Result<()> {
            self.inner.ack(id).await
        }
        fn is_closed(&self) -> bool {
            self.inner.is_closed()
        }
    }

    #[tokio::test]
    async fn test_run_backs_off_on_source_errors() {
        let source = Arc::new(BrokenSource {
            inner: MemorySource::new(),
            failures: std::sync::atomic::AtomicUsize::new(2),
        });
        for i in 0..4 {
            source.inner.push(fixtures::entry(i));
        }
        source.inner.close();

        let store = Arc::new(MemoryStore::new());
        let acc = Accumulator::new(
            store.clone(),
            source.clone(),
            Arc::new(ManualClock::new(fixtures::at_ms(fixtures::BASE_MS))),
            config(2),
        );

        let (_tx, rx) = watch::channel(false);
        let stats = acc.run(rx).await.unwrap();
        assert_eq!(stats.batches_committed, 2);
        assert_eq!(stats.messages_committed, 4);
        assert_eq!(source.inner.acked().len(), 4);
    }
}
