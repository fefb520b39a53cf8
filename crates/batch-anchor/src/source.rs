//! Inbound message sources.
//!
//! A [`MessageSource`] hands out [`Delivery`] values and takes
//! acknowledgements for them. Entries are acknowledged only once the batch
//! that holds them is durable, so a source that redelivers unacknowledged
//! entries gives at-least-once ingestion.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use batch_anchor_core::StreamEntry;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, Split};
use tokio::sync::Notify;

use crate::error::Result;

/// Source-assigned identifier of one delivery.
pub type DeliveryId = u64;

/// One entry handed out by a source.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub id: DeliveryId,
    /// The decoded entry, or why it could not be decoded.
    pub entry: std::result::Result<StreamEntry, String>,
}

#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Up to `max` deliveries. Waits at most `wait` for the first one and
    /// returns an empty vec if none arrived.
    async fn next_batch(&self, max: usize, wait: Duration) -> Result<Vec<Delivery>>;

    /// Acknowledge a delivery. It will not be handed out again.
    async fn ack(&self, id: DeliveryId) -> Result<()>;

    /// True once the source will never produce another delivery.
    fn is_closed(&self) -> bool {
        false
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// In-memory source
// ─────────────────────────────────────────────────────────────────────────────

/// Queue-backed source with explicit redelivery.
#[derive(Default)]
pub struct MemorySource {
    inner: Mutex<MemoryInner>,
    ready: Notify,
}

#[derive(Default)]
struct MemoryInner {
    next_id: DeliveryId,
    queue: VecDeque<Delivery>,
    in_flight: BTreeMap<DeliveryId, Delivery>,
    acked: Vec<DeliveryId>,
    closed: bool,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Enqueue an entry and return its delivery id.
    pub fn push(&self, entry: StreamEntry) -> DeliveryId {
        self.push_delivery(Ok(entry))
    }

    /// Enqueue a payload that failed to decode.
    pub fn push_undecodable(&self, reason: impl Into<String>) -> DeliveryId {
        self.push_delivery(Err(reason.into()))
    }

    fn push_delivery(&self, entry: std::result::Result<StreamEntry, String>) -> DeliveryId {
        let id = {
            let mut inner = self.lock();
            inner.next_id += 1;
            let id = inner.next_id;
            inner.queue.push_back(Delivery { id, entry });
            id
        };
        self.ready.notify_one();
        id
    }

    /// No more entries will be pushed.
    pub fn close(&self) {
        self.lock().closed = true;
        self.ready.notify_one();
    }

    /// Acknowledged delivery ids, in acknowledgement order.
    pub fn acked(&self) -> Vec<DeliveryId> {
        self.lock().acked.clone()
    }

    /// Deliveries handed out but not yet acknowledged.
    pub fn in_flight(&self) -> usize {
        self.lock().in_flight.len()
    }

    /// Deliveries waiting to be handed out.
    pub fn queued(&self) -> usize {
        self.lock().queue.len()
    }

    /// Put every unacknowledged delivery back at the head of the queue,
    /// as a broker does when a consumer dies.
    pub fn redeliver_unacked(&self) -> usize {
        let count = {
            let mut inner = self.lock();
            let in_flight = std::mem::take(&mut inner.in_flight);
            let count = in_flight.len();
            for (_, delivery) in in_flight.into_iter().rev() {
                inner.queue.push_front(delivery);
            }
            count
        };
        if count > 0 {
            self.ready.notify_one();
        }
        count
    }
}

#[async_trait]
impl MessageSource for MemorySource {
    async fn next_batch(&self, max: usize, wait: Duration) -> Result<Vec<Delivery>> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            {
                let mut inner = self.lock();
                if !inner.queue.is_empty() {
                    let take = max.min(inner.queue.len());
                    let batch: Vec<Delivery> = inner.queue.drain(..take).collect();
                    for delivery in &batch {
                        inner.in_flight.insert(delivery.id, delivery.clone());
                    }
                    return Ok(batch);
                }
                if inner.closed || max == 0 {
                    return Ok(Vec::new());
                }
            }
            if tokio::time::timeout_at(deadline, self.ready.notified())
                .await
                .is_err()
            {
                return Ok(Vec::new());
            }
        }
    }

    async fn ack(&self, id: DeliveryId) -> Result<()> {
        let mut inner = self.lock();
        if inner.in_flight.remove(&id).is_some() {
            inner.acked.push(id);
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        let inner = self.lock();
        inner.closed && inner.queue.is_empty()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// JSON lines source
// ─────────────────────────────────────────────────────────────────────────────

/// Newline-delimited JSON stream entries from a reader (stdin in the binary).
///
/// Lines are decoded from raw bytes: a line that is not valid UTF-8 or not
/// valid JSON becomes an undecodable delivery and reading carries on.
/// A plain stream cannot redeliver, so acknowledgements are only counted.
pub struct JsonLinesSource<R> {
    lines: tokio::sync::Mutex<Split<R>>,
    next_id: AtomicU64,
    acked: AtomicU64,
    closed: AtomicBool,
}

impl<R: AsyncBufRead + Unpin + Send> JsonLinesSource<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: tokio::sync::Mutex::new(reader.split(b'\n')),
            next_id: AtomicU64::new(0),
            acked: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Number of acknowledged deliveries.
    pub fn acked(&self) -> u64 {
        self.acked.load(Ordering::Relaxed)
    }

    fn decode(&self, line: &[u8]) -> Delivery {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        Delivery {
            id,
            entry: serde_json::from_slice(line).map_err(|e| e.to_string()),
        }
    }
}

#[async_trait]
impl<R: AsyncBufRead + Unpin + Send> MessageSource for JsonLinesSource<R> {
    async fn next_batch(&self, max: usize, wait: Duration) -> Result<Vec<Delivery>> {
        let mut lines = self.lines.lock().await;
        let mut batch = Vec::new();
        let mut budget = wait;

        while batch.len() < max && !self.closed.load(Ordering::Acquire) {
            // `next_segment` is cancel safe: a timed-out read loses nothing.
            let line = match tokio::time::timeout(budget, lines.next_segment()).await {
                Err(_) => break,
                Ok(line) => line?,
            };
            match line {
                Some(line) if line.iter().all(u8::is_ascii_whitespace) => {}
                Some(mut line) => {
                    if line.last() == Some(&b'\r') {
                        line.pop();
                    }
                    batch.push(self.decode(&line));
                    // Only the first line is waited for.
                    budget = Duration::ZERO;
                }
                None => self.closed.store(true, Ordering::Release),
            }
        }
        Ok(batch)
    }

    async fn ack(&self, _id: DeliveryId) -> Result<()> {
        self.acked.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use batch_anchor_testkit::fixtures;

    #[tokio::test]
    async fn test_memory_source_redelivers_unacked() {
        let source = MemorySource::new();
        let a = source.push(fixtures::entry(0));
        let b = source.push(fixtures::entry(1));

        let got = source.next_batch(10, Duration::ZERO).await.unwrap();
        assert_eq!(got.iter().map(|d| d.id).collect::<Vec<_>>(), vec![a, b]);

        source.ack(a).await.unwrap();
        assert_eq!(source.redeliver_unacked(), 1);

        let again = source.next_batch(10, Duration::ZERO).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].id, b);
        assert_eq!(source.acked(), vec![a]);
    }

    #[tokio::test]
    async fn test_memory_source_respects_max_and_wait() {
        let source = MemorySource::new();
        for i in 0..5 {
            source.push(fixtures::entry(i));
        }
        assert_eq!(source.next_batch(2, Duration::ZERO).await.unwrap().len(), 2);
        assert_eq!(source.queued(), 3);

        let empty = MemorySource::new();
        let got = empty
            .next_batch(10, Duration::from_millis(10))
            .await
            .unwrap();
        assert!(got.is_empty());
    }

    #[tokio::test]
    async fn test_json_lines_decodes_and_closes() {
        let entry = serde_json::to_string(&fixtures::entry(3)).unwrap();
        let input = format!("{entry}\n\nnot json\n{entry}\n");
        let source = JsonLinesSource::new(input.as_bytes());

        let got = source.next_batch(10, Duration::from_secs(1)).await.unwrap();
        assert_eq!(got.len(), 3);
        let first = got[0].entry.as_ref().unwrap();
        assert_eq!(first.message_id.as_deref(), Some("msg-00003"));
        assert_eq!(first.device_id.as_deref(), Some("dev-3"));
        assert!(got[1].entry.is_err());
        assert_eq!(got[2].id, 3);
        assert!(source.is_closed());
    }

    #[tokio::test]
    async fn test_json_lines_survives_invalid_utf8() {
        let entry = serde_json::to_string(&fixtures::entry(1)).unwrap();
        let mut input = Vec::new();
        input.extend_from_slice(entry.as_bytes());
        input.extend_from_slice(b"\r\n\xff\xfe{\"messageId\": \"\xc3\"}\n");
        input.extend_from_slice(entry.as_bytes());
        input.push(b'\n');
        let source = JsonLinesSource::new(std::io::Cursor::new(input));

        let got = source.next_batch(10, Duration::from_secs(1)).await.unwrap();
        assert_eq!(got.len(), 3);
        assert!(got[0].entry.is_ok());
        assert!(got[1].entry.is_err());
        assert_eq!(got[2].entry, got[0].entry);
        assert!(source.is_closed());
    }
}
