//! In-memory implementation of the BatchStore trait.
//!
//! This is primarily for testing. It has the same semantics as SQLite
//! but keeps everything in memory with no persistence.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;
use batch_anchor_core::{
    AnchorRecord, AnchorStatus, BatchId, Message, SealedBatch, StoredBatch, TimeWindow,
};
use chrono::{DateTime, Utc};

use crate::error::{Result, StoreError};
use crate::traits::{
    eligible, lease_expiry, AnchorStats, AnchorUpdate, BatchStore, Claim, ClaimScope, ClaimToken,
    SaveResult,
};

/// In-memory store implementation.
///
/// All data is lost when the store is dropped. Thread-safe via RwLock.
pub struct MemoryStore {
    inner: RwLock<MemoryStoreInner>,
}

#[derive(Default)]
struct MemoryStoreInner {
    batches: HashMap<BatchId, Entry>,
    /// Insertion order, for first-wins message lookup.
    order: Vec<BatchId>,
}

struct Entry {
    batch: StoredBatch,
    messages: Vec<Message>,
    claim: Option<(ClaimToken, DateTime<Utc>)>,
}

impl Entry {
    fn claimable(&self, now: DateTime<Utc>) -> bool {
        self.claim.map_or(true, |(_, until)| until <= now)
    }
}

impl MemoryStore {
    /// Create a new empty in-memory store.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(MemoryStoreInner::default()),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, MemoryStoreInner>> {
        self.inner
            .read()
            .map_err(|e| StoreError::Poisoned(e.to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, MemoryStoreInner>> {
        self.inner
            .write()
            .map_err(|e| StoreError::Poisoned(e.to_string()))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn apply(record: &mut AnchorRecord, update: AnchorUpdate) {
    match update {
        AnchorUpdate::Confirmed { signature, at } => {
            record.status = AnchorStatus::Confirmed;
            record.signature = Some(signature);
            record.last_error = None;
            record.confirmed_at = Some(at);
        }
        AnchorUpdate::Retry { error } => {
            record.status = AnchorStatus::Pending;
            record.retry_count += 1;
            record.last_error = Some(error);
        }
        AnchorUpdate::Failed { error } => {
            record.status = AnchorStatus::Failed;
            record.retry_count += 1;
            record.last_error = Some(error);
        }
    }
}

fn oldest_first(batches: &mut [StoredBatch]) {
    batches.sort_by(|a, b| a.start.cmp(&b.start).then(a.id.cmp(&b.id)));
}

#[async_trait]
impl BatchStore for MemoryStore {
    async fn save_batch(&self, batch: &SealedBatch) -> Result<SaveResult> {
        let mut inner = self.write()?;

        if let Some(existing) = inner.batches.get(&batch.id) {
            return if existing.batch.hash == batch.hash {
                Ok(SaveResult::AlreadyExists)
            } else {
                Err(StoreError::Conflict { id: batch.id })
            };
        }

        let stored = StoredBatch {
            id: batch.id,
            hash: batch.hash,
            message_count: batch.message_count(),
            start: batch.start,
            end: batch.end,
            aggregates: batch.aggregates.clone(),
            anchor: AnchorRecord::new(),
        };
        inner.batches.insert(
            batch.id,
            Entry {
                batch: stored,
                messages: batch.messages.clone(),
                claim: None,
            },
        );
        inner.order.push(batch.id);
        Ok(SaveResult::Inserted)
    }

    async fn get_batch(&self, id: &BatchId) -> Result<Option<StoredBatch>> {
        let inner = self.read()?;
        Ok(inner.batches.get(id).map(|e| e.batch.clone()))
    }

    async fn list_batches(&self, limit: usize, offset: usize) -> Result<Vec<StoredBatch>> {
        let inner = self.read()?;
        let mut all: Vec<StoredBatch> = inner.batches.values().map(|e| e.batch.clone()).collect();
        all.sort_by(|a, b| b.end.cmp(&a.end).then(a.id.cmp(&b.id)));
        Ok(all.into_iter().skip(offset).take(limit).collect())
    }

    async fn get_message(&self, id: &str) -> Result<Option<Message>> {
        let inner = self.read()?;
        let found = inner
            .order
            .iter()
            .filter_map(|bid| inner.batches.get(bid))
            .flat_map(|e| e.messages.iter())
            .find(|m| m.id == id)
            .cloned();
        Ok(found)
    }

    async fn list_messages(&self, batch_id: &BatchId) -> Result<Vec<Message>> {
        let inner = self.read()?;
        Ok(inner
            .batches
            .get(batch_id)
            .map(|e| e.messages.clone())
            .unwrap_or_default())
    }

    async fn update_anchor_status(&self, id: &BatchId, update: AnchorUpdate) -> Result<()> {
        let mut inner = self.write()?;
        let entry = inner.batches.get_mut(id).ok_or(StoreError::NotFound(*id))?;

        let status = entry.batch.anchor.status;
        if status.is_terminal() {
            return Err(StoreError::TerminalStatus { id: *id, status });
        }
        apply(&mut entry.batch.anchor, update);
        entry.claim = None;
        Ok(())
    }

    async fn find_due(&self, window: &TimeWindow, max_retries: u32) -> Result<Vec<StoredBatch>> {
        let inner = self.read()?;
        let scope = ClaimScope::Window(*window);
        let mut due: Vec<StoredBatch> = inner
            .batches
            .values()
            .filter(|e| eligible(&e.batch, &scope, max_retries))
            .map(|e| e.batch.clone())
            .collect();
        oldest_first(&mut due);
        Ok(due)
    }

    async fn claim(
        &self,
        scope: ClaimScope,
        now: DateTime<Utc>,
        lease: Duration,
        max_retries: u32,
    ) -> Result<Vec<Claim>> {
        let mut inner = self.write()?;
        let expires_at = lease_expiry(now, lease);

        let mut candidates: Vec<StoredBatch> = inner
            .batches
            .values()
            .filter(|e| e.claimable(now) && eligible(&e.batch, &scope, max_retries))
            .map(|e| e.batch.clone())
            .collect();
        oldest_first(&mut candidates);
        if let ClaimScope::Pending { limit } = scope {
            candidates.truncate(limit);
        }

        let mut claims = Vec::with_capacity(candidates.len());
        for batch in candidates {
            let token = ClaimToken::new();
            if let Some(entry) = inner.batches.get_mut(&batch.id) {
                entry.claim = Some((token, expires_at));
            }
            claims.push(Claim {
                token,
                batch,
                expires_at,
            });
        }
        Ok(claims)
    }

    async fn complete_claim(&self, claim: &Claim, update: AnchorUpdate) -> Result<()> {
        let mut inner = self.write()?;
        let id = claim.batch.id;
        let entry = inner.batches.get_mut(&id).ok_or(StoreError::NotFound(id))?;

        if entry.claim.map(|(token, _)| token) != Some(claim.token) {
            return Err(StoreError::ClaimLost(id));
        }
        let status = entry.batch.anchor.status;
        if status.is_terminal() {
            return Err(StoreError::TerminalStatus { id, status });
        }
        apply(&mut entry.batch.anchor, update);
        entry.claim = None;
        Ok(())
    }

    async fn renew_claim(
        &self,
        claim: &Claim,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Claim> {
        let mut inner = self.write()?;
        let id = claim.batch.id;
        let entry = inner.batches.get_mut(&id).ok_or(StoreError::NotFound(id))?;

        if entry.claim.map(|(token, _)| token) != Some(claim.token) {
            return Err(StoreError::ClaimLost(id));
        }
        let status = entry.batch.anchor.status;
        if status.is_terminal() {
            return Err(StoreError::TerminalStatus { id, status });
        }
        let expires_at = lease_expiry(now, lease);
        entry.claim = Some((claim.token, expires_at));
        Ok(Claim {
            token: claim.token,
            batch: entry.batch.clone(),
            expires_at,
        })
    }

    async fn release_claim(&self, claim: &Claim) -> Result<()> {
        let mut inner = self.write()?;
        if let Some(entry) = inner.batches.get_mut(&claim.batch.id) {
            if entry.claim.map(|(token, _)| token) == Some(claim.token) {
                entry.claim = None;
            }
        }
        Ok(())
    }

    async fn statistics(&self, now: DateTime<Utc>, max_retries: u32) -> Result<AnchorStats> {
        let inner = self.read()?;
        let mut stats = AnchorStats::default();
        for entry in inner.batches.values() {
            let anchor = &entry.batch.anchor;
            match anchor.status {
                AnchorStatus::None => stats.none += 1,
                AnchorStatus::Pending => {
                    stats.pending += 1;
                    if anchor.retry_count < max_retries {
                        stats.retry_queue += 1;
                    }
                }
                AnchorStatus::Confirmed => stats.confirmed += 1,
                AnchorStatus::Failed => stats.failed += 1,
            }
            if entry.claim.map_or(false, |(_, until)| until > now) {
                stats.claimed += 1;
            }
        }
        Ok(stats)
    }
}
