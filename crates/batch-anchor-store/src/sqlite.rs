//! SQLite implementation of the BatchStore trait.
//!
//! This is the primary storage backend. It uses rusqlite with bundled
//! SQLite, wrapped in async via tokio::spawn_blocking.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use batch_anchor_core::{
    AnchorRecord, AnchorStatus, BatchAggregates, BatchId, ContentHash, CoreError, GeoPoint,
    LocationSummary, Message, SealedBatch, StoredBatch, TimeWindow,
};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::{Result, StoreError};
use crate::migration;
use crate::traits::{
    lease_expiry, AnchorStats, AnchorUpdate, BatchStore, Claim, ClaimScope, ClaimToken, SaveResult,
};

const BATCH_COLUMNS: &str = "id, hash, message_count, start_ts, end_ts, anchor_status, \
     anchor_signature, retry_count, last_error, confirmed_at, device_ids, asset_ids, \
     asset_types, site_ids, location_summary";

const MESSAGE_COLUMNS: &str = "id, device_id, topic, message_hash, raw_payload, received_at, \
     tenant_id, site_id, asset_id, asset_type, location";

/// SQLite-based store implementation.
///
/// Thread-safe via internal Mutex. All operations use spawn_blocking
/// to avoid blocking the async runtime.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open a SQLite database at the given path.
    ///
    /// Creates the file and runs migrations if needed.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut conn = Connection::open(path)?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory SQLite database.
    pub fn open_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn blocking<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|e| StoreError::Poisoned(e.to_string()))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }
}

fn conversion<E>(idx: usize, e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

fn millis_to_utc(idx: usize, ms: i64) -> rusqlite::Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| conversion(idx, CoreError::TimestampOutOfRange(ms)))
}

fn json_list(row: &Row<'_>, idx: usize) -> rusqlite::Result<Vec<String>> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text).map_err(|e| conversion(idx, e))
}

// Helper to convert a row to StoredBatch (columns in BATCH_COLUMNS order)
fn row_to_batch(row: &Row<'_>) -> rusqlite::Result<StoredBatch> {
    let id: String = row.get(0)?;
    let hash: String = row.get(1)?;
    let status: String = row.get(5)?;
    let confirmed_at: Option<i64> = row.get(9)?;
    let location: Option<String> = row.get(14)?;

    let location: Option<LocationSummary> = location
        .map(|s| serde_json::from_str(&s))
        .transpose()
        .map_err(|e| conversion(14, e))?;

    Ok(StoredBatch {
        id: id.parse().map_err(|e| conversion(0, e))?,
        hash: ContentHash::from_hex(&hash).map_err(|e| conversion(1, e))?,
        message_count: row.get::<_, i64>(2)? as usize,
        start: millis_to_utc(3, row.get(3)?)?,
        end: millis_to_utc(4, row.get(4)?)?,
        aggregates: BatchAggregates {
            device_ids: json_list(row, 10)?,
            asset_ids: json_list(row, 11)?,
            asset_types: json_list(row, 12)?,
            site_ids: json_list(row, 13)?,
            location,
        },
        anchor: AnchorRecord {
            status: status.parse().map_err(|e| conversion(5, e))?,
            signature: row.get(6)?,
            retry_count: row.get(7)?,
            last_error: row.get(8)?,
            confirmed_at: confirmed_at.map(|ms| millis_to_utc(9, ms)).transpose()?,
        },
    })
}

// Helper to convert a row to Message (columns in MESSAGE_COLUMNS order)
fn row_to_message(row: &Row<'_>) -> rusqlite::Result<Message> {
    let hash: String = row.get(3)?;
    let payload: String = row.get(4)?;
    let location: Option<String> = row.get(10)?;

    Ok(Message {
        id: row.get(0)?,
        device_id: row.get(1)?,
        topic: row.get(2)?,
        hash: ContentHash::from_hex(&hash).map_err(|e| conversion(3, e))?,
        payload: serde_json::from_str(&payload).map_err(|e| conversion(4, e))?,
        received_at: millis_to_utc(5, row.get(5)?)?,
        tenant_id: row.get(6)?,
        site_id: row.get(7)?,
        asset_id: row.get(8)?,
        asset_type: row.get(9)?,
        location: location
            .map(|s| serde_json::from_str::<GeoPoint>(&s))
            .transpose()
            .map_err(|e| conversion(10, e))?,
    })
}

fn query_batches<P: rusqlite::Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> Result<Vec<StoredBatch>> {
    let mut stmt = conn.prepare(sql)?;
    let batches = stmt
        .query_map(params, row_to_batch)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(batches)
}

/// Apply an anchor update unless the row is already terminal.
///
/// Returns the number of rows changed (0 or 1). Always clears the claim.
fn apply_update(conn: &Connection, id: &str, update: &AnchorUpdate) -> Result<usize> {
    let changed = match update {
        AnchorUpdate::Confirmed { signature, at } => conn.execute(
            "UPDATE batches
             SET anchor_status = 'confirmed', anchor_signature = ?2, last_error = NULL,
                 confirmed_at = ?3, claim_token = NULL, claimed_until = NULL
             WHERE id = ?1 AND anchor_status NOT IN ('confirmed', 'failed')",
            params![id, signature, at.timestamp_millis()],
        )?,
        AnchorUpdate::Retry { error } => conn.execute(
            "UPDATE batches
             SET anchor_status = 'pending', retry_count = retry_count + 1, last_error = ?2,
                 claim_token = NULL, claimed_until = NULL
             WHERE id = ?1 AND anchor_status NOT IN ('confirmed', 'failed')",
            params![id, error],
        )?,
        AnchorUpdate::Failed { error } => conn.execute(
            "UPDATE batches
             SET anchor_status = 'failed', retry_count = retry_count + 1, last_error = ?2,
                 claim_token = NULL, claimed_until = NULL
             WHERE id = ?1 AND anchor_status NOT IN ('confirmed', 'failed')",
            params![id, error],
        )?,
    };
    Ok(changed)
}

fn read_status(conn: &Connection, id: &BatchId) -> Result<(AnchorStatus, Option<String>)> {
    let row: Option<(String, Option<String>)> = conn
        .query_row(
            "SELECT anchor_status, claim_token FROM batches WHERE id = ?1",
            params![id.to_hyphenated()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    let (status, token) = row.ok_or(StoreError::NotFound(*id))?;
    let status = status
        .parse()
        .map_err(|e: CoreError| StoreError::InvalidData(e.to_string()))?;
    Ok((status, token))
}

#[async_trait]
impl BatchStore for SqliteStore {
    async fn save_batch(&self, batch: &SealedBatch) -> Result<SaveResult> {
        let batch = batch.clone();

        self.blocking(move |conn| {
            let id = batch.id.to_hyphenated();
            let hash = batch.hash.to_hex();
            let tx = conn.transaction()?;

            let existing: Option<String> = tx
                .query_row("SELECT hash FROM batches WHERE id = ?1", params![id], |row| {
                    row.get(0)
                })
                .optional()?;
            if let Some(existing) = existing {
                return if existing == hash {
                    Ok(SaveResult::AlreadyExists)
                } else {
                    Err(StoreError::Conflict { id: batch.id })
                };
            }

            let agg = &batch.aggregates;
            tx.execute(
                "INSERT INTO batches (
                    id, hash, message_count, start_ts, end_ts, status, anchor_status,
                    retry_count, device_ids, asset_ids, asset_types, site_ids, location_summary
                ) VALUES (?1, ?2, ?3, ?4, ?5, 'complete', 'none', 0, ?6, ?7, ?8, ?9, ?10)",
                params![
                    id,
                    hash,
                    batch.message_count() as i64,
                    batch.start.timestamp_millis(),
                    batch.end.timestamp_millis(),
                    serde_json::to_string(&agg.device_ids)?,
                    serde_json::to_string(&agg.asset_ids)?,
                    serde_json::to_string(&agg.asset_types)?,
                    serde_json::to_string(&agg.site_ids)?,
                    agg.location.as_ref().map(serde_json::to_string).transpose()?,
                ],
            )?;

            {
                let mut stmt = tx.prepare(
                    "INSERT INTO messages (
                        batch_id, seq, id, device_id, topic, message_hash, raw_payload,
                        received_at, tenant_id, site_id, asset_id, asset_type, location
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                )?;
                for (seq, m) in batch.messages.iter().enumerate() {
                    stmt.execute(params![
                        id,
                        seq as i64,
                        m.id,
                        m.device_id,
                        m.topic,
                        m.hash.to_hex(),
                        serde_json::to_string(&m.payload)?,
                        m.received_at.timestamp_millis(),
                        m.tenant_id,
                        m.site_id,
                        m.asset_id,
                        m.asset_type,
                        m.location.as_ref().map(serde_json::to_string).transpose()?,
                    ])?;
                }
            }

            tx.commit()?;
            tracing::debug!(batch_id = %batch.id, count = batch.message_count(), "batch persisted");
            Ok(SaveResult::Inserted)
        })
        .await
    }

    async fn get_batch(&self, id: &BatchId) -> Result<Option<StoredBatch>> {
        let id = *id;
        self.blocking(move |conn| {
            conn.query_row(
                &format!("SELECT {BATCH_COLUMNS} FROM batches WHERE id = ?1"),
                params![id.to_hyphenated()],
                row_to_batch,
            )
            .optional()
            .map_err(StoreError::from)
        })
        .await
    }

    async fn list_batches(&self, limit: usize, offset: usize) -> Result<Vec<StoredBatch>> {
        self.blocking(move |conn| {
            query_batches(
                conn,
                &format!(
                    "SELECT {BATCH_COLUMNS} FROM batches
                     ORDER BY end_ts DESC, id ASC LIMIT ?1 OFFSET ?2"
                ),
                params![limit as i64, offset as i64],
            )
        })
        .await
    }

    async fn get_message(&self, id: &str) -> Result<Option<Message>> {
        let id = id.to_string();
        self.blocking(move |conn| {
            conn.query_row(
                &format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1 ORDER BY rowid LIMIT 1"
                ),
                params![id],
                row_to_message,
            )
            .optional()
            .map_err(StoreError::from)
        })
        .await
    }

    async fn list_messages(&self, batch_id: &BatchId) -> Result<Vec<Message>> {
        let batch_id = *batch_id;
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages WHERE batch_id = ?1 ORDER BY seq"
            ))?;
            let messages = stmt
                .query_map(params![batch_id.to_hyphenated()], row_to_message)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(messages)
        })
        .await
    }

    async fn update_anchor_status(&self, id: &BatchId, update: AnchorUpdate) -> Result<()> {
        let id = *id;
        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            let (status, _) = read_status(&tx, &id)?;
            if status.is_terminal() {
                return Err(StoreError::TerminalStatus { id, status });
            }
            apply_update(&tx, &id.to_hyphenated(), &update)?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn find_due(&self, window: &TimeWindow, max_retries: u32) -> Result<Vec<StoredBatch>> {
        let window = *window;
        self.blocking(move |conn| {
            query_batches(
                conn,
                &format!(
                    "SELECT {BATCH_COLUMNS} FROM batches
                     WHERE start_ts >= ?1 AND start_ts < ?2
                       AND anchor_status IN ('none', 'pending')
                       AND retry_count < ?3
                     ORDER BY start_ts ASC"
                ),
                params![
                    window.start.timestamp_millis(),
                    window.end.timestamp_millis(),
                    max_retries
                ],
            )
        })
        .await
    }

    async fn claim(
        &self,
        scope: ClaimScope,
        now: DateTime<Utc>,
        lease: Duration,
        max_retries: u32,
    ) -> Result<Vec<Claim>> {
        let expires_at = lease_expiry(now, lease);

        self.blocking(move |conn| {
            let now_ms = now.timestamp_millis();
            let tx = conn.transaction()?;

            let candidates = match scope {
                ClaimScope::Pending { limit } => query_batches(
                    &tx,
                    &format!(
                        "SELECT {BATCH_COLUMNS} FROM batches
                         WHERE anchor_status = 'pending'
                           AND retry_count < ?1
                           AND (claimed_until IS NULL OR claimed_until <= ?2)
                         ORDER BY start_ts ASC LIMIT ?3"
                    ),
                    params![max_retries, now_ms, limit as i64],
                )?,
                ClaimScope::Window(window) => query_batches(
                    &tx,
                    &format!(
                        "SELECT {BATCH_COLUMNS} FROM batches
                         WHERE start_ts >= ?1 AND start_ts < ?2
                           AND anchor_status IN ('none', 'pending')
                           AND retry_count < ?3
                           AND (claimed_until IS NULL OR claimed_until <= ?4)
                         ORDER BY start_ts ASC"
                    ),
                    params![
                        window.start.timestamp_millis(),
                        window.end.timestamp_millis(),
                        max_retries,
                        now_ms
                    ],
                )?,
                ClaimScope::Batch(id) => query_batches(
                    &tx,
                    &format!(
                        "SELECT {BATCH_COLUMNS} FROM batches
                         WHERE id = ?1
                           AND anchor_status IN ('none', 'pending')
                           AND retry_count < ?2
                           AND (claimed_until IS NULL OR claimed_until <= ?3)"
                    ),
                    params![id.to_hyphenated(), max_retries, now_ms],
                )?,
            };

            let mut claims = Vec::with_capacity(candidates.len());
            for batch in candidates {
                let token = ClaimToken::new();
                // Re-check the lease in the UPDATE so concurrent processes
                // sharing the file cannot both win.
                let changed = tx.execute(
                    "UPDATE batches SET claim_token = ?1, claimed_until = ?2
                     WHERE id = ?3 AND (claimed_until IS NULL OR claimed_until <= ?4)",
                    params![
                        token.to_string(),
                        expires_at.timestamp_millis(),
                        batch.id.to_hyphenated(),
                        now_ms
                    ],
                )?;
                if changed == 1 {
                    claims.push(Claim {
                        token,
                        batch,
                        expires_at,
                    });
                }
            }

            tx.commit()?;
            Ok(claims)
        })
        .await
    }

    async fn complete_claim(&self, claim: &Claim, update: AnchorUpdate) -> Result<()> {
        let id = claim.batch.id;
        let token = claim.token.to_string();

        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            let (status, held) = read_status(&tx, &id)?;
            if held.as_deref() != Some(token.as_str()) {
                return Err(StoreError::ClaimLost(id));
            }
            if status.is_terminal() {
                return Err(StoreError::TerminalStatus { id, status });
            }
            apply_update(&tx, &id.to_hyphenated(), &update)?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn renew_claim(
        &self,
        claim: &Claim,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Claim> {
        let id = claim.batch.id;
        let token = claim.token.to_string();
        let expires_at = lease_expiry(now, lease);

        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            let (status, held) = read_status(&tx, &id)?;
            if held.as_deref() != Some(token.as_str()) {
                return Err(StoreError::ClaimLost(id));
            }
            if status.is_terminal() {
                return Err(StoreError::TerminalStatus { id, status });
            }
            tx.execute(
                "UPDATE batches SET claimed_until = ?1 WHERE id = ?2 AND claim_token = ?3",
                params![expires_at.timestamp_millis(), id.to_hyphenated(), token],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await?;

        Ok(Claim {
            expires_at,
            ..claim.clone()
        })
    }

    async fn release_claim(&self, claim: &Claim) -> Result<()> {
        let id = claim.batch.id;
        let token = claim.token.to_string();

        self.blocking(move |conn| {
            conn.execute(
                "UPDATE batches SET claim_token = NULL, claimed_until = NULL
                 WHERE id = ?1 AND claim_token = ?2",
                params![id.to_hyphenated(), token],
            )?;
            Ok(())
        })
        .await
    }

    async fn statistics(&self, now: DateTime<Utc>, max_retries: u32) -> Result<AnchorStats> {
        self.blocking(move |conn| {
            let mut stats = AnchorStats::default();

            let mut stmt =
                conn.prepare("SELECT anchor_status, COUNT(*) FROM batches GROUP BY anchor_status")?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            for (status, count) in rows {
                let count = count as u64;
                match status.as_str() {
                    "none" => stats.none = count,
                    "pending" => stats.pending = count,
                    "confirmed" => stats.confirmed = count,
                    "failed" => stats.failed = count,
                    other => {
                        return Err(StoreError::InvalidData(format!("anchor status {other}")))
                    }
                }
            }

            stats.retry_queue = conn.query_row(
                "SELECT COUNT(*) FROM batches WHERE anchor_status = 'pending' AND retry_count < ?1",
                params![max_retries],
                |row| row.get::<_, i64>(0),
            )? as u64;

            stats.claimed = conn.query_row(
                "SELECT COUNT(*) FROM batches WHERE claimed_until > ?1",
                params![now.timestamp_millis()],
                |row| row.get::<_, i64>(0),
            )? as u64;

            Ok(stats)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use batch_anchor_core::{Batch, StreamEntry};
    use serde_json::json;

    fn sealed(device_prefix: &str, n: usize) -> SealedBatch {
        let mut batch = Batch::new();
        for i in 0..n {
            let entry: StreamEntry = serde_json::from_value(json!({
                "messageId": format!("{device_prefix}-{i}"),
                "deviceId": format!("{device_prefix}-{}", i % 2),
                "payload": {"seq": i},
                "receivedAt": 1736870400000i64 + i as i64,
            }))
            .unwrap();
            batch.push(entry.into_message().unwrap());
        }
        batch.seal().unwrap()
    }

    #[tokio::test]
    async fn test_failed_message_insert_rolls_back_batch() {
        let store = SqliteStore::open_memory().unwrap();
        store
            .conn
            .lock()
            .unwrap()
            .execute_batch(
                "CREATE TRIGGER fail_boom BEFORE INSERT ON messages
                 WHEN NEW.device_id = 'boom-1'
                 BEGIN SELECT RAISE(ABORT, 'boom'); END;",
            )
            .unwrap();

        let batch = sealed("boom", 3);
        assert!(store.save_batch(&batch).await.is_err());

        assert!(store.get_batch(&batch.id).await.unwrap().is_none());
        assert!(store.list_messages(&batch.id).await.unwrap().is_empty());

        // The same unit commits once the fault is gone.
        store
            .conn
            .lock()
            .unwrap()
            .execute_batch("DROP TRIGGER fail_boom;")
            .unwrap();
        assert_eq!(store.save_batch(&batch).await.unwrap(), SaveResult::Inserted);
        assert_eq!(store.list_messages(&batch.id).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_conflicting_hash_rejected() {
        let store = SqliteStore::open_memory().unwrap();
        let batch = sealed("dev", 2);
        store.save_batch(&batch).await.unwrap();

        let mut tampered = batch.clone();
        tampered.hash = ContentHash::hash(b"other");
        assert!(matches!(
            store.save_batch(&tampered).await,
            Err(StoreError::Conflict { .. })
        ));
    }
}
