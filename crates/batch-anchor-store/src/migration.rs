//! Database schema migrations for SQLite.
//!
//! A simple versioned migration system. Each migration transforms the schema
//! from version N to N+1.

use rusqlite::Connection;

use crate::error::{Result, StoreError};

/// Current schema version.
pub const CURRENT_VERSION: u32 = 1;

/// Initialize or migrate the database schema.
///
/// Idempotent: it can be called on every open.
pub fn migrate(conn: &mut Connection) -> Result<()> {
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        )",
        [],
    )?;

    let current: u32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )?;

    if current < CURRENT_VERSION {
        let tx = conn.transaction()?;

        for version in (current + 1)..=CURRENT_VERSION {
            apply_migration(&tx, version)?;

            tx.execute(
                "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
                rusqlite::params![version, chrono::Utc::now().timestamp_millis()],
            )?;
        }

        tx.commit()?;
        tracing::debug!(from = current, to = CURRENT_VERSION, "migrated batch store schema");
    }

    Ok(())
}

fn apply_migration(conn: &Connection, version: u32) -> Result<()> {
    match version {
        1 => apply_v1(conn),
        _ => Err(StoreError::Migration(format!(
            "unknown migration version: {}",
            version
        ))),
    }
}

/// Migration v1: Initial schema.
fn apply_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- One row per closed batch, with its anchor record embedded
        CREATE TABLE batches (
            id TEXT PRIMARY KEY,              -- hyphenated UUID
            hash TEXT NOT NULL,               -- 64 hex chars, SHA-256
            message_count INTEGER NOT NULL,
            start_ts INTEGER NOT NULL,        -- first message (Unix ms)
            end_ts INTEGER NOT NULL,          -- last message (Unix ms)
            status TEXT NOT NULL DEFAULT 'complete',
            anchor_status TEXT NOT NULL DEFAULT 'none',
            anchor_signature TEXT,
            retry_count INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            confirmed_at INTEGER,             -- Unix ms
            device_ids TEXT NOT NULL,         -- JSON array
            asset_ids TEXT NOT NULL,          -- JSON array
            asset_types TEXT NOT NULL,        -- JSON array
            site_ids TEXT NOT NULL,           -- JSON array
            location_summary TEXT,            -- JSON object, nullable
            claim_token TEXT,                 -- live anchoring claim, nullable
            claimed_until INTEGER             -- claim lease expiry (Unix ms)
        );

        -- Messages owned by a batch; arrival order is (batch_id, seq)
        CREATE TABLE messages (
            batch_id TEXT NOT NULL REFERENCES batches(id) ON DELETE CASCADE,
            seq INTEGER NOT NULL,
            id TEXT NOT NULL,
            device_id TEXT NOT NULL,
            topic TEXT,
            message_hash TEXT NOT NULL,
            raw_payload TEXT NOT NULL,        -- JSON document
            received_at INTEGER NOT NULL,     -- Unix ms
            tenant_id TEXT,
            site_id TEXT,
            asset_id TEXT,
            asset_type TEXT,
            location TEXT,                    -- JSON {lat, lon}, nullable
            PRIMARY KEY (batch_id, seq)
        );

        CREATE INDEX idx_batches_anchor ON batches(anchor_status, start_ts);
        CREATE INDEX idx_batches_end ON batches(end_ts);
        CREATE INDEX idx_messages_id ON messages(id);
        "#,
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migration_creates_tables() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<std::result::Result<Vec<_>, _>>()
            .unwrap();

        assert!(tables.contains(&"batches".to_string()));
        assert!(tables.contains(&"messages".to_string()));
        assert!(tables.contains(&"schema_migrations".to_string()));
    }

    #[test]
    fn test_migration_idempotent() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate(&mut conn).unwrap();
        migrate(&mut conn).unwrap();

        let version: u32 = conn
            .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, CURRENT_VERSION);
    }
}
