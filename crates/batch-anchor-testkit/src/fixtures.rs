//! Deterministic test data.

use batch_anchor_core::{
    AnchorRecord, Batch, BatchAggregates, BoundingBox, GeoPoint, LocationSummary, Message,
    SealedBatch, StoredBatch, StreamEntry,
};
use chrono::{DateTime, TimeZone, Utc};
use serde_json::json;

/// 2025-01-14T16:00:00Z in Unix milliseconds.
pub const BASE_MS: i64 = 1_736_870_400_000;

pub fn at_ms(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .expect("fixture timestamp in range")
}

/// The `i`-th entry of a synthetic stream, one second apart from `BASE_MS`.
pub fn entry(i: usize) -> StreamEntry {
    entry_at(i, BASE_MS + i as i64 * 1_000)
}

/// Entry `i` received at `ms`.
pub fn entry_at(i: usize, ms: i64) -> StreamEntry {
    serde_json::from_value(json!({
        "messageId": format!("msg-{i:05}"),
        "topic": format!("sensors/dev-{}/uplink", i % 4),
        "deviceId": format!("dev-{}", i % 4),
        "tenantId": "tenant-a",
        "siteId": format!("site-{}", i % 2),
        "assetId": format!("asset-{}", i % 5),
        "assetType": "pallet",
        "payload": {"seq": i, "temp": 20.5, "battery": {"v": 3.7, "pct": 88}},
        "receivedAt": ms,
        "location": {"lat": 40.7128 + (i % 10) as f64 * 0.001, "lon": -74.006},
    }))
    .expect("fixture entry is well formed")
}

/// `n` consecutive entries starting at index 0.
pub fn entries(n: usize) -> Vec<StreamEntry> {
    (0..n).map(entry).collect()
}

/// An entry missing its device id.
pub fn malformed_entry() -> StreamEntry {
    serde_json::from_value(json!({
        "messageId": "bad-1",
        "payload": {"temp": 1},
        "receivedAt": BASE_MS,
    }))
    .expect("fixture entry is well formed")
}

pub fn messages(n: usize) -> Vec<Message> {
    entries(n)
        .into_iter()
        .map(|e| e.into_message().expect("fixture entries are valid"))
        .collect()
}

/// A sealed batch of `n` fixture messages.
pub fn sealed_batch(n: usize) -> SealedBatch {
    let mut batch = Batch::new();
    for m in messages(n) {
        batch.push(m);
    }
    batch.seal().expect("fixture batch is not empty")
}

/// The stored form of a freshly saved sealed batch.
pub fn stored_batch(sealed: &SealedBatch) -> StoredBatch {
    StoredBatch {
        id: sealed.id,
        hash: sealed.hash,
        message_count: sealed.message_count(),
        start: sealed.start,
        end: sealed.end,
        aggregates: sealed.aggregates.clone(),
        anchor: AnchorRecord::new(),
    }
}

/// Aggregates larger than any proof record may carry. Every list opens
/// with an identifier too long to anchor, followed by identifiers of exactly
/// 24 bytes (asset ids) or 16 bytes (types and sites).
pub fn worst_case_aggregates() -> BatchAggregates {
    let sized = |prefix: &str, i: usize, len: usize| {
        let head = format!("{prefix}-{i:02}-");
        format!("{head}{}", "z".repeat(len - head.len()))
    };
    let list = |prefix: &str, n: usize, len: usize| {
        std::iter::once(format!("{prefix}-{}", "o".repeat(64)))
            .chain((0..n).map(|i| sized(prefix, i, len)))
            .collect::<Vec<_>>()
    };
    BatchAggregates {
        device_ids: (0..100).map(|i| format!("dev-{i}")).collect(),
        asset_ids: list("asset", 20, 24),
        asset_types: list("type", 10, 16),
        site_ids: list("site", 10, 16),
        location: Some(LocationSummary {
            count: 1000,
            centroid: GeoPoint {
                lat: -33.8688198123,
                lon: -151.2092956123,
            },
            bounding_box: BoundingBox {
                min_lat: -89.999999,
                max_lat: 89.999999,
                min_lon: -179.999999,
                max_lon: 179.999999,
            },
        }),
    }
}
