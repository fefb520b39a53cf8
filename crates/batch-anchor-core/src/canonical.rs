//! Canonical hashing of messages and batches.
//!
//! Message hash:
//!
//! ```text
//! sha256( deviceId | receivedAtISO | canonical_json(payload) )
//! ```
//!
//! where `canonical_json` sorts object keys at every nesting depth and keeps
//! array order. The hash is therefore independent of the key order the
//! upstream producer happened to use.
//!
//! Batch hash:
//!
//! ```text
//! messagesHash = hex(sha256( h_1 || h_2 || ... || h_n ))   (hex digests, arrival order)
//! batchHash    = sha256( batchId | messageCount | startISO | endISO | messagesHash )
//! ```
//!
//! The batch hash is sensitive to arrival order: two batches holding the same
//! messages in a different order hash differently.
//!
//! **This encoding is FROZEN.** Anchored hashes can only be re-verified if
//! it never changes.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::types::{BatchId, ContentHash};

/// Field separator inside hash preimages.
const SEPARATOR: &str = "|";

/// Render a JSON document with object keys sorted at every depth.
pub fn canonical_json(value: &Value) -> String {
    canonicalize(value).to_string()
}

/// Rebuild a value so every object is populated in sorted key order.
///
/// Inserting in sorted order yields sorted output whether or not
/// `serde_json` was built with `preserve_order`.
fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::new();
            for key in keys {
                sorted.insert(key.clone(), canonicalize(&map[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// ISO-8601 UTC with millisecond precision, e.g. `2025-01-14T16:00:00.000Z`.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Hash a single message.
pub fn hash_message(device_id: &str, timestamp: &DateTime<Utc>, payload: &Value) -> ContentHash {
    let input = [
        device_id,
        format_timestamp(timestamp).as_str(),
        canonical_json(payload).as_str(),
    ]
    .join(SEPARATOR);
    ContentHash::hash(input.as_bytes())
}

/// Hash a batch from its header fields and message hashes in arrival order.
pub fn hash_batch(
    batch_id: &BatchId,
    message_count: usize,
    start: &DateTime<Utc>,
    end: &DateTime<Utc>,
    message_hashes: &[ContentHash],
) -> ContentHash {
    let mut hasher = Sha256::new();
    for hash in message_hashes {
        hasher.update(hash.to_hex().as_bytes());
    }
    let messages_hash = hex::encode(hasher.finalize());

    let input = [
        batch_id.to_hyphenated(),
        message_count.to_string(),
        format_timestamp(start),
        format_timestamp(end),
        messages_hash,
    ]
    .join(SEPARATOR);
    ContentHash::hash(input.as_bytes())
}
