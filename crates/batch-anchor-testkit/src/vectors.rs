//! Golden vectors for the canonical hashes.
//!
//! Any change to these expected values means anchored proofs can no longer
//! be re-verified.

use batch_anchor_core::{BatchId, Message, StreamEntry};
use serde_json::json;
use uuid::Uuid;

/// Fixed batch id used by [`BATCH_HASH`].
pub const BATCH_ID: Uuid = Uuid::from_u128(0x00000000_0000_4000_8000_000000000001);

/// Hash of `dev-1 | 2025-01-14T16:00:00.000Z | {"a":{"c":"x","d":[3,1]},"b":2}`.
pub const MESSAGE_1_HASH: &str =
    "16f7019ea9cdda0179d75539091b97b6d0c2fba3460a5d7aa98823949bfce424";

/// Hash of `dev-2 | 2025-01-14T16:00:01.500Z | {"temp":21.5}`.
pub const MESSAGE_2_HASH: &str =
    "0058879f169da9ecbfeb12edc384979680731df2e4d47bf9aab232513f474e02";

/// Hash of a batch of message 1 then message 2 under [`BATCH_ID`].
pub const BATCH_HASH: &str = "4637b0fc21f7ab221d79652c158c9ac2a8f42b1a152d39a76233b4ea68217668";

pub fn batch_id() -> BatchId {
    BatchId::from_uuid(BATCH_ID)
}

/// Entry for message 1, with its payload keys deliberately out of order.
pub fn entry_1() -> StreamEntry {
    serde_json::from_value(json!({
        "messageId": "golden-1",
        "deviceId": "dev-1",
        "payload": {"b": 2, "a": {"d": [3, 1], "c": "x"}},
        "receivedAt": "2025-01-14T16:00:00.000Z",
    }))
    .expect("golden entry 1 is well formed")
}

pub fn entry_2() -> StreamEntry {
    serde_json::from_value(json!({
        "messageId": "golden-2",
        "deviceId": "dev-2",
        "payload": {"temp": 21.5},
        "receivedAt": 1_736_870_401_500i64,
    }))
    .expect("golden entry 2 is well formed")
}

pub fn messages() -> Vec<Message> {
    [entry_1(), entry_2()]
        .into_iter()
        .map(|e| e.into_message().expect("golden entries are valid"))
        .collect()
}
