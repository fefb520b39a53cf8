//! Proptest generators for property-based testing.

use proptest::prelude::*;
use serde_json::{Map, Value};

/// Generate a JSON scalar.
pub fn json_scalar() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(Value::from),
        (-1.0e6f64..1.0e6).prop_map(Value::from),
        "[a-zA-Z0-9 _-]{0,12}".prop_map(Value::String),
    ]
}

/// Generate a nested JSON document.
pub fn json_value() -> impl Strategy<Value = Value> {
    json_scalar().prop_recursive(3, 24, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
            prop::collection::btree_map("[a-z]{1,6}", inner, 0..5)
                .prop_map(|m| Value::Object(m.into_iter().collect())),
        ]
    })
}

/// Rebuild `value` with every object's keys inserted in reverse order.
///
/// The result is equal as a JSON document; only insertion order differs,
/// which is observable when serde_json keeps insertion order.
pub fn reverse_key_order(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = Map::new();
            for (k, v) in map.iter().rev() {
                out.insert(k.clone(), reverse_key_order(v));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(reverse_key_order).collect()),
        other => other.clone(),
    }
}

/// Generate a device id.
pub fn device_id() -> impl Strategy<Value = String> {
    "dev-[a-z0-9]{1,12}".prop_map(String::from)
}

/// Generate a timestamp in milliseconds within a few years of 2025.
pub fn timestamp_ms() -> impl Strategy<Value = i64> {
    1_700_000_000_000i64..1_800_000_000_000
}

/// Generate a list of identifiers, possibly with repeats.
pub fn identifiers(max: usize) -> impl Strategy<Value = Vec<String>> {
    prop::collection::vec("[ -~]{0,40}", 0..=max)
}
