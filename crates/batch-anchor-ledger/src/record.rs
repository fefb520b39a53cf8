//! Proof records: the data a batch anchors on the ledger.
//!
//! A [`ProofRecord`] is the readable form. On the wire it travels as a
//! [`CompactRecord`]: short keys, Unix-second timestamps, and an auxiliary
//! block with capped identifier lists. Empty fields are omitted.
//!
//! Identifiers are carried byte for byte or not at all: an identifier too
//! long for its field is skipped, never shortened, so every identifier in a
//! proof also appears in the stored batch.
//!
//! ```text
//! {"t":"VEEP_BATCH","v":"1.0","bid":..,"h":..,"mc":..,"ts":..,"s":..,"e":..,
//!  "a":{"ids":[..],"typ":[..],"sit":[..],"loc":{"lat":..,"lon":..,"cnt":..}},
//!  "o":{"wallet":..,"network":..}}
//! ```

use batch_anchor_core::{BatchAggregates, BatchId, ContentHash, GeoPoint, StoredBatch};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{LedgerError, Result};

/// Record type tag.
pub const RECORD_TYPE: &str = "VEEP_BATCH";

/// Record format version.
pub const RECORD_VERSION: &str = "1.0";

/// Largest memo the ledger accepts, in bytes.
pub const MAX_RECORD_BYTES: usize = 566;

pub const MAX_ASSET_IDS: usize = 3;
pub const MAX_ASSET_TYPES: usize = 2;
pub const MAX_SITE_IDS: usize = 2;

/// Longest asset id carried, measured in JSON-escaped bytes. Longer ids
/// are left out whole.
pub const MAX_ID_BYTES: usize = 24;

/// Longest asset type or site id carried, in JSON-escaped bytes.
pub const MAX_TAG_BYTES: usize = 16;

/// Longest network name the wire record carries.
pub const MAX_NETWORK_BYTES: usize = 16;

/// Who anchored the record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Origin {
    pub wallet: String,
    pub network: String,
}

/// Centroid of the located messages of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CentroidSummary {
    pub centroid: GeoPoint,
    pub asset_count: usize,
}

/// Optional asset metadata carried with a record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetSummary {
    #[serde(default)]
    pub asset_ids: Vec<String>,
    #[serde(default)]
    pub asset_types: Vec<String>,
    #[serde(default)]
    pub site_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location_summary: Option<CentroidSummary>,
}

impl AssetSummary {
    /// Capped summary of a batch's aggregates, `None` when nothing remains.
    ///
    /// Each list keeps the first identifiers, in order, that fit their byte
    /// limit.
    pub fn from_aggregates(agg: &BatchAggregates) -> Option<Self> {
        let summary = Self {
            asset_ids: capped(&agg.asset_ids, MAX_ASSET_IDS, MAX_ID_BYTES),
            asset_types: capped(&agg.asset_types, MAX_ASSET_TYPES, MAX_TAG_BYTES),
            site_ids: capped(&agg.site_ids, MAX_SITE_IDS, MAX_TAG_BYTES),
            location_summary: agg.location.map(|loc| CentroidSummary {
                centroid: GeoPoint {
                    lat: round6(loc.centroid.lat),
                    lon: round6(loc.centroid.lon),
                },
                asset_count: loc.count,
            }),
        };
        (!summary.is_empty()).then_some(summary)
    }

    pub fn is_empty(&self) -> bool {
        self.asset_ids.is_empty()
            && self.asset_types.is_empty()
            && self.site_ids.is_empty()
            && self.location_summary.is_none()
    }
}

/// Readable proof record.
///
/// Timestamps are whole seconds, which is the wire precision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProofRecord {
    #[serde(rename = "type")]
    pub record_type: String,
    pub version: String,
    pub batch_id: BatchId,
    pub batch_hash: ContentHash,
    pub message_count: usize,
    /// When the record was built.
    pub timestamp: DateTime<Utc>,
    pub start_timestamp: DateTime<Utc>,
    pub end_timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset: Option<AssetSummary>,
    pub origin: Origin,
}

impl ProofRecord {
    /// Build the record for a stored batch.
    pub fn for_batch(batch: &StoredBatch, created_at: DateTime<Utc>, origin: Origin) -> Self {
        Self {
            record_type: RECORD_TYPE.to_string(),
            version: RECORD_VERSION.to_string(),
            batch_id: batch.id,
            batch_hash: batch.hash,
            message_count: batch.message_count,
            timestamp: whole_seconds(created_at),
            start_timestamp: whole_seconds(batch.start),
            end_timestamp: whole_seconds(batch.end),
            asset: AssetSummary::from_aggregates(&batch.aggregates),
            origin,
        }
    }

    /// The same record with the auxiliary block removed.
    pub fn without_asset(&self) -> Self {
        Self {
            asset: None,
            ..self.clone()
        }
    }

    pub fn compact(&self) -> CompactRecord {
        CompactRecord {
            t: self.record_type.clone(),
            v: self.version.clone(),
            bid: self.batch_id.to_hyphenated(),
            h: self.batch_hash.to_hex(),
            mc: self.message_count,
            ts: self.timestamp.timestamp(),
            s: self.start_timestamp.timestamp(),
            e: self.end_timestamp.timestamp(),
            a: self.asset.as_ref().map(|a| CompactAsset {
                ids: a.asset_ids.clone(),
                typ: a.asset_types.clone(),
                sit: a.site_ids.clone(),
                loc: a.location_summary.map(|l| CompactLocation {
                    lat: l.centroid.lat,
                    lon: l.centroid.lon,
                    cnt: l.asset_count,
                }),
            }),
            o: self.origin.clone(),
        }
    }

    /// Compact wire bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.compact())?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompactLocation {
    pub lat: f64,
    pub lon: f64,
    pub cnt: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompactAsset {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub typ: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sit: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loc: Option<CompactLocation>,
}

/// Wire form of a [`ProofRecord`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompactRecord {
    pub t: String,
    pub v: String,
    pub bid: String,
    pub h: String,
    pub mc: usize,
    pub ts: i64,
    pub s: i64,
    pub e: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub a: Option<CompactAsset>,
    pub o: Origin,
}

impl CompactRecord {
    pub fn expand(&self) -> Result<ProofRecord> {
        Ok(ProofRecord {
            record_type: self.t.clone(),
            version: self.v.clone(),
            batch_id: self
                .bid
                .parse()
                .map_err(|e| LedgerError::Decode(format!("batch id: {e}")))?,
            batch_hash: ContentHash::from_hex(&self.h)
                .map_err(|e| LedgerError::Decode(format!("batch hash: {e}")))?,
            message_count: self.mc,
            timestamp: from_unix(self.ts)?,
            start_timestamp: from_unix(self.s)?,
            end_timestamp: from_unix(self.e)?,
            asset: self.a.as_ref().map(|a| AssetSummary {
                asset_ids: a.ids.clone(),
                asset_types: a.typ.clone(),
                site_ids: a.sit.clone(),
                location_summary: a.loc.as_ref().map(|l| CentroidSummary {
                    centroid: GeoPoint {
                        lat: l.lat,
                        lon: l.lon,
                    },
                    asset_count: l.cnt,
                }),
            }),
            origin: self.o.clone(),
        })
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum AnyRecord {
    Compact(CompactRecord),
    Expanded(ProofRecord),
}

/// Decode a record in either compact or expanded form.
///
/// Expanding an already-expanded record returns it unchanged.
pub fn expand(value: &serde_json::Value) -> Result<ProofRecord> {
    match AnyRecord::deserialize(value)
        .map_err(|e| LedgerError::Decode(format!("not a proof record: {e}")))?
    {
        AnyRecord::Compact(c) => c.expand(),
        AnyRecord::Expanded(p) => Ok(p),
    }
}

/// Decode memo bytes read back from the ledger.
pub fn decode_memo(bytes: &[u8]) -> Result<ProofRecord> {
    let value: serde_json::Value = serde_json::from_slice(bytes)?;
    expand(&value)
}

fn whole_seconds(t: DateTime<Utc>) -> DateTime<Utc> {
    Utc.timestamp_opt(t.timestamp(), 0).single().unwrap_or(t)
}

fn from_unix(secs: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_opt(secs, 0)
        .single()
        .ok_or_else(|| LedgerError::Decode(format!("timestamp out of range: {secs}")))
}

fn round6(x: f64) -> f64 {
    (x * 1e6).round() / 1e6
}

fn capped(values: &[String], max_items: usize, max_bytes: usize) -> Vec<String> {
    let kept: Vec<String> = values
        .iter()
        .filter(|v| !v.is_empty() && escaped_len(v) <= max_bytes)
        .take(max_items)
        .cloned()
        .collect();
    let skipped = values
        .iter()
        .filter(|v| escaped_len(v) > max_bytes)
        .count();
    if skipped > 0 {
        tracing::debug!(skipped, max_bytes, "identifiers too long for the proof record");
    }
    kept
}

/// Length of `s` once JSON-escaped, without quotes.
pub fn escaped_len(s: &str) -> usize {
    s.chars().map(escaped_char_len).sum()
}

fn escaped_char_len(c: char) -> usize {
    match c {
        '"' | '\\' | '\n' | '\r' | '\t' | '\u{08}' | '\u{0c}' => 2,
        c if (c as u32) < 0x20 => 6,
        c => c.len_utf8(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use batch_anchor_core::{AnchorRecord, BoundingBox, LocationSummary};
    use serde_json::json;

    fn stored(agg: BatchAggregates) -> StoredBatch {
        StoredBatch {
            id: BatchId::new(),
            hash: ContentHash::hash(b"batch"),
            message_count: 1000,
            start: Utc.timestamp_millis_opt(1_736_870_400_123).unwrap(),
            end: Utc.timestamp_millis_opt(1_736_870_700_999).unwrap(),
            aggregates: agg,
            anchor: AnchorRecord::new(),
        }
    }

    fn origin() -> Origin {
        Origin {
            wallet: "9xQeWvG816bUx9EPjHmaT23yvVM2ZWbrrpZb9PusVFin".into(),
            network: "devnet".into(),
        }
    }

    /// Identifiers at exactly their byte limits, each list led by one that
    /// is too long to carry.
    fn worst_case() -> BatchAggregates {
        let sized = |p: String, limit: usize| format!("{p}{}", "x".repeat(limit - p.len()));
        let with_oversized = |mut ids: Vec<String>| {
            ids.insert(0, "o".repeat(80));
            ids
        };
        BatchAggregates {
            device_ids: (0..50).map(|i| format!("dev-{i}")).collect(),
            asset_ids: with_oversized((0..10).map(|i| sized(format!("asset{i}-"), MAX_ID_BYTES)).collect()),
            asset_types: with_oversized((0..5).map(|i| sized(format!("type{i}-"), MAX_TAG_BYTES)).collect()),
            site_ids: with_oversized((0..5).map(|i| sized(format!("site{i}-"), MAX_TAG_BYTES)).collect()),
            location: Some(LocationSummary {
                count: 1000,
                centroid: GeoPoint {
                    lat: -89.123456789012,
                    lon: -179.987654321098,
                },
                bounding_box: BoundingBox {
                    min_lat: -90.0,
                    max_lat: 90.0,
                    min_lon: -180.0,
                    max_lon: 180.0,
                },
            }),
        }
    }

    #[test]
    fn test_compact_expand_roundtrip() {
        let record = ProofRecord::for_batch(&stored(worst_case()), Utc::now(), origin());
        assert_eq!(record.compact().expand().unwrap(), record);
    }

    #[test]
    fn test_expand_is_idempotent() {
        let record = ProofRecord::for_batch(&stored(worst_case()), Utc::now(), origin());
        let compact = serde_json::to_value(record.compact()).unwrap();

        let once = expand(&compact).unwrap();
        let twice = expand(&serde_json::to_value(&once).unwrap()).unwrap();
        assert_eq!(once, twice);
        assert_eq!(once, record);
    }

    #[test]
    fn test_worst_case_fits_budget() {
        let record = ProofRecord::for_batch(&stored(worst_case()), Utc::now(), origin());
        let bytes = record.encode().unwrap();
        assert!(
            bytes.len() <= MAX_RECORD_BYTES,
            "{} bytes: {}",
            bytes.len(),
            String::from_utf8_lossy(&bytes)
        );

        let asset = record.asset.unwrap();
        assert_eq!(asset.asset_ids.len(), MAX_ASSET_IDS);
        assert_eq!(asset.asset_types.len(), MAX_ASSET_TYPES);
        assert_eq!(asset.site_ids.len(), MAX_SITE_IDS);
    }

    #[test]
    fn test_escape_heavy_identifiers_fit_budget() {
        // 15 escaped bytes: \u0001, \", \\, two-byte é, three-byte 漢.
        let nasty = "\u{1}\"\\é漢";
        assert_eq!(escaped_len(nasty), 15);
        let agg = BatchAggregates {
            asset_ids: vec![format!("{nasty}{}", "a".repeat(MAX_ID_BYTES - 15)); 3],
            asset_types: vec![format!("{nasty}a"); 2],
            site_ids: vec![format!("{nasty}b"); 2],
            ..worst_case()
        };
        let record = ProofRecord::for_batch(&stored(agg), Utc::now(), origin());
        let asset = record.asset.clone().unwrap();
        assert_eq!(asset.asset_ids.len(), 3);
        assert_eq!(asset.site_ids, vec![format!("{nasty}b"); 2]);
        assert!(record.encode().unwrap().len() <= MAX_RECORD_BYTES);
    }

    #[test]
    fn test_identifiers_carried_verbatim_or_skipped() {
        let agg = BatchAggregates {
            asset_ids: vec![
                "pallet-with-a-very-long-identifier-0001".into(),
                "".into(),
                "asset-1".into(),
                "asset-2".into(),
            ],
            site_ids: vec!["warehouse-north-annex".into(), "site-9".into()],
            ..Default::default()
        };
        let record = ProofRecord::for_batch(&stored(agg), Utc::now(), origin());
        let asset = record.asset.unwrap();
        assert_eq!(asset.asset_ids, vec!["asset-1", "asset-2"]);
        assert_eq!(asset.site_ids, vec!["site-9"]);
    }

    #[test]
    fn test_empty_fields_omitted() {
        let record = ProofRecord::for_batch(&stored(BatchAggregates::default()), Utc::now(), origin());
        assert!(record.asset.is_none());

        let text = String::from_utf8(record.encode().unwrap()).unwrap();
        assert!(!text.contains("\"a\""));
        assert!(!text.contains("null"));
    }

    #[test]
    fn test_partial_aux_block() {
        let agg = BatchAggregates {
            site_ids: vec!["site-1".into()],
            ..Default::default()
        };
        let record = ProofRecord::for_batch(&stored(agg), Utc::now(), origin());
        let value = serde_json::to_value(record.compact()).unwrap();
        assert_eq!(value["a"], json!({"sit": ["site-1"]}));
    }

    #[test]
    fn test_centroid_six_decimals() {
        let record = ProofRecord::for_batch(&stored(worst_case()), Utc::now(), origin());
        let loc = record.asset.unwrap().location_summary.unwrap();
        assert_eq!(loc.centroid.lat, -89.123457);
        assert_eq!(loc.centroid.lon, -179.987654);
        assert_eq!(loc.asset_count, 1000);
    }

    #[test]
    fn test_timestamps_are_unix_seconds() {
        let record = ProofRecord::for_batch(&stored(worst_case()), Utc::now(), origin());
        let compact = record.compact();
        assert_eq!(compact.s, 1_736_870_400);
        assert_eq!(compact.e, 1_736_870_700);
    }

    #[test]
    fn test_expand_rejects_garbage() {
        assert!(expand(&json!({"hello": "world"})).is_err());
        assert!(decode_memo(b"not json").is_err());
    }

    #[test]
    fn test_escaped_len() {
        assert_eq!(escaped_len("abc"), 3);
        assert_eq!(escaped_len("é"), 2);
        assert_eq!(escaped_len("a\"b"), 4);
        assert_eq!(escaped_len("\u{1f}"), 6);
    }
}
