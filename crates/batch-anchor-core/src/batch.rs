//! Batches: open accumulations, sealed batches, and persisted summaries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::canonical::hash_batch;
use crate::error::CoreError;
use crate::message::{GeoPoint, Message};
use crate::types::{AnchorRecord, BatchId, ContentHash};

/// An open batch. Mutated only by the accumulator.
#[derive(Debug, Clone)]
pub struct Batch {
    id: BatchId,
    messages: Vec<Message>,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
}

impl Batch {
    /// Open an empty batch with a fresh id.
    pub fn new() -> Self {
        Self::with_id(BatchId::new())
    }

    pub fn with_id(id: BatchId) -> Self {
        Self {
            id,
            messages: Vec::new(),
            start: None,
            end: None,
        }
    }

    pub fn id(&self) -> BatchId {
        self.id
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Time of the first message, if any.
    pub fn start(&self) -> Option<DateTime<Utc>> {
        self.start
    }

    /// Time of the last message, if any.
    pub fn end(&self) -> Option<DateTime<Utc>> {
        self.end
    }

    /// Append a message in arrival order.
    pub fn push(&mut self, message: Message) {
        if self.start.is_none() {
            self.start = Some(message.received_at);
        }
        self.end = Some(message.received_at);
        self.messages.push(message);
    }

    /// Close the batch: compute its hash and aggregates.
    pub fn seal(self) -> Result<SealedBatch, CoreError> {
        let (start, end) = match (self.start, self.end) {
            (Some(s), Some(e)) if !self.messages.is_empty() => (s, e),
            _ => return Err(CoreError::EmptyBatch),
        };

        let hashes: Vec<ContentHash> = self.messages.iter().map(|m| m.hash).collect();
        let hash = hash_batch(&self.id, self.messages.len(), &start, &end, &hashes);
        let aggregates = BatchAggregates::from_messages(&self.messages);

        Ok(SealedBatch {
            id: self.id,
            messages: self.messages,
            start,
            end,
            hash,
            aggregates,
        })
    }
}

impl Default for Batch {
    fn default() -> Self {
        Self::new()
    }
}

/// A closed batch, ready to persist. Immutable.
#[derive(Debug, Clone)]
pub struct SealedBatch {
    pub id: BatchId,
    pub messages: Vec<Message>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub hash: ContentHash,
    pub aggregates: BatchAggregates,
}

impl SealedBatch {
    pub fn message_count(&self) -> usize {
        self.messages.len()
    }
}

/// Axis-aligned bounding box over located messages.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoundingBox {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lon: f64,
    pub max_lon: f64,
}

/// Coarse geographic summary of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationSummary {
    /// Number of located messages.
    pub count: usize,
    pub centroid: GeoPoint,
    pub bounding_box: BoundingBox,
}

impl LocationSummary {
    /// Arithmetic centroid and bounding box; `None` when no points.
    pub fn from_points(points: &[GeoPoint]) -> Option<Self> {
        let first = points.first()?;
        let mut bbox = BoundingBox {
            min_lat: first.lat,
            max_lat: first.lat,
            min_lon: first.lon,
            max_lon: first.lon,
        };
        let (mut sum_lat, mut sum_lon) = (0.0, 0.0);
        for p in points {
            bbox.min_lat = bbox.min_lat.min(p.lat);
            bbox.max_lat = bbox.max_lat.max(p.lat);
            bbox.min_lon = bbox.min_lon.min(p.lon);
            bbox.max_lon = bbox.max_lon.max(p.lon);
            sum_lat += p.lat;
            sum_lon += p.lon;
        }
        let n = points.len() as f64;
        Some(Self {
            count: points.len(),
            centroid: GeoPoint {
                lat: sum_lat / n,
                lon: sum_lon / n,
            },
            bounding_box: bbox,
        })
    }
}

/// Identifiers and location derived from a batch's messages.
///
/// Identifier lists are de-duplicated and keep first-seen order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchAggregates {
    pub device_ids: Vec<String>,
    pub asset_ids: Vec<String>,
    pub asset_types: Vec<String>,
    pub site_ids: Vec<String>,
    pub location: Option<LocationSummary>,
}

impl BatchAggregates {
    pub fn from_messages(messages: &[Message]) -> Self {
        let mut agg = Self::default();
        let mut points = Vec::new();
        for m in messages {
            push_unique(&mut agg.device_ids, Some(&m.device_id));
            push_unique(&mut agg.asset_ids, m.asset_id.as_ref());
            push_unique(&mut agg.asset_types, m.asset_type.as_ref());
            push_unique(&mut agg.site_ids, m.site_id.as_ref());
            if let Some(p) = m.location {
                points.push(p);
            }
        }
        agg.location = LocationSummary::from_points(&points);
        agg
    }
}

fn push_unique(list: &mut Vec<String>, value: Option<&String>) {
    if let Some(v) = value {
        if !list.contains(v) {
            list.push(v.clone());
        }
    }
}

/// A persisted batch row (without its messages).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredBatch {
    pub id: BatchId,
    pub hash: ContentHash,
    pub message_count: usize,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub aggregates: BatchAggregates,
    pub anchor: AnchorRecord,
}
