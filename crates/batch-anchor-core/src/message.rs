//! Inbound stream entries and validated messages.
//!
//! [`StreamEntry`] mirrors the inbound stream contract: every field is
//! optional because the producer is untrusted. [`StreamEntry::into_message`]
//! is the ingestion boundary; it either yields a hashed [`Message`] or a
//! [`ValidationError`] explaining why the entry must be dropped.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::canonical::hash_message;
use crate::error::ValidationError;
use crate::types::ContentHash;

/// A WGS84 point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

impl GeoPoint {
    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lon.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lon)
    }
}

/// `receivedAt` as producers send it: ISO-8601 text or Unix milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawTimestamp {
    Millis(i64),
    Text(String),
}

impl RawTimestamp {
    fn parse(&self) -> Result<DateTime<Utc>, ValidationError> {
        match self {
            RawTimestamp::Millis(ms) => Utc
                .timestamp_millis_opt(*ms)
                .single()
                .ok_or_else(|| ValidationError::InvalidTimestamp(ms.to_string())),
            RawTimestamp::Text(s) => {
                let trimmed = s.trim();
                if let Ok(ms) = trimmed.parse::<i64>() {
                    return RawTimestamp::Millis(ms).parse();
                }
                DateTime::parse_from_rfc3339(trimmed)
                    .map(|dt| dt.with_timezone(&Utc))
                    .map_err(|_| ValidationError::InvalidTimestamp(s.clone()))
            }
        }
    }
}

/// One record from the inbound stream, before validation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamEntry {
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub payload: Option<Value>,
    #[serde(default)]
    pub received_at: Option<RawTimestamp>,
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub site_id: Option<String>,
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub asset_id: Option<String>,
    #[serde(default)]
    pub asset_type: Option<String>,
    #[serde(default)]
    pub location: Option<GeoPoint>,
}

/// A validated telemetry message. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub topic: Option<String>,
    pub payload: Value,
    pub received_at: DateTime<Utc>,
    pub device_id: String,
    pub tenant_id: Option<String>,
    pub site_id: Option<String>,
    pub asset_id: Option<String>,
    pub asset_type: Option<String>,
    pub location: Option<GeoPoint>,
    pub hash: ContentHash,
}

impl StreamEntry {
    /// Validate required fields and hash the entry into a [`Message`].
    ///
    /// Required: `deviceId`, `payload`, `receivedAt`. A payload delivered as
    /// text is parsed as JSON when possible and kept as a JSON string
    /// otherwise. A missing `messageId` is replaced by a fresh UUID.
    pub fn into_message(self) -> Result<Message, ValidationError> {
        let device_id = non_empty(self.device_id).ok_or(ValidationError::MissingField("deviceId"))?;

        let payload = match self.payload {
            None | Some(Value::Null) => return Err(ValidationError::MissingField("payload")),
            Some(Value::String(text)) if text.trim().is_empty() => {
                return Err(ValidationError::MissingField("payload"))
            }
            Some(Value::String(text)) => {
                serde_json::from_str(&text).unwrap_or(Value::String(text))
            }
            Some(other) => other,
        };

        let received_at = self
            .received_at
            .ok_or(ValidationError::MissingField("receivedAt"))?
            .parse()?;

        if let Some(loc) = &self.location {
            if !loc.is_valid() {
                return Err(ValidationError::InvalidLocation(format!(
                    "lat={} lon={}",
                    loc.lat, loc.lon
                )));
            }
        }

        let hash = hash_message(&device_id, &received_at, &payload);

        Ok(Message {
            id: non_empty(self.message_id).unwrap_or_else(|| Uuid::new_v4().to_string()),
            topic: non_empty(self.topic),
            payload,
            received_at,
            device_id,
            tenant_id: non_empty(self.tenant_id),
            site_id: non_empty(self.site_id),
            asset_id: non_empty(self.asset_id),
            asset_type: non_empty(self.asset_type),
            location: self.location,
            hash,
        })
    }
}

fn non_empty(s: Option<String>) -> Option<String> {
    s.filter(|v| !v.trim().is_empty())
}
