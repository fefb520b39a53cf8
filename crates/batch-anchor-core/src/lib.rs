//! # Batch Anchor Core
//!
//! Pure primitives for the batch anchoring pipeline: telemetry messages,
//! batches, anchor status, time windows, and canonical hashing.
//!
//! This crate contains no I/O, no storage, no networking. It is pure
//! computation over the data that the store, ledger, and service crates
//! move around.
//!
//! ## Key Types
//!
//! - [`StreamEntry`] - A raw record as delivered by the inbound stream
//! - [`Message`] - A validated, hashed telemetry message
//! - [`Batch`] - An open accumulation of messages
//! - [`SealedBatch`] - A closed batch with its content hash and aggregates
//! - [`AnchorStatus`] / [`AnchorRecord`] - Ledger anchoring state of a batch
//! - [`TimeWindow`] - A boundary-aligned half-open time interval
//!
//! ## Canonicalization
//!
//! Message and batch hashes are SHA-256 over a canonical textual form. See
//! the [`canonical`] module.

pub mod batch;
pub mod canonical;
pub mod error;
pub mod message;
pub mod types;
pub mod window;

pub use batch::{Batch, BatchAggregates, BoundingBox, LocationSummary, SealedBatch, StoredBatch};
pub use canonical::{canonical_json, format_timestamp, hash_batch, hash_message};
pub use error::{CoreError, ValidationError};
pub use message::{GeoPoint, Message, StreamEntry};
pub use types::{AnchorRecord, AnchorStatus, BatchId, ContentHash};
pub use window::TimeWindow;
