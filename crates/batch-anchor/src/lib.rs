//! # Batch Anchor
//!
//! Turns a telemetry stream into hashed batches and anchors a compact proof
//! of each batch on a public ledger.
//!
//! ## Overview
//!
//! ```text
//! stream -> Accumulator -> BatchStore -> [Scheduler / Reconciler] -> AnchoringClient -> BatchStore
//! ```
//!
//! - **Accumulator**: validates and hashes entries, closes batches by size
//!   or age, persists them atomically, and acknowledges entries only after
//!   the batch is durable.
//! - **Scheduler**: at each window boundary, anchors the batches that
//!   started in the window that just elapsed.
//! - **Reconciler**: periodically retries `pending` batches until they
//!   confirm or exhaust their retry budget.
//!
//! Both anchoring paths claim a batch in the store before submitting it, so
//! they never anchor the same batch concurrently. `confirmed` and `failed`
//! are terminal.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use batch_anchor::{AnchorConfig, AnchorService, SystemClock};
//! use batch_anchor::ledger::{Keypair, MemoryLedger};
//! use batch_anchor::source::MemorySource;
//! use batch_anchor::store::MemoryStore;
//!
//! async fn example() -> batch_anchor::Result<()> {
//!     let service = AnchorService::new(
//!         AnchorConfig::default(),
//!         Arc::new(MemoryStore::new()),
//!         Arc::new(MemoryLedger::funded()),
//!         Keypair::generate(),
//!         Arc::new(SystemClock),
//!     )?;
//!
//!     let source = Arc::new(MemorySource::new());
//!     let handle = service.start(source).await;
//!     // ... push entries into the source ...
//!     handle.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Re-exports
//!
//! - `batch_anchor::core` - Messages, batches, hashing, windows
//! - `batch_anchor::store` - Batch persistence (SQLite and in-memory)
//! - `batch_anchor::ledger` - Proof records and the Solana anchoring client

pub mod accumulator;
pub mod anchoring;
pub mod clock;
pub mod config;
pub mod error;
pub mod reconciler;
pub mod scheduler;
pub mod service;
pub mod source;
pub mod telemetry;

// Re-export component crates
pub use batch_anchor_core as core;
pub use batch_anchor_ledger as ledger;
pub use batch_anchor_store as store;

pub use accumulator::{Accumulator, IngestStats};
pub use anchoring::{AnchorWorker, Disposition, PassOutcome, PassReport, WorkerStats};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{AnchorConfig, ServiceConfig};
pub use error::{AnchorError, Result};
pub use reconciler::Reconciler;
pub use scheduler::{Scheduler, SchedulerStatus};
pub use service::{AnchorService, BatchVerification, FieldMatches, ServiceHandle, ServiceStats};
pub use source::{Delivery, DeliveryId, JsonLinesSource, MemorySource, MessageSource};
