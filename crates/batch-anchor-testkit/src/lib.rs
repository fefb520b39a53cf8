//! # Batch Anchor Testkit
//!
//! Testing utilities for the batch anchoring crates.
//!
//! - **Golden vectors**: fixed inputs with their expected message and batch
//!   hashes, pinning the canonical encoding
//! - **Generators**: proptest strategies for payloads and stream entries
//! - **Fixtures**: deterministic entries, batches, and worst-case aggregates
//!
//! ```rust
//! use batch_anchor_testkit::fixtures;
//!
//! let batch = fixtures::sealed_batch(10);
//! assert_eq!(batch.message_count(), 10);
//! ```

pub mod fixtures;
pub mod generators;
pub mod vectors;
