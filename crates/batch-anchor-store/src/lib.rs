//! # Batch Anchor Store
//!
//! Storage abstraction for sealed batches and their anchor status. Provides a
//! trait-based interface with SQLite and in-memory implementations.
//!
//! ## Key Types
//!
//! - [`BatchStore`] - The async trait for all storage operations
//! - [`SqliteStore`] - SQLite-based persistent storage
//! - [`MemoryStore`] - In-memory storage for tests
//! - [`Claim`] - A leased right to attempt anchoring one batch
//! - [`AnchorUpdate`] - The outcome of an anchoring attempt
//!
//! ## Usage
//!
//! ```rust,no_run
//! use batch_anchor_store::{BatchStore, SqliteStore};
//!
//! async fn example() {
//!     let store = SqliteStore::open("batches.db").unwrap();
//!     let recent = store.list_batches(10, 0).await.unwrap();
//!     for batch in recent {
//!         println!("{} {}", batch.id, batch.anchor.status);
//!     }
//! }
//! ```
//!
//! ## Design Notes
//!
//! - **Atomic batches**: a batch row and its message rows commit together
//! - **Idempotent saves**: saving the same batch twice returns `AlreadyExists`
//! - **Leases**: a claim expires, so a crashed worker never strands a batch
//! - **Sinks**: `confirmed` and `failed` rows are never updated again

pub mod error;
pub mod memory;
pub mod migration;
pub mod sqlite;
pub mod traits;

pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use traits::{AnchorStats, AnchorUpdate, BatchStore, Claim, ClaimScope, ClaimToken, SaveResult};
