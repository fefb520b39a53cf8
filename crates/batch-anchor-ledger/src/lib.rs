//! # Batch Anchor Ledger
//!
//! Anchors batch proofs on a public ledger and reads them back.
//!
//! ## Key Types
//!
//! - [`AnchoringClient`] - record, verify, and health-check batch proofs
//! - [`LedgerClient`] - the network seam to a ledger node
//! - [`SolanaRpc`] - JSON-RPC implementation of [`LedgerClient`]
//! - [`MemoryLedger`] - in-memory implementation for tests
//! - [`ProofRecord`] / [`CompactRecord`] - readable and wire forms of a proof
//! - [`AnchorErrorKind`] - classification of failed attempts
//!
//! ## Design Notes
//!
//! - **Byte budget**: a memo holds at most 566 bytes. Identifier lists in
//!   the auxiliary block are capped by count and by escaped length so that
//!   the worst case always fits.
//! - **Health gate**: an unhealthy client fails `record_batch` as retryable
//!   without any network call.
//! - **No errors out of `record_batch`**: every failure is classified into a
//!   [`RecordOutcome`] for the caller to persist.

pub mod anchor;
pub mod client;
pub mod error;
pub mod memory;
pub mod record;
pub mod rpc;
pub mod transaction;

pub use anchor::{
    explorer_url, AnchoringClient, AnchoringConfig, BalanceTier, HealthReport, OversizePolicy,
    RecordFailure, RecordOutcome, VerifiedRecord,
};
pub use client::{Commitment, ConfirmedTransaction, LedgerClient, SignatureStatus};
pub use error::{AnchorErrorKind, LedgerError, Result};
pub use memory::MemoryLedger;
pub use record::{expand, CompactRecord, Origin, ProofRecord, MAX_RECORD_BYTES};
pub use rpc::SolanaRpc;
pub use transaction::{Keypair, Pubkey, Transaction, LAMPORTS_PER_SOL, MEMO_PROGRAM_ID};
