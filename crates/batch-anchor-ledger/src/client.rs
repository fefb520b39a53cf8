//! Network seam between the anchoring client and a ledger node.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::transaction::Pubkey;

/// Commitment level reported for a signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Commitment {
    Processed,
    Confirmed,
    Finalized,
}

/// Status of a submitted transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureStatus {
    pub slot: u64,
    #[serde(default)]
    pub confirmation_status: Option<Commitment>,
    /// Execution error, if the transaction landed but failed.
    #[serde(default)]
    pub err: Option<serde_json::Value>,
}

impl SignatureStatus {
    pub fn is_confirmed(&self) -> bool {
        matches!(
            self.confirmation_status,
            Some(Commitment::Confirmed) | Some(Commitment::Finalized)
        )
    }
}

/// A transaction fetched back from the ledger.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfirmedTransaction {
    pub slot: u64,
    /// Unix seconds, when the node knows it.
    pub block_time: Option<i64>,
    pub fee: u64,
    /// Wire bytes of the transaction.
    pub transaction: Vec<u8>,
}

/// Ledger node operations used by anchoring.
///
/// Implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Current block height; doubles as a connectivity probe.
    async fn block_height(&self) -> Result<u64>;

    /// Balance of an account in lamports.
    async fn balance(&self, account: &Pubkey) -> Result<u64>;

    /// Recent blockhash to reference in a new transaction.
    async fn latest_blockhash(&self) -> Result<[u8; 32]>;

    /// Submit a signed transaction; returns its signature.
    async fn send_transaction(&self, wire: &[u8]) -> Result<String>;

    /// Status of a signature, `None` while the node has not seen it.
    async fn signature_status(&self, signature: &str) -> Result<Option<SignatureStatus>>;

    /// Fetch a confirmed transaction, `None` if absent.
    async fn get_transaction(&self, signature: &str) -> Result<Option<ConfirmedTransaction>>;
}
