//! In-memory ledger for tests.
//!
//! Accepts signed memo transactions, confirms them immediately (unless told
//! to hold them), and serves them back. Every trait call is counted so tests
//! can assert that no network traffic happened.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use crate::client::{Commitment, ConfirmedTransaction, LedgerClient, SignatureStatus};
use crate::error::{LedgerError, Result};
use crate::transaction::{Pubkey, Transaction, LAMPORTS_PER_SOL};

const FEE_LAMPORTS: u64 = 5_000;

/// In-memory ledger implementation.
pub struct MemoryLedger {
    inner: Mutex<Inner>,
    calls: AtomicUsize,
}

struct Inner {
    balance: u64,
    slot: u64,
    unreachable: bool,
    send_failure: Option<String>,
    hold_confirmations: bool,
    transactions: HashMap<String, Vec<u8>>,
    sent: Vec<String>,
}

impl MemoryLedger {
    /// A reachable ledger where the wallet holds `balance` lamports.
    pub fn new(balance: u64) -> Self {
        Self {
            inner: Mutex::new(Inner {
                balance,
                slot: 1,
                unreachable: false,
                send_failure: None,
                hold_confirmations: false,
                transactions: HashMap::new(),
                sent: Vec::new(),
            }),
            calls: AtomicUsize::new(0),
        }
    }

    /// A ledger with one SOL in the wallet.
    pub fn funded() -> Self {
        Self::new(LAMPORTS_PER_SOL)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn enter(&self) -> Result<MutexGuard<'_, Inner>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let inner = self.lock();
        if inner.unreachable {
            return Err(LedgerError::Transport("connection refused".into()));
        }
        Ok(inner)
    }

    pub fn set_balance(&self, lamports: u64) {
        self.lock().balance = lamports;
    }

    /// Make every call fail with a connection error.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.lock().unreachable = unreachable;
    }

    /// Make `send_transaction` fail with this RPC message until cleared.
    pub fn fail_sends(&self, message: Option<&str>) {
        self.lock().send_failure = message.map(str::to_string);
    }

    /// Accept transactions but never report them confirmed.
    pub fn hold_confirmations(&self, hold: bool) {
        self.lock().hold_confirmations = hold;
    }

    /// Number of trait calls made so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn reset_calls(&self) {
        self.calls.store(0, Ordering::SeqCst);
    }

    /// Signatures of accepted transactions, in submission order.
    pub fn sent(&self) -> Vec<String> {
        self.lock().sent.clone()
    }

    /// Memo carried by an accepted transaction.
    pub fn memo(&self, signature: &str) -> Option<Vec<u8>> {
        let inner = self.lock();
        let wire = inner.transactions.get(signature)?;
        let tx = Transaction::deserialize(wire).ok()?;
        tx.memo_data().map(<[u8]>::to_vec)
    }
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::funded()
    }
}

#[async_trait]
impl LedgerClient for MemoryLedger {
    async fn block_height(&self) -> Result<u64> {
        let inner = self.enter()?;
        Ok(inner.slot)
    }

    async fn balance(&self, _account: &Pubkey) -> Result<u64> {
        let inner = self.enter()?;
        Ok(inner.balance)
    }

    async fn latest_blockhash(&self) -> Result<[u8; 32]> {
        let inner = self.enter()?;
        let mut hash = [0u8; 32];
        hash[..8].copy_from_slice(&inner.slot.to_le_bytes());
        Ok(hash)
    }

    async fn send_transaction(&self, wire: &[u8]) -> Result<String> {
        let mut inner = self.enter()?;
        if let Some(message) = &inner.send_failure {
            return Err(LedgerError::Rpc {
                code: -32002,
                message: message.clone(),
            });
        }

        let tx = Transaction::deserialize(wire)?;
        tx.verify()?;
        if tx.memo_data().is_none() {
            return Err(LedgerError::Rpc {
                code: -32602,
                message: "invalid transaction: no memo instruction".into(),
            });
        }
        if inner.balance < FEE_LAMPORTS {
            return Err(LedgerError::Rpc {
                code: -32002,
                message: "Attempt to debit an account: insufficient funds for fee".into(),
            });
        }

        let signature = tx
            .id()
            .ok_or_else(|| LedgerError::Decode("unsigned transaction".into()))?;
        inner.balance -= FEE_LAMPORTS;
        inner.slot += 1;
        inner.transactions.insert(signature.clone(), wire.to_vec());
        inner.sent.push(signature.clone());
        Ok(signature)
    }

    async fn signature_status(&self, signature: &str) -> Result<Option<SignatureStatus>> {
        let inner = self.enter()?;
        if !inner.transactions.contains_key(signature) {
            return Ok(None);
        }
        let confirmation_status = if inner.hold_confirmations {
            Commitment::Processed
        } else {
            Commitment::Confirmed
        };
        Ok(Some(SignatureStatus {
            slot: inner.slot,
            confirmation_status: Some(confirmation_status),
            err: None,
        }))
    }

    async fn get_transaction(&self, signature: &str) -> Result<Option<ConfirmedTransaction>> {
        let inner = self.enter()?;
        Ok(inner
            .transactions
            .get(signature)
            .map(|wire| ConfirmedTransaction {
                slot: inner.slot,
                block_time: Some(1_736_870_400),
                fee: FEE_LAMPORTS,
                transaction: wire.clone(),
            }))
    }
}
