//! Anchoring client: turns stored batches into ledger proofs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use batch_anchor_core::StoredBatch;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::client::LedgerClient;
use crate::error::{AnchorErrorKind, LedgerError, Result};
use crate::record::{decode_memo, Origin, ProofRecord, MAX_RECORD_BYTES};
use crate::transaction::{Keypair, Transaction, LAMPORTS_PER_SOL};

/// What to do when a record exceeds the byte budget.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OversizePolicy {
    /// Fail the batch permanently.
    #[default]
    Fail,
    /// Re-encode without the auxiliary block, then fail if still too big.
    DropAuxiliary,
}

/// Anchoring client settings.
#[derive(Debug, Clone)]
pub struct AnchoringConfig {
    /// Network name recorded in proofs and used for explorer links.
    pub network: String,
    pub byte_budget: usize,
    /// Below this the client reports unhealthy.
    pub min_balance_lamports: u64,
    pub low_balance_lamports: u64,
    pub critical_balance_lamports: u64,
    /// Lamports moved by the self-transfer.
    pub transfer_lamports: u64,
    pub confirm_timeout: Duration,
    pub poll_interval: Duration,
    pub oversize_policy: OversizePolicy,
}

impl Default for AnchoringConfig {
    fn default() -> Self {
        Self {
            network: "devnet".to_string(),
            byte_budget: MAX_RECORD_BYTES,
            min_balance_lamports: 10_000,
            low_balance_lamports: LAMPORTS_PER_SOL / 10,
            critical_balance_lamports: LAMPORTS_PER_SOL / 20,
            transfer_lamports: 1,
            confirm_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_millis(500),
            oversize_policy: OversizePolicy::Fail,
        }
    }
}

/// Wallet balance tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BalanceTier {
    Ok,
    Low,
    Critical,
    Unknown,
}

/// Result of a health check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub healthy: bool,
    pub connected: bool,
    pub block_height: Option<u64>,
    pub wallet: String,
    pub balance_lamports: Option<u64>,
    pub balance_sol: Option<f64>,
    pub balance_status: BalanceTier,
    pub network: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Why an attempt did not confirm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordFailure {
    pub kind: AnchorErrorKind,
    pub message: String,
}

impl RecordFailure {
    fn new(kind: AnchorErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

impl From<LedgerError> for RecordFailure {
    fn from(e: LedgerError) -> Self {
        Self::new(e.kind(), e.to_string())
    }
}

/// Outcome of [`AnchoringClient::record_batch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    Confirmed { signature: String, duration: Duration },
    Failed { failure: RecordFailure, duration: Duration },
}

impl RecordOutcome {
    pub fn is_confirmed(&self) -> bool {
        matches!(self, RecordOutcome::Confirmed { .. })
    }
}

/// A proof read back from the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifiedRecord {
    pub signature: String,
    pub record: ProofRecord,
    pub block_time: Option<DateTime<Utc>>,
    pub slot: u64,
    pub fee: u64,
    pub explorer_url: String,
}

/// Submits and verifies batch proofs.
///
/// Health is cached: [`check_health`](Self::check_health) refreshes it and
/// `record_batch` refuses to touch the network while it is unhealthy. A
/// new client starts unhealthy until its first check.
pub struct AnchoringClient {
    ledger: Arc<dyn LedgerClient>,
    wallet: Keypair,
    config: AnchoringConfig,
    healthy: AtomicBool,
}

impl AnchoringClient {
    pub fn new(ledger: Arc<dyn LedgerClient>, wallet: Keypair, config: AnchoringConfig) -> Self {
        tracing::info!(
            wallet = %wallet.pubkey(),
            network = %config.network,
            "anchoring client created"
        );
        Self {
            ledger,
            wallet,
            config,
            healthy: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &AnchoringConfig {
        &self.config
    }

    pub fn wallet_address(&self) -> String {
        self.wallet.pubkey().to_base58()
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    fn origin(&self) -> Origin {
        Origin {
            wallet: self.wallet_address(),
            network: self.config.network.clone(),
        }
    }

    /// Tier for a balance in lamports.
    pub fn balance_tier(&self, lamports: u64) -> BalanceTier {
        if lamports < self.config.critical_balance_lamports {
            BalanceTier::Critical
        } else if lamports < self.config.low_balance_lamports {
            BalanceTier::Low
        } else {
            BalanceTier::Ok
        }
    }

    /// Probe connectivity and balance, and update the cached health.
    pub async fn check_health(&self) -> HealthReport {
        let mut report = HealthReport {
            healthy: false,
            connected: false,
            block_height: None,
            wallet: self.wallet_address(),
            balance_lamports: None,
            balance_sol: None,
            balance_status: BalanceTier::Unknown,
            network: self.config.network.clone(),
            error: None,
        };

        let probe = async {
            let height = self.ledger.block_height().await?;
            let balance = self.ledger.balance(&self.wallet.pubkey()).await?;
            Ok::<_, LedgerError>((height, balance))
        };

        match probe.await {
            Ok((height, balance)) => {
                report.connected = true;
                report.block_height = Some(height);
                report.balance_lamports = Some(balance);
                report.balance_sol = Some(balance as f64 / LAMPORTS_PER_SOL as f64);
                report.balance_status = self.balance_tier(balance);
                report.healthy = balance >= self.config.min_balance_lamports;
                if !report.healthy {
                    report.error = Some(format!(
                        "balance {balance} lamports below minimum {}",
                        self.config.min_balance_lamports
                    ));
                }
                if report.balance_status != BalanceTier::Ok {
                    tracing::warn!(balance, tier = ?report.balance_status, "wallet balance low");
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "ledger health check failed");
                report.error = Some(e.to_string());
            }
        }

        let was = self.healthy.swap(report.healthy, Ordering::AcqRel);
        if was != report.healthy {
            tracing::info!(healthy = report.healthy, "ledger health changed");
        }
        report
    }

    /// Encode the proof for `batch` within the byte budget.
    pub fn encode_record(
        &self,
        batch: &StoredBatch,
        created_at: DateTime<Utc>,
    ) -> std::result::Result<Vec<u8>, RecordFailure> {
        let record = ProofRecord::for_batch(batch, created_at, self.origin());
        let bytes = record.encode()?;
        if bytes.len() <= self.config.byte_budget {
            return Ok(bytes);
        }

        if self.config.oversize_policy == OversizePolicy::DropAuxiliary && record.asset.is_some() {
            let slim = record.without_asset().encode()?;
            if slim.len() <= self.config.byte_budget {
                tracing::warn!(
                    batch_id = %batch.id,
                    size = bytes.len(),
                    reduced = slim.len(),
                    "proof record over budget, dropped auxiliary block"
                );
                return Ok(slim);
            }
        }

        tracing::error!(
            batch_id = %batch.id,
            size = bytes.len(),
            budget = self.config.byte_budget,
            "proof record exceeds byte budget"
        );
        Err(RecordFailure::new(
            AnchorErrorKind::PayloadTooLarge,
            format!(
                "record is {} bytes, budget is {}",
                bytes.len(),
                self.config.byte_budget
            ),
        ))
    }

    /// Anchor one batch and wait for confirmation.
    ///
    /// Never returns an error: every failure is classified into the outcome.
    pub async fn record_batch(
        &self,
        batch: &StoredBatch,
        created_at: DateTime<Utc>,
    ) -> RecordOutcome {
        let started = Instant::now();

        if !self.is_healthy() {
            tracing::warn!(batch_id = %batch.id, "ledger unhealthy, not submitting");
            return RecordOutcome::Failed {
                failure: RecordFailure::new(
                    AnchorErrorKind::ClientUnhealthy,
                    "ledger client unhealthy",
                ),
                duration: started.elapsed(),
            };
        }

        let memo = match self.encode_record(batch, created_at) {
            Ok(memo) => memo,
            Err(failure) => {
                return RecordOutcome::Failed {
                    failure,
                    duration: started.elapsed(),
                }
            }
        };

        tracing::info!(
            batch_id = %batch.id,
            count = batch.message_count,
            size = memo.len(),
            "recording batch on ledger"
        );

        match self.submit(&memo).await {
            Ok(signature) => {
                let duration = started.elapsed();
                tracing::info!(
                    batch_id = %batch.id,
                    signature = %signature,
                    duration_ms = duration.as_millis() as u64,
                    "batch anchored"
                );
                RecordOutcome::Confirmed { signature, duration }
            }
            Err(failure) => {
                let duration = started.elapsed();
                tracing::warn!(
                    batch_id = %batch.id,
                    kind = %failure.kind,
                    error = %failure.message,
                    duration_ms = duration.as_millis() as u64,
                    "anchoring attempt failed"
                );
                RecordOutcome::Failed { failure, duration }
            }
        }
    }

    async fn submit(&self, memo: &[u8]) -> std::result::Result<String, RecordFailure> {
        let blockhash = self.ledger.latest_blockhash().await?;
        let tx = Transaction::memo(&self.wallet, blockhash, memo, self.config.transfer_lamports)?;
        let wire = tx.serialize()?;
        let signature = self.ledger.send_transaction(&wire).await?;
        self.await_confirmation(&signature).await?;
        Ok(signature)
    }

    async fn await_confirmation(&self, signature: &str) -> std::result::Result<(), RecordFailure> {
        let deadline = tokio::time::Instant::now() + self.config.confirm_timeout;
        loop {
            if let Some(status) = self.ledger.signature_status(signature).await? {
                if let Some(err) = status.err {
                    return Err(RecordFailure::new(
                        AnchorErrorKind::InvalidTransaction,
                        format!("transaction failed: {err}"),
                    ));
                }
                if status.is_confirmed() {
                    return Ok(());
                }
            }
            if tokio::time::Instant::now() + self.config.poll_interval > deadline {
                return Err(LedgerError::Timeout(format!(
                    "confirmation of {signature} timed out after {:?}",
                    self.config.confirm_timeout
                ))
                .into());
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    /// Fetch a transaction and decode the proof in its memo.
    pub async fn verify_batch(&self, signature: &str) -> Result<VerifiedRecord> {
        let confirmed = self
            .ledger
            .get_transaction(signature)
            .await?
            .ok_or_else(|| LedgerError::NotFound(signature.to_string()))?;

        let tx = Transaction::deserialize(&confirmed.transaction)?;
        let memo = tx
            .memo_data()
            .ok_or_else(|| LedgerError::Decode("memo instruction not found".into()))?;
        let record = decode_memo(memo)?;

        Ok(VerifiedRecord {
            signature: signature.to_string(),
            record,
            block_time: confirmed
                .block_time
                .and_then(|t| Utc.timestamp_opt(t, 0).single()),
            slot: confirmed.slot,
            fee: confirmed.fee,
            explorer_url: self.explorer_url(signature),
        })
    }

    /// Block explorer link for a signature.
    pub fn explorer_url(&self, signature: &str) -> String {
        explorer_url(&self.config.network, signature)
    }
}

/// Block explorer link for a signature on `network`.
pub fn explorer_url(network: &str, signature: &str) -> String {
    match network {
        "mainnet" | "mainnet-beta" => format!("https://explorer.solana.com/tx/{signature}"),
        cluster => format!("https://explorer.solana.com/tx/{signature}?cluster={cluster}"),
    }
}
