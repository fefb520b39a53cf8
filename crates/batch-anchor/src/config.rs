//! Service configuration.
//!
//! [`AnchorConfig`] is the typed configuration the components are built
//! from. [`ServiceConfig`] is its flat environment form: every setting is a
//! `BATCH_ANCHOR_*` variable with a default, converted and validated by
//! [`ServiceConfig::into_anchor_config`].

use std::path::PathBuf;
use std::time::Duration;

use batch_anchor_ledger::record::MAX_NETWORK_BYTES;
use batch_anchor_ledger::{AnchoringConfig, OversizePolicy, LAMPORTS_PER_SOL, MAX_RECORD_BYTES};
use config::{Config, Environment};
use serde::{Deserialize, Serialize};

use crate::error::{AnchorError, Result};

/// When an open batch is closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchingConfig {
    /// Close as soon as the batch holds this many messages.
    pub size_threshold: usize,
    /// Close once the batch has been open this long.
    pub timeout: Duration,
    /// Longest single wait on the message source.
    pub poll_wait: Duration,
    /// Wait between attempts to persist a closed batch.
    pub commit_backoff: Duration,
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            size_threshold: 1000,
            timeout: Duration::from_secs(300),
            poll_wait: Duration::from_secs(1),
            commit_backoff: Duration::from_secs(5),
        }
    }
}

/// Retry reconciliation of `pending` batches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcilerConfig {
    pub interval: Duration,
    /// Attempts allowed per batch before it is failed for good.
    pub max_retries: u32,
    /// Batches taken per pass.
    pub batch_limit: usize,
    /// Pause between consecutive attempts within a pass.
    pub pacing: Duration,
    /// Delay before the first pass after start.
    pub startup_delay: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            max_retries: 10,
            batch_limit: 10,
            pacing: Duration::from_secs(1),
            startup_delay: Duration::from_secs(5),
        }
    }
}

/// Window-aligned first attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub window: Duration,
    pub pacing: Duration,
    /// Process the last elapsed window right after start.
    pub record_on_startup: bool,
    /// Earlier windows swept again on each tick.
    pub catch_up_windows: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window: Duration::from_secs(600),
            pacing: Duration::from_secs(1),
            record_on_startup: false,
            catch_up_windows: 1,
        }
    }
}

/// Ledger connection and anchoring policy.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerConfig {
    pub rpc_url: String,
    pub network: String,
    /// Base58 64-byte wallet secret.
    pub keypair: Option<String>,
    pub byte_budget: usize,
    pub min_balance_lamports: u64,
    pub low_balance_sol: f64,
    pub critical_balance_sol: f64,
    pub confirm_timeout: Duration,
    pub poll_interval: Duration,
    pub request_timeout: Duration,
    pub oversize_policy: OversizePolicy,
}

impl LedgerConfig {
    /// Longest a single anchoring attempt can take: fetching a blockhash,
    /// sending, then polling until the confirmation deadline.
    pub fn attempt_budget(&self) -> Duration {
        self.confirm_timeout + self.request_timeout * 2
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            rpc_url: "https://api.devnet.solana.com".into(),
            network: "devnet".into(),
            keypair: None,
            byte_budget: MAX_RECORD_BYTES,
            min_balance_lamports: 10_000,
            low_balance_sol: 0.1,
            critical_balance_sol: 0.05,
            confirm_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_millis(500),
            request_timeout: Duration::from_secs(30),
            oversize_policy: OversizePolicy::Fail,
        }
    }
}

/// Anchoring claims.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimConfig {
    /// How long a claimed batch is withheld from other claimants.
    pub lease: Duration,
}

impl Default for ClaimConfig {
    fn default() -> Self {
        Self {
            lease: Duration::from_secs(600),
        }
    }
}

/// Complete service configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnchorConfig {
    pub batching: BatchingConfig,
    pub reconciler: ReconcilerConfig,
    pub scheduler: SchedulerConfig,
    pub ledger: LedgerConfig,
    pub claim: ClaimConfig,
    /// SQLite database file. `None` keeps everything in memory.
    pub database_path: Option<PathBuf>,
}

impl AnchorConfig {
    /// Reject settings the components cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.batching.size_threshold == 0 {
            return invalid("batch size threshold must be at least 1");
        }
        if self.batching.timeout.is_zero() {
            return invalid("batch timeout must be positive");
        }
        if self.scheduler.window.is_zero() {
            return invalid("scheduler window must be positive");
        }
        if self.reconciler.interval.is_zero() {
            return invalid("reconciler interval must be positive");
        }
        if self.reconciler.max_retries == 0 {
            return invalid("max retries must be at least 1");
        }
        if self.claim.lease <= self.ledger.attempt_budget() {
            return invalid(&format!(
                "claim lease ({}s) must exceed the worst-case attempt ({}s)",
                self.claim.lease.as_secs(),
                self.ledger.attempt_budget().as_secs()
            ));
        }
        if self.ledger.network.is_empty() || self.ledger.network.len() > MAX_NETWORK_BYTES {
            return invalid(&format!(
                "network name must be 1..={MAX_NETWORK_BYTES} bytes, got {:?}",
                self.ledger.network
            ));
        }
        if self.ledger.byte_budget == 0 || self.ledger.byte_budget > MAX_RECORD_BYTES {
            return invalid(&format!(
                "byte budget must be 1..={MAX_RECORD_BYTES}, got {}",
                self.ledger.byte_budget
            ));
        }
        if self.ledger.critical_balance_sol > self.ledger.low_balance_sol {
            return invalid("critical balance threshold exceeds the low threshold");
        }
        Ok(())
    }

    /// Settings for the anchoring client.
    pub fn anchoring(&self) -> AnchoringConfig {
        AnchoringConfig {
            network: self.ledger.network.clone(),
            byte_budget: self.ledger.byte_budget,
            min_balance_lamports: self.ledger.min_balance_lamports,
            low_balance_lamports: sol_to_lamports(self.ledger.low_balance_sol),
            critical_balance_lamports: sol_to_lamports(self.ledger.critical_balance_sol),
            confirm_timeout: self.ledger.confirm_timeout,
            poll_interval: self.ledger.poll_interval,
            oversize_policy: self.ledger.oversize_policy,
            ..AnchoringConfig::default()
        }
    }
}

fn invalid(reason: &str) -> Result<()> {
    Err(AnchorError::Config(reason.to_string()))
}

fn sol_to_lamports(sol: f64) -> u64 {
    (sol * LAMPORTS_PER_SOL as f64).round().max(0.0) as u64
}

/// Flat settings loaded from `BATCH_ANCHOR_*` environment variables.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServiceConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Emit logs as JSON lines
    #[serde(default)]
    pub log_json: bool,

    /// SQLite file; empty keeps the store in memory
    #[serde(default = "default_database_path")]
    pub database_path: String,

    // Batching
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_batch_timeout_secs")]
    pub batch_timeout_secs: u64,

    #[serde(default = "default_source_wait_ms")]
    pub source_wait_ms: u64,

    // Reconciler
    #[serde(default = "default_reconciler_interval_secs")]
    pub reconciler_interval_secs: u64,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_reconciler_batch_limit")]
    pub reconciler_batch_limit: usize,

    #[serde(default = "default_pacing_ms")]
    pub pacing_ms: u64,

    // Scheduler
    #[serde(default = "default_true")]
    pub scheduler_enabled: bool,

    #[serde(default = "default_scheduler_window_secs")]
    pub scheduler_window_secs: u64,

    #[serde(default)]
    pub record_on_startup: bool,

    #[serde(default = "default_catch_up_windows")]
    pub scheduler_catch_up_windows: u32,

    // Ledger
    #[serde(default = "default_rpc_url")]
    pub rpc_url: String,

    #[serde(default = "default_network")]
    pub network: String,

    /// Base58 wallet secret (required)
    #[serde(default)]
    pub wallet_secret: Option<String>,

    #[serde(default = "default_byte_budget")]
    pub byte_budget: usize,

    #[serde(default = "default_min_balance_lamports")]
    pub min_balance_lamports: u64,

    #[serde(default = "default_low_balance_sol")]
    pub low_balance_sol: f64,

    #[serde(default = "default_critical_balance_sol")]
    pub critical_balance_sol: f64,

    #[serde(default = "default_confirm_timeout_secs")]
    pub confirm_timeout_secs: u64,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// `fail` or `drop_auxiliary`
    #[serde(default = "default_oversize_policy")]
    pub oversize_policy: String,

    // Claims
    #[serde(default = "default_claim_lease_secs")]
    pub claim_lease_secs: u64,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_database_path() -> String {
    "batch-anchor.db".to_string()
}

fn default_batch_size() -> usize {
    1000
}

fn default_batch_timeout_secs() -> u64 {
    300
}

fn default_source_wait_ms() -> u64 {
    1000
}

fn default_reconciler_interval_secs() -> u64 {
    300
}

fn default_max_retries() -> u32 {
    10
}

fn default_reconciler_batch_limit() -> usize {
    10
}

fn default_pacing_ms() -> u64 {
    1000
}

fn default_true() -> bool {
    true
}

fn default_scheduler_window_secs() -> u64 {
    600
}

fn default_catch_up_windows() -> u32 {
    1
}

fn default_rpc_url() -> String {
    "https://api.devnet.solana.com".to_string()
}

fn default_network() -> String {
    "devnet".to_string()
}

fn default_byte_budget() -> usize {
    MAX_RECORD_BYTES
}

fn default_min_balance_lamports() -> u64 {
    10_000
}

fn default_low_balance_sol() -> f64 {
    0.1
}

fn default_critical_balance_sol() -> f64 {
    0.05
}

fn default_confirm_timeout_secs() -> u64 {
    60
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_oversize_policy() -> String {
    "fail".to_string()
}

fn default_claim_lease_secs() -> u64 {
    600
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Config::builder()
            .add_source(Environment::with_prefix("BATCH_ANCHOR"))
            .build()?
            .try_deserialize()?)
    }

    /// Convert to the typed configuration. A wallet secret is required.
    pub fn into_anchor_config(self) -> Result<AnchorConfig> {
        let keypair = match self.wallet_secret {
            Some(secret) if !secret.trim().is_empty() => secret.trim().to_string(),
            _ => {
                return Err(AnchorError::Config(
                    "BATCH_ANCHOR_WALLET_SECRET is required".into(),
                ))
            }
        };

        let oversize_policy = match self.oversize_policy.as_str() {
            "fail" => OversizePolicy::Fail,
            "drop_auxiliary" => OversizePolicy::DropAuxiliary,
            other => {
                return Err(AnchorError::Config(format!(
                    "unknown oversize policy {other:?}"
                )))
            }
        };

        let pacing = Duration::from_millis(self.pacing_ms);
        let defaults = AnchorConfig::default();
        let config = AnchorConfig {
            batching: BatchingConfig {
                size_threshold: self.batch_size,
                timeout: Duration::from_secs(self.batch_timeout_secs),
                poll_wait: Duration::from_millis(self.source_wait_ms),
                ..defaults.batching
            },
            reconciler: ReconcilerConfig {
                interval: Duration::from_secs(self.reconciler_interval_secs),
                max_retries: self.max_retries,
                batch_limit: self.reconciler_batch_limit,
                pacing,
                ..defaults.reconciler
            },
            scheduler: SchedulerConfig {
                enabled: self.scheduler_enabled,
                window: Duration::from_secs(self.scheduler_window_secs),
                pacing,
                record_on_startup: self.record_on_startup,
                catch_up_windows: self.scheduler_catch_up_windows,
            },
            ledger: LedgerConfig {
                rpc_url: self.rpc_url,
                network: self.network,
                keypair: Some(keypair),
                byte_budget: self.byte_budget,
                min_balance_lamports: self.min_balance_lamports,
                low_balance_sol: self.low_balance_sol,
                critical_balance_sol: self.critical_balance_sol,
                confirm_timeout: Duration::from_secs(self.confirm_timeout_secs),
                request_timeout: Duration::from_secs(self.request_timeout_secs),
                oversize_policy,
                ..defaults.ledger
            },
            claim: ClaimConfig {
                lease: Duration::from_secs(self.claim_lease_secs),
            },
            database_path: match self.database_path.trim() {
                "" => None,
                path => Some(PathBuf::from(path)),
            },
        };
        config.validate()?;
        Ok(config)
    }
}
