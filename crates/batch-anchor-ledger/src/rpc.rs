//! Solana JSON-RPC implementation of [`LedgerClient`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::client::{ConfirmedTransaction, LedgerClient, SignatureStatus};
use crate::error::{LedgerError, Result};
use crate::transaction::Pubkey;

const COMMITMENT: &str = "confirmed";

/// HTTP JSON-RPC client for a Solana node.
pub struct SolanaRpc {
    http: Client,
    url: String,
    next_id: AtomicU64,
}

#[derive(Deserialize)]
struct RpcEnvelope {
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<RpcErrorObject>,
}

#[derive(Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

#[derive(Deserialize)]
struct WithContext<T> {
    value: T,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BlockhashValue {
    blockhash: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcTransaction {
    slot: u64,
    #[serde(default)]
    block_time: Option<i64>,
    meta: Option<RpcMeta>,
    /// `[data, encoding]`
    transaction: (String, String),
}

#[derive(Deserialize)]
struct RpcMeta {
    fee: u64,
}

impl SolanaRpc {
    /// Create a client for `url` with a per-request timeout.
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            url: url.into(),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        tracing::trace!(method, id, "rpc request");
        let response = self.http.post(&self.url).json(&body).send().await?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(LedgerError::Rpc {
                code: 429,
                message: "429 Too Many Requests".into(),
            });
        }
        if !status.is_success() {
            return Err(LedgerError::Transport(format!("{method}: HTTP {status}")));
        }

        let envelope: RpcEnvelope = response.json().await?;
        if let Some(err) = envelope.error {
            return Err(LedgerError::Rpc {
                code: err.code,
                message: err.message,
            });
        }
        serde_json::from_value(envelope.result)
            .map_err(|e| LedgerError::Decode(format!("{method}: {e}")))
    }
}

#[async_trait]
impl LedgerClient for SolanaRpc {
    async fn block_height(&self) -> Result<u64> {
        self.call("getBlockHeight", json!([{ "commitment": COMMITMENT }]))
            .await
    }

    async fn balance(&self, account: &Pubkey) -> Result<u64> {
        let r: WithContext<u64> = self
            .call(
                "getBalance",
                json!([account.to_base58(), { "commitment": COMMITMENT }]),
            )
            .await?;
        Ok(r.value)
    }

    async fn latest_blockhash(&self) -> Result<[u8; 32]> {
        let r: WithContext<BlockhashValue> = self
            .call("getLatestBlockhash", json!([{ "commitment": COMMITMENT }]))
            .await?;
        let hash: Pubkey = r.value.blockhash.parse()?;
        Ok(hash.0)
    }

    async fn send_transaction(&self, wire: &[u8]) -> Result<String> {
        self.call(
            "sendTransaction",
            json!([
                BASE64.encode(wire),
                {
                    "encoding": "base64",
                    "skipPreflight": false,
                    "preflightCommitment": COMMITMENT,
                    "maxRetries": 3
                }
            ]),
        )
        .await
    }

    async fn signature_status(&self, signature: &str) -> Result<Option<SignatureStatus>> {
        let r: WithContext<Vec<Option<SignatureStatus>>> = self
            .call(
                "getSignatureStatuses",
                json!([[signature], { "searchTransactionHistory": true }]),
            )
            .await?;
        Ok(r.value.into_iter().next().flatten())
    }

    async fn get_transaction(&self, signature: &str) -> Result<Option<ConfirmedTransaction>> {
        let r: Option<RpcTransaction> = self
            .call(
                "getTransaction",
                json!([
                    signature,
                    {
                        "encoding": "base64",
                        "commitment": COMMITMENT,
                        "maxSupportedTransactionVersion": 0
                    }
                ]),
            )
            .await?;

        let Some(tx) = r else {
            return Ok(None);
        };
        let (data, encoding) = tx.transaction;
        if encoding != "base64" {
            return Err(LedgerError::Decode(format!("unexpected encoding {encoding}")));
        }
        let transaction = BASE64
            .decode(data)
            .map_err(|e| LedgerError::Decode(format!("transaction base64: {e}")))?;

        Ok(Some(ConfirmedTransaction {
            slot: tx.slot,
            block_time: tx.block_time,
            fee: tx.meta.map(|m| m.fee).unwrap_or(0),
            transaction,
        }))
    }
}
