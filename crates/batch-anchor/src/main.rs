//! `batch-anchord`: reads newline-delimited JSON stream entries on stdin,
//! batches them into SQLite and anchors each batch on Solana.

use std::sync::Arc;

use anyhow::Context;
use batch_anchor::config::ServiceConfig;
use batch_anchor::ledger::{Keypair, SolanaRpc};
use batch_anchor::source::JsonLinesSource;
use batch_anchor::store::{BatchStore, SqliteStore};
use batch_anchor::{telemetry, AnchorService, SystemClock};
use tokio::io::BufReader;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = ServiceConfig::from_env().context("loading configuration")?;
    telemetry::init_tracing(&settings.log_level, settings.log_json)?;
    let config = settings.into_anchor_config()?;

    let secret = config
        .ledger
        .keypair
        .as_deref()
        .context("wallet secret missing")?;
    let wallet = Keypair::from_base58(secret).context("decoding wallet secret")?;

    let store: Arc<dyn BatchStore> = match &config.database_path {
        Some(path) => Arc::new(
            SqliteStore::open(path)
                .with_context(|| format!("opening database {}", path.display()))?,
        ),
        None => Arc::new(SqliteStore::open_memory()?),
    };
    let ledger = Arc::new(SolanaRpc::new(
        config.ledger.rpc_url.clone(),
        config.ledger.request_timeout,
    )?);

    info!(
        rpc_url = %config.ledger.rpc_url,
        database = ?config.database_path,
        batch_size = config.batching.size_threshold,
        "starting batch-anchord"
    );
    let service = AnchorService::new(config, store, ledger, wallet, Arc::new(SystemClock))?;

    let source = Arc::new(JsonLinesSource::new(BufReader::new(tokio::io::stdin())));
    let handle = service.start(source).await;

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutdown requested");

    let ingest = handle.stop().await?;
    let stats = service.statistics().await?;
    info!(
        batches = ingest.batches_committed,
        messages = ingest.messages_committed,
        dropped = ingest.dropped,
        stats = %serde_json::to_string(&stats)?,
        "final statistics"
    );
    Ok(())
}
