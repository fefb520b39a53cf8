//! AnchoringClient against the in-memory ledger.

use std::sync::Arc;
use std::time::Duration;

use batch_anchor_ledger::{
    AnchorErrorKind, AnchoringClient, AnchoringConfig, BalanceTier, Keypair, LedgerError,
    MemoryLedger, OversizePolicy, RecordOutcome, LAMPORTS_PER_SOL,
};
use batch_anchor_testkit::fixtures;

fn client_with(ledger: &Arc<MemoryLedger>, config: AnchoringConfig) -> AnchoringClient {
    AnchoringClient::new(ledger.clone(), Keypair::from_seed(&[1u8; 32]), config)
}

fn client(ledger: &Arc<MemoryLedger>) -> AnchoringClient {
    client_with(ledger, AnchoringConfig::default())
}

fn failure(outcome: RecordOutcome) -> (AnchorErrorKind, bool) {
    match outcome {
        RecordOutcome::Failed { failure, .. } => (failure.kind, failure.is_retryable()),
        other => panic!("expected failure, got {other:?}"),
    }
}

#[tokio::test]
async fn test_unhealthy_client_makes_no_network_calls() {
    let ledger = Arc::new(MemoryLedger::funded());
    let client = client(&ledger);
    let batch = fixtures::stored_batch(&fixtures::sealed_batch(3));

    // Never checked: starts unhealthy.
    let (kind, retryable) = failure(client.record_batch(&batch, fixtures::at_ms(0)).await);
    assert_eq!(kind, AnchorErrorKind::ClientUnhealthy);
    assert!(retryable);
    assert_eq!(ledger.calls(), 0);

    // Checked and found unreachable.
    ledger.set_unreachable(true);
    let report = client.check_health().await;
    assert!(!report.healthy);
    assert!(!report.connected);
    assert!(report.error.is_some());

    ledger.reset_calls();
    let (kind, _) = failure(client.record_batch(&batch, fixtures::at_ms(0)).await);
    assert_eq!(kind, AnchorErrorKind::ClientUnhealthy);
    assert_eq!(ledger.calls(), 0);
}

#[tokio::test]
async fn test_record_and_verify_roundtrip() {
    let ledger = Arc::new(MemoryLedger::funded());
    let client = client(&ledger);
    assert!(client.check_health().await.healthy);

    let sealed = fixtures::sealed_batch(10);
    let batch = fixtures::stored_batch(&sealed);
    let outcome = client.record_batch(&batch, fixtures::at_ms(fixtures::BASE_MS)).await;

    let signature = match outcome {
        RecordOutcome::Confirmed { signature, .. } => signature,
        other => panic!("expected confirmation, got {other:?}"),
    };
    assert_eq!(ledger.sent(), vec![signature.clone()]);

    let verified = client.verify_batch(&signature).await.unwrap();
    assert_eq!(verified.record.batch_id, batch.id);
    assert_eq!(verified.record.batch_hash, batch.hash);
    assert_eq!(verified.record.message_count, 10);
    assert_eq!(verified.record.origin.wallet, client.wallet_address());
    assert_eq!(verified.record.origin.network, "devnet");
    assert_eq!(verified.fee, 5_000);
    assert!(verified.block_time.is_some());
    assert!(verified.explorer_url.ends_with("?cluster=devnet"));

    let asset = verified.record.asset.unwrap();
    assert_eq!(asset.asset_ids, vec!["asset-0", "asset-1", "asset-2"]);
    assert_eq!(asset.asset_types, vec!["pallet"]);
    assert_eq!(asset.site_ids, vec!["site-0", "site-1"]);
}

#[tokio::test]
async fn test_verify_unknown_signature() {
    let ledger = Arc::new(MemoryLedger::funded());
    let client = client(&ledger);
    let err = client.verify_batch("1111").await.unwrap_err();
    assert!(matches!(err, LedgerError::NotFound(_)));
}

#[tokio::test]
async fn test_balance_tiers() {
    let ledger = Arc::new(MemoryLedger::new(LAMPORTS_PER_SOL / 2));
    let client = client(&ledger);
    assert_eq!(client.check_health().await.balance_status, BalanceTier::Ok);

    ledger.set_balance(70_000_000);
    let report = client.check_health().await;
    assert_eq!(report.balance_status, BalanceTier::Low);
    assert!(report.healthy);
    assert_eq!(report.balance_sol, Some(0.07));

    ledger.set_balance(1_000_000);
    let report = client.check_health().await;
    assert_eq!(report.balance_status, BalanceTier::Critical);
    assert!(report.healthy);

    ledger.set_balance(5_000);
    let report = client.check_health().await;
    assert!(!report.healthy);
    assert!(!client.is_healthy());
}

#[tokio::test]
async fn test_send_failures_are_classified() {
    let ledger = Arc::new(MemoryLedger::funded());
    let client = client(&ledger);
    client.check_health().await;
    let batch = fixtures::stored_batch(&fixtures::sealed_batch(2));

    ledger.fail_sends(Some("429 Too Many Requests"));
    let (kind, retryable) = failure(client.record_batch(&batch, fixtures::at_ms(0)).await);
    assert_eq!(kind, AnchorErrorKind::RateLimited);
    assert!(retryable);

    ledger.fail_sends(Some("Blockhash not found"));
    let (kind, retryable) = failure(client.record_batch(&batch, fixtures::at_ms(0)).await);
    assert_eq!(kind, AnchorErrorKind::ExpiredReference);
    assert!(retryable);

    ledger.fail_sends(None);
    assert!(client
        .record_batch(&batch, fixtures::at_ms(0))
        .await
        .is_confirmed());

    // Drained after the last health check: the node refuses the fee.
    ledger.set_balance(4_000);
    let (kind, retryable) = failure(client.record_batch(&batch, fixtures::at_ms(0)).await);
    assert_eq!(kind, AnchorErrorKind::InsufficientFunds);
    assert!(!retryable);
}

#[tokio::test]
async fn test_oversize_fails_without_submitting() {
    let ledger = Arc::new(MemoryLedger::funded());
    let client = client_with(
        &ledger,
        AnchoringConfig {
            byte_budget: 350,
            ..AnchoringConfig::default()
        },
    );
    client.check_health().await;

    let batch = fixtures::stored_batch(&fixtures::sealed_batch(10));
    let (kind, retryable) = failure(client.record_batch(&batch, fixtures::at_ms(0)).await);
    assert_eq!(kind, AnchorErrorKind::PayloadTooLarge);
    assert!(!retryable);
    assert!(ledger.sent().is_empty());
}

#[tokio::test]
async fn test_oversize_drop_auxiliary_policy() {
    let ledger = Arc::new(MemoryLedger::funded());
    let client = client_with(
        &ledger,
        AnchoringConfig {
            byte_budget: 350,
            oversize_policy: OversizePolicy::DropAuxiliary,
            ..AnchoringConfig::default()
        },
    );
    client.check_health().await;

    let batch = fixtures::stored_batch(&fixtures::sealed_batch(10));
    let outcome = client.record_batch(&batch, fixtures::at_ms(0)).await;
    let RecordOutcome::Confirmed { signature, .. } = outcome else {
        panic!("expected confirmation, got {outcome:?}");
    };

    let verified = client.verify_batch(&signature).await.unwrap();
    assert!(verified.record.asset.is_none());
    assert_eq!(verified.record.batch_hash, batch.hash);
}

#[tokio::test]
async fn test_worst_case_batch_fits_default_budget() {
    let ledger = Arc::new(MemoryLedger::funded());
    let client = client(&ledger);

    let mut batch = fixtures::stored_batch(&fixtures::sealed_batch(1));
    batch.message_count = 1000;
    batch.aggregates = fixtures::worst_case_aggregates();

    let memo = client.encode_record(&batch, fixtures::at_ms(0)).unwrap();
    assert!(memo.len() <= batch_anchor_ledger::MAX_RECORD_BYTES);

    let record: serde_json::Value = serde_json::from_slice(&memo).unwrap();
    let asset = batch_anchor_ledger::expand(&record).unwrap().asset.unwrap();
    assert_eq!(asset.asset_ids, batch.aggregates.asset_ids[1..4].to_vec());
    assert_eq!(asset.site_ids, batch.aggregates.site_ids[1..3].to_vec());
}

#[tokio::test]
async fn test_anchored_identifiers_match_stored_exactly() {
    let ledger = Arc::new(MemoryLedger::funded());
    let client = client(&ledger);
    client.check_health().await;

    let mut batch = fixtures::stored_batch(&fixtures::sealed_batch(1));
    batch.aggregates.asset_ids = vec![
        "shipment-2024-10-0001-pallet-A".into(),
        "pallet-7".into(),
    ];
    batch.aggregates.site_ids = vec!["distribution-center-east".into()];

    let RecordOutcome::Confirmed { signature, .. } =
        client.record_batch(&batch, fixtures::at_ms(fixtures::BASE_MS)).await
    else {
        panic!("expected confirmation");
    };

    let asset = client.verify_batch(&signature).await.unwrap().record.asset.unwrap();
    assert_eq!(asset.asset_ids, vec!["pallet-7"]);
    assert!(asset.site_ids.is_empty());
}

#[tokio::test]
async fn test_unconfirmed_submission_times_out_retryable() {
    let ledger = Arc::new(MemoryLedger::funded());
    let client = client_with(
        &ledger,
        AnchoringConfig {
            confirm_timeout: Duration::from_millis(50),
            poll_interval: Duration::from_millis(10),
            ..AnchoringConfig::default()
        },
    );
    client.check_health().await;
    ledger.hold_confirmations(true);

    let batch = fixtures::stored_batch(&fixtures::sealed_batch(1));
    let (kind, retryable) = failure(client.record_batch(&batch, fixtures::at_ms(0)).await);
    assert_eq!(kind, AnchorErrorKind::Timeout);
    assert!(retryable);
    assert_eq!(ledger.sent().len(), 1);
}
