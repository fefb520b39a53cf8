//! End-to-end: stream -> accumulator -> store -> anchoring -> verification.

use std::sync::Arc;
use std::time::Duration;

use batch_anchor::core::{hash_batch, AnchorStatus, ContentHash, TimeWindow};
use batch_anchor::ledger::{Keypair, MemoryLedger};
use batch_anchor::store::{AnchorUpdate, BatchStore, MemoryStore, SqliteStore};
use batch_anchor::{
    AnchorConfig, AnchorService, AnchorWorker, BatchVerification, Clock, Disposition,
    ManualClock, MemorySource, PassOutcome, Reconciler,
};
use batch_anchor_testkit::fixtures;
use tokio::sync::watch;

fn config() -> AnchorConfig {
    let mut config = AnchorConfig::default();
    config.reconciler.pacing = Duration::ZERO;
    config.scheduler.pacing = Duration::ZERO;
    config.batching.poll_wait = Duration::from_millis(10);
    config
}

fn stores(dir: &tempfile::TempDir) -> Vec<(&'static str, Arc<dyn BatchStore>)> {
    let memory: Arc<dyn BatchStore> = Arc::new(MemoryStore::new());
    let sqlite: Arc<dyn BatchStore> =
        Arc::new(SqliteStore::open(dir.path().join("anchor.db")).unwrap());
    vec![("memory", memory), ("sqlite", sqlite)]
}

fn build(
    store: Arc<dyn BatchStore>,
    ledger: &Arc<MemoryLedger>,
    clock: &Arc<ManualClock>,
    config: AnchorConfig,
) -> AnchorService {
    AnchorService::new(
        config,
        store,
        ledger.clone(),
        Keypair::from_seed(&[9u8; 32]),
        clock.clone(),
    )
    .unwrap()
}

fn clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(fixtures::at_ms(fixtures::BASE_MS)))
}

#[tokio::test]
async fn test_thousand_messages_one_anchored_batch() {
    let dir = tempfile::tempdir().unwrap();
    for (name, store) in stores(&dir) {
        let ledger = Arc::new(MemoryLedger::funded());
        let clock = clock();
        let service = build(store, &ledger, &clock, config());

        let source = Arc::new(MemorySource::new());
        for i in 0..1000 {
            source.push(fixtures::entry(i));
        }
        source.close();

        let (_tx, rx) = watch::channel(false);
        let stats = service.accumulator(source.clone()).run(rx).await.unwrap();
        assert_eq!(stats.batches_committed, 1, "{name}");
        assert_eq!(source.acked().len(), 1000, "{name}");
        assert_eq!(source.in_flight(), 0, "{name}");

        let batches = service.list_batches(10, 0).await.unwrap();
        assert_eq!(batches.len(), 1, "{name}");
        let id = batches[0].id;

        let batch = service.get_batch(&id).await.unwrap().unwrap();
        assert_eq!(batch.message_count, 1000);
        assert_eq!(batch.anchor.status, AnchorStatus::None);
        assert_eq!(batch.start, fixtures::at_ms(fixtures::BASE_MS));
        assert_eq!(batch.end, fixtures::at_ms(fixtures::BASE_MS + 999_000));

        // The stored hash is reproducible from the stored messages.
        let messages = service.store().list_messages(&id).await.unwrap();
        let expected: Vec<ContentHash> = fixtures::messages(1000).iter().map(|m| m.hash).collect();
        let stored: Vec<ContentHash> = messages.iter().map(|m| m.hash).collect();
        assert_eq!(stored, expected, "{name}");
        assert_eq!(
            hash_batch(&id, 1000, &batch.start, &batch.end, &stored),
            batch.hash
        );

        assert!(service.check_health().await.healthy);
        let signature = match service.record_batch(&id).await.unwrap() {
            Disposition::Confirmed { signature } => signature,
            other => panic!("{name}: expected confirmation, got {other:?}"),
        };

        let anchored = service.get_batch(&id).await.unwrap().unwrap();
        assert_eq!(anchored.anchor.status, AnchorStatus::Confirmed);
        assert_eq!(anchored.anchor.signature.as_deref(), Some(signature.as_str()));
        assert_eq!(anchored.anchor.confirmed_at, Some(clock.now()));

        let verified = service.verify_batch(&signature).await.unwrap();
        assert_eq!(verified.record.batch_id, id);
        assert_eq!(verified.record.message_count, 1000);
        assert_eq!(verified.record.batch_hash, batch.hash);

        match service.verify_stored_batch(&id).await.unwrap() {
            BatchVerification::Anchored { verified, matches, .. } => {
                assert!(verified, "{name}: {matches:?}");
            }
            other => panic!("{name}: expected anchored, got {other:?}"),
        }

        // Recording again reports the stored outcome without a new submission.
        assert_eq!(
            service.record_batch(&id).await.unwrap(),
            Disposition::Confirmed { signature }
        );
        assert_eq!(ledger.sent().len(), 1);

        let stats = service.statistics().await.unwrap();
        assert_eq!(stats.database.confirmed, 1);
        assert_eq!(stats.anchoring.total_success, 1);
    }
}

#[tokio::test]
async fn test_size_threshold_splits_batches() {
    let ledger = Arc::new(MemoryLedger::funded());
    let clock = clock();
    let mut config = config();
    config.batching.size_threshold = 100;
    let service = build(Arc::new(MemoryStore::new()), &ledger, &clock, config);

    let source = Arc::new(MemorySource::new());
    for i in 0..250 {
        source.push(fixtures::entry(i));
    }
    source.push(fixtures::malformed_entry());
    source.close();

    let (_tx, rx) = watch::channel(false);
    let stats = service.accumulator(source.clone()).run(rx).await.unwrap();
    assert_eq!(stats.batches_committed, 3);
    assert_eq!(stats.dropped, 1);
    assert_eq!(source.acked().len(), 251);

    let mut counts: Vec<usize> = service
        .list_batches(10, 0)
        .await
        .unwrap()
        .iter()
        .map(|b| b.message_count)
        .collect();
    counts.sort_unstable();
    assert_eq!(counts, vec![50, 100, 100]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_reconcilers_never_double_confirm() {
    let dir = tempfile::tempdir().unwrap();
    for (name, store) in stores(&dir) {
        let ledger = Arc::new(MemoryLedger::funded());
        let clock = clock();
        let service = build(store.clone(), &ledger, &clock, config());

        let mut ids = Vec::new();
        for n in 1..=5 {
            let sealed = fixtures::sealed_batch(n);
            store.save_batch(&sealed).await.unwrap();
            store
                .update_anchor_status(&sealed.id, AnchorUpdate::Retry { error: "TIMEOUT: seed".into() })
                .await
                .unwrap();
            ids.push(sealed.id);
        }

        // Two independent reconcilers sharing only the store and the ledger.
        let second = Arc::new(Reconciler::new(
            Arc::new(AnchorWorker::new(
                store.clone(),
                service.client().clone(),
                clock.clone(),
                10,
                Duration::from_secs(600),
            )),
            service.config().reconciler.clone(),
        ));
        let first = service.reconciler().clone();

        let (a, b) = tokio::join!(
            tokio::spawn({
                let r = first.clone();
                async move { r.run_once().await }
            }),
            tokio::spawn({
                let r = second.clone();
                async move { r.run_once().await }
            }),
        );
        let confirmed: usize = [a.unwrap().unwrap(), b.unwrap().unwrap()]
            .into_iter()
            .map(|outcome| match outcome {
                PassOutcome::Completed(report) => report.confirmed,
                other => panic!("{name}: unexpected {other:?}"),
            })
            .sum();

        assert_eq!(confirmed, 5, "{name}");
        assert_eq!(ledger.sent().len(), 5, "{name}: one submission per batch");
        for id in &ids {
            let batch = store.get_batch(id).await.unwrap().unwrap();
            assert_eq!(batch.anchor.status, AnchorStatus::Confirmed, "{name}");
        }

        // Nothing left for either of them.
        for r in [&first, &second] {
            assert_eq!(
                r.run_once().await.unwrap(),
                PassOutcome::Completed(Default::default())
            );
        }
        assert_eq!(ledger.sent().len(), 5);
    }
}

#[tokio::test]
async fn test_scheduler_never_reselects_terminal_batches() {
    let dir = tempfile::tempdir().unwrap();
    for (name, store) in stores(&dir) {
        let ledger = Arc::new(MemoryLedger::funded());
        // Just past the end of the 16:00-16:10 window.
        let clock = Arc::new(ManualClock::new(fixtures::at_ms(fixtures::BASE_MS + 601_000)));
        let service = build(store.clone(), &ledger, &clock, config());

        let fresh = fixtures::sealed_batch(2);
        let confirmed = fixtures::sealed_batch(3);
        let failed = fixtures::sealed_batch(4);
        for b in [&fresh, &confirmed, &failed] {
            store.save_batch(b).await.unwrap();
        }
        store
            .update_anchor_status(
                &confirmed.id,
                AnchorUpdate::Confirmed {
                    signature: "prior".into(),
                    at: clock.now(),
                },
            )
            .await
            .unwrap();
        store
            .update_anchor_status(&failed.id, AnchorUpdate::Failed { error: "INSUFFICIENT_FUNDS: x".into() })
            .await
            .unwrap();

        let scheduler = service.scheduler();
        let due = scheduler.due_window(clock.now()).unwrap();
        assert_eq!(
            due,
            TimeWindow {
                start: fixtures::at_ms(fixtures::BASE_MS),
                end: fixtures::at_ms(fixtures::BASE_MS + 600_000),
            }
        );

        let outcome = scheduler.tick().await.unwrap();
        let PassOutcome::Completed(report) = outcome else {
            panic!("{name}: unexpected {outcome:?}");
        };
        assert_eq!(report.claimed, 1, "{name}");
        assert_eq!(report.confirmed, 1, "{name}");
        assert_eq!(ledger.sent().len(), 1);

        // Every batch in the window is now terminal: later ticks and manual
        // triggers select nothing.
        for _ in 0..2 {
            let outcome = scheduler.trigger_manual().await.unwrap();
            assert_eq!(outcome, PassOutcome::Completed(Default::default()), "{name}");
        }
        clock.advance(Duration::from_secs(600));
        scheduler.tick().await.unwrap();
        assert_eq!(ledger.sent().len(), 1, "{name}");

        let failed_now = store.get_batch(&failed.id).await.unwrap().unwrap();
        assert_eq!(failed_now.anchor.status, AnchorStatus::Failed);
        assert_eq!(scheduler.status().batches_recorded, 1);
    }
}

#[tokio::test]
async fn test_unhealthy_ledger_burns_no_retries() {
    let ledger = Arc::new(MemoryLedger::funded());
    let clock = clock();
    let store: Arc<dyn BatchStore> = Arc::new(MemoryStore::new());
    let service = build(store.clone(), &ledger, &clock, config());

    let sealed = fixtures::sealed_batch(2);
    store.save_batch(&sealed).await.unwrap();
    store
        .update_anchor_status(&sealed.id, AnchorUpdate::Retry { error: "seed".into() })
        .await
        .unwrap();

    ledger.set_unreachable(true);
    assert_eq!(
        service.reconciler().run_once().await.unwrap(),
        PassOutcome::Unhealthy
    );
    let batch = store.get_batch(&sealed.id).await.unwrap().unwrap();
    assert_eq!(batch.anchor.retry_count, 1);

    ledger.set_unreachable(false);
    let outcome = service.reconciler().run_once().await.unwrap();
    assert!(matches!(outcome, PassOutcome::Completed(r) if r.confirmed == 1));
}

#[tokio::test]
async fn test_oversize_batch_fails_immediately() {
    let ledger = Arc::new(MemoryLedger::funded());
    let clock = clock();
    let mut config = config();
    config.ledger.byte_budget = 300;
    let store: Arc<dyn BatchStore> = Arc::new(MemoryStore::new());
    let service = build(store.clone(), &ledger, &clock, config);

    let sealed = fixtures::sealed_batch(10);
    store.save_batch(&sealed).await.unwrap();
    service.check_health().await;

    let disposition = service.record_batch(&sealed.id).await.unwrap();
    let Disposition::Failed { error } = disposition else {
        panic!("expected failure, got {disposition:?}");
    };
    assert!(error.starts_with("PAYLOAD_TOO_LARGE"), "{error}");
    assert!(ledger.sent().is_empty());

    let batch = store.get_batch(&sealed.id).await.unwrap().unwrap();
    assert_eq!(batch.anchor.status, AnchorStatus::Failed);
    assert!(matches!(
        service.verify_stored_batch(&sealed.id).await.unwrap(),
        BatchVerification::NotAnchored {
            status: AnchorStatus::Failed,
            ..
        }
    ));
}

#[tokio::test]
async fn test_service_runs_until_stopped() {
    let ledger = Arc::new(MemoryLedger::funded());
    let clock = clock();
    let mut config = config();
    config.batching.size_threshold = 10;
    let service = build(Arc::new(MemoryStore::new()), &ledger, &clock, config);

    let source = Arc::new(MemorySource::new());
    let handle = service.start(source.clone()).await;
    for i in 0..25 {
        source.push(fixtures::entry(i));
    }
    source.close();

    tokio::time::timeout(Duration::from_secs(5), async {
        while !handle.ingest_finished() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    let stats = handle.stop().await.unwrap();
    assert_eq!(stats.messages_committed, 25);
    assert_eq!(service.list_batches(10, 0).await.unwrap().len(), 3);
}
