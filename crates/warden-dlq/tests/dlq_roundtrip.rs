use serde_json::json;
use std::sync::Arc;
use warden_core::{
    ClassificationTable, ErrorClassifier, EventBus, FsStorage, ManualClock, RunId, SharedStorage,
};
use warden_dlq::{DeadLetterQueue, DlqConfig, Failure, RetryOutcome};

async fn open(storage: SharedStorage, clock: Arc<ManualClock>) -> DeadLetterQueue {
    DeadLetterQueue::open(
        storage,
        DlqConfig {
            jitter_pct: 0.0,
            ..DlqConfig::default()
        },
        ErrorClassifier::from_table(&ClassificationTable::default()).unwrap(),
        Arc::new(EventBus::new()),
        clock,
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn transient_item_round_trips_through_disk_and_recovers() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::starting_now());
    let run = RunId::new("batch-7");

    let id = {
        let queue = open(Arc::new(FsStorage::new(dir.path())), clock.clone()).await;
        let item = queue
            .add_failed_item(
                &run,
                "doc-42",
                json!({"doc": 42}),
                Failure::new("upstream rate limit exceeded"),
                json!({"attempt": 1}),
            )
            .await
            .unwrap();
        clock.advance_ms(1_000);
        let outcome = queue
            .mark_retry_attempt(&item.id, Err(Failure::new("503 from upstream")))
            .await
            .unwrap();
        assert!(matches!(outcome, RetryOutcome::Rescheduled(_)));
        item.id
    };
    assert!(dir.path().join("dlq/runs/batch-7.jsonl").exists());
    assert!(dir.path().join("dlq/index.json").exists());

    let queue = open(Arc::new(FsStorage::new(dir.path())), clock.clone()).await;
    let restored = queue.get(&id).await.unwrap();
    assert_eq!(restored.retry_count, 1);
    assert_eq!(restored.backoff_ms, 2_000);
    assert_eq!(restored.payload, json!({"doc": 42}));
    assert!(queue.get_pending_retries(Some(&run)).await.is_empty());

    clock.advance_ms(2_000);
    let sweep = queue
        .retry_due(Some(&run), |_item| async { Ok(()) })
        .await
        .unwrap();
    assert_eq!(sweep.recovered, 1);
    assert_eq!(queue.stats(None).await.total, 0);
    assert!(!dir.path().join("dlq/runs/batch-7.jsonl").exists());
}

#[tokio::test]
async fn torn_final_line_is_skipped_on_replay() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::starting_now());
    let run = RunId::new("r");
    {
        let queue = open(Arc::new(FsStorage::new(dir.path())), clock.clone()).await;
        queue
            .add_failed_item(&run, "u", json!(null), Failure::new("timeout"), json!(null))
            .await
            .unwrap();
    }
    let log = dir.path().join("dlq/runs/r.jsonl");
    let mut bytes = std::fs::read(&log).unwrap();
    bytes.extend_from_slice(br#"{"op":"upsert","item":{"id":"#);
    std::fs::write(&log, bytes).unwrap();

    let queue = open(Arc::new(FsStorage::new(dir.path())), clock).await;
    assert_eq!(queue.list(Some(&run)).await.len(), 1);
}
