mod common;

use binlog_hub::capture::{RowAction, RowsEvent};
use binlog_hub::position::Position;
use binlog_hub::test_utils::{MemoryCheckpointStore, RecordingPublisher, ScriptedSource, Step};
use binlog_hub::{Error, Replicator, Result};
use common::{ids, order_insert, test_config};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct Harness {
    source: Arc<ScriptedSource>,
    publisher: Arc<RecordingPublisher>,
    store: Arc<MemoryCheckpointStore>,
    shutdown: CancellationToken,
    position_dir: TempDir,
}

impl Harness {
    fn new(script: Vec<Step>, store: MemoryCheckpointStore) -> Self {
        Self {
            source: Arc::new(ScriptedSource::new(script)),
            publisher: Arc::new(RecordingPublisher::new()),
            store: Arc::new(store),
            shutdown: CancellationToken::new(),
            position_dir: TempDir::new().unwrap(),
        }
    }

    fn start(&self, max_events: usize) -> JoinHandle<Result<()>> {
        let config = test_config(self.position_dir.path(), max_events);
        let replicator = Replicator::new(
            &config,
            self.source.clone(),
            self.publisher.clone(),
            self.store.clone(),
        );
        tokio::spawn(replicator.run(self.shutdown.clone()))
    }
}

#[tokio::test(start_paused = true)]
async fn test_rows_flow_to_publisher_and_position_is_persisted() {
    let synced = Position::new("mysql-bin.000001", 900);
    let harness = Harness::new(
        vec![
            Step::Rows(order_insert(&[1, 2])),
            Step::Rows(
                RowsEvent::new("shop", "audit_log", RowAction::Insert, vec!["id".into()])
                    .with_row(vec![json!(99)]),
            ),
            Step::Synced(Position::new("mysql-bin.000001", 400)),
            Step::Rows(order_insert(&[3])),
            Step::Synced(synced.clone()),
        ],
        MemoryCheckpointStore::new(),
    );

    let handle = harness.start(3);
    tokio::time::sleep(Duration::from_millis(1500)).await;

    let batches = harness.publisher.batches();
    assert_eq!(batches.len(), 1);
    assert_eq!(ids(&batches[0]), vec![1, 2, 3]);
    assert_eq!(harness.store.written(), vec![synced]);

    harness.shutdown.cancel();
    assert!(matches!(handle.await.unwrap(), Err(Error::Shutdown)));
    assert!(harness.source.observed_cancellation());
}

#[tokio::test(start_paused = true)]
async fn test_resumes_from_saved_position() {
    let saved = Position::new("mysql-bin.000042", 1234);
    let harness = Harness::new(vec![], MemoryCheckpointStore::with_position(saved.clone()));

    let handle = harness.start(10);
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(harness.source.started_from(), Some(Some(saved)));

    harness.shutdown.cancel();
    handle.await.unwrap().unwrap_err();
}

#[tokio::test(start_paused = true)]
async fn test_first_run_starts_without_position() {
    let harness = Harness::new(vec![], MemoryCheckpointStore::new());

    let handle = harness.start(10);
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(harness.source.started_from(), Some(None));

    harness.shutdown.cancel();
    handle.await.unwrap().unwrap_err();
}

#[tokio::test(start_paused = true)]
async fn test_timed_flush_failure_stops_pipeline() {
    let harness = Harness::new(
        vec![Step::Rows(order_insert(&[1]))],
        MemoryCheckpointStore::new(),
    );
    harness.publisher.fail_publishes(true);

    let result = harness.start(10).await.unwrap();

    assert!(matches!(result, Err(Error::Publish(_))));
    assert!(harness.source.observed_cancellation());
    assert!(!harness.shutdown.is_cancelled());
}

#[tokio::test(start_paused = true)]
async fn test_size_flush_failure_is_returned_by_source() {
    let harness = Harness::new(
        vec![
            Step::Rows(order_insert(&[1, 2])),
            Step::Synced(Position::new("mysql-bin.000001", 500)),
        ],
        MemoryCheckpointStore::new(),
    );
    harness.publisher.fail_publishes(true);

    let result = harness.start(2).await.unwrap();

    assert!(matches!(result, Err(Error::Publish(_))));
    assert!(harness.store.written().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_checkpoint_failure_stops_pipeline() {
    let harness = Harness::new(
        vec![Step::Synced(Position::new("mysql-bin.000001", 500))],
        MemoryCheckpointStore::new(),
    );
    harness.store.fail_writes(true);

    let result = harness.start(10).await.unwrap();

    assert!(matches!(result, Err(Error::Persistence(_))));
    assert!(harness.source.observed_cancellation());
}

#[tokio::test(start_paused = true)]
async fn test_source_failure_is_returned() {
    let harness = Harness::new(
        vec![Step::Fail("binlog stream failed".into())],
        MemoryCheckpointStore::new(),
    );

    let result = harness.start(10).await.unwrap();

    assert!(matches!(result, Err(Error::Replication { message }) if message == "binlog stream failed"));
}

#[tokio::test(start_paused = true)]
async fn test_external_shutdown_drains_buffer_and_position() {
    let synced = Position::new("mysql-bin.000003", 77);
    let harness = Harness::new(
        vec![
            Step::Rows(order_insert(&[10, 11])),
            Step::Synced(synced.clone()),
        ],
        MemoryCheckpointStore::new(),
    );

    let handle = harness.start(10);
    tokio::time::sleep(Duration::from_millis(500)).await;

    // Neither the flush timer nor the checkpoint tick has fired yet.
    assert!(harness.publisher.batches().is_empty());
    assert!(harness.store.written().is_empty());

    harness.shutdown.cancel();
    let result = handle.await.unwrap();

    assert!(matches!(result, Err(Error::Shutdown)));
    assert_eq!(ids(&harness.publisher.batches()[0]), vec![10, 11]);
    assert_eq!(harness.store.written(), vec![synced]);
}

#[tokio::test(start_paused = true)]
async fn test_update_publishes_after_images_only() {
    let update = RowsEvent::new(
        "shop",
        "customers",
        RowAction::Update,
        vec!["id".into(), "name".into()],
    )
    .with_row(vec![json!(1), json!("old")])
    .with_row(vec![json!(1), json!("new")]);

    let harness = Harness::new(vec![Step::Rows(update)], MemoryCheckpointStore::new());

    let handle = harness.start(1);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let batches = harness.publisher.batches();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0][0].key.as_deref(), Some("shop:customers"));

    let event: serde_json::Value = serde_json::from_slice(&batches[0][0].payload).unwrap();
    assert_eq!(event["action"], "update");
    assert_eq!(event["payload"]["name"], "new");

    harness.shutdown.cancel();
    handle.await.unwrap().unwrap_err();
}

#[tokio::test(start_paused = true)]
async fn test_position_waits_for_its_batch_to_publish() {
    let synced = Position::new("mysql-bin.000001", 900);
    let harness = Harness::new(
        vec![
            Step::Rows(order_insert(&[1, 2])),
            Step::Synced(synced.clone()),
        ],
        MemoryCheckpointStore::new(),
    );

    let handle = harness.start(10);

    // Ticks at 1s..4s find nothing to persist while the rows are buffered.
    tokio::time::sleep(Duration::from_millis(4500)).await;
    assert!(harness.store.written().is_empty());

    // The timer flush at 5s releases the position, the 6s tick writes it.
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(ids(&harness.publisher.batches()[0]), vec![1, 2]);
    assert_eq!(harness.store.written(), vec![synced]);

    harness.shutdown.cancel();
    handle.await.unwrap().unwrap_err();
}

#[tokio::test(start_paused = true)]
async fn test_failed_batch_never_checkpoints_its_position() {
    let harness = Harness::new(
        vec![
            Step::Rows(order_insert(&[1, 2])),
            Step::Synced(Position::new("mysql-bin.000001", 900)),
        ],
        MemoryCheckpointStore::new(),
    );
    harness.publisher.fail_publishes(true);

    let result = harness.start(10).await.unwrap();

    assert!(matches!(result, Err(Error::Publish(_))));
    assert_eq!(harness.publisher.published(), 0);
    assert!(harness.store.written().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_position_without_buffered_rows_is_saved_at_once() {
    let synced = Position::new("mysql-bin.000001", 300);
    let harness = Harness::new(
        vec![
            Step::Rows(
                RowsEvent::new("shop", "audit_log", RowAction::Insert, vec!["id".into()])
                    .with_row(vec![json!(1)]),
            ),
            Step::Synced(synced.clone()),
        ],
        MemoryCheckpointStore::new(),
    );

    let handle = harness.start(10);
    tokio::time::sleep(Duration::from_millis(1500)).await;

    assert!(harness.publisher.batches().is_empty());
    assert_eq!(harness.store.written(), vec![synced]);

    harness.shutdown.cancel();
    handle.await.unwrap().unwrap_err();
}

#[tokio::test(start_paused = true)]
async fn test_panicking_task_is_reported_by_name() {
    let harness = Harness::new(
        vec![Step::Panic("decoder bug".into())],
        MemoryCheckpointStore::new(),
    );

    let result = harness.start(10).await.unwrap();

    assert!(matches!(result, Err(Error::Internal(message)) if message.starts_with("source panicked")));
}
