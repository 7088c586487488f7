//! Integration tests for the full claim-process-publish lifecycle.
//!
//! These tests verify that:
//! - A healthy item goes Unclaimed -> Complete with its artifacts uploaded
//! - A transient stage failure requeues with an incremented retry count,
//!   and the next poll finishes the item
//! - A permanent failure goes straight to Error with exactly one notification
//! - Exhausting the retry budget ends in Error
//! - Complete items are never reclaimed, and client mode on them is a no-op
//! - Shutdown mid-attempt returns the item to the pool without spending retries
//! - Client mode distinguishes retry backoff from another worker's lease
//! - No scratch data outlives an attempt

use std::sync::Arc;
use std::time::Duration;

use imaging_core::claim::ClaimCoordinator;
use imaging_core::failure::{create_notification_system, FailureRouter, Notification, RetryConfig};
use imaging_core::pipeline::{PipelineExecutor, ProcessingConfig, Stage};
use imaging_core::publish::ResultPublisher;
use imaging_core::scheduler::{ClientOutcome, ItemWorker, Scheduler, SchedulerConfig};
use imaging_core::testing::{
    fixtures, MockImageTool, MockNotifier, MockObjectStore, MockWorkSource, ToolBehavior,
};
use imaging_core::work_item::{ProcessingStatus, Rid, WorkItem};
use tempfile::TempDir;

const MAX_RETRIES: u32 = 2;

/// Test harness wiring mocks into a real scheduler.
struct TestHarness {
    processing: TempDir,
    source: Arc<MockWorkSource>,
    store: Arc<MockObjectStore>,
    tool: Arc<MockImageTool>,
    notifier: Arc<MockNotifier>,
    scheduler: Scheduler,
}

impl TestHarness {
    async fn new(rids: &[&str]) -> Self {
        let processing = TempDir::new().expect("Failed to create temp dir");
        let source = Arc::new(MockWorkSource::with_items(rids));
        let store = Arc::new(MockObjectStore::new());
        for rid in rids {
            let item = source.item(&Rid::new(*rid)).await.expect("seeded item");
            store.put_object(&item.url, b"raw microscopy image").await;
        }
        let tool = Arc::new(MockImageTool::new());
        let notifier = Arc::new(MockNotifier::new());

        let (handle, dispatcher) = create_notification_system(notifier.clone(), 16);
        tokio::spawn(dispatcher.run());

        let config = SchedulerConfig::default()
            .with_max_concurrent(2)
            .with_worker_id("worker-a");
        let retry = RetryConfig::default()
            .with_max_retries(MAX_RETRIES)
            .with_initial_delay(0)
            .with_publish_attempts(2, 1);

        let coordinator = Arc::new(ClaimCoordinator::new(
            source.clone(),
            "worker-a",
            config.lease_timeout(),
        ));
        let executor = Arc::new(PipelineExecutor::new(
            ProcessingConfig::default().with_processing_dir(processing.path().into()),
            tool.clone(),
            store.clone(),
        ));
        let publisher = Arc::new(ResultPublisher::new(
            store.clone(),
            coordinator.clone(),
            "/hatrac/Imaging/{rid}/{stage}/{filename}",
            retry.clone(),
        ));
        let router = Arc::new(FailureRouter::new(retry, "worker-a").with_notifier(handle));
        let worker = ItemWorker::new(coordinator, executor, publisher, router);

        Self {
            processing,
            source,
            store,
            tool,
            notifier,
            scheduler: Scheduler::new(config, worker),
        }
    }

    async fn item(&self, rid: &str) -> WorkItem {
        self.source.item(&Rid::new(rid)).await.expect("item exists")
    }

    fn scratch_entries(&self) -> usize {
        std::fs::read_dir(self.processing.path())
            .map(|entries| entries.count())
            .unwrap_or(0)
    }

    /// Wait for the dispatcher to deliver `count` notifications.
    async fn notifications(&self, count: usize) -> Vec<Notification> {
        for _ in 0..100 {
            let sent = self.notifier.sent().await;
            if sent.len() >= count {
                return sent;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.notifier.sent().await
    }
}

#[tokio::test]
async fn test_healthy_item_completes() {
    let h = TestHarness::new(&["1-X"]).await;

    let report = h.scheduler.run_cycle().await.unwrap();
    assert_eq!(report.completed, 1);

    let item = h.item("1-X").await;
    assert_eq!(item.status, ProcessingStatus::Complete);
    assert!(item.lease.is_none());
    assert!(item.error_detail.is_none());

    let result = item.result.expect("result written");
    assert_eq!(result.metadata.channels, 3);
    assert!(!result.artifacts.is_empty());
    // The normalized intermediate is not published.
    assert!(result.artifacts.iter().all(|a| a.stage != "normalize"));

    let uploads = h.store.uploads().await;
    assert_eq!(uploads.len(), result.artifacts.len());
    assert!(uploads.iter().all(|path| path.starts_with("/hatrac/Imaging/1-X/")));

    assert_eq!(h.scratch_entries(), 0);
    assert!(h.notifier.sent().await.is_empty());
}

#[tokio::test]
async fn test_transient_failure_requeues_then_completes() {
    let h = TestHarness::new(&["1-Y"]).await;
    h.tool
        .script_once(Stage::Package, ToolBehavior::FailTransient("out of memory".into()))
        .await;

    let first = h.scheduler.run_cycle().await.unwrap();
    assert_eq!(first.requeued, 1);

    let item = h.item("1-Y").await;
    assert_eq!(item.status, ProcessingStatus::Unclaimed);
    assert_eq!(item.retry_count, 1);
    assert!(item.lease.is_none());
    assert!(item
        .error_detail
        .as_deref()
        .is_some_and(|detail| detail.contains("out of memory")));
    assert_eq!(h.scratch_entries(), 0);

    let second = h.scheduler.run_cycle().await.unwrap();
    assert_eq!(second.completed, 1);

    let item = h.item("1-Y").await;
    assert_eq!(item.status, ProcessingStatus::Complete);
    assert_eq!(item.retry_count, 1);
    assert_eq!(h.scratch_entries(), 0);
    assert!(h.notifier.sent().await.is_empty());
}

#[tokio::test]
async fn test_permanent_failure_goes_to_error_with_one_notification() {
    let h = TestHarness::new(&["1-Z"]).await;
    h.tool
        .script(Stage::Normalize, ToolBehavior::FailPermanent("unsupported format".into()))
        .await;

    let report = h.scheduler.run_cycle().await.unwrap();
    assert_eq!(report.failed, 1);

    let item = h.item("1-Z").await;
    assert_eq!(item.status, ProcessingStatus::Error);
    assert_eq!(item.retry_count, 0);
    assert!(item.lease.is_none());
    assert!(item
        .error_detail
        .as_deref()
        .is_some_and(|detail| detail.contains("unsupported format")));

    let sent = h.notifications(1).await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].rid, "1-Z");
    assert_eq!(sent[0].stage.as_deref(), Some("normalize"));
    assert!(sent[0].diagnostic.contains("unsupported format"));

    // Error is terminal: later polls leave it alone and send nothing.
    let report = h.scheduler.run_cycle().await.unwrap();
    assert_eq!(report.listed, 0);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.notifier.sent().await.len(), 1);
    assert_eq!(h.scratch_entries(), 0);
}

#[tokio::test]
async fn test_retry_budget_exhaustion_ends_in_error() {
    let h = TestHarness::new(&["1-W"]).await;
    h.tool
        .script(Stage::Pyramid, ToolBehavior::FailTransient("scratch volume busy".into()))
        .await;

    for expected_retry in 1..=MAX_RETRIES {
        let report = h.scheduler.run_cycle().await.unwrap();
        assert_eq!(report.requeued, 1);
        assert_eq!(h.item("1-W").await.retry_count, expected_retry);
    }

    let report = h.scheduler.run_cycle().await.unwrap();
    assert_eq!(report.failed, 1);

    let item = h.item("1-W").await;
    assert_eq!(item.status, ProcessingStatus::Error);
    assert_eq!(item.retry_count, MAX_RETRIES);
    assert!(item
        .error_detail
        .as_deref()
        .is_some_and(|detail| detail.contains("retry budget exhausted")));

    let sent = h.notifications(1).await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].retry_count, MAX_RETRIES);
    assert_eq!(h.scratch_entries(), 0);
}

#[tokio::test]
async fn test_complete_item_is_never_reclaimed() {
    let h = TestHarness::new(&["1-A", "1-B"]).await;
    h.source
        .set_status(&Rid::new("1-A"), ProcessingStatus::Complete)
        .await;

    let report = h.scheduler.run_cycle().await.unwrap();
    assert_eq!(report.listed, 1);
    assert_eq!(report.completed, 1);

    let report = h.scheduler.run_cycle().await.unwrap();
    assert_eq!(report.listed, 0);
    assert_eq!(h.source.claim_calls().await, 1);
    assert!(h
        .tool
        .calls()
        .await
        .iter()
        .all(|(rid, _)| rid.as_str() == "1-B"));
}

#[tokio::test]
async fn test_client_mode_on_complete_item_is_noop() {
    let h = TestHarness::new(&["1-C"]).await;

    let outcome = h.scheduler.run_once(&Rid::new("1-C")).await.unwrap();
    assert_eq!(outcome, ClientOutcome::Completed);
    let uploads = h.store.uploads().await.len();
    let claims = h.source.claim_calls().await;

    let outcome = h.scheduler.run_once(&Rid::new("1-C")).await.unwrap();
    assert_eq!(outcome, ClientOutcome::AlreadyComplete);
    assert_eq!(outcome.exit_code(), 0);
    assert_eq!(h.store.uploads().await.len(), uploads);
    assert_eq!(h.source.claim_calls().await, claims);
}

#[tokio::test]
async fn test_client_mode_reports_requeue_and_failure() {
    let h = TestHarness::new(&["1-R", "1-F"]).await;
    h.tool
        .script_for(
            &Rid::new("1-R"),
            Stage::Metadata,
            ToolBehavior::Timeout,
        )
        .await;
    h.tool
        .script_for(
            &Rid::new("1-F"),
            Stage::Package,
            ToolBehavior::FailPermanent("corrupt tile".into()),
        )
        .await;

    let requeued = h.scheduler.run_once(&Rid::new("1-R")).await.unwrap();
    assert_eq!(requeued, ClientOutcome::Requeued { retry_count: 1 });
    assert_eq!(requeued.exit_code(), 2);

    let failed = h.scheduler.run_once(&Rid::new("1-F")).await.unwrap();
    assert!(matches!(failed, ClientOutcome::Failed { .. }));
    assert_eq!(failed.exit_code(), 1);

    // A second client run on the failed item reports the stored error without claiming.
    let claims = h.source.claim_calls().await;
    let again = h.scheduler.run_once(&Rid::new("1-F")).await.unwrap();
    assert!(matches!(again, ClientOutcome::Failed { .. }));
    assert_eq!(h.source.claim_calls().await, claims);
    assert_eq!(h.scratch_entries(), 0);
}

#[tokio::test]
async fn test_manual_requeue_after_error() {
    let h = TestHarness::new(&["1-Q"]).await;
    h.tool
        .script_once(Stage::Normalize, ToolBehavior::FailPermanent("bad header".into()))
        .await;

    h.scheduler.run_cycle().await.unwrap();
    assert_eq!(h.item("1-Q").await.status, ProcessingStatus::Error);

    let item = h.scheduler.requeue(&Rid::new("1-Q")).await.unwrap();
    assert_eq!(item.status, ProcessingStatus::Unclaimed);
    assert_eq!(item.retry_count, 0);

    let report = h.scheduler.run_cycle().await.unwrap();
    assert_eq!(report.completed, 1);
    assert_eq!(h.item("1-Q").await.status, ProcessingStatus::Complete);
}

#[tokio::test]
async fn test_shutdown_mid_attempt_releases_item() {
    let h = TestHarness::new(&["1-S"]).await;
    h.tool
        .script(Stage::Pyramid, ToolBehavior::Slow(Duration::from_millis(300)))
        .await;

    let (report, _) = tokio::join!(h.scheduler.run_cycle(), async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        h.scheduler.shutdown();
    });
    let report = report.unwrap();
    assert_eq!(report.interrupted, 1);
    assert_eq!(report.completed, 0);

    let item = h.item("1-S").await;
    assert_eq!(item.status, ProcessingStatus::Unclaimed);
    assert!(item.lease.is_none());
    assert_eq!(item.retry_count, 0);
    assert!(item.retry_after.is_none());

    assert_eq!(h.scratch_entries(), 0);
    assert!(h.store.uploads().await.is_empty());
    assert!(h.notifier.sent().await.is_empty());
}

#[tokio::test]
async fn test_client_mode_reports_backoff() {
    let h = TestHarness::new(&[]).await;
    let retry_after = chrono::Utc::now() + chrono::Duration::hours(1);
    let mut item = fixtures::work_item("1-W");
    item.retry_count = 1;
    item.retry_after = Some(retry_after);
    h.source.insert(item).await;

    let outcome = h.scheduler.run_once(&Rid::new("1-W")).await.unwrap();
    assert_eq!(
        outcome,
        ClientOutcome::BackingOff {
            retry_count: 1,
            retry_after,
        }
    );
    assert_eq!(outcome.exit_code(), 2);
    assert!(outcome.describe().contains("waiting for retry"));
    assert_eq!(h.source.claim_calls().await, 0);
}
