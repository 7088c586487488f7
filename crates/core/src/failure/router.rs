//! Failure routing.

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use super::config::RetryConfig;
use super::notify::{Notification, NotificationHandle};
use super::types::{AttemptFailure, Disposition, ErrorClass};
use crate::claim::{ClaimCoordinator, ClaimError};
use crate::pipeline::PipelineError;
use crate::work_item::{ProcessingStatus, StatusUpdate, WorkItem, WorkSourceError};

/// Longest error detail written to the catalog; notifications carry the full text.
const MAX_DETAIL_CHARS: usize = 4000;

/// Decides and records what happens to an item after a failed attempt.
pub struct FailureRouter {
    retry: RetryConfig,
    notifier: Option<NotificationHandle>,
    worker_id: String,
}

impl FailureRouter {
    pub fn new(retry: RetryConfig, worker_id: impl Into<String>) -> Self {
        Self {
            retry,
            notifier: None,
            worker_id: worker_id.into(),
        }
    }

    pub fn with_notifier(mut self, handle: NotificationHandle) -> Self {
        self.notifier = Some(handle);
        self
    }

    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    /// Classify a failure; `None` when the attempt has no say over the record.
    fn class_of(failure: &AttemptFailure) -> Option<ErrorClass> {
        match failure {
            AttemptFailure::Pipeline(PipelineError::StageFailed { class, .. }) => Some(*class),
            AttemptFailure::Pipeline(PipelineError::Scratch(_)) => Some(ErrorClass::Transient),
            AttemptFailure::Pipeline(_) => None,
            AttemptFailure::Publish(e) if e.is_lease_lost() => None,
            AttemptFailure::Publish(e) => Some(e.class()),
            AttemptFailure::Catalog(WorkSourceError::Conflict { .. })
            | AttemptFailure::Catalog(WorkSourceError::NotFound(_)) => None,
            AttemptFailure::Catalog(e) if e.is_retryable() => Some(ErrorClass::Transient),
            AttemptFailure::Catalog(_) => Some(ErrorClass::Permanent),
            AttemptFailure::Panicked(_) => Some(ErrorClass::Transient),
        }
    }

    /// Pure routing decision for `failure` on `item` as last observed.
    pub fn route(
        &self,
        item: &WorkItem,
        failure: &AttemptFailure,
        now: DateTime<Utc>,
    ) -> Disposition {
        let reason = truncate(&failure.diagnostic(), MAX_DETAIL_CHARS);

        if let AttemptFailure::Pipeline(PipelineError::Interrupted { .. }) = failure {
            return Disposition::Release { reason };
        }

        match Self::class_of(failure) {
            None => Disposition::Abandon { reason },
            Some(ErrorClass::Transient) if item.retry_count < self.retry.max_retries => {
                let retry_count = item.retry_count + 1;
                let delay = chrono::Duration::from_std(self.retry.backoff(retry_count))
                    .unwrap_or(chrono::Duration::MAX);
                Disposition::Requeue {
                    retry_count,
                    retry_after: now + delay,
                    reason,
                }
            }
            Some(ErrorClass::Transient) => Disposition::Terminal {
                retry_count: item.retry_count,
                reason: format!("retry budget exhausted: {}", reason),
                budget_exhausted: true,
            },
            Some(ErrorClass::Permanent) => Disposition::Terminal {
                retry_count: item.retry_count,
                reason,
                budget_exhausted: false,
            },
        }
    }

    /// Route `failure` and write the outcome through the coordinator.
    ///
    /// Returns the disposition actually applied: a write rejected because
    /// the lease moved downgrades to [`Disposition::Abandon`]. Exactly one
    /// notification is emitted per successful terminal write.
    pub async fn apply(
        &self,
        coordinator: &ClaimCoordinator,
        item: &WorkItem,
        failure: &AttemptFailure,
    ) -> Disposition {
        let disposition = self.route(item, failure, Utc::now());
        let rid = &item.rid;

        let update = match &disposition {
            Disposition::Abandon { reason } => {
                coordinator.forget(rid).await;
                warn!("Abandoning {} without a write: {}", rid, reason);
                return disposition;
            }
            Disposition::Release { reason } => {
                StatusUpdate::new(ProcessingStatus::Unclaimed).with_error(reason.clone())
            }
            Disposition::Requeue {
                retry_count,
                retry_after,
                reason,
            } => StatusUpdate::new(ProcessingStatus::Unclaimed)
                .with_retry(*retry_count, Some(*retry_after))
                .with_error(reason.clone()),
            Disposition::Terminal {
                retry_count,
                reason,
                ..
            } => StatusUpdate::new(ProcessingStatus::Error)
                .with_retry(*retry_count, None)
                .with_error(reason.clone()),
        };

        match coordinator.release(rid, update).await {
            Ok(_) => {}
            Err(e) => {
                let abandoned = Disposition::Abandon {
                    reason: format!("failed to record {}: {}", disposition.label(), e),
                };
                if matches!(e, ClaimError::Source(_)) {
                    error!("Could not record failure for {}: {}", rid, e);
                } else {
                    warn!("Lease on {} lost before recording failure: {}", rid, e);
                }
                return abandoned;
            }
        }

        match &disposition {
            Disposition::Requeue {
                retry_count,
                retry_after,
                ..
            } => info!(
                "Requeued {} (retry {}/{}, claimable after {})",
                rid, retry_count, self.retry.max_retries, retry_after
            ),
            Disposition::Release { .. } => info!("Released {} for another worker", rid),
            Disposition::Terminal { retry_count, .. } => {
                error!("Marked {} as failed: {}", rid, disposition.reason());
                self.notify(item, failure, *retry_count).await;
            }
            Disposition::Abandon { .. } => {}
        }

        disposition
    }

    async fn notify(&self, item: &WorkItem, failure: &AttemptFailure, retry_count: u32) {
        let Some(handle) = &self.notifier else {
            return;
        };
        handle
            .emit(Notification {
                rid: item.rid.to_string(),
                filename: item.filename.clone(),
                stage: failure.stage().map(|s| s.to_string()),
                retry_count,
                diagnostic: failure.diagnostic(),
                worker_id: self.worker_id.clone(),
                occurred_at: Utc::now(),
            })
            .await;
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::failure::notify::create_notification_system;
    use crate::pipeline::Stage;
    use crate::publish::PublishError;
    use crate::testing::{fixtures, MockNotifier, MockWorkSource};
    use crate::work_item::Rid;

    fn transient() -> AttemptFailure {
        PipelineError::transient(Stage::Package, "out of memory").into()
    }

    fn permanent() -> AttemptFailure {
        PipelineError::permanent(Stage::Package, "unsupported pixel type").into()
    }

    fn router() -> FailureRouter {
        FailureRouter::new(RetryConfig::default().with_max_retries(2), "worker-a")
    }

    #[test]
    fn test_transient_requeues_with_backoff() {
        let now = Utc::now();
        let item = fixtures::work_item("1-A");

        match router().route(&item, &transient(), now) {
            Disposition::Requeue {
                retry_count,
                retry_after,
                ..
            } => {
                assert_eq!(retry_count, 1);
                assert_eq!(retry_after, now + chrono::Duration::seconds(60));
            }
            other => panic!("unexpected disposition: {other:?}"),
        }
    }

    #[test]
    fn test_transient_at_budget_is_terminal() {
        let mut item = fixtures::work_item("1-A");
        item.retry_count = 2;

        match router().route(&item, &transient(), Utc::now()) {
            Disposition::Terminal {
                retry_count,
                budget_exhausted,
                ..
            } => {
                assert_eq!(retry_count, 2);
                assert!(budget_exhausted);
            }
            other => panic!("unexpected disposition: {other:?}"),
        }
    }

    #[test]
    fn test_permanent_keeps_retry_count() {
        let mut item = fixtures::work_item("1-A");
        item.retry_count = 1;
        assert_eq!(
            router().route(&item, &permanent(), Utc::now()),
            Disposition::Terminal {
                retry_count: 1,
                reason: "package stage failed (permanent): unsupported pixel type".to_string(),
                budget_exhausted: false,
            }
        );
    }

    #[test]
    fn test_lease_loss_and_shutdown() {
        let item = fixtures::work_item("1-A");
        let lost: AttemptFailure = PublishError::LeaseLost("moved".to_string()).into();
        assert!(matches!(
            router().route(&item, &lost, Utc::now()),
            Disposition::Abandon { .. }
        ));

        let interrupted: AttemptFailure = PipelineError::Interrupted {
            stage: Stage::Pyramid,
        }
        .into();
        assert!(matches!(
            router().route(&item, &interrupted, Utc::now()),
            Disposition::Release { .. }
        ));
    }

    #[test]
    fn test_catalog_errors() {
        let item = fixtures::work_item("1-A");
        let timeout = AttemptFailure::Catalog(WorkSourceError::Timeout("catalog".into()));
        assert!(matches!(
            router().route(&item, &timeout, Utc::now()),
            Disposition::Requeue { .. }
        ));
        let malformed = AttemptFailure::Catalog(WorkSourceError::Malformed("row".into()));
        assert!(matches!(
            router().route(&item, &malformed, Utc::now()),
            Disposition::Terminal { .. }
        ));
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("abcdef", 3), "abc...");
        assert_eq!(truncate("abc", 3), "abc");
    }

    async fn claimed(coordinator: &ClaimCoordinator) -> WorkItem {
        let item = coordinator.list_claimable(10).await.unwrap().remove(0);
        coordinator.claim(&item).await.unwrap();
        coordinator
            .advance(&item.rid, ProcessingStatus::Processing)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_apply_terminal_notifies_once() {
        let source = Arc::new(MockWorkSource::with_items(&["1-Z"]));
        let coordinator =
            ClaimCoordinator::new(source.clone(), "worker-a", std::time::Duration::from_secs(60));
        let notifier = Arc::new(MockNotifier::new());
        let (handle, dispatcher) = create_notification_system(notifier.clone(), 4);
        let task = tokio::spawn(dispatcher.run());
        let router = router().with_notifier(handle);

        let item = claimed(&coordinator).await;
        let applied = router.apply(&coordinator, &item, &permanent()).await;
        assert!(matches!(applied, Disposition::Terminal { .. }));

        drop(router);
        task.await.unwrap();

        let record = source.item(&Rid::new("1-Z")).await.unwrap();
        assert_eq!(record.status, ProcessingStatus::Error);
        assert_eq!(record.retry_count, 0);
        let sent = notifier.sent().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].stage.as_deref(), Some("package"));
    }

    #[tokio::test]
    async fn test_apply_requeue_writes_backoff() {
        let source = Arc::new(MockWorkSource::with_items(&["1-Y"]));
        let coordinator =
            ClaimCoordinator::new(source.clone(), "worker-a", std::time::Duration::from_secs(60));

        let item = claimed(&coordinator).await;
        let applied = router().apply(&coordinator, &item, &transient()).await;
        assert!(matches!(applied, Disposition::Requeue { retry_count: 1, .. }));

        let record = source.item(&Rid::new("1-Y")).await.unwrap();
        assert_eq!(record.status, ProcessingStatus::Unclaimed);
        assert_eq!(record.retry_count, 1);
        assert!(record.retry_after.unwrap() > Utc::now());
        assert!(record.lease.is_none());
        assert!(coordinator.leases().is_empty().await);
    }

    #[tokio::test]
    async fn test_apply_downgrades_to_abandon_on_conflict() {
        let source = Arc::new(MockWorkSource::with_items(&["1-A"]));
        let coordinator =
            ClaimCoordinator::new(source.clone(), "worker-a", std::time::Duration::from_secs(60));
        let notifier = Arc::new(MockNotifier::new());
        let (handle, dispatcher) = create_notification_system(notifier.clone(), 4);
        let task = tokio::spawn(dispatcher.run());
        let router = router().with_notifier(handle);

        let item = claimed(&coordinator).await;
        source
            .fail_next_update(WorkSourceError::Conflict {
                rid: "1-A".to_string(),
                reason: "version moved".to_string(),
            })
            .await;
        let applied = router.apply(&coordinator, &item, &permanent()).await;
        assert!(matches!(applied, Disposition::Abandon { .. }));

        drop(router);
        task.await.unwrap();
        assert!(notifier.sent().await.is_empty());
    }
}
