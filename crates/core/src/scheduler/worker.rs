//! One claim-process-publish cycle for a single item.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::gate::LeaseGate;
use super::types::ItemOutcome;
use crate::claim::ClaimCoordinator;
use crate::failure::{AttemptFailure, FailureRouter};
use crate::metrics;
use crate::pipeline::{AttemptPhase, PipelineExecutor, ProcessingAttempt};
use crate::publish::ResultPublisher;
use crate::work_item::WorkItem;

/// Everything an item attempt needs. Cheap to clone into spawned tasks.
#[derive(Clone)]
pub struct ItemWorker {
    coordinator: Arc<ClaimCoordinator>,
    executor: Arc<PipelineExecutor>,
    publisher: Arc<ResultPublisher>,
    router: Arc<FailureRouter>,
}

impl ItemWorker {
    pub fn new(
        coordinator: Arc<ClaimCoordinator>,
        executor: Arc<PipelineExecutor>,
        publisher: Arc<ResultPublisher>,
        router: Arc<FailureRouter>,
    ) -> Self {
        Self {
            coordinator,
            executor,
            publisher,
            router,
        }
    }

    pub fn coordinator(&self) -> &Arc<ClaimCoordinator> {
        &self.coordinator
    }

    pub fn router(&self) -> &Arc<FailureRouter> {
        &self.router
    }

    /// Claim `item` and drive it to a recorded outcome.
    ///
    /// Every path after a successful claim ends in exactly one of: the
    /// publisher's `Complete` write, a router write, or a deliberate
    /// abandon after the lease moved.
    pub async fn process(&self, item: WorkItem, shutdown: watch::Receiver<bool>) -> ItemOutcome {
        if *shutdown.borrow() {
            return ItemOutcome::Skipped;
        }

        if let Err(e) = self.coordinator.claim(&item).await {
            if e.is_conflict() {
                debug!("Skipping {}: {}", item.rid, e);
            } else {
                warn!("Failed to claim {}: {}", item.rid, e);
            }
            return ItemOutcome::Skipped;
        }

        let mut attempt = ProcessingAttempt::new(item.rid.clone());
        let outcome = match self.attempt(&item, &mut attempt, shutdown).await {
            Ok(()) => {
                attempt.enter(AttemptPhase::Finished);
                info!("Completed {} in {}ms", item.rid, attempt.elapsed_ms());
                ItemOutcome::Completed
            }
            Err(failure) => {
                attempt.fail(failure.to_string());
                warn!(
                    "Attempt on {} failed after {}ms: {}",
                    item.rid,
                    attempt.elapsed_ms(),
                    failure
                );
                self.router
                    .apply(&self.coordinator, &item, &failure)
                    .await
                    .into()
            }
        };

        metrics::ATTEMPTS_TOTAL
            .with_label_values(&[outcome.label()])
            .inc();
        outcome
    }

    async fn attempt(
        &self,
        item: &WorkItem,
        attempt: &mut ProcessingAttempt,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), AttemptFailure> {
        let gate = LeaseGate::new(self.coordinator.clone(), item.rid.clone(), shutdown);
        let result = self.executor.execute(item, &gate, attempt).await?;

        attempt.enter(AttemptPhase::Publishing);
        let published = self.publisher.publish(&result).await;

        let scratch = result.scratch_path().to_path_buf();
        if let Err(e) = result.discard() {
            warn!(
                "Failed to remove scratch {} for {}: {}",
                scratch.display(),
                item.rid,
                e
            );
        }

        published?;
        Ok(())
    }
}
