//! Scheduler implementation.
//!
//! Server mode polls the work source, claims and processes items through a
//! bounded pool, then sleeps. Client mode runs exactly one cycle on a named
//! item.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use tokio::sync::{watch, RwLock, Semaphore};
use tracing::{debug, error, info, warn};

use super::config::SchedulerConfig;
use super::types::{ClientOutcome, CycleReport, ItemOutcome, SchedulerError, SchedulerStatus};
use super::worker::ItemWorker;
use crate::claim::ClaimCoordinator;
use crate::failure::AttemptFailure;
use crate::metrics;
use crate::work_item::{ProcessingStatus, Rid, WorkItem};

/// Polling scheduler for one worker process.
pub struct Scheduler {
    config: SchedulerConfig,
    worker: ItemWorker,

    // Runtime state
    running: Arc<AtomicBool>,
    cycles: AtomicU64,
    last_cycle: RwLock<Option<CycleReport>>,
    shutdown_tx: watch::Sender<bool>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, worker: ItemWorker) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            config,
            worker,
            running: Arc::new(AtomicBool::new(false)),
            cycles: AtomicU64::new(0),
            last_cycle: RwLock::new(None),
            shutdown_tx,
        }
    }

    fn coordinator(&self) -> &Arc<ClaimCoordinator> {
        self.worker.coordinator()
    }

    /// Ask in-flight attempts to stop at their next stage boundary and the
    /// loop to exit.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Run until [`Scheduler::shutdown`] is called, then release held leases.
    pub async fn run(&self) -> Result<(), SchedulerError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(SchedulerError::AlreadyRunning);
        }

        info!(
            "Scheduler started (worker {}, pool {}, poll every {}s)",
            self.coordinator().worker_id(),
            self.config.max_concurrent,
            self.config.poll_interval_secs
        );

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            let found_work = match self.run_cycle().await {
                Ok(report) => report.claimed() > 0,
                Err(e) => {
                    warn!("Poll cycle failed: {}", e);
                    false
                }
            };

            // Drain the backlog before sleeping.
            if found_work {
                continue;
            }

            tokio::select! {
                _ = shutdown_rx.changed() => {
                    info!("Scheduler received shutdown signal");
                }
                _ = tokio::time::sleep(self.config.poll_interval()) => {}
            }
        }

        let released = self
            .coordinator()
            .release_all("worker shutting down")
            .await;
        if released > 0 {
            info!("Released {} lease(s) on shutdown", released);
        }
        metrics::LEASES_HELD.set(0);
        self.running.store(false, Ordering::SeqCst);
        info!("Scheduler stopped");
        Ok(())
    }

    /// One poll: list, then claim and process each item through the pool.
    ///
    /// Item failures are routed and counted; only a failed listing is an error.
    pub async fn run_cycle(&self) -> Result<CycleReport, SchedulerError> {
        metrics::POLL_CYCLES_TOTAL.inc();
        self.cycles.fetch_add(1, Ordering::Relaxed);

        let mut report = CycleReport {
            started_at: Some(Utc::now()),
            ..Default::default()
        };

        let items = self
            .coordinator()
            .list_claimable(self.config.batch_limit)
            .await?;
        report.listed = items.len();
        debug!("Poll found {} claimable item(s)", items.len());

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent.max(1)));
        let handles = items.iter().map(|item| {
            let semaphore = Arc::clone(&semaphore);
            let worker = self.worker.clone();
            let shutdown = self.shutdown_tx.subscribe();
            let task_item = item.clone();

            tokio::spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return ItemOutcome::Skipped;
                };
                worker.process(task_item, shutdown).await
            })
        });
        let joined = join_all(handles).await;

        for (item, joined) in items.iter().zip(joined) {
            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(e) => self.recover_panicked(item, e).await,
            };
            report.record(&outcome);
        }

        metrics::LEASES_HELD.set(self.coordinator().leases().len().await as i64);
        report.finished_at = Some(Utc::now());
        if report.listed > 0 {
            info!(
                "Cycle done: {} listed, {} completed, {} requeued, {} failed, {} skipped",
                report.listed, report.completed, report.requeued, report.failed, report.skipped
            );
        }
        *self.last_cycle.write().await = Some(report.clone());
        Ok(report)
    }

    /// A panicked attempt still holds its lease; route it like a transient failure.
    async fn recover_panicked(&self, item: &WorkItem, e: tokio::task::JoinError) -> ItemOutcome {
        error!("Attempt on {} panicked: {}", item.rid, e);
        if !self.coordinator().leases().contains(&item.rid).await {
            return ItemOutcome::Abandoned {
                reason: e.to_string(),
            };
        }
        let failure = AttemptFailure::Panicked(e.to_string());
        let outcome: ItemOutcome = self
            .worker
            .router()
            .apply(self.coordinator(), item, &failure)
            .await
            .into();
        metrics::ATTEMPTS_TOTAL
            .with_label_values(&[outcome.label()])
            .inc();
        outcome
    }

    /// Client mode: exactly one claim-process-publish cycle on `rid`.
    pub async fn run_once(&self, rid: &Rid) -> Result<ClientOutcome, SchedulerError> {
        let item = self
            .coordinator()
            .get(rid)
            .await?
            .ok_or_else(|| SchedulerError::NotFound(rid.to_string()))?;

        match item.status {
            ProcessingStatus::Complete => {
                info!("{} is already complete; nothing to do", rid);
                return Ok(ClientOutcome::AlreadyComplete);
            }
            ProcessingStatus::Error => {
                return Ok(ClientOutcome::Failed {
                    reason: item
                        .error_detail
                        .unwrap_or_else(|| "item is in error state".to_string()),
                });
            }
            _ => {}
        }

        let now = Utc::now();
        if let (ProcessingStatus::Unclaimed, Some(retry_after)) = (item.status, item.retry_after) {
            if retry_after > now {
                return Ok(ClientOutcome::BackingOff {
                    retry_count: item.retry_count,
                    retry_after,
                });
            }
        }

        if !item.is_claimable(now, self.coordinator().lease_timeout()) {
            return Ok(ClientOutcome::Busy {
                status: item.status.to_string(),
            });
        }

        let worker = self.worker.clone();
        let shutdown = self.shutdown_tx.subscribe();
        let task_item = item.clone();
        let outcome = match tokio::spawn(async move { worker.process(task_item, shutdown).await })
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => self.recover_panicked(&item, e).await,
        };

        Ok(match outcome {
            ItemOutcome::Completed => ClientOutcome::Completed,
            ItemOutcome::Requeued { retry_count } => ClientOutcome::Requeued { retry_count },
            ItemOutcome::Failed { reason } => ClientOutcome::Failed { reason },
            ItemOutcome::Interrupted => ClientOutcome::Requeued {
                retry_count: item.retry_count,
            },
            ItemOutcome::Skipped | ItemOutcome::Abandoned { .. } => ClientOutcome::Busy {
                status: self.current_status(rid).await,
            },
        })
    }

    async fn current_status(&self, rid: &Rid) -> String {
        match self.coordinator().get(rid).await {
            Ok(Some(item)) => item.status.to_string(),
            _ => "unknown".to_string(),
        }
    }

    /// Manual re-queue of an `Error` item: back to `Unclaimed`, retry count reset.
    pub async fn requeue(&self, rid: &Rid) -> Result<WorkItem, SchedulerError> {
        let item = self.coordinator().source().requeue(rid).await?;
        info!("Requeued {} for processing", rid);
        Ok(item)
    }

    pub async fn status(&self) -> SchedulerStatus {
        SchedulerStatus {
            running: self.running.load(Ordering::Relaxed),
            worker_id: self.coordinator().worker_id().to_string(),
            source: self.coordinator().source().name().to_string(),
            max_concurrent: self.config.max_concurrent,
            poll_interval_secs: self.config.poll_interval_secs,
            cycles: self.cycles.load(Ordering::Relaxed),
            leases: self.coordinator().leases().snapshot().await,
            last_cycle: self.last_cycle.read().await.clone(),
        }
    }
}
