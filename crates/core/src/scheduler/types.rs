//! Types for the scheduler.

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::failure::Disposition;
use crate::work_item::{Lease, WorkSourceError};

/// Errors that stop a cycle or a client run before any item is touched.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("work item not found: {0}")]
    NotFound(String),

    #[error("scheduler already running")]
    AlreadyRunning,

    #[error("work source error: {0}")]
    Source(#[from] WorkSourceError),
}

/// What happened to one listed item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum ItemOutcome {
    Completed,
    /// Not claimed: another worker holds it, or shutdown began first.
    Skipped,
    Requeued { retry_count: u32 },
    /// Unclaimed but still waiting out the backoff of an earlier failure.
    BackingOff {
        retry_count: u32,
        retry_after: DateTime<Utc>,
    },
    Failed { reason: String },
    /// Stopped at a stage boundary by shutdown; lease released.
    Interrupted,
    /// Lease lost mid-attempt; nothing written.
    Abandoned { reason: String },
}

impl ItemOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            ItemOutcome::Completed => "completed",
            ItemOutcome::Skipped => "skipped",
            ItemOutcome::Requeued { .. } => "requeued",
            ItemOutcome::Failed { .. } => "failed",
            ItemOutcome::Interrupted => "interrupted",
            ItemOutcome::Abandoned { .. } => "abandoned",
        }
    }
}

impl From<Disposition> for ItemOutcome {
    fn from(disposition: Disposition) -> Self {
        match disposition {
            Disposition::Requeue { retry_count, .. } => ItemOutcome::Requeued { retry_count },
            Disposition::Terminal { reason, .. } => ItemOutcome::Failed { reason },
            Disposition::Release { .. } => ItemOutcome::Interrupted,
            Disposition::Abandon { reason } => ItemOutcome::Abandoned { reason },
        }
    }
}

/// Summary of one poll cycle.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleReport {
    pub listed: usize,
    pub completed: usize,
    pub skipped: usize,
    pub requeued: usize,
    pub failed: usize,
    pub interrupted: usize,
    pub abandoned: usize,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl CycleReport {
    pub fn record(&mut self, outcome: &ItemOutcome) {
        match outcome {
            ItemOutcome::Completed => self.completed += 1,
            ItemOutcome::Skipped => self.skipped += 1,
            ItemOutcome::Requeued { .. } => self.requeued += 1,
            ItemOutcome::Failed { .. } => self.failed += 1,
            ItemOutcome::Interrupted => self.interrupted += 1,
            ItemOutcome::Abandoned { .. } => self.abandoned += 1,
        }
    }

    /// Items this worker actually claimed during the cycle.
    pub fn claimed(&self) -> usize {
        self.listed - self.skipped
    }
}

/// Result of a client-mode run on one RID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum ClientOutcome {
    /// Already `Complete`; nothing was reprocessed.
    AlreadyComplete,
    Completed,
    Requeued { retry_count: u32 },
    /// Unclaimed but still waiting out the backoff of an earlier failure.
    BackingOff {
        retry_count: u32,
        retry_after: DateTime<Utc>,
    },
    Failed { reason: String },
    /// Held by another worker, or not in a claimable state.
    Busy { status: String },
}

impl ClientOutcome {
    /// Process exit status: 0 complete or no-op, 1 error, 2 requeued or
    /// backing off, 3 busy.
    pub fn exit_code(&self) -> i32 {
        match self {
            ClientOutcome::AlreadyComplete | ClientOutcome::Completed => 0,
            ClientOutcome::Failed { .. } => 1,
            ClientOutcome::Requeued { .. } | ClientOutcome::BackingOff { .. } => 2,
            ClientOutcome::Busy { .. } => 3,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            ClientOutcome::AlreadyComplete => "already complete, nothing to do".to_string(),
            ClientOutcome::Completed => "complete".to_string(),
            ClientOutcome::Requeued { retry_count } => {
                format!("requeued for retry (retry count {})", retry_count)
            }
            ClientOutcome::BackingOff {
                retry_count,
                retry_after,
            } => format!(
                "waiting for retry until {} (retry count {})",
                retry_after.to_rfc3339(),
                retry_count
            ),
            ClientOutcome::Failed { reason } => format!("failed: {}", reason),
            ClientOutcome::Busy { status } => format!("not claimable (status {})", status),
        }
    }
}

/// Current status of the scheduler.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub running: bool,
    pub worker_id: String,
    pub source: String,
    pub max_concurrent: usize,
    pub poll_interval_secs: u64,
    pub cycles: u64,
    pub leases: Vec<Lease>,
    pub last_cycle: Option<CycleReport>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_exit_codes() {
        assert_eq!(ClientOutcome::AlreadyComplete.exit_code(), 0);
        assert_eq!(ClientOutcome::Completed.exit_code(), 0);
        assert_eq!(
            ClientOutcome::Failed {
                reason: "corrupt".into()
            }
            .exit_code(),
            1
        );
        assert_eq!(ClientOutcome::Requeued { retry_count: 1 }.exit_code(), 2);
        assert_eq!(
            ClientOutcome::BackingOff {
                retry_count: 1,
                retry_after: Utc::now(),
            }
            .exit_code(),
            2
        );
        assert_eq!(
            ClientOutcome::Busy {
                status: "processing".into()
            }
            .exit_code(),
            3
        );
    }

    #[test]
    fn test_cycle_report_counts() {
        let mut report = CycleReport {
            listed: 3,
            ..Default::default()
        };
        report.record(&ItemOutcome::Completed);
        report.record(&ItemOutcome::Skipped);
        report.record(&ItemOutcome::Requeued { retry_count: 1 });
        assert_eq!(report.completed, 1);
        assert_eq!(report.claimed(), 2);
    }

    #[test]
    fn test_outcome_serialization() {
        let json = serde_json::to_value(ItemOutcome::Requeued { retry_count: 2 }).unwrap();
        assert_eq!(json["outcome"], "requeued");
        assert_eq!(json["retry_count"], 2);
    }
}
