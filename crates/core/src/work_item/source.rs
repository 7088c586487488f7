//! Work source trait and error type.

use async_trait::async_trait;
use thiserror::Error;

use super::types::{ClaimableQuery, Lease, LeaseMarker, Rid, StatusUpdate, WorkItem};

/// Errors from a work source.
#[derive(Debug, Error)]
pub enum WorkSourceError {
    #[error("Work item not found: {0}")]
    NotFound(String),

    /// The conditional write was rejected because the record moved.
    #[error("Conditional write rejected for {rid}: {reason}")]
    Conflict { rid: String, reason: String },

    #[error("Invalid status transition for {rid}: {from} -> {to}")]
    InvalidTransition {
        rid: String,
        from: String,
        to: String,
    },

    #[error("Catalog request timed out: {0}")]
    Timeout(String),

    #[error("Catalog unavailable: {0}")]
    Unavailable(String),

    #[error("Catalog rejected request (HTTP {status}): {message}")]
    Api { status: u16, message: String },

    #[error("Malformed catalog record: {0}")]
    Malformed(String),

    #[error("Database error: {0}")]
    Database(String),
}

impl WorkSourceError {
    pub fn conflict(rid: &Rid, reason: impl Into<String>) -> Self {
        Self::Conflict {
            rid: rid.to_string(),
            reason: reason.into(),
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// Environment failures worth retrying on a later cycle.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::Unavailable(_) | Self::Database(_) => true,
            Self::Api { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }
}

/// A catalog of work items supporting single-record compare-and-set.
///
/// Every mutating operation is one conditional write. Implementations must
/// never read-then-write without a precondition.
#[async_trait]
pub trait WorkSource: Send + Sync {
    /// Backend name for logs and status output.
    fn name(&self) -> &str;

    /// List candidate items. Implementations may over-return; callers filter
    /// with [`WorkItem::is_claimable`].
    async fn list_claimable(&self, query: &ClaimableQuery)
        -> Result<Vec<WorkItem>, WorkSourceError>;

    async fn get(&self, rid: &Rid) -> Result<Option<WorkItem>, WorkSourceError>;

    /// Conditionally move `item` to `Claimed`, keyed on the state observed
    /// in `item` (its `version` where the backend versions single rows).
    ///
    /// Returns the updated record. A record that moved since `item` was
    /// read yields [`WorkSourceError::Conflict`].
    async fn claim(&self, item: &WorkItem, lease: &LeaseMarker)
        -> Result<WorkItem, WorkSourceError>;

    /// Conditional write by the current lease holder, keyed on the lease's
    /// last written version. Refreshes `leased_at` when the lease is kept and
    /// clears the lease marker otherwise.
    async fn update(&self, lease: &Lease, update: StatusUpdate)
        -> Result<WorkItem, WorkSourceError>;

    /// Manual re-queue: `Error -> Unclaimed` with the retry count reset.
    async fn requeue(&self, rid: &Rid) -> Result<WorkItem, WorkSourceError>;
}
