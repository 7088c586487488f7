//! Claim errors.

use thiserror::Error;

use crate::work_item::WorkSourceError;

#[derive(Debug, Error)]
pub enum ClaimError {
    /// Another worker won the conditional claim.
    #[error("Claim conflict on {rid}: {reason}")]
    Conflict { rid: String, reason: String },

    /// The observed record does not permit a claim.
    #[error("{rid} is not claimable (status {status})")]
    NotClaimable { rid: String, status: String },

    /// The holder's conditional update failed because the record moved.
    #[error("Lease on {rid} expired: {reason}")]
    LeaseExpired { rid: String, reason: String },

    #[error("No lease held on {0}")]
    NotHeld(String),

    #[error(transparent)]
    Source(#[from] WorkSourceError),
}

impl ClaimError {
    /// Outcomes where another worker owns the item; skip without a write.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            ClaimError::Conflict { .. } | ClaimError::NotClaimable { .. } | ClaimError::LeaseExpired { .. }
        )
    }
}
