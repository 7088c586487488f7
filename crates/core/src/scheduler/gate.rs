//! Stage gate backed by a held lease.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::debug;

use crate::claim::{ClaimCoordinator, ClaimError};
use crate::pipeline::{PipelineError, Stage, StageGate};
use crate::work_item::{ProcessingStatus, Rid};

/// Renews the lease at every stage boundary and stops on shutdown.
///
/// The first boundary moves the item `Claimed -> Processing`; later ones
/// are same-status heartbeats.
pub struct LeaseGate {
    coordinator: Arc<ClaimCoordinator>,
    rid: Rid,
    shutdown: watch::Receiver<bool>,
}

impl LeaseGate {
    pub fn new(
        coordinator: Arc<ClaimCoordinator>,
        rid: Rid,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            coordinator,
            rid,
            shutdown,
        }
    }
}

#[async_trait]
impl StageGate for LeaseGate {
    async fn before_stage(&self, stage: Stage) -> Result<(), PipelineError> {
        if *self.shutdown.borrow() {
            return Err(PipelineError::Interrupted { stage });
        }

        match self
            .coordinator
            .advance(&self.rid, ProcessingStatus::Processing)
            .await
        {
            Ok(_) => {
                debug!("Lease on {} renewed before {} stage", self.rid, stage);
                Ok(())
            }
            Err(ClaimError::Source(e)) if e.is_retryable() => Err(PipelineError::transient(
                stage,
                format!("lease renewal failed: {}", e),
            )),
            Err(e) => Err(PipelineError::LeaseLost {
                stage,
                reason: e.to_string(),
            }),
        }
    }
}
