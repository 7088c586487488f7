//! Claim coordinator.

use std::sync::Arc;

use chrono::{Duration, Utc};
use tracing::{debug, info, warn};

use super::error::ClaimError;
use super::registry::LeaseRegistry;
use crate::metrics;
use crate::work_item::{
    CatalogResult, ClaimableQuery, Lease, LeaseMarker, ProcessingStatus, Rid, StatusUpdate,
    WorkItem, WorkSource, WorkSourceError,
};

/// At-most-one-claimant access to work items.
///
/// Mutual exclusion comes from one conditional write per claim against the
/// work source; the coordinator adds the lease bookkeeping for this process.
pub struct ClaimCoordinator {
    source: Arc<dyn WorkSource>,
    worker_id: String,
    lease_timeout: Duration,
    leases: LeaseRegistry,
}

impl ClaimCoordinator {
    pub fn new(
        source: Arc<dyn WorkSource>,
        worker_id: impl Into<String>,
        lease_timeout: std::time::Duration,
    ) -> Self {
        Self {
            source,
            worker_id: worker_id.into(),
            lease_timeout: Duration::from_std(lease_timeout).unwrap_or(Duration::MAX),
            leases: LeaseRegistry::new(),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn lease_timeout(&self) -> Duration {
        self.lease_timeout
    }

    pub fn source(&self) -> &Arc<dyn WorkSource> {
        &self.source
    }

    pub fn leases(&self) -> &LeaseRegistry {
        &self.leases
    }

    /// Items a new claim may be attempted on, excluding ones this process holds.
    pub async fn list_claimable(&self, limit: usize) -> Result<Vec<WorkItem>, WorkSourceError> {
        let query = ClaimableQuery::new(self.lease_timeout).with_limit(limit);
        let items = self.source.list_claimable(&query).await?;

        let mut claimable = Vec::with_capacity(items.len());
        for item in items {
            if item.is_claimable(query.now, self.lease_timeout)
                && !self.leases.contains(&item.rid).await
            {
                claimable.push(item);
            }
        }
        Ok(claimable)
    }

    pub async fn get(&self, rid: &Rid) -> Result<Option<WorkItem>, WorkSourceError> {
        self.source.get(rid).await
    }

    /// Claim `item` with a single conditional write keyed on its observed version.
    pub async fn claim(&self, item: &WorkItem) -> Result<Lease, ClaimError> {
        if !item.is_claimable(Utc::now(), self.lease_timeout) {
            metrics::CLAIMS_TOTAL
                .with_label_values(&["not_claimable"])
                .inc();
            return Err(ClaimError::NotClaimable {
                rid: item.rid.to_string(),
                status: item.status.to_string(),
            });
        }

        if let Some(stale) = item.lease.as_ref().filter(|_| item.status.is_leased()) {
            warn!(
                "Reclaiming stale lease on {} held by {} since {}",
                item.rid, stale.owner, stale.leased_at
            );
        }

        let marker = LeaseMarker::new(&self.worker_id);
        match self.source.claim(item, &marker).await {
            Ok(claimed) => {
                let lease = Lease::from_claimed(&claimed, &marker);
                self.leases.insert(lease.clone()).await;
                metrics::CLAIMS_TOTAL.with_label_values(&["claimed"]).inc();
                info!("Claimed {} (lease {})", item.rid, lease.token);
                Ok(lease)
            }
            Err(WorkSourceError::Conflict { rid, reason }) => {
                metrics::CLAIMS_TOTAL.with_label_values(&["conflict"]).inc();
                debug!("Lost claim race on {}: {}", rid, reason);
                Err(ClaimError::Conflict { rid, reason })
            }
            Err(e) => {
                metrics::CLAIMS_TOTAL.with_label_values(&["error"]).inc();
                Err(ClaimError::Source(e))
            }
        }
    }

    /// Move a held item forward (or heartbeat with its current status).
    pub async fn advance(
        &self,
        rid: &Rid,
        status: ProcessingStatus,
    ) -> Result<WorkItem, ClaimError> {
        self.write(rid, StatusUpdate::new(status)).await
    }

    /// Refresh the lease without changing status.
    pub async fn heartbeat(&self, rid: &Rid) -> Result<WorkItem, ClaimError> {
        let lease = self
            .leases
            .get(rid)
            .await
            .ok_or_else(|| ClaimError::NotHeld(rid.to_string()))?;
        self.write(rid, StatusUpdate::new(lease.status)).await
    }

    /// Final write: `Uploading -> Complete` with result metadata.
    pub async fn complete(
        &self,
        rid: &Rid,
        result: CatalogResult,
    ) -> Result<WorkItem, ClaimError> {
        self.write(
            rid,
            StatusUpdate::new(ProcessingStatus::Complete).with_result(result),
        )
        .await
    }

    /// Give the item back (`Unclaimed`) or fail it (`Error`).
    ///
    /// The local lease is dropped whatever the write's outcome; an unwritten
    /// release leaves a lease that goes stale and is reclaimed.
    pub async fn release(
        &self,
        rid: &Rid,
        update: StatusUpdate,
    ) -> Result<WorkItem, ClaimError> {
        debug_assert!(!update.keeps_lease());
        let result = self.write(rid, update).await;
        self.leases.remove(rid).await;
        result
    }

    /// Drop a lease locally without writing (the record already moved on).
    pub async fn forget(&self, rid: &Rid) -> Option<Lease> {
        self.leases.remove(rid).await
    }

    /// Release every lease still held, without consuming retry budget.
    pub async fn release_all(&self, reason: &str) -> usize {
        let mut released = 0;
        for lease in self.leases.snapshot().await {
            let update = StatusUpdate::new(ProcessingStatus::Unclaimed).with_error(reason);
            match self.release(&lease.rid, update).await {
                Ok(_) => {
                    released += 1;
                    info!("Released lease on {} ({})", lease.rid, reason);
                }
                Err(e) => warn!("Failed to release lease on {}: {}", lease.rid, e),
            }
        }
        released
    }

    async fn write(&self, rid: &Rid, update: StatusUpdate) -> Result<WorkItem, ClaimError> {
        let mut lease = self
            .leases
            .get(rid)
            .await
            .ok_or_else(|| ClaimError::NotHeld(rid.to_string()))?;

        if !lease.status.can_transition_to(update.status) {
            return Err(ClaimError::Source(WorkSourceError::InvalidTransition {
                rid: rid.to_string(),
                from: lease.status.to_string(),
                to: update.status.to_string(),
            }));
        }

        let keeps_lease = update.keeps_lease();
        match self.source.update(&lease, update).await {
            Ok(written) => {
                if keeps_lease {
                    lease.advance(&written);
                    self.leases.insert(lease).await;
                } else {
                    self.leases.remove(rid).await;
                }
                Ok(written)
            }
            Err(WorkSourceError::Conflict { rid, reason }) => {
                self.leases.remove(&lease.rid).await;
                metrics::LEASES_LOST_TOTAL.inc();
                warn!("Lease on {} expired: {}", rid, reason);
                Err(ClaimError::LeaseExpired { rid, reason })
            }
            Err(e) => Err(ClaimError::Source(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockWorkSource;

    fn coordinator(source: Arc<MockWorkSource>, worker: &str) -> ClaimCoordinator {
        ClaimCoordinator::new(source, worker, std::time::Duration::from_secs(60))
    }

    #[tokio::test]
    async fn test_claim_then_advance_to_complete() {
        let source = Arc::new(MockWorkSource::with_items(&["1-A"]));
        let coord = coordinator(source.clone(), "worker-a");

        let items = coord.list_claimable(10).await.unwrap();
        let lease = coord.claim(&items[0]).await.unwrap();
        assert_eq!(lease.owner, "worker-a");
        assert!(coord.leases().contains(&lease.rid).await);

        // Held items are not offered again to this process.
        assert!(coord.list_claimable(10).await.unwrap().is_empty());

        coord
            .advance(&lease.rid, ProcessingStatus::Processing)
            .await
            .unwrap();
        coord.heartbeat(&lease.rid).await.unwrap();
        coord
            .advance(&lease.rid, ProcessingStatus::Uploading)
            .await
            .unwrap();
        let done = coord
            .complete(&lease.rid, crate::testing::fixtures::catalog_result())
            .await
            .unwrap();
        assert_eq!(done.status, ProcessingStatus::Complete);
        assert!(done.lease.is_none());
        assert!(coord.leases().is_empty().await);
    }

    #[tokio::test]
    async fn test_conflicting_claim_is_reported_not_raised() {
        let source = Arc::new(MockWorkSource::with_items(&["1-X"]));
        let a = coordinator(source.clone(), "worker-a");
        let b = coordinator(source.clone(), "worker-b");

        let seen_a = a.list_claimable(10).await.unwrap();
        let seen_b = b.list_claimable(10).await.unwrap();

        a.claim(&seen_a[0]).await.unwrap();
        let err = b.claim(&seen_b[0]).await.unwrap_err();
        assert!(err.is_conflict());
        assert!(matches!(err, ClaimError::Conflict { .. }));
        assert!(b.leases().is_empty().await);
    }

    #[tokio::test]
    async fn test_complete_item_is_not_claimable() {
        let source = Arc::new(MockWorkSource::with_items(&["1-A"]));
        source
            .set_status(&Rid::new("1-A"), ProcessingStatus::Complete)
            .await;
        let coord = coordinator(source.clone(), "worker-a");

        assert!(coord.list_claimable(10).await.unwrap().is_empty());
        let item = coord.get(&Rid::new("1-A")).await.unwrap().unwrap();
        let err = coord.claim(&item).await.unwrap_err();
        assert!(matches!(err, ClaimError::NotClaimable { .. }));
        assert_eq!(source.claim_calls().await, 0);
    }

    #[tokio::test]
    async fn test_stale_holder_gets_lease_expired() {
        let source = Arc::new(MockWorkSource::with_items(&["1-A"]));
        let a = ClaimCoordinator::new(source.clone(), "worker-a", std::time::Duration::ZERO);
        let b = ClaimCoordinator::new(source.clone(), "worker-b", std::time::Duration::ZERO);

        let item = a.list_claimable(10).await.unwrap().remove(0);
        a.claim(&item).await.unwrap();

        // With a zero lease timeout the lease is immediately stale for B.
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let stale = b.get(&Rid::new("1-A")).await.unwrap().unwrap();
        b.claim(&stale).await.unwrap();

        let err = a
            .advance(&Rid::new("1-A"), ProcessingStatus::Processing)
            .await
            .unwrap_err();
        assert!(matches!(err, ClaimError::LeaseExpired { .. }));
        assert!(a.leases().is_empty().await);
    }

    #[tokio::test]
    async fn test_release_drops_lease_even_when_write_fails() {
        let source = Arc::new(MockWorkSource::with_items(&["1-A"]));
        let coord = coordinator(source.clone(), "worker-a");
        let item = coord.list_claimable(10).await.unwrap().remove(0);
        let lease = coord.claim(&item).await.unwrap();

        source
            .fail_next_update(WorkSourceError::Unavailable("catalog down".into()))
            .await;
        let result = coord
            .release(&lease.rid, StatusUpdate::new(ProcessingStatus::Unclaimed))
            .await;
        assert!(result.is_err());
        assert!(coord.leases().is_empty().await);
    }

    #[tokio::test]
    async fn test_invalid_transition_rejected_locally() {
        let source = Arc::new(MockWorkSource::with_items(&["1-A"]));
        let coord = coordinator(source.clone(), "worker-a");
        let item = coord.list_claimable(10).await.unwrap().remove(0);
        let lease = coord.claim(&item).await.unwrap();

        let err = coord
            .advance(&lease.rid, ProcessingStatus::Complete)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ClaimError::Source(WorkSourceError::InvalidTransition { .. })
        ));
        assert_eq!(source.update_calls().await, 0);
    }

    #[tokio::test]
    async fn test_release_all_returns_items_to_pool() {
        let source = Arc::new(MockWorkSource::with_items(&["1-A", "1-B"]));
        let coord = coordinator(source.clone(), "worker-a");
        for item in coord.list_claimable(10).await.unwrap() {
            coord.claim(&item).await.unwrap();
        }

        assert_eq!(coord.release_all("shutdown").await, 2);
        let a = source.item(&Rid::new("1-A")).await.unwrap();
        assert_eq!(a.status, ProcessingStatus::Unclaimed);
        assert_eq!(a.retry_count, 0);
    }
}
