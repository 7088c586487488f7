//! Mock work source for testing.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use super::fixtures;
use crate::work_item::{
    ClaimableQuery, Lease, LeaseMarker, ProcessingStatus, Rid, StatusUpdate, WorkItem, WorkSource,
    WorkSourceError,
};

/// In-memory work source with real compare-and-set semantics.
///
/// Every mutation holds the write lock for its check and its write, so
/// concurrent claimants race exactly as they would against a catalog.
///
/// Provides controllable behavior for testing:
/// - Seed items by RID
/// - Inject failures into the next list or update
/// - Count claim and update calls
///
/// # Example
///
/// ```rust,ignore
/// use imaging_core::testing::MockWorkSource;
///
/// let source = MockWorkSource::with_items(&["1-A", "1-B"]);
/// source.fail_next_update(WorkSourceError::Timeout("catalog".into())).await;
/// ```
#[derive(Debug, Default)]
pub struct MockWorkSource {
    items: Arc<RwLock<BTreeMap<Rid, WorkItem>>>,
    next_version: Arc<RwLock<u64>>,
    list_errors: Arc<RwLock<VecDeque<WorkSourceError>>>,
    update_errors: Arc<RwLock<VecDeque<WorkSourceError>>>,
    claim_calls: Arc<RwLock<usize>>,
    update_calls: Arc<RwLock<usize>>,
}

impl MockWorkSource {
    /// Create an empty mock work source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a source holding one unclaimed fixture item per RID.
    pub fn with_items(rids: &[&str]) -> Self {
        let items = rids
            .iter()
            .enumerate()
            .map(|(i, rid)| {
                let mut item = fixtures::work_item(rid);
                item.version = (i + 1).to_string();
                (item.rid.clone(), item)
            })
            .collect();
        Self {
            items: Arc::new(RwLock::new(items)),
            next_version: Arc::new(RwLock::new(rids.len() as u64 + 1)),
            ..Self::default()
        }
    }

    /// Insert or replace an item as-is.
    pub async fn insert(&self, item: WorkItem) {
        self.items.write().await.insert(item.rid.clone(), item);
    }

    /// Get the stored record.
    pub async fn item(&self, rid: &Rid) -> Option<WorkItem> {
        self.items.read().await.get(rid).cloned()
    }

    /// Get all stored records in RID order.
    pub async fn items(&self) -> Vec<WorkItem> {
        self.items.read().await.values().cloned().collect()
    }

    /// Force a status, as an operator editing the catalog would.
    pub async fn set_status(&self, rid: &Rid, status: ProcessingStatus) {
        let version = self.bump().await;
        if let Some(item) = self.items.write().await.get_mut(rid) {
            item.status = status;
            if !status.is_leased() {
                item.lease = None;
            }
            item.version = version;
        }
    }

    /// Make the next `list_claimable` fail.
    pub async fn fail_next_list(&self, error: WorkSourceError) {
        self.list_errors.write().await.push_back(error);
    }

    /// Make the next `update` fail. Queued errors are used in order.
    pub async fn fail_next_update(&self, error: WorkSourceError) {
        self.update_errors.write().await.push_back(error);
    }

    /// Number of `claim` calls made.
    pub async fn claim_calls(&self) -> usize {
        *self.claim_calls.read().await
    }

    /// Number of `update` calls made.
    pub async fn update_calls(&self) -> usize {
        *self.update_calls.read().await
    }

    async fn bump(&self) -> String {
        let mut next = self.next_version.write().await;
        let version = *next;
        *next += 1;
        version.to_string()
    }
}

#[async_trait]
impl WorkSource for MockWorkSource {
    fn name(&self) -> &str {
        "mock"
    }

    async fn list_claimable(
        &self,
        query: &ClaimableQuery,
    ) -> Result<Vec<WorkItem>, WorkSourceError> {
        if let Some(error) = self.list_errors.write().await.pop_front() {
            return Err(error);
        }
        Ok(self
            .items
            .read()
            .await
            .values()
            .filter(|item| item.is_claimable(query.now, query.lease_timeout))
            .take(query.limit)
            .cloned()
            .collect())
    }

    async fn get(&self, rid: &Rid) -> Result<Option<WorkItem>, WorkSourceError> {
        Ok(self.item(rid).await)
    }

    async fn claim(
        &self,
        item: &WorkItem,
        lease: &LeaseMarker,
    ) -> Result<WorkItem, WorkSourceError> {
        *self.claim_calls.write().await += 1;
        let version = self.bump().await;

        let mut items = self.items.write().await;
        let current = items
            .get_mut(&item.rid)
            .ok_or_else(|| WorkSourceError::NotFound(item.rid.to_string()))?;

        if current.version != item.version || current.status.is_terminal() {
            return Err(WorkSourceError::conflict(
                &item.rid,
                format!(
                    "expected version {}, found {} ({})",
                    item.version, current.version, current.status
                ),
            ));
        }

        current.status = ProcessingStatus::Claimed;
        current.lease = Some(lease.clone());
        current.version = version;
        Ok(current.clone())
    }

    async fn update(
        &self,
        lease: &Lease,
        update: StatusUpdate,
    ) -> Result<WorkItem, WorkSourceError> {
        *self.update_calls.write().await += 1;
        if let Some(error) = self.update_errors.write().await.pop_front() {
            return Err(error);
        }
        let version = self.bump().await;

        let mut items = self.items.write().await;
        let current = items
            .get_mut(&lease.rid)
            .ok_or_else(|| WorkSourceError::NotFound(lease.rid.to_string()))?;

        if current.lease_token() != Some(&lease.token) || current.version != lease.version {
            return Err(WorkSourceError::conflict(
                &lease.rid,
                format!(
                    "lease no longer held (version {} -> {})",
                    lease.version, current.version
                ),
            ));
        }
        if !current.status.can_transition_to(update.status) {
            return Err(WorkSourceError::InvalidTransition {
                rid: lease.rid.to_string(),
                from: current.status.to_string(),
                to: update.status.to_string(),
            });
        }

        current.lease = if update.keeps_lease() {
            Some(LeaseMarker {
                owner: lease.owner.clone(),
                token: lease.token.clone(),
                leased_at: Utc::now(),
            })
        } else {
            None
        };
        if let Some(retry_count) = update.retry_count {
            current.retry_count = retry_count;
        }
        current.retry_after = update.retry_after;
        current.error_detail = match update.status {
            ProcessingStatus::Complete => None,
            _ => update.error_detail.or(current.error_detail.take()),
        };
        if let Some(result) = update.result {
            current.result = Some(result);
        }
        current.status = update.status;
        current.version = version;
        Ok(current.clone())
    }

    async fn requeue(&self, rid: &Rid) -> Result<WorkItem, WorkSourceError> {
        let version = self.bump().await;
        let mut items = self.items.write().await;
        let current = items
            .get_mut(rid)
            .ok_or_else(|| WorkSourceError::NotFound(rid.to_string()))?;

        if current.status != ProcessingStatus::Error {
            return Err(WorkSourceError::InvalidTransition {
                rid: rid.to_string(),
                from: current.status.to_string(),
                to: ProcessingStatus::Unclaimed.to_string(),
            });
        }

        current.status = ProcessingStatus::Unclaimed;
        current.retry_count = 0;
        current.retry_after = None;
        current.lease = None;
        current.version = version;
        Ok(current.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_claim_is_compare_and_set() {
        let source = MockWorkSource::with_items(&["1-A"]);
        let observed = source.item(&Rid::new("1-A")).await.unwrap();

        source
            .claim(&observed, &LeaseMarker::new("worker-a"))
            .await
            .unwrap();
        let err = source
            .claim(&observed, &LeaseMarker::new("worker-b"))
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(source.claim_calls().await, 2);
    }

    #[tokio::test]
    async fn test_injected_update_failure_is_consumed() {
        let source = MockWorkSource::with_items(&["1-A"]);
        let observed = source.item(&Rid::new("1-A")).await.unwrap();
        let marker = LeaseMarker::new("worker-a");
        let claimed = source.claim(&observed, &marker).await.unwrap();
        let lease = Lease::from_claimed(&claimed, &marker);

        source
            .fail_next_update(WorkSourceError::Timeout("catalog".into()))
            .await;
        assert!(source
            .update(&lease, StatusUpdate::new(ProcessingStatus::Processing))
            .await
            .is_err());
        let written = source
            .update(&lease, StatusUpdate::new(ProcessingStatus::Processing))
            .await
            .unwrap();
        assert_eq!(written.status, ProcessingStatus::Processing);
    }
}
