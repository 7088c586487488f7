//! Per-process set of held leases.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::work_item::{Lease, Rid};

/// Leases held by this worker process, keyed by RID.
///
/// Cloning shares the same set.
#[derive(Clone, Default)]
pub struct LeaseRegistry {
    inner: Arc<RwLock<HashMap<Rid, Lease>>>,
}

impl LeaseRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, lease: Lease) {
        self.inner.write().await.insert(lease.rid.clone(), lease);
    }

    pub async fn get(&self, rid: &Rid) -> Option<Lease> {
        self.inner.read().await.get(rid).cloned()
    }

    pub async fn remove(&self, rid: &Rid) -> Option<Lease> {
        self.inner.write().await.remove(rid)
    }

    pub async fn contains(&self, rid: &Rid) -> bool {
        self.inner.read().await.contains_key(rid)
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }

    /// Held leases ordered by RID.
    pub async fn snapshot(&self) -> Vec<Lease> {
        let mut leases: Vec<_> = self.inner.read().await.values().cloned().collect();
        leases.sort_by(|a, b| a.rid.cmp(&b.rid));
        leases
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::work_item::{LeaseToken, ProcessingStatus};
    use chrono::Utc;

    fn lease(rid: &str) -> Lease {
        Lease {
            rid: Rid::new(rid),
            token: LeaseToken::generate(),
            owner: "worker".to_string(),
            version: "1".to_string(),
            status: ProcessingStatus::Claimed,
            acquired_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let registry = LeaseRegistry::new();
        let other = registry.clone();

        registry.insert(lease("1-B")).await;
        registry.insert(lease("1-A")).await;
        assert_eq!(other.len().await, 2);
        assert!(other.contains(&Rid::new("1-A")).await);

        let rids: Vec<_> = other
            .snapshot()
            .await
            .into_iter()
            .map(|l| l.rid.to_string())
            .collect();
        assert_eq!(rids, vec!["1-A", "1-B"]);

        other.remove(&Rid::new("1-A")).await;
        assert!(registry.get(&Rid::new("1-A")).await.is_none());
        assert!(!registry.is_empty().await);
    }
}
