//! Result publisher.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use super::error::PublishError;
use crate::claim::ClaimCoordinator;
use crate::failure::{ErrorClass, RetryConfig};
use crate::metrics;
use crate::pipeline::{Artifact, PipelineResult};
use crate::storage::{digest_file, render_path, ObjectStore, StoredObject};
use crate::work_item::{CatalogResult, ProcessingStatus, WorkItem};

/// Uploads a pipeline's artifacts and records the result on the catalog.
///
/// The only writer of `Complete`. Uploads go to deterministic paths, so
/// re-running a publish overwrites rather than duplicates.
pub struct ResultPublisher {
    store: Arc<dyn ObjectStore>,
    coordinator: Arc<ClaimCoordinator>,
    path_template: String,
    retry: RetryConfig,
}

impl ResultPublisher {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        coordinator: Arc<ClaimCoordinator>,
        path_template: impl Into<String>,
        retry: RetryConfig,
    ) -> Self {
        Self {
            store,
            coordinator,
            path_template: path_template.into(),
            retry,
        }
    }

    /// Publish with local retries.
    ///
    /// Transient failures are retried up to `publish_attempts` times, reusing
    /// artifacts already uploaded. A lost lease stops immediately.
    pub async fn publish(&self, result: &PipelineResult) -> Result<WorkItem, PublishError> {
        let attempts = self.retry.publish_attempts.max(1);
        let mut uploaded: HashMap<usize, StoredObject> = HashMap::new();
        let mut attempt = 1;

        loop {
            match self.publish_once(result, &mut uploaded).await {
                Ok(item) => return Ok(item),
                Err(e) if e.is_lease_lost() || e.class() == ErrorClass::Permanent => {
                    return Err(e)
                }
                Err(e) if attempt >= attempts => {
                    return Err(PublishError::Exhausted {
                        attempts,
                        last: Box::new(e),
                    })
                }
                Err(e) => {
                    let delay = self.retry.publish_backoff(attempt);
                    warn!(
                        "Publish attempt {}/{} for {} failed: {}; retrying in {:?}",
                        attempt, attempts, result.rid, e, delay
                    );
                    metrics::PUBLISH_RETRIES_TOTAL.inc();
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn publish_once(
        &self,
        result: &PipelineResult,
        uploaded: &mut HashMap<usize, StoredObject>,
    ) -> Result<WorkItem, PublishError> {
        // Also renews the lease on every retry.
        self.coordinator
            .advance(&result.rid, ProcessingStatus::Uploading)
            .await?;

        let mut renewed = true;
        for (index, artifact) in result.artifacts.iter().enumerate() {
            if uploaded.contains_key(&index) {
                continue;
            }
            // Each upload may run for the whole transfer timeout.
            if !renewed {
                self.coordinator.heartbeat(&result.rid).await?;
            }
            renewed = false;
            let stored = self.upload(result, artifact).await?;
            uploaded.insert(index, stored);
        }

        let mut artifacts: Vec<(usize, StoredObject)> =
            uploaded.iter().map(|(i, s)| (*i, s.clone())).collect();
        artifacts.sort_by_key(|(i, _)| *i);

        let catalog_result = CatalogResult {
            artifacts: artifacts.into_iter().map(|(_, s)| s).collect(),
            metadata: result.metadata.clone(),
            completed_at: Utc::now(),
        };

        let item = self.coordinator.complete(&result.rid, catalog_result).await?;
        info!(
            "Published {} artifact(s) for {}",
            result.artifacts.len(),
            result.rid
        );
        Ok(item)
    }

    async fn upload(
        &self,
        result: &PipelineResult,
        artifact: &Artifact,
    ) -> Result<StoredObject, PublishError> {
        let filename = artifact.filename();
        let digest = digest_file(&artifact.path).await?;
        let path = render_path(
            &self.path_template,
            result.rid.as_str(),
            artifact.stage.as_str(),
            &filename,
        );

        let url = self
            .store
            .upload(&artifact.path, &path)
            .await
            .map_err(|source| PublishError::Upload {
                artifact: filename.clone(),
                source,
            })?;

        Ok(StoredObject {
            stage: artifact.stage.as_str().to_string(),
            filename,
            url,
            size_bytes: digest.size_bytes,
            md5: digest.md5,
            sha256: digest.sha256,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{OpenGate, PipelineExecutor, ProcessingAttempt, ProcessingConfig};
    use crate::storage::StoreError;
    use crate::testing::{fixtures, MockImageTool, MockObjectStore, MockWorkSource};
    use crate::work_item::{Rid, WorkSourceError};
    use tempfile::TempDir;

    struct Harness {
        _processing: TempDir,
        source: Arc<MockWorkSource>,
        store: Arc<MockObjectStore>,
        coordinator: Arc<ClaimCoordinator>,
        executor: PipelineExecutor,
    }

    fn harness() -> Harness {
        let processing = TempDir::new().unwrap();
        let source = Arc::new(MockWorkSource::with_items(&["1-A"]));
        let store = Arc::new(MockObjectStore::new());
        let coordinator = Arc::new(ClaimCoordinator::new(
            source.clone(),
            "worker-a",
            std::time::Duration::from_secs(600),
        ));
        let executor = PipelineExecutor::new(
            ProcessingConfig::default().with_processing_dir(processing.path().into()),
            Arc::new(MockImageTool::new()),
            store.clone(),
        );
        Harness {
            _processing: processing,
            source,
            store,
            coordinator,
            executor,
        }
    }

    async fn claimed_result(h: &Harness) -> PipelineResult {
        let item = h.coordinator.list_claimable(10).await.unwrap().remove(0);
        h.store.put_object(&item.url, b"raw image").await;
        h.coordinator.claim(&item).await.unwrap();
        h.coordinator
            .advance(&item.rid, ProcessingStatus::Processing)
            .await
            .unwrap();
        let mut attempt = ProcessingAttempt::new(item.rid.clone());
        h.executor
            .execute(&item, &OpenGate, &mut attempt)
            .await
            .unwrap()
    }

    fn publisher(h: &Harness) -> ResultPublisher {
        ResultPublisher::new(
            h.store.clone(),
            h.coordinator.clone(),
            "/hatrac/Imaging/{rid}/{stage}/{filename}",
            RetryConfig::default().with_publish_attempts(3, 1),
        )
    }

    #[tokio::test]
    async fn test_publish_uploads_and_completes() {
        let h = harness();
        let result = claimed_result(&h).await;

        let item = publisher(&h).publish(&result).await.unwrap();
        assert_eq!(item.status, ProcessingStatus::Complete);

        let recorded = item.result.unwrap();
        assert_eq!(recorded.artifacts.len(), result.artifacts.len());
        assert_eq!(recorded.metadata, fixtures::image_metadata());
        assert!(recorded.artifacts[0]
            .url
            .starts_with("/hatrac/Imaging/1-A/pyramid/"));
        assert_eq!(h.store.uploads().await.len(), result.artifacts.len());
    }

    #[tokio::test]
    async fn test_lease_renewed_before_each_upload() {
        let h = harness();
        let result = claimed_result(&h).await;
        assert!(result.artifacts.len() > 1);
        let before = h.source.update_calls().await;

        publisher(&h).publish(&result).await.unwrap();

        // Uploading, one heartbeat per further artifact, then Complete.
        assert_eq!(
            h.source.update_calls().await - before,
            result.artifacts.len() + 1
        );
    }

    #[tokio::test]
    async fn test_transient_upload_failure_is_retried_locally() {
        let h = harness();
        let result = claimed_result(&h).await;
        h.store
            .fail_next_upload(StoreError::Unavailable("hatrac 503".to_string()))
            .await;

        let item = publisher(&h).publish(&result).await.unwrap();
        assert_eq!(item.status, ProcessingStatus::Complete);
        assert_eq!(h.store.uploads().await.len(), result.artifacts.len());
    }

    #[tokio::test]
    async fn test_permanent_upload_failure_stops() {
        let h = harness();
        let result = claimed_result(&h).await;
        h.store
            .fail_next_upload(StoreError::Http {
                location: "/hatrac/x".to_string(),
                status: 400,
                message: "bad request".to_string(),
            })
            .await;

        let err = publisher(&h).publish(&result).await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::Permanent);
        let item = h.source.item(&Rid::new("1-A")).await.unwrap();
        assert_eq!(item.status, ProcessingStatus::Uploading);
    }

    #[tokio::test]
    async fn test_lost_lease_is_not_retried() {
        let h = harness();
        let result = claimed_result(&h).await;
        h.source
            .fail_next_update(WorkSourceError::Conflict {
                rid: "1-A".to_string(),
                reason: "version moved".to_string(),
            })
            .await;

        let err = publisher(&h).publish(&result).await.unwrap_err();
        assert!(err.is_lease_lost());
        assert!(h.store.uploads().await.is_empty());
    }

    #[tokio::test]
    async fn test_exhausted_attempts_are_transient() {
        let h = harness();
        let result = claimed_result(&h).await;
        for _ in 0..3 {
            h.store
                .fail_next_upload(StoreError::Timeout("hatrac".to_string()))
                .await;
        }

        let err = publisher(&h).publish(&result).await.unwrap_err();
        assert!(matches!(err, PublishError::Exhausted { attempts: 3, .. }));
        assert_eq!(err.class(), ErrorClass::Transient);
    }
}
