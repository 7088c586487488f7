//! Mock object store for testing.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::storage::{ObjectStore, StoreError};

/// In-memory object store keyed by location.
///
/// Provides controllable behavior for testing:
/// - Seed source objects with [`MockObjectStore::put_object`]
/// - Inject failures into upcoming fetches or uploads
/// - Inspect successful uploads
#[derive(Debug, Default)]
pub struct MockObjectStore {
    objects: Arc<RwLock<HashMap<String, Vec<u8>>>>,
    uploads: Arc<RwLock<Vec<String>>>,
    fetch_errors: Arc<RwLock<VecDeque<StoreError>>>,
    upload_errors: Arc<RwLock<VecDeque<StoreError>>>,
}

impl MockObjectStore {
    /// Create an empty mock store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an object at `location`.
    pub async fn put_object(&self, location: &str, bytes: &[u8]) {
        self.objects
            .write()
            .await
            .insert(location.to_string(), bytes.to_vec());
    }

    /// Read back an object.
    pub async fn object(&self, location: &str) -> Option<Vec<u8>> {
        self.objects.read().await.get(location).cloned()
    }

    /// Paths of successful uploads, in order.
    pub async fn uploads(&self) -> Vec<String> {
        self.uploads.read().await.clone()
    }

    /// Make the next fetch fail. Queued errors are used in order.
    pub async fn fail_next_fetch(&self, error: StoreError) {
        self.fetch_errors.write().await.push_back(error);
    }

    /// Make the next upload fail. Queued errors are used in order.
    pub async fn fail_next_upload(&self, error: StoreError) {
        self.upload_errors.write().await.push_back(error);
    }
}

#[async_trait]
impl ObjectStore for MockObjectStore {
    fn name(&self) -> &str {
        "mock"
    }

    async fn fetch(&self, location: &str, dest: &Path) -> Result<u64, StoreError> {
        if let Some(error) = self.fetch_errors.write().await.pop_front() {
            return Err(error);
        }
        let bytes = self
            .object(location)
            .await
            .ok_or_else(|| StoreError::NotFound(location.to_string()))?;
        tokio::fs::write(dest, &bytes).await?;
        Ok(bytes.len() as u64)
    }

    async fn upload(&self, source: &Path, path: &str) -> Result<String, StoreError> {
        if let Some(error) = self.upload_errors.write().await.pop_front() {
            return Err(error);
        }
        let bytes = tokio::fs::read(source).await?;
        self.put_object(path, &bytes).await;
        self.uploads.write().await.push(path.to_string());
        Ok(path.to_string())
    }
}
