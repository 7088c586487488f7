//! Object storage trait.

use std::path::Path;

use async_trait::async_trait;

use super::error::StoreError;

/// Durable object storage for source assets and produced artifacts.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Returns the name of this store implementation.
    fn name(&self) -> &str;

    /// Download `location` into `dest`, returning the byte count.
    async fn fetch(&self, location: &str, dest: &Path) -> Result<u64, StoreError>;

    /// Upload `source` under `path`, returning the durable URL.
    async fn upload(&self, source: &Path, path: &str) -> Result<String, StoreError>;
}
