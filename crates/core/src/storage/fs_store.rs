//! Local filesystem object store.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use super::error::StoreError;
use super::traits::ObjectStore;

/// Object store rooted at a local directory.
///
/// Locations are paths relative to the root (a leading `/` is ignored) or
/// `file://` URLs. Uploaded objects are addressed by their storage path.
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, location: &str) -> Result<PathBuf, StoreError> {
        if let Some(path) = location.strip_prefix("file://") {
            return Ok(PathBuf::from(path));
        }
        let relative = location.trim_start_matches('/');
        let decoded = urlencoding::decode(relative)
            .map_err(|_| StoreError::InvalidLocation(location.to_string()))?;
        if relative.is_empty() || decoded.split('/').any(|part| part == "..") {
            return Err(StoreError::InvalidLocation(location.to_string()));
        }
        Ok(self.root.join(decoded.as_ref()))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    fn name(&self) -> &str {
        "filesystem"
    }

    async fn fetch(&self, location: &str, dest: &Path) -> Result<u64, StoreError> {
        let source = self.resolve(location)?;
        match tokio::fs::copy(&source, dest).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(location.to_string()))
            }
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    async fn upload(&self, source: &Path, path: &str) -> Result<String, StoreError> {
        let dest = self.resolve(path)?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(source, &dest).await?;
        Ok(path.to_string())
    }
}
