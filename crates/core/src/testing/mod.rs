//! Testing utilities and mock implementations.
//!
//! This module provides mock implementations of the external-facing traits
//! (work source, image tool, object store, notifier), so the full
//! claim-process-publish cycle can be tested without a catalog, a storage
//! server or conversion binaries.
//!
//! # Example
//!
//! ```rust,ignore
//! use imaging_core::testing::{MockImageTool, MockObjectStore, MockWorkSource, ToolBehavior};
//!
//! let source = MockWorkSource::with_items(&["1-A"]);
//! let store = MockObjectStore::new();
//! store.put_object(&fixtures::work_item("1-A").url, b"raw image").await;
//!
//! let tool = MockImageTool::new();
//! tool.script(Stage::Package, ToolBehavior::FailPermanent("corrupt".into())).await;
//! ```

mod mock_image_tool;
mod mock_notifier;
mod mock_object_store;
mod mock_work_source;

pub use mock_image_tool::{MockImageTool, ToolBehavior};
pub use mock_notifier::MockNotifier;
pub use mock_object_store::MockObjectStore;
pub use mock_work_source::MockWorkSource;

/// Test fixtures and helper functions.
pub mod fixtures {
    use chrono::Utc;

    use crate::failure::Notification;
    use crate::pipeline::ImageMetadata;
    use crate::storage::StoredObject;
    use crate::work_item::{CatalogResult, ProcessingStatus, Rid, WorkItem};

    /// Create an unclaimed work item whose source lives at a Hatrac-style path.
    pub fn work_item(rid: &str) -> WorkItem {
        WorkItem {
            rid: Rid::new(rid),
            filename: format!("{}.czi", rid),
            url: format!("/hatrac/Imaging/source/{}/{}.czi", rid, rid),
            byte_size: None,
            md5: None,
            status: ProcessingStatus::Unclaimed,
            retry_count: 0,
            retry_after: None,
            lease: None,
            error_detail: None,
            result: None,
            version: "1".to_string(),
        }
    }

    /// Metadata the mock tool's metadata stage reports.
    pub fn image_metadata() -> ImageMetadata {
        ImageMetadata {
            channels: 3,
            z_planes: 12,
            width: 2048,
            height: 1024,
            series: Some(1),
            pixel_type: Some("uint16".to_string()),
        }
    }

    /// Create a result with one packaged artifact.
    pub fn catalog_result() -> CatalogResult {
        CatalogResult {
            artifacts: vec![StoredObject {
                stage: "package".to_string(),
                filename: "1-A.ome.tiff".to_string(),
                url: "/hatrac/Imaging/1-A/package/1-A.ome.tiff".to_string(),
                size_bytes: 1024,
                md5: "0cc175b9c0f1b6a831c399e269772661".to_string(),
                sha256: "ca978112ca1bbdcafac231b39a23dc4da786eff8147c4e72b9807785afee48bb"
                    .to_string(),
            }],
            metadata: image_metadata(),
            completed_at: Utc::now(),
        }
    }

    /// Create a failure notification for `rid`.
    pub fn notification(rid: &str) -> Notification {
        Notification {
            rid: rid.to_string(),
            filename: format!("{}.czi", rid),
            stage: Some("package".to_string()),
            retry_count: 0,
            diagnostic: "package stage failed (permanent): unsupported pixel type".to_string(),
            worker_id: "worker-test".to_string(),
            occurred_at: Utc::now(),
        }
    }
}
