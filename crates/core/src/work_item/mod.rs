//! Work items and the catalogs that hold them.
//!
//! A [`WorkItem`] is one catalog record describing a source image. Its
//! `status` moves through [`ProcessingStatus`] only via conditional writes
//! against a [`WorkSource`]: every claim and every holder update carries the
//! last observed version as its precondition.
//!
//! # Backends
//!
//! - [`ErmrestWorkSource`]: REST catalog, `PUT` with `If-Match` on the read `ETag`
//! - [`SqliteWorkSource`]: local table, `UPDATE ... WHERE version = ?`
//!
//! # Example
//!
//! ```ignore
//! use imaging_core::work_item::{ClaimableQuery, LeaseMarker, SqliteWorkSource, WorkSource};
//!
//! let source = SqliteWorkSource::in_memory()?;
//! let items = source.list_claimable(&ClaimableQuery::new(lease_timeout)).await?;
//! let claimed = source.claim(&items[0], &LeaseMarker::new("worker-1")).await?;
//! ```

mod config;
mod ermrest;
mod source;
mod sqlite_source;
mod types;

pub use config::{CatalogBackend, CatalogConfig, ModelMapping, StatusVocabulary};
pub use ermrest::ErmrestWorkSource;
pub use source::{WorkSource, WorkSourceError};
pub use sqlite_source::SqliteWorkSource;
pub use types::{
    CatalogResult, ClaimableQuery, Lease, LeaseMarker, LeaseToken, NewWorkItem, ProcessingStatus,
    Rid, StatusUpdate, WorkItem,
};
