//! Object storage for source assets and published artifacts.
//!
//! # Backends
//!
//! - [`HatracStore`]: Hatrac over HTTP with cookie credentials
//! - [`FsObjectStore`]: local directory, for single-host setups and tests
//!
//! Upload paths come from a template with `{rid}`, `{stage}` and
//! `{filename}` placeholders (see [`render_path`]).

mod config;
mod error;
mod fs_store;
mod hatrac;
mod traits;
mod types;

pub use config::{StorageBackend, StorageConfig};
pub use error::StoreError;
pub use fs_store::FsObjectStore;
pub use hatrac::HatracStore;
pub use traits::ObjectStore;
pub use types::{digest_file, render_path, FileDigest, StoredObject};
