//! Storage configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Which object store backend to use.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    #[default]
    Hatrac,
    Filesystem,
}

/// Configuration for object storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,

    /// Server root for relative locations, e.g. `https://host`.
    /// Defaults to the scheme and host of `catalog.base_uri`.
    #[serde(default)]
    pub base_url: Option<String>,

    /// Root directory when `backend = "filesystem"`.
    #[serde(default = "default_root")]
    pub root: PathBuf,

    /// Upload path template (`{rid}`, `{stage}`, `{filename}`).
    #[serde(default = "default_path_template")]
    pub path_template: String,

    /// Timeout for a single transfer in seconds.
    #[serde(default = "default_transfer_timeout")]
    pub transfer_timeout_secs: u64,
}

fn default_root() -> PathBuf {
    PathBuf::from("storage")
}

fn default_path_template() -> String {
    "/hatrac/Imaging/{rid}/{stage}/{filename}".to_string()
}

fn default_transfer_timeout() -> u64 {
    600
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            base_url: None,
            root: default_root(),
            path_template: default_path_template(),
            transfer_timeout_secs: default_transfer_timeout(),
        }
    }
}
