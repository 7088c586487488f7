//! Catalog configuration and column/status mapping.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::types::ProcessingStatus;

/// Which work source backend to use.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum CatalogBackend {
    /// REST catalog (ERMrest-style entity and attributegroup paths).
    #[default]
    Ermrest,
    /// Local SQLite table.
    Sqlite,
}

/// Configuration for the work source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    #[serde(default)]
    pub backend: CatalogBackend,

    /// Catalog base URI, e.g. `https://host/ermrest/catalog/1`.
    #[serde(default)]
    pub base_uri: String,

    /// Host name used to pick credentials out of a multi-server credentials file.
    #[serde(default)]
    pub server_name: Option<String>,

    #[serde(default)]
    pub credentials_file: Option<PathBuf>,

    /// Path of the table entity, relative to `base_uri`.
    #[serde(default = "default_entity_path")]
    pub entity_path: String,

    /// Query listing unclaimed items, relative to `base_uri`.
    #[serde(default = "default_claimable_query")]
    pub claimable_query: String,

    /// Query listing leased items (checked for stale leases).
    #[serde(default = "default_leased_query")]
    pub leased_query: Option<String>,

    /// Conditional claim target; the RID is appended.
    #[serde(default = "default_update_path")]
    pub claim_path: String,

    /// Conditional update target; the RID is appended.
    #[serde(default = "default_update_path")]
    pub update_path: String,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Database file when `backend = "sqlite"`.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    #[serde(default)]
    pub model: ModelMapping,
}

fn default_entity_path() -> String {
    "entity/Imaging:Processed_File".to_string()
}

fn default_claimable_query() -> String {
    "entity/Imaging:Processed_File/Processing_Status=new;Processing_Status=renew".to_string()
}

fn default_leased_query() -> Option<String> {
    Some(
        "entity/Imaging:Processed_File/Processing_Status=in%20progress;\
         Processing_Status=processing;Processing_Status=uploading"
            .to_string(),
    )
}

fn default_update_path() -> String {
    "attributegroup/Imaging:Processed_File/RID".to_string()
}

fn default_request_timeout() -> u64 {
    60
}

fn default_db_path() -> PathBuf {
    PathBuf::from("imaging-work.db")
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            backend: CatalogBackend::default(),
            base_uri: String::new(),
            server_name: None,
            credentials_file: None,
            entity_path: default_entity_path(),
            claimable_query: default_claimable_query(),
            leased_query: default_leased_query(),
            claim_path: default_update_path(),
            update_path: default_update_path(),
            request_timeout_secs: default_request_timeout(),
            db_path: default_db_path(),
            model: ModelMapping::default(),
        }
    }
}

/// Column names of the catalog table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelMapping {
    pub rid: String,
    pub filename: String,
    pub url: String,
    pub bytes: String,
    pub md5: String,
    pub status: String,
    pub retry_count: String,
    pub retry_after: String,
    pub lease_owner: String,
    pub lease_token: String,
    pub leased_at: String,
    pub error_detail: String,
    /// JSON column receiving artifacts and derived metadata.
    pub result: String,
    pub statuses: StatusVocabulary,
}

impl Default for ModelMapping {
    fn default() -> Self {
        Self {
            rid: "RID".to_string(),
            filename: "File_Name".to_string(),
            url: "File_URL".to_string(),
            bytes: "File_Bytes".to_string(),
            md5: "File_MD5".to_string(),
            status: "Processing_Status".to_string(),
            retry_count: "Retry_Count".to_string(),
            retry_after: "Retry_After".to_string(),
            lease_owner: "Lease_Owner".to_string(),
            lease_token: "Lease_Token".to_string(),
            leased_at: "Leased_At".to_string(),
            error_detail: "Processing_Detail".to_string(),
            result: "Properties".to_string(),
            statuses: StatusVocabulary::default(),
        }
    }
}

/// Catalog status strings for each processing status.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusVocabulary {
    /// Values read as `Unclaimed`; the first is written on release.
    pub unclaimed: Vec<String>,
    pub claimed: String,
    pub processing: String,
    pub uploading: String,
    pub complete: String,
    /// Values read as `Error`; the first is written on terminal failure.
    pub error: Vec<String>,
}

impl Default for StatusVocabulary {
    fn default() -> Self {
        Self {
            unclaimed: vec!["new".to_string(), "renew".to_string()],
            claimed: "in progress".to_string(),
            processing: "processing".to_string(),
            uploading: "uploading".to_string(),
            complete: "success".to_string(),
            error: vec![
                "error".to_string(),
                "HATRAC GET ERROR".to_string(),
                "CONVERT ERROR".to_string(),
                "HTTP ERROR".to_string(),
                "GET THUMBNAIL ERROR".to_string(),
                "GET TIFF URL ERROR".to_string(),
            ],
        }
    }
}

impl StatusVocabulary {
    pub fn to_catalog(&self, status: ProcessingStatus) -> &str {
        match status {
            ProcessingStatus::Unclaimed => first_or(&self.unclaimed, "new"),
            ProcessingStatus::Claimed => &self.claimed,
            ProcessingStatus::Processing => &self.processing,
            ProcessingStatus::Uploading => &self.uploading,
            ProcessingStatus::Complete => &self.complete,
            ProcessingStatus::Error => first_or(&self.error, "error"),
        }
    }

    pub fn from_catalog(&self, value: &str) -> Option<ProcessingStatus> {
        if self.unclaimed.iter().any(|v| v == value) {
            Some(ProcessingStatus::Unclaimed)
        } else if value == self.claimed {
            Some(ProcessingStatus::Claimed)
        } else if value == self.processing {
            Some(ProcessingStatus::Processing)
        } else if value == self.uploading {
            Some(ProcessingStatus::Uploading)
        } else if value == self.complete {
            Some(ProcessingStatus::Complete)
        } else if self.error.iter().any(|v| v == value) {
            Some(ProcessingStatus::Error)
        } else {
            None
        }
    }
}

fn first_or<'a>(values: &'a [String], fallback: &'a str) -> &'a str {
    values.first().map(String::as_str).unwrap_or(fallback)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_vocabulary() {
        let vocab = StatusVocabulary::default();
        assert_eq!(vocab.from_catalog("new"), Some(ProcessingStatus::Unclaimed));
        assert_eq!(vocab.from_catalog("renew"), Some(ProcessingStatus::Unclaimed));
        assert_eq!(vocab.from_catalog("in progress"), Some(ProcessingStatus::Claimed));
        assert_eq!(vocab.from_catalog("success"), Some(ProcessingStatus::Complete));
        assert_eq!(vocab.from_catalog("CONVERT ERROR"), Some(ProcessingStatus::Error));
        assert_eq!(vocab.from_catalog("MISSING_SCENES_WARNING"), None);

        assert_eq!(vocab.to_catalog(ProcessingStatus::Unclaimed), "new");
        assert_eq!(vocab.to_catalog(ProcessingStatus::Error), "error");
    }

    #[test]
    fn test_deserialize_partial_mapping() {
        let toml = r#"
            base_uri = "https://example.org/ermrest/catalog/2"
            server_name = "example.org"

            [model]
            status = "Status"

            [model.statuses]
            complete = "done"
        "#;
        let config: CatalogConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.backend, CatalogBackend::Ermrest);
        assert_eq!(config.model.status, "Status");
        assert_eq!(config.model.rid, "RID");
        assert_eq!(config.model.statuses.complete, "done");
        assert_eq!(config.model.statuses.claimed, "in progress");
        assert_eq!(config.request_timeout_secs, 60);
    }
}
