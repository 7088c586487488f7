use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};

use crate::failure::{NotifyConfig, RetryConfig};
use crate::pipeline::ProcessingConfig;
use crate::scheduler::SchedulerConfig;
use crate::storage::StorageConfig;
use crate::work_item::{CatalogBackend, CatalogConfig};

/// Root configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub processing: ProcessingConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Health and metrics endpoint (server mode only)
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_host")]
    pub host: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_port() -> u16 {
    9184
}

/// Log output configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset.
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Sanitized config for API responses (credentials redacted)
#[derive(Debug, Clone, Serialize)]
pub struct SanitizedConfig {
    pub catalog: SanitizedCatalogConfig,
    pub storage: StorageConfig,
    pub processing: ProcessingConfig,
    pub retry: RetryConfig,
    pub scheduler: SchedulerConfig,
    pub notify: SanitizedNotifyConfig,
    pub metrics: MetricsConfig,
    pub logging: LoggingConfig,
}

/// Catalog config with the credentials path hidden
#[derive(Debug, Clone, Serialize)]
pub struct SanitizedCatalogConfig {
    pub backend: CatalogBackend,
    pub base_uri: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
    pub credentials_configured: bool,
    pub claimable_query: String,
    pub request_timeout_secs: u64,
}

/// Notify config with recipients reduced to a count
#[derive(Debug, Clone, Serialize)]
pub struct SanitizedNotifyConfig {
    pub backend: String,
    pub recipients: usize,
}

impl From<&Config> for SanitizedConfig {
    fn from(config: &Config) -> Self {
        Self {
            catalog: SanitizedCatalogConfig {
                backend: config.catalog.backend,
                base_uri: config.catalog.base_uri.clone(),
                server_name: config.catalog.server_name.clone(),
                credentials_configured: config.catalog.credentials_file.is_some(),
                claimable_query: config.catalog.claimable_query.clone(),
                request_timeout_secs: config.catalog.request_timeout_secs,
            },
            storage: config.storage.clone(),
            processing: config.processing.clone(),
            retry: config.retry.clone(),
            scheduler: config.scheduler.clone(),
            notify: SanitizedNotifyConfig {
                backend: serde_json::to_value(config.notify.backend)
                    .ok()
                    .and_then(|v| v.as_str().map(String::from))
                    .unwrap_or_default(),
                recipients: config.notify.recipients.len(),
            },
            metrics: config.metrics.clone(),
            logging: config.logging.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_minimal_config() {
        let toml = r#"
[catalog]
base_uri = "https://imaging.example.org/ermrest/catalog/1"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.catalog.backend, CatalogBackend::Ermrest);
        assert_eq!(config.scheduler.max_concurrent, 1);
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.metrics.port, 9184);
        assert!(!config.metrics.enabled);
        assert_eq!(config.logging.format, LogFormat::Pretty);
    }

    #[test]
    fn test_deserialize_missing_catalog_fails() {
        let toml = r#"
[scheduler]
poll_interval_secs = 60
"#;
        let result: Result<Config, _> = toml::from_str(toml);
        assert!(result.is_err());
    }

    #[test]
    fn test_deserialize_full_sections() {
        let toml = r#"
[catalog]
backend = "sqlite"
db_path = "/var/lib/imaging/work.db"

[catalog.model.statuses]
complete = "done"

[storage]
backend = "filesystem"
root = "/data/objects"

[processing]
processing_dir = "/scratch/imaging"

[processing.tools.pyramid]
program = "vips"
args = ["dzsave", "{input}", "{output_dir}/{rid}"]
output_extension = "dzi"
timeout_secs = 1800

[retry]
max_retries = 5

[scheduler]
max_concurrent = 4
lease_timeout_secs = 10800

[notify]
backend = "file"
file = "/var/log/imaging/failures.jsonl"

[logging]
format = "json"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.catalog.backend, CatalogBackend::Sqlite);
        assert_eq!(config.catalog.model.statuses.complete, "done");
        assert_eq!(config.processing.tools.pyramid.program.to_str(), Some("vips"));
        assert_eq!(config.processing.tools.pyramid.timeout_secs, 1800);
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.scheduler.max_concurrent, 4);
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_sanitized_config_hides_credentials() {
        let toml = r#"
[catalog]
base_uri = "https://imaging.example.org/ermrest/catalog/1"
credentials_file = "/home/worker/.deriva/credential.json"

[notify]
backend = "command"
recipients = ["ops@example.org"]
"#;
        let config: Config = toml::from_str(toml).unwrap();
        let sanitized = SanitizedConfig::from(&config);
        assert!(sanitized.catalog.credentials_configured);
        assert_eq!(sanitized.notify.backend, "command");
        assert_eq!(sanitized.notify.recipients, 1);

        let json = serde_json::to_string(&sanitized).unwrap();
        assert!(!json.contains("credential.json"));
        assert!(!json.contains("ops@example.org"));
    }
}
