use super::{types::Config, ConfigError};
use crate::work_item::CatalogBackend;

/// Longest accepted lease; crashed workers' items must come back eventually.
const MAX_LEASE_TIMEOUT_SECS: u64 = 7 * 24 * 3600;

/// Validate configuration
/// Currently validates:
/// - Catalog base URI is set for the REST backend
/// - Pool size and poll interval are non-zero
/// - Lease timeout outlasts the longest stage or transfer plus one catalog
///   request, and stays below a week
/// - Processing directory and upload template are usable
pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.catalog.backend == CatalogBackend::Ermrest && config.catalog.base_uri.trim().is_empty()
    {
        return Err(ConfigError::ValidationError(
            "catalog.base_uri is required for the ermrest backend".to_string(),
        ));
    }

    if config.scheduler.max_concurrent == 0 {
        return Err(ConfigError::ValidationError(
            "scheduler.max_concurrent cannot be 0".to_string(),
        ));
    }

    if config.scheduler.poll_interval_secs == 0 {
        return Err(ConfigError::ValidationError(
            "scheduler.poll_interval_secs cannot be 0".to_string(),
        ));
    }

    // A live worker heartbeats at every stage boundary and before every
    // upload, so the lease must survive the longest tool run or single
    // transfer plus the renewal request itself.
    let longest_step = config
        .processing
        .tools
        .max_timeout_secs()
        .max(config.storage.transfer_timeout_secs);
    let minimum = longest_step.saturating_add(config.catalog.request_timeout_secs);
    if config.scheduler.lease_timeout_secs <= minimum {
        return Err(ConfigError::ValidationError(format!(
            "scheduler.lease_timeout_secs ({}) must exceed the longest tool or transfer \
             timeout plus catalog.request_timeout_secs ({})",
            config.scheduler.lease_timeout_secs, minimum
        )));
    }

    if config.scheduler.lease_timeout_secs > MAX_LEASE_TIMEOUT_SECS {
        return Err(ConfigError::ValidationError(format!(
            "scheduler.lease_timeout_secs ({}) cannot exceed {}",
            config.scheduler.lease_timeout_secs, MAX_LEASE_TIMEOUT_SECS
        )));
    }

    if config.retry.backoff_multiplier < 1.0 {
        return Err(ConfigError::ValidationError(
            "retry.backoff_multiplier must be at least 1.0".to_string(),
        ));
    }

    if config.retry.publish_attempts == 0 {
        return Err(ConfigError::ValidationError(
            "retry.publish_attempts cannot be 0".to_string(),
        ));
    }

    if config.processing.processing_dir.as_os_str().is_empty() {
        return Err(ConfigError::ValidationError(
            "processing.processing_dir is required".to_string(),
        ));
    }

    if !config.storage.path_template.contains("{rid}") {
        return Err(ConfigError::ValidationError(
            "storage.path_template must contain {rid}".to_string(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::load_config_from_str;

    fn base() -> Config {
        load_config_from_str(
            r#"
[catalog]
base_uri = "https://imaging.example.org/ermrest/catalog/1"
"#,
        )
        .unwrap()
    }

    #[test]
    fn test_validate_valid_config() {
        assert!(validate_config(&base()).is_ok());
    }

    #[test]
    fn test_validate_missing_base_uri_fails() {
        let mut config = base();
        config.catalog.base_uri = String::new();
        let result = validate_config(&config);
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));

        config.catalog.backend = CatalogBackend::Sqlite;
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_validate_pool_zero_fails() {
        let mut config = base();
        config.scheduler.max_concurrent = 0;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_validate_lease_shorter_than_tool_fails() {
        let mut config = base();
        config.processing.tools.package.timeout_secs = 7200;
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("lease_timeout_secs"));

        config.scheduler.lease_timeout_secs = 7200 + 60 + 1;
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_validate_lease_shorter_than_transfer_fails() {
        let mut config = base();
        config.storage.transfer_timeout_secs = 7200;
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("transfer"));

        config.scheduler.lease_timeout_secs = 7200 + 60 + 1;
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_validate_lease_upper_bound() {
        let mut config = base();
        config.scheduler.lease_timeout_secs = u64::MAX;
        assert!(validate_config(&config).is_err());

        config.scheduler.lease_timeout_secs = 7 * 24 * 3600;
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_validate_template_requires_rid() {
        let mut config = base();
        config.storage.path_template = "/hatrac/Imaging/{filename}".to_string();
        assert!(validate_config(&config).is_err());
    }
}
