use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use std::path::Path;

use super::{types::Config, ConfigError};

/// Environment variable prefix for overrides, e.g. `IMAGING_SCHEDULER__MAX_CONCURRENT=4`.
pub const ENV_PREFIX: &str = "IMAGING_";

/// Load configuration from file with environment variable overrides
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::FileNotFound(path.display().to_string()));
    }

    let config: Config = Figment::new()
        .merge(Toml::file(path))
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
        .extract()
        .map_err(|e| ConfigError::ParseError(e.to_string()))?;

    Ok(config)
}

/// Load configuration from TOML string (useful for testing)
pub fn load_config_from_str(toml_str: &str) -> Result<Config, ConfigError> {
    toml::from_str(toml_str).map_err(|e| ConfigError::ParseError(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_config_from_str_valid() {
        let toml = r#"
[catalog]
base_uri = "https://imaging.example.org/ermrest/catalog/1"

[scheduler]
poll_interval_secs = 60
"#;
        let config = load_config_from_str(toml).unwrap();
        assert_eq!(config.scheduler.poll_interval_secs, 60);
    }

    #[test]
    fn test_load_config_from_str_missing_catalog() {
        let toml = r#"
[scheduler]
poll_interval_secs = 60
"#;
        let result = load_config_from_str(toml);
        assert!(result.is_err());
        let err = result.unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));
    }

    #[test]
    fn test_load_config_file_not_found() {
        let result = load_config(Path::new("/nonexistent/imaging.toml"));
        assert!(result.is_err());
        let err = result.unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound(_)));
    }

    #[test]
    fn test_load_config_from_file() {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(
            temp_file,
            r#"
[catalog]
base_uri = "https://imaging.example.org/ermrest/catalog/1"
server_name = "imaging.example.org"

[metrics]
enabled = true
host = "127.0.0.1"
port = 9200
"#
        )
        .unwrap();

        let config = load_config(temp_file.path()).unwrap();
        assert_eq!(
            config.catalog.server_name.as_deref(),
            Some("imaging.example.org")
        );
        assert_eq!(config.metrics.port, 9200);
        assert_eq!(config.metrics.host.to_string(), "127.0.0.1");
    }
}
