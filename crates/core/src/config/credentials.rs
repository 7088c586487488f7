//! Catalog credentials file.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use super::ConfigError;

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CredentialFile {
    Single { cookie: String },
    PerServer(HashMap<String, ServerCredential>),
}

#[derive(Debug, Deserialize)]
struct ServerCredential {
    cookie: String,
}

/// Read the session cookie from a credentials file.
///
/// Accepts `{"cookie": "..."}` or `{"<server>": {"cookie": "..."}}`; the
/// per-server form needs `server_name` unless it holds exactly one entry.
pub fn load_cookie(path: &Path, server_name: Option<&str>) -> Result<String, ConfigError> {
    let content = std::fs::read_to_string(path)
        .map_err(|_| ConfigError::FileNotFound(path.display().to_string()))?;
    parse_cookie(&content, server_name)
}

pub(crate) fn parse_cookie(content: &str, server_name: Option<&str>) -> Result<String, ConfigError> {
    let file: CredentialFile = serde_json::from_str(content)
        .map_err(|e| ConfigError::ParseError(format!("credentials file: {}", e)))?;

    match file {
        CredentialFile::Single { cookie } => Ok(cookie),
        CredentialFile::PerServer(mut servers) => match server_name {
            Some(name) => servers.remove(name).map(|c| c.cookie).ok_or_else(|| {
                ConfigError::ValidationError(format!("no credentials for server {}", name))
            }),
            None if servers.len() == 1 => Ok(servers
                .into_values()
                .next()
                .map(|c| c.cookie)
                .unwrap_or_default()),
            None => Err(ConfigError::ValidationError(
                "credentials file lists several servers; set catalog.server_name".to_string(),
            )),
        },
    }
}
