//! Notification types.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A terminal-failure notice for one work item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub rid: String,
    pub filename: String,
    /// Stage where the final failure happened, if any.
    pub stage: Option<String>,
    pub retry_count: u32,
    /// Diagnostic text (error message plus captured tool output).
    pub diagnostic: String,
    pub worker_id: String,
    pub occurred_at: DateTime<Utc>,
}

impl Notification {
    /// One-line subject; catalog-supplied values have control characters replaced.
    pub fn subject(&self) -> String {
        single_line(&format!(
            "Image processing failed for {} ({})",
            self.rid, self.filename
        ))
    }

    pub fn body(&self) -> String {
        let mut body = format!(
            "RID: {}\nFile: {}\nWorker: {}\nRetries: {}\nTime: {}\n",
            single_line(&self.rid),
            single_line(&self.filename),
            self.worker_id,
            self.retry_count,
            self.occurred_at.to_rfc3339()
        );
        if let Some(stage) = &self.stage {
            body.push_str(&format!("Stage: {}\n", stage));
        }
        body.push('\n');
        body.push_str(&self.diagnostic);
        body.push('\n');
        body
    }
}

/// Replace CR, LF and other control characters so `value` fits on one line.
pub(crate) fn single_line(value: &str) -> String {
    value
        .chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect()
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("Notification I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Notification command failed: {0}")]
    Command(String),

    #[error("Failed to encode notification: {0}")]
    Encode(String),
}

/// Notification backend selection.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum NotifyBackend {
    /// Log at error level only.
    #[default]
    Log,
    /// Append JSON lines to a file.
    File,
    /// Pipe an RFC 822 message into a mail command.
    Command,
}

/// Notification configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyConfig {
    #[serde(default)]
    pub backend: NotifyBackend,

    #[serde(default)]
    pub sender: Option<String>,

    #[serde(default)]
    pub recipients: Vec<String>,

    #[serde(default = "default_file")]
    pub file: PathBuf,

    /// Program and arguments for `backend = "command"`.
    #[serde(default = "default_command")]
    pub command: Vec<String>,

    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,

    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

fn default_file() -> PathBuf {
    PathBuf::from("imaging-notifications.jsonl")
}

fn default_command() -> Vec<String> {
    vec!["/usr/sbin/sendmail".to_string(), "-t".to_string()]
}

fn default_command_timeout() -> u64 {
    30
}

fn default_buffer_size() -> usize {
    64
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            backend: NotifyBackend::default(),
            sender: None,
            recipients: Vec::new(),
            file: default_file(),
            command: default_command(),
            command_timeout_secs: default_command_timeout(),
            buffer_size: default_buffer_size(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_body_includes_stage_and_diagnostic() {
        let notification = Notification {
            rid: "1-A".to_string(),
            filename: "slide.czi".to_string(),
            stage: Some("package".to_string()),
            retry_count: 2,
            diagnostic: "bfconvert exited with code 1".to_string(),
            worker_id: "worker-1".to_string(),
            occurred_at: Utc::now(),
        };
        assert!(notification.subject().contains("1-A"));
        let body = notification.body();
        assert!(body.contains("Stage: package"));
        assert!(body.contains("bfconvert exited with code 1"));
    }

    #[test]
    fn test_config_defaults() {
        let config: NotifyConfig = toml::from_str("").unwrap();
        assert_eq!(config.backend, NotifyBackend::Log);
        assert_eq!(config.command[0], "/usr/sbin/sendmail");
    }
}
