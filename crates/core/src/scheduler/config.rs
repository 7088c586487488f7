//! Scheduler configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for the polling scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Seconds to sleep between polls when no work was found.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Items processed concurrently by this worker.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Age after which another worker's lease counts as abandoned.
    /// Must exceed the longest stage timeout (checked at startup).
    #[serde(default = "default_lease_timeout")]
    pub lease_timeout_secs: u64,

    /// Maximum items listed per poll.
    #[serde(default = "default_batch_limit")]
    pub batch_limit: usize,

    /// Lease owner recorded on claimed rows. Defaults to `<host>-<pid>`.
    #[serde(default)]
    pub worker_id: Option<String>,
}

fn default_poll_interval() -> u64 {
    300 // 5 minutes
}

fn default_max_concurrent() -> usize {
    1
}

fn default_lease_timeout() -> u64 {
    7200 // 2 hours
}

fn default_batch_limit() -> usize {
    25
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            max_concurrent: default_max_concurrent(),
            lease_timeout_secs: default_lease_timeout(),
            batch_limit: default_batch_limit(),
            worker_id: None,
        }
    }
}

impl SchedulerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn lease_timeout(&self) -> Duration {
        Duration::from_secs(self.lease_timeout_secs)
    }

    /// Configured worker id, or one derived from the host name and pid.
    pub fn resolved_worker_id(&self) -> String {
        match self.worker_id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => {
                let host = std::env::var("HOSTNAME")
                    .ok()
                    .filter(|h| !h.is_empty())
                    .unwrap_or_else(|| "imaging-worker".to_string());
                format!("{}-{}", host, std::process::id())
            }
        }
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max;
        self
    }

    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = Some(id.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SchedulerConfig::default();
        assert_eq!(config.poll_interval_secs, 300);
        assert_eq!(config.max_concurrent, 1);
        assert_eq!(config.lease_timeout(), Duration::from_secs(7200));
        assert!(config.worker_id.is_none());
    }

    #[test]
    fn test_deserialize_minimal() {
        let toml = r#"
            max_concurrent = 4
            worker_id = "node-7"
        "#;
        let config: SchedulerConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.max_concurrent, 4);
        assert_eq!(config.batch_limit, 25);
        assert_eq!(config.resolved_worker_id(), "node-7");
    }

    #[test]
    fn test_blank_worker_id_is_derived() {
        let config = SchedulerConfig::default().with_worker_id("  ");
        let id = config.resolved_worker_id();
        assert!(id.ends_with(&format!("-{}", std::process::id())));
    }
}
