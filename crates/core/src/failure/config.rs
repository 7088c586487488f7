//! Retry configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Retry budget and backoff curve.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of transient-failure requeues before an item is
    /// marked `Error`.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Initial delay before a requeued item is claimable again, in seconds.
    #[serde(default = "default_retry_delay")]
    pub initial_delay_secs: u64,

    /// Maximum delay between retries in seconds.
    #[serde(default = "default_max_delay")]
    pub max_delay_secs: u64,

    /// Exponential backoff multiplier.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Local attempts of the publish step before it counts as a transient failure.
    #[serde(default = "default_publish_attempts")]
    pub publish_attempts: u32,

    /// Initial delay between publish attempts in milliseconds.
    #[serde(default = "default_publish_delay")]
    pub publish_delay_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    60 // 1 minute
}

fn default_max_delay() -> u64 {
    3600 // 1 hour
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_publish_attempts() -> u32 {
    3
}

fn default_publish_delay() -> u64 {
    1000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay_secs: default_retry_delay(),
            max_delay_secs: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            publish_attempts: default_publish_attempts(),
            publish_delay_ms: default_publish_delay(),
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `retry` (1-based) becomes claimable.
    pub fn backoff(&self, retry: u32) -> Duration {
        scaled(
            Duration::from_secs(self.initial_delay_secs),
            self.backoff_multiplier,
            retry,
            Duration::from_secs(self.max_delay_secs),
        )
    }

    /// Delay after failed publish attempt number `attempt` (1-based).
    pub fn publish_backoff(&self, attempt: u32) -> Duration {
        scaled(
            Duration::from_millis(self.publish_delay_ms),
            self.backoff_multiplier,
            attempt,
            Duration::from_secs(self.max_delay_secs),
        )
    }

    pub fn with_max_retries(mut self, max: u32) -> Self {
        self.max_retries = max;
        self
    }

    pub fn with_initial_delay(mut self, secs: u64) -> Self {
        self.initial_delay_secs = secs;
        self
    }

    pub fn with_publish_attempts(mut self, attempts: u32, delay_ms: u64) -> Self {
        self.publish_attempts = attempts;
        self.publish_delay_ms = delay_ms;
        self
    }
}

fn scaled(initial: Duration, multiplier: f64, n: u32, cap: Duration) -> Duration {
    let exponent = n.saturating_sub(1).min(64) as i32;
    let secs = initial.as_secs_f64() * multiplier.max(1.0).powi(exponent);
    if !secs.is_finite() || secs >= cap.as_secs_f64() {
        cap
    } else {
        Duration::from_secs_f64(secs)
    }
}
