use std::sync::Arc;

use chrono::{DateTime, Utc};
use imaging_core::{Config, SanitizedConfig, Scheduler};

/// Shared application state
pub struct AppState {
    config: Config,
    scheduler: Arc<Scheduler>,
    started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(config: Config, scheduler: Arc<Scheduler>) -> Self {
        Self {
            config,
            scheduler,
            started_at: Utc::now(),
        }
    }

    pub fn sanitized_config(&self) -> SanitizedConfig {
        SanitizedConfig::from(&self.config)
    }

    pub fn scheduler(&self) -> &Scheduler {
        self.scheduler.as_ref()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }
}
