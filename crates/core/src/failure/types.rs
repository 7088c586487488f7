//! Failure classification types.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pipeline::{PipelineError, Stage};
use crate::publish::PublishError;
use crate::work_item::WorkSourceError;

/// How a failure affects the retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Environmental: resource exhaustion, timeouts, unreachable services.
    Transient,
    /// The input itself is bad; retrying cannot help.
    Permanent,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Transient => "transient",
            ErrorClass::Permanent => "permanent",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Anything that ended a processing attempt early.
#[derive(Debug, Error)]
pub enum AttemptFailure {
    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error("Catalog error: {0}")]
    Catalog(#[from] WorkSourceError),

    #[error("Worker task panicked: {0}")]
    Panicked(String),
}

impl AttemptFailure {
    pub fn stage(&self) -> Option<Stage> {
        match self {
            AttemptFailure::Pipeline(e) => e.stage(),
            _ => None,
        }
    }

    /// Error message plus any captured tool output.
    pub fn diagnostic(&self) -> String {
        let diagnostics = match self {
            AttemptFailure::Pipeline(e) => e.diagnostics(),
            _ => None,
        };
        match diagnostics {
            Some(extra) => format!("{}\n\n{}", self, extra),
            None => self.to_string(),
        }
    }
}

/// Decision for a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Back to `Unclaimed` with an incremented retry count and a backoff.
    Requeue {
        retry_count: u32,
        retry_after: DateTime<Utc>,
        reason: String,
    },
    /// `Error`; one failure notification follows the write.
    Terminal {
        retry_count: u32,
        reason: String,
        budget_exhausted: bool,
    },
    /// Back to `Unclaimed` without touching the retry budget (shutdown).
    Release { reason: String },
    /// The lease is gone; write nothing.
    Abandon { reason: String },
}

impl Disposition {
    pub fn label(&self) -> &'static str {
        match self {
            Disposition::Requeue { .. } => "requeued",
            Disposition::Terminal { .. } => "failed",
            Disposition::Release { .. } => "interrupted",
            Disposition::Abandon { .. } => "abandoned",
        }
    }

    pub fn reason(&self) -> &str {
        match self {
            Disposition::Requeue { reason, .. }
            | Disposition::Terminal { reason, .. }
            | Disposition::Release { reason }
            | Disposition::Abandon { reason } => reason,
        }
    }
}
