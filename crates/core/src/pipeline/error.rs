//! Error types for the pipeline module.

use std::path::PathBuf;

use thiserror::Error;

use super::types::Stage;
use crate::failure::ErrorClass;

/// Errors from one external tool run.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Tool not found: {path}")]
    NotFound { path: PathBuf },

    #[error("No tool configured for stage {stage}")]
    NotConfigured { stage: Stage },

    #[error("Invalid tool configuration: {0}")]
    InvalidConfig(String),

    #[error("{stage} tool exited with {}", describe_exit(.code))]
    Failed {
        stage: Stage,
        code: Option<i32>,
        stderr_tail: String,
        transient: bool,
    },

    #[error("{stage} tool timed out after {timeout_secs}s")]
    Timeout { stage: Stage, timeout_secs: u64 },

    #[error("Tool I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("code {}", code),
        None => "a signal".to_string(),
    }
}

impl ToolError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ToolError::Failed { transient, .. } if !transient => ErrorClass::Permanent,
            _ => ErrorClass::Transient,
        }
    }

    pub fn diagnostics(&self) -> Option<&str> {
        match self {
            ToolError::Failed { stderr_tail, .. } if !stderr_tail.is_empty() => {
                Some(stderr_tail.as_str())
            }
            _ => None,
        }
    }
}

/// Errors from a pipeline run, tagged with the stage that failed.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{stage} stage failed ({class}): {message}")]
    StageFailed {
        stage: Stage,
        class: ErrorClass,
        message: String,
        diagnostics: Option<String>,
    },

    /// Shutdown was requested; stopped at the boundary before `stage`.
    #[error("Interrupted before {stage} stage")]
    Interrupted { stage: Stage },

    /// The lease moved while the pipeline was running.
    #[error("Lease lost before {stage} stage: {reason}")]
    LeaseLost { stage: Stage, reason: String },

    #[error("Scratch space error: {0}")]
    Scratch(String),
}

impl PipelineError {
    pub fn stage_failed(stage: Stage, class: ErrorClass, message: impl Into<String>) -> Self {
        Self::StageFailed {
            stage,
            class,
            message: message.into(),
            diagnostics: None,
        }
    }

    pub fn permanent(stage: Stage, message: impl Into<String>) -> Self {
        Self::stage_failed(stage, ErrorClass::Permanent, message)
    }

    pub fn transient(stage: Stage, message: impl Into<String>) -> Self {
        Self::stage_failed(stage, ErrorClass::Transient, message)
    }

    pub fn from_tool(stage: Stage, error: ToolError) -> Self {
        Self::StageFailed {
            stage,
            class: error.class(),
            diagnostics: error.diagnostics().map(String::from),
            message: error.to_string(),
        }
    }

    pub fn stage(&self) -> Option<Stage> {
        match self {
            Self::StageFailed { stage, .. }
            | Self::Interrupted { stage }
            | Self::LeaseLost { stage, .. } => Some(*stage),
            Self::Scratch(_) => None,
        }
    }

    pub fn diagnostics(&self) -> Option<&str> {
        match self {
            Self::StageFailed { diagnostics, .. } => diagnostics.as_deref(),
            _ => None,
        }
    }
}
