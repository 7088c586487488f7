//! Image conversion pipeline.
//!
//! A claimed item goes through a fixed sequence:
//!
//! ```text
//! fetch -> normalize -> pyramid -> package -> metadata
//! ```
//!
//! Each tool stage is an external transform `(input path, output dir)`
//! behind the [`ImageTool`] trait. The [`PipelineExecutor`] verifies each
//! stage's declared output (non-empty file with the expected extension)
//! before feeding it to the next stage, and checks a [`StageGate`] at every
//! boundary so a lost lease or a shutdown stops the attempt between stages.
//!
//! All files live in a per-attempt scratch directory under
//! `processing_dir`, removed on every exit path.
//!
//! # Example
//!
//! ```ignore
//! use imaging_core::pipeline::{CommandTool, OpenGate, PipelineExecutor, ProcessingAttempt};
//!
//! let tool = Arc::new(CommandTool::new(&config.processing)?);
//! let executor = PipelineExecutor::new(config.processing.clone(), tool, store);
//! let mut attempt = ProcessingAttempt::new(item.rid.clone());
//! let result = executor.execute(&item, &OpenGate, &mut attempt).await?;
//! ```

mod command;
mod config;
mod error;
mod executor;
mod tool;
mod types;

pub use command::CommandTool;
pub use config::{ProcessingConfig, StageTools, ToolConfig};
pub use error::{PipelineError, ToolError};
pub use executor::{OpenGate, PipelineExecutor, StageGate};
pub use tool::ImageTool;
pub use types::{
    Artifact, AttemptPhase, ImageMetadata, PipelineResult, ProcessingAttempt, Stage,
    StageInvocation, ToolRun,
};
