//! External image tool trait.

use async_trait::async_trait;

use super::error::ToolError;
use super::types::{StageInvocation, ToolRun};

/// Runs the external transform for a pipeline stage.
///
/// A tool reads `invocation.input` and writes its declared output into
/// `invocation.output_dir`. The executor verifies the output; the tool only
/// reports how the process ended.
#[async_trait]
pub trait ImageTool: Send + Sync {
    /// Returns the name of this tool implementation.
    fn name(&self) -> &str;

    /// Run the tool for one stage.
    async fn run(&self, invocation: &StageInvocation) -> Result<ToolRun, ToolError>;

    /// Check that every configured program is available.
    async fn validate(&self) -> Result<(), ToolError>;
}
