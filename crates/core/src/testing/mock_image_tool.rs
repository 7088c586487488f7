//! Mock image tool for testing.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::fixtures;
use crate::pipeline::{ImageTool, Stage, StageInvocation, ToolError, ToolRun};
use crate::work_item::Rid;

/// Scripted outcome of one stage.
#[derive(Debug, Clone)]
pub enum ToolBehavior {
    /// Write a well-formed output file.
    Succeed,
    /// Sleep, then succeed.
    Slow(Duration),
    FailTransient(String),
    FailPermanent(String),
    Timeout,
    /// Succeed but write `<rid>.bin` instead of the declared extension.
    WrongExtension,
    /// Succeed but write a zero-byte output.
    EmptyOutput,
    Panic,
}

/// Mock implementation of the ImageTool trait.
///
/// Writes real files into the invocation's output directory so the
/// executor's verification runs unchanged. The metadata stage writes the
/// [`fixtures::image_metadata`] document.
///
/// Behaviors are looked up in order: one-shot scripts, per-item scripts,
/// per-stage scripts, then [`ToolBehavior::Succeed`].
///
/// # Example
///
/// ```rust,ignore
/// use imaging_core::testing::{MockImageTool, ToolBehavior};
///
/// let tool = MockImageTool::new();
/// tool.script_once(Stage::Package, ToolBehavior::FailTransient("out of memory".into())).await;
/// ```
#[derive(Debug, Default)]
pub struct MockImageTool {
    once: Arc<RwLock<HashMap<Stage, Vec<ToolBehavior>>>>,
    per_item: Arc<RwLock<HashMap<(Rid, Stage), ToolBehavior>>>,
    per_stage: Arc<RwLock<HashMap<Stage, ToolBehavior>>>,
    calls: Arc<RwLock<Vec<(Rid, Stage)>>>,
}

impl MockImageTool {
    /// Create a mock tool where every stage succeeds.
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `behavior` for every run of `stage`.
    pub async fn script(&self, stage: Stage, behavior: ToolBehavior) {
        self.per_stage.write().await.insert(stage, behavior);
    }

    /// Use `behavior` for every run of `stage` on `rid`.
    pub async fn script_for(&self, rid: &Rid, stage: Stage, behavior: ToolBehavior) {
        self.per_item
            .write()
            .await
            .insert((rid.clone(), stage), behavior);
    }

    /// Use `behavior` for the next run of `stage` only.
    pub async fn script_once(&self, stage: Stage, behavior: ToolBehavior) {
        self.once
            .write()
            .await
            .entry(stage)
            .or_default()
            .push(behavior);
    }

    /// All runs so far, in call order.
    pub async fn calls(&self) -> Vec<(Rid, Stage)> {
        self.calls.read().await.clone()
    }

    async fn behavior(&self, rid: &Rid, stage: Stage) -> ToolBehavior {
        if let Some(queue) = self.once.write().await.get_mut(&stage) {
            if !queue.is_empty() {
                return queue.remove(0);
            }
        }
        if let Some(behavior) = self.per_item.read().await.get(&(rid.clone(), stage)) {
            return behavior.clone();
        }
        self.per_stage
            .read()
            .await
            .get(&stage)
            .cloned()
            .unwrap_or(ToolBehavior::Succeed)
    }
}

async fn write_output(invocation: &StageInvocation, extension: &str, empty: bool) -> Result<(), ToolError> {
    let path = invocation
        .output_dir
        .join(format!("{}.{}", invocation.rid, extension));
    let content = if empty {
        Vec::new()
    } else if invocation.stage == Stage::Metadata {
        serde_json::to_vec(&fixtures::image_metadata())
            .map_err(|e| ToolError::Io(std::io::Error::other(e)))?
    } else {
        format!("{} output of {}", invocation.stage, invocation.input.display()).into_bytes()
    };
    tokio::fs::write(path, content).await?;
    Ok(())
}

#[async_trait]
impl ImageTool for MockImageTool {
    fn name(&self) -> &str {
        "mock"
    }

    async fn run(&self, invocation: &StageInvocation) -> Result<ToolRun, ToolError> {
        let start = Instant::now();
        self.calls
            .write()
            .await
            .push((invocation.rid.clone(), invocation.stage));

        let stage = invocation.stage;
        match self.behavior(&invocation.rid, stage).await {
            ToolBehavior::Succeed => write_output(invocation, &invocation.output_extension, false).await?,
            ToolBehavior::Slow(delay) => {
                tokio::time::sleep(delay).await;
                write_output(invocation, &invocation.output_extension, false).await?
            }
            ToolBehavior::FailTransient(message) => {
                return Err(ToolError::Failed {
                    stage,
                    code: Some(75),
                    stderr_tail: message,
                    transient: true,
                })
            }
            ToolBehavior::FailPermanent(message) => {
                return Err(ToolError::Failed {
                    stage,
                    code: Some(1),
                    stderr_tail: message,
                    transient: false,
                })
            }
            ToolBehavior::Timeout => {
                return Err(ToolError::Timeout {
                    stage,
                    timeout_secs: 0,
                })
            }
            ToolBehavior::WrongExtension => write_output(invocation, "bin", false).await?,
            ToolBehavior::EmptyOutput => {
                write_output(invocation, &invocation.output_extension, true).await?
            }
            ToolBehavior::Panic => panic!("mock {} tool panicked", stage),
        }

        Ok(ToolRun {
            exit_code: Some(0),
            duration_ms: start.elapsed().as_millis() as u64,
            stderr_tail: String::new(),
        })
    }

    async fn validate(&self) -> Result<(), ToolError> {
        Ok(())
    }
}
