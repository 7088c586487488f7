//! Pipeline executor.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tempfile::TempDir;
use tracing::{debug, info};

use super::config::ProcessingConfig;
use super::error::PipelineError;
use super::tool::ImageTool;
use super::types::{
    Artifact, AttemptPhase, ImageMetadata, PipelineResult, ProcessingAttempt, Stage,
    StageInvocation,
};
use crate::failure::ErrorClass;
use crate::metrics;
use crate::storage::{digest_file, ObjectStore};
use crate::work_item::WorkItem;

/// Checked at every stage boundary.
///
/// The scheduler's gate renews the lease and watches for shutdown; an error
/// stops the attempt before the stage starts.
#[async_trait]
pub trait StageGate: Send + Sync {
    async fn before_stage(&self, stage: Stage) -> Result<(), PipelineError>;
}

/// Gate that never stops an attempt.
pub struct OpenGate;

#[async_trait]
impl StageGate for OpenGate {
    async fn before_stage(&self, _stage: Stage) -> Result<(), PipelineError> {
        Ok(())
    }
}

/// Runs fetch and the tool stages for one claimed item.
pub struct PipelineExecutor {
    config: ProcessingConfig,
    tool: Arc<dyn ImageTool>,
    store: Arc<dyn ObjectStore>,
}

impl PipelineExecutor {
    pub fn new(
        config: ProcessingConfig,
        tool: Arc<dyn ImageTool>,
        store: Arc<dyn ObjectStore>,
    ) -> Self {
        Self {
            config,
            tool,
            store,
        }
    }

    pub fn processing_dir(&self) -> &Path {
        &self.config.processing_dir
    }

    /// Run the pipeline.
    ///
    /// Stages run strictly in order; the first failure aborts the rest. The
    /// scratch directory is removed on every error path, and on success it
    /// is handed to the returned [`PipelineResult`].
    pub async fn execute(
        &self,
        item: &WorkItem,
        gate: &dyn StageGate,
        attempt: &mut ProcessingAttempt,
    ) -> Result<PipelineResult, PipelineError> {
        let scratch = self.create_scratch(item).await?;
        debug!("Scratch for {} at {}", item.rid, scratch.path().display());

        gate.before_stage(Stage::Fetch).await?;
        attempt.enter(AttemptPhase::Running(Stage::Fetch));
        let mut input = self.fetch_source(item, scratch.path()).await?;

        let mut artifacts = Vec::new();
        let mut metadata = None;

        for stage in Stage::TOOL_STAGES {
            gate.before_stage(stage).await?;
            attempt.enter(AttemptPhase::Running(stage));

            let tool_config = self.config.tools.get(stage).ok_or_else(|| {
                PipelineError::transient(stage, "no tool configured for stage")
            })?;

            let output_dir = scratch.path().join(stage.as_str());
            tokio::fs::create_dir_all(&output_dir)
                .await
                .map_err(|e| PipelineError::Scratch(e.to_string()))?;

            let invocation = StageInvocation {
                rid: item.rid.clone(),
                stage,
                input: input.clone(),
                output_dir: output_dir.clone(),
                output_extension: tool_config.output_extension.clone(),
            };

            let timer = metrics::STAGE_DURATION
                .with_label_values(&[stage.as_str()])
                .start_timer();
            let run = self.tool.run(&invocation).await;
            timer.observe_duration();
            let run = run.map_err(|e| PipelineError::from_tool(stage, e))?;

            let outputs = verify_outputs(stage, &output_dir, &tool_config.output_extension).await?;
            info!(
                "{} stage for {} produced {} file(s) in {}ms",
                stage,
                item.rid,
                outputs.len(),
                run.duration_ms
            );

            if stage == Stage::Metadata {
                metadata = Some(read_metadata(&outputs[0].path).await?);
            }

            input = outputs[0].path.clone();
            if tool_config.publish {
                artifacts.extend(outputs);
            }
        }

        let metadata = metadata
            .ok_or_else(|| PipelineError::permanent(Stage::Metadata, "no metadata produced"))?;

        Ok(PipelineResult {
            rid: item.rid.clone(),
            artifacts,
            metadata,
            scratch,
        })
    }

    async fn create_scratch(&self, item: &WorkItem) -> Result<TempDir, PipelineError> {
        tokio::fs::create_dir_all(&self.config.processing_dir)
            .await
            .map_err(|e| {
                PipelineError::Scratch(format!(
                    "{}: {}",
                    self.config.processing_dir.display(),
                    e
                ))
            })?;

        let prefix = format!("{}-", sanitize(item.rid.as_str()));
        tempfile::Builder::new()
            .prefix(&prefix)
            .tempdir_in(&self.config.processing_dir)
            .map_err(|e| PipelineError::Scratch(e.to_string()))
    }

    async fn fetch_source(&self, item: &WorkItem, scratch: &Path) -> Result<PathBuf, PipelineError> {
        if item.url.trim().is_empty() {
            return Err(PipelineError::permanent(Stage::Fetch, "item has no source URL"));
        }

        let source_dir = scratch.join("source");
        tokio::fs::create_dir_all(&source_dir)
            .await
            .map_err(|e| PipelineError::Scratch(e.to_string()))?;

        let filename = Path::new(&item.filename)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| sanitize(item.rid.as_str()));
        let dest = source_dir.join(filename);

        let bytes = self
            .store
            .fetch(&item.url, &dest)
            .await
            .map_err(|e| PipelineError::stage_failed(Stage::Fetch, e.class(), e.to_string()))?;

        if bytes == 0 {
            return Err(PipelineError::permanent(Stage::Fetch, "source asset is empty"));
        }
        if let Some(expected) = item.byte_size {
            if expected != bytes {
                return Err(PipelineError::transient(
                    Stage::Fetch,
                    format!("fetched {} bytes, catalog records {}", bytes, expected),
                ));
            }
        }
        if let Some(expected) = item.md5.as_deref().filter(|m| !m.is_empty()) {
            let digest = digest_file(&dest)
                .await
                .map_err(|e| PipelineError::Scratch(e.to_string()))?;
            if !digest.md5.eq_ignore_ascii_case(expected) {
                return Err(PipelineError::permanent(
                    Stage::Fetch,
                    format!("md5 mismatch: expected {}, got {}", expected, digest.md5),
                ));
            }
        }

        info!("Fetched {} bytes for {}", bytes, item.rid);
        Ok(dest)
    }
}

/// Presence and basic well-formedness of a stage's declared output.
async fn verify_outputs(
    stage: Stage,
    output_dir: &Path,
    extension: &str,
) -> Result<Vec<Artifact>, PipelineError> {
    let suffix = format!(".{}", extension.trim_start_matches('.').to_ascii_lowercase());
    let mut entries = tokio::fs::read_dir(output_dir)
        .await
        .map_err(|e| PipelineError::Scratch(e.to_string()))?;

    let mut outputs = Vec::new();
    let mut others = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| PipelineError::Scratch(e.to_string()))?
    {
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().to_ascii_lowercase();
        let meta = entry
            .metadata()
            .await
            .map_err(|e| PipelineError::Scratch(e.to_string()))?;
        if !meta.is_file() {
            continue;
        }
        if !name.ends_with(&suffix) {
            others.push(name);
            continue;
        }
        if meta.len() == 0 {
            return Err(PipelineError::permanent(
                stage,
                format!("output {} is empty", path.display()),
            ));
        }
        outputs.push(Artifact {
            stage,
            path,
            size_bytes: meta.len(),
        });
    }

    if outputs.is_empty() {
        let found = if others.is_empty() {
            "nothing".to_string()
        } else {
            others.join(", ")
        };
        return Err(PipelineError::StageFailed {
            stage,
            class: ErrorClass::Permanent,
            message: format!("no {} output produced", suffix),
            diagnostics: Some(format!("found: {}", found)),
        });
    }

    outputs.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(outputs)
}

async fn read_metadata(path: &Path) -> Result<ImageMetadata, PipelineError> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| PipelineError::Scratch(e.to_string()))?;
    serde_json::from_str(&content).map_err(|e| {
        PipelineError::permanent(Stage::Metadata, format!("malformed metadata: {}", e))
    })
}

fn sanitize(value: &str) -> String {
    value
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}
