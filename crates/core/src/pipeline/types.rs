//! Pipeline data types.

use std::fmt;
use std::path::PathBuf;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::TempDir;

use crate::work_item::Rid;

/// Processing stages in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Download of the source asset into scratch space.
    Fetch,
    /// Format normalization.
    Normalize,
    /// Tiled pyramid generation.
    Pyramid,
    /// OME-TIFF packaging.
    Package,
    /// Metadata extraction.
    Metadata,
}

impl Stage {
    /// Stages run by external tools, in order.
    pub const TOOL_STAGES: [Stage; 4] = [
        Stage::Normalize,
        Stage::Pyramid,
        Stage::Package,
        Stage::Metadata,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Fetch => "fetch",
            Stage::Normalize => "normalize",
            Stage::Pyramid => "pyramid",
            Stage::Package => "package",
            Stage::Metadata => "metadata",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata derived from the packaged image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageMetadata {
    pub channels: u32,
    pub z_planes: u32,
    pub width: u64,
    pub height: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub series: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pixel_type: Option<String>,
}

/// One tool invocation.
#[derive(Debug, Clone)]
pub struct StageInvocation {
    pub rid: Rid,
    pub stage: Stage,
    pub input: PathBuf,
    pub output_dir: PathBuf,
    /// Extension the declared output must carry (without the dot).
    pub output_extension: String,
}

/// Outcome of a successful tool run.
#[derive(Debug, Clone)]
pub struct ToolRun {
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    pub stderr_tail: String,
}

/// A verified stage output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub stage: Stage,
    pub path: PathBuf,
    pub size_bytes: u64,
}

impl Artifact {
    pub fn filename(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Output of a successful pipeline run.
///
/// Owns the attempt's scratch directory: artifacts stay on disk until the
/// result is dropped, which removes the directory.
#[derive(Debug)]
pub struct PipelineResult {
    pub rid: Rid,
    /// Artifacts to publish, in stage order.
    pub artifacts: Vec<Artifact>,
    pub metadata: ImageMetadata,
    pub(crate) scratch: TempDir,
}

impl PipelineResult {
    pub fn scratch_path(&self) -> &std::path::Path {
        self.scratch.path()
    }

    /// Remove the scratch directory, reporting any error.
    pub fn discard(self) -> std::io::Result<()> {
        self.scratch.close()
    }
}

/// Progress of one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "phase", content = "stage")]
pub enum AttemptPhase {
    Claimed,
    Running(Stage),
    Publishing,
    Finished,
}

/// In-memory record of one worker's pass over a work item.
#[derive(Debug, Clone)]
pub struct ProcessingAttempt {
    pub rid: Rid,
    pub started_at: DateTime<Utc>,
    pub phase: AttemptPhase,
    pub last_error: Option<String>,
    started: Instant,
}

impl ProcessingAttempt {
    pub fn new(rid: Rid) -> Self {
        Self {
            rid,
            started_at: Utc::now(),
            phase: AttemptPhase::Claimed,
            last_error: None,
            started: Instant::now(),
        }
    }

    pub fn enter(&mut self, phase: AttemptPhase) {
        self.phase = phase;
    }

    /// Last stage the attempt reached, if it got past the claim.
    pub fn stage_reached(&self) -> Option<Stage> {
        match self.phase {
            AttemptPhase::Running(stage) => Some(stage),
            _ => None,
        }
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        self.last_error = Some(error.into());
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }
}
