//! Configuration for the processing pipeline.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::types::Stage;

/// Configuration for the processing pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingConfig {
    /// Parent directory for per-attempt scratch directories.
    #[serde(default = "default_processing_dir")]
    pub processing_dir: PathBuf,

    /// Exit codes that mark a tool failure as transient.
    #[serde(default = "default_transient_exit_codes")]
    pub transient_exit_codes: Vec<i32>,

    /// Case-insensitive stderr patterns that mark a tool failure as transient.
    #[serde(default = "default_transient_patterns")]
    pub transient_patterns: Vec<String>,

    /// Number of trailing stderr lines kept for diagnostics.
    #[serde(default = "default_stderr_tail_lines")]
    pub stderr_tail_lines: usize,

    #[serde(default)]
    pub tools: StageTools,
}

/// One external tool per stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageTools {
    #[serde(default = "default_normalize")]
    pub normalize: ToolConfig,
    #[serde(default = "default_pyramid")]
    pub pyramid: ToolConfig,
    #[serde(default = "default_package")]
    pub package: ToolConfig,
    #[serde(default = "default_metadata")]
    pub metadata: ToolConfig,
}

/// External tool invocation for one stage.
///
/// Arguments may use `{input}`, `{output_dir}`, `{rid}` and `{stage}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolConfig {
    pub program: PathBuf,

    #[serde(default)]
    pub args: Vec<String>,

    /// Extension of the declared output, e.g. `ome.tiff`.
    pub output_extension: String,

    #[serde(default = "default_tool_timeout")]
    pub timeout_secs: u64,

    /// Whether this stage's output is uploaded.
    #[serde(default = "default_publish")]
    pub publish: bool,
}

fn default_processing_dir() -> PathBuf {
    std::env::temp_dir().join("imaging-worker")
}

fn default_transient_exit_codes() -> Vec<i32> {
    vec![75] // EX_TEMPFAIL
}

fn default_transient_patterns() -> Vec<String> {
    [
        "out of memory",
        "cannot allocate memory",
        "no space left on device",
        "resource temporarily unavailable",
        "too many open files",
        "outofmemoryerror",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_stderr_tail_lines() -> usize {
    20
}

fn default_tool_timeout() -> u64 {
    3600 // 1 hour
}

fn default_publish() -> bool {
    true
}

fn tool(program: &str, args: &[&str], output_extension: &str, publish: bool) -> ToolConfig {
    ToolConfig {
        program: PathBuf::from(program),
        args: args.iter().map(|s| s.to_string()).collect(),
        output_extension: output_extension.to_string(),
        timeout_secs: default_tool_timeout(),
        publish,
    }
}

fn default_normalize() -> ToolConfig {
    tool(
        "bfconvert",
        &["-overwrite", "-series", "0", "{input}", "{output_dir}/{rid}.ome.tif"],
        "ome.tif",
        false,
    )
}

fn default_pyramid() -> ToolConfig {
    tool(
        "vips",
        &["dzsave", "{input}", "{output_dir}/{rid}.zip", "--layout", "iiif"],
        "zip",
        true,
    )
}

fn default_package() -> ToolConfig {
    tool(
        "bfconvert",
        &[
            "-overwrite",
            "-pyramid-resolutions",
            "4",
            "-pyramid-scale",
            "2",
            "-tilex",
            "512",
            "-tiley",
            "512",
            "{input}",
            "{output_dir}/{rid}.ome.tiff",
        ],
        "ome.tiff",
        true,
    )
}

fn default_metadata() -> ToolConfig {
    tool(
        "imaging-metadata",
        &["--output", "{output_dir}/{rid}.json", "{input}"],
        "json",
        true,
    )
}

impl Default for StageTools {
    fn default() -> Self {
        Self {
            normalize: default_normalize(),
            pyramid: default_pyramid(),
            package: default_package(),
            metadata: default_metadata(),
        }
    }
}

impl StageTools {
    /// Tool for a tool stage; `None` for [`Stage::Fetch`].
    pub fn get(&self, stage: Stage) -> Option<&ToolConfig> {
        match stage {
            Stage::Fetch => None,
            Stage::Normalize => Some(&self.normalize),
            Stage::Pyramid => Some(&self.pyramid),
            Stage::Package => Some(&self.package),
            Stage::Metadata => Some(&self.metadata),
        }
    }

    pub fn max_timeout_secs(&self) -> u64 {
        Stage::TOOL_STAGES
            .iter()
            .filter_map(|s| self.get(*s))
            .map(|t| t.timeout_secs)
            .max()
            .unwrap_or(0)
    }
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            processing_dir: default_processing_dir(),
            transient_exit_codes: default_transient_exit_codes(),
            transient_patterns: default_transient_patterns(),
            stderr_tail_lines: default_stderr_tail_lines(),
            tools: StageTools::default(),
        }
    }
}

impl ProcessingConfig {
    /// Sets the processing directory.
    pub fn with_processing_dir(mut self, dir: PathBuf) -> Self {
        self.processing_dir = dir;
        self
    }

    /// Replaces the tool for one stage.
    pub fn with_tool(mut self, stage: Stage, tool: ToolConfig) -> Self {
        match stage {
            Stage::Fetch => {}
            Stage::Normalize => self.tools.normalize = tool,
            Stage::Pyramid => self.tools.pyramid = tool,
            Stage::Package => self.tools.package = tool,
            Stage::Metadata => self.tools.metadata = tool,
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ProcessingConfig::default();
        assert_eq!(config.transient_exit_codes, vec![75]);
        assert!(config
            .transient_patterns
            .iter()
            .any(|p| p == "no space left on device"));
        assert!(!config.tools.normalize.publish);
        assert!(config.tools.package.publish);
        assert_eq!(config.tools.metadata.output_extension, "json");
    }

    #[test]
    fn test_deserialize_tool_override() {
        let toml = r#"
            processing_dir = "/scratch/imaging"

            [tools.pyramid]
            program = "/opt/bin/make-pyramid"
            args = ["{input}", "{output_dir}"]
            output_extension = "tar"
            timeout_secs = 600
        "#;
        let config: ProcessingConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.processing_dir, PathBuf::from("/scratch/imaging"));
        assert_eq!(
            config.tools.pyramid.program,
            PathBuf::from("/opt/bin/make-pyramid")
        );
        assert!(config.tools.pyramid.publish);
        assert_eq!(config.tools.package.output_extension, "ome.tiff");
        assert_eq!(config.tools.max_timeout_secs(), 3600);
    }
}
