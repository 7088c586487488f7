//! Process-backed image tool.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use regex_lite::Regex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info};

use super::config::{ProcessingConfig, StageTools, ToolConfig};
use super::error::ToolError;
use super::tool::ImageTool;
use super::types::{Stage, StageInvocation, ToolRun};

/// Runs each stage as a child process built from the configured argument template.
pub struct CommandTool {
    tools: StageTools,
    transient_exit_codes: Vec<i32>,
    transient_patterns: Vec<Regex>,
    tail_lines: usize,
}

impl CommandTool {
    pub fn new(config: &ProcessingConfig) -> Result<Self, ToolError> {
        let transient_patterns = config
            .transient_patterns
            .iter()
            .map(|p| {
                Regex::new(&format!("(?i){}", p))
                    .map_err(|e| ToolError::InvalidConfig(format!("pattern '{}': {}", p, e)))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            tools: config.tools.clone(),
            transient_exit_codes: config.transient_exit_codes.clone(),
            transient_patterns,
            tail_lines: config.stderr_tail_lines.max(1),
        })
    }

    fn tool(&self, stage: Stage) -> Result<&ToolConfig, ToolError> {
        self.tools
            .get(stage)
            .ok_or(ToolError::NotConfigured { stage })
    }

    fn render_args(tool: &ToolConfig, invocation: &StageInvocation) -> Vec<String> {
        let input = invocation.input.to_string_lossy();
        let output_dir = invocation.output_dir.to_string_lossy();
        tool.args
            .iter()
            .map(|arg| {
                arg.replace("{input}", &input)
                    .replace("{output_dir}", &output_dir)
                    .replace("{rid}", invocation.rid.as_str())
                    .replace("{stage}", invocation.stage.as_str())
            })
            .collect()
    }

    /// Signals, configured exit codes and resource-exhaustion messages are
    /// environment failures; everything else is blamed on the input.
    fn is_transient(&self, code: Option<i32>, stderr: &str) -> bool {
        match code {
            None => true,
            Some(code) if self.transient_exit_codes.contains(&code) => true,
            Some(_) => self.transient_patterns.iter().any(|re| re.is_match(stderr)),
        }
    }
}

#[async_trait]
impl ImageTool for CommandTool {
    fn name(&self) -> &str {
        "command"
    }

    async fn run(&self, invocation: &StageInvocation) -> Result<ToolRun, ToolError> {
        let tool = self.tool(invocation.stage)?;
        let args = Self::render_args(tool, invocation);
        let start = Instant::now();

        info!(
            "Running {} tool for {}: {} {}",
            invocation.stage,
            invocation.rid,
            tool.program.display(),
            args.join(" ")
        );

        let mut child = Command::new(&tool.program)
            .args(&args)
            .current_dir(&invocation.output_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    ToolError::NotFound {
                        path: tool.program.clone(),
                    }
                } else {
                    ToolError::Io(e)
                }
            })?;

        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ToolError::Io(std::io::Error::other("stderr not captured")))?;
        let mut reader = BufReader::new(stderr).lines();
        let mut tail: VecDeque<String> = VecDeque::with_capacity(self.tail_lines);

        let result = timeout(Duration::from_secs(tool.timeout_secs), async {
            while let Ok(Some(line)) = reader.next_line().await {
                debug!("[{} {}] {}", invocation.rid, invocation.stage, line);
                if tail.len() == self.tail_lines {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            child.wait().await
        })
        .await;

        let stderr_tail = tail.into_iter().collect::<Vec<_>>().join("\n");

        match result {
            Ok(Ok(status)) if status.success() => Ok(ToolRun {
                exit_code: status.code(),
                duration_ms: start.elapsed().as_millis() as u64,
                stderr_tail,
            }),
            Ok(Ok(status)) => Err(ToolError::Failed {
                stage: invocation.stage,
                code: status.code(),
                transient: self.is_transient(status.code(), &stderr_tail),
                stderr_tail,
            }),
            Ok(Err(e)) => Err(ToolError::Io(e)),
            Err(_) => {
                let _ = child.kill().await;
                Err(ToolError::Timeout {
                    stage: invocation.stage,
                    timeout_secs: tool.timeout_secs,
                })
            }
        }
    }

    async fn validate(&self) -> Result<(), ToolError> {
        for stage in Stage::TOOL_STAGES {
            let tool = self.tool(stage)?;
            if resolve_program(&tool.program).is_none() {
                return Err(ToolError::NotFound {
                    path: tool.program.clone(),
                });
            }
        }
        Ok(())
    }
}

/// Locate a program the way a shell would: paths as given, bare names via `PATH`.
fn resolve_program(program: &Path) -> Option<PathBuf> {
    if program.components().count() > 1 {
        return program.is_file().then(|| program.to_path_buf());
    }
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::work_item::Rid;
    use tempfile::TempDir;

    fn sh(script: &str, ext: &str) -> ToolConfig {
        ToolConfig {
            program: PathBuf::from("sh"),
            args: vec!["-c".to_string(), script.to_string()],
            output_extension: ext.to_string(),
            timeout_secs: 5,
            publish: true,
        }
    }

    fn command_tool(stage: Stage, tool: ToolConfig) -> CommandTool {
        CommandTool::new(&ProcessingConfig::default().with_tool(stage, tool)).unwrap()
    }

    fn invocation(dir: &TempDir, stage: Stage) -> StageInvocation {
        StageInvocation {
            rid: Rid::new("1-A"),
            stage,
            input: dir.path().join("input.czi"),
            output_dir: dir.path().to_path_buf(),
            output_extension: "tif".to_string(),
        }
    }

    #[test]
    fn test_render_args() {
        let tool = ToolConfig {
            program: PathBuf::from("bfconvert"),
            args: vec![
                "{input}".to_string(),
                "{output_dir}/{rid}-{stage}.tif".to_string(),
            ],
            output_extension: "tif".to_string(),
            timeout_secs: 5,
            publish: true,
        };
        let inv = StageInvocation {
            rid: Rid::new("1-A"),
            stage: Stage::Package,
            input: PathBuf::from("/scratch/in.czi"),
            output_dir: PathBuf::from("/scratch/package"),
            output_extension: "tif".to_string(),
        };
        assert_eq!(
            CommandTool::render_args(&tool, &inv),
            vec!["/scratch/in.czi", "/scratch/package/1-A-package.tif"]
        );
    }

    #[test]
    fn test_transient_classification() {
        let tool = CommandTool::new(&ProcessingConfig::default()).unwrap();
        assert!(tool.is_transient(None, ""));
        assert!(tool.is_transient(Some(75), ""));
        assert!(tool.is_transient(Some(1), "java.lang.OutOfMemoryError: Java heap space"));
        assert!(tool.is_transient(Some(1), "write failed: No space left on device"));
        assert!(!tool.is_transient(Some(1), "Unsupported pixel type"));
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        let config = ProcessingConfig {
            transient_patterns: vec!["(unclosed".to_string()],
            ..ProcessingConfig::default()
        };
        assert!(matches!(
            CommandTool::new(&config),
            Err(ToolError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_run_success() {
        let dir = TempDir::new().unwrap();
        let tool = command_tool(Stage::Pyramid, sh("echo working >&2; touch out.tif", "tif"));

        let run = tool.run(&invocation(&dir, Stage::Pyramid)).await.unwrap();
        assert_eq!(run.exit_code, Some(0));
        assert_eq!(run.stderr_tail, "working");
        assert!(dir.path().join("out.tif").exists());
    }

    #[tokio::test]
    async fn test_run_permanent_failure_keeps_stderr_tail() {
        let dir = TempDir::new().unwrap();
        let tool = command_tool(
            Stage::Package,
            sh("echo 'Unsupported pixel type' >&2; exit 3", "tif"),
        );

        let err = tool
            .run(&invocation(&dir, Stage::Package))
            .await
            .unwrap_err();
        match err {
            ToolError::Failed {
                code,
                stderr_tail,
                transient,
                ..
            } => {
                assert_eq!(code, Some(3));
                assert_eq!(stderr_tail, "Unsupported pixel type");
                assert!(!transient);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_run_tempfail_is_transient() {
        let dir = TempDir::new().unwrap();
        let tool = command_tool(Stage::Package, sh("exit 75", "tif"));
        let err = tool
            .run(&invocation(&dir, Stage::Package))
            .await
            .unwrap_err();
        assert_eq!(err.class(), crate::failure::ErrorClass::Transient);
    }

    #[tokio::test]
    async fn test_run_timeout_kills_process() {
        let dir = TempDir::new().unwrap();
        let mut slow = sh("sleep 5", "tif");
        slow.timeout_secs = 1;
        let tool = command_tool(Stage::Normalize, slow);

        let start = Instant::now();
        let err = tool
            .run(&invocation(&dir, Stage::Normalize))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Timeout { timeout_secs: 1, .. }));
        assert!(start.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_missing_program() {
        let dir = TempDir::new().unwrap();
        let tool = command_tool(
            Stage::Metadata,
            ToolConfig {
                program: PathBuf::from("/nonexistent/imaging-tool"),
                args: vec![],
                output_extension: "json".to_string(),
                timeout_secs: 5,
                publish: true,
            },
        );
        let err = tool
            .run(&invocation(&dir, Stage::Metadata))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::NotFound { .. }));
        assert!(matches!(
            tool.validate().await,
            Err(ToolError::NotFound { .. })
        ));
    }

    #[test]
    fn test_resolve_program_via_path() {
        assert!(resolve_program(Path::new("sh")).is_some());
        assert!(resolve_program(Path::new("definitely-not-a-real-tool-xyz")).is_none());
    }
}
