//! Notification backends.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::Mutex;

use super::dispatcher::Notifier;
use super::types::{single_line, Notification, NotifyBackend, NotifyConfig, NotifyError};

/// Logs notifications at error level.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    fn name(&self) -> &str {
        "log"
    }

    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        tracing::error!(
            rid = %notification.rid,
            stage = notification.stage.as_deref().unwrap_or("-"),
            "{}: {}",
            notification.subject(),
            notification.diagnostic
        );
        Ok(())
    }
}

/// Appends notifications as JSON lines.
pub struct FileNotifier {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileNotifier {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }
}

#[async_trait]
impl Notifier for FileNotifier {
    fn name(&self) -> &str {
        "file"
    }

    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        let mut line =
            serde_json::to_string(notification).map_err(|e| NotifyError::Encode(e.to_string()))?;
        line.push('\n');

        let _guard = self.lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

/// Pipes an RFC 822 message into a mail command such as `sendmail -t`.
pub struct CommandNotifier {
    program: String,
    args: Vec<String>,
    sender: Option<String>,
    recipients: Vec<String>,
    timeout: Duration,
}

impl CommandNotifier {
    pub fn new(
        command: &[String],
        sender: Option<String>,
        recipients: Vec<String>,
        timeout: Duration,
    ) -> Result<Self, NotifyError> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| NotifyError::Command("empty notification command".to_string()))?;

        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            sender,
            recipients,
            timeout,
        })
    }

    fn message(&self, notification: &Notification) -> String {
        let mut message = String::new();
        if let Some(sender) = &self.sender {
            message.push_str(&format!("From: {}\n", single_line(sender)));
        }
        message.push_str(&format!(
            "To: {}\n",
            single_line(&self.recipients.join(", "))
        ));
        message.push_str(&format!("Subject: {}\n", notification.subject()));
        message.push_str("Content-Type: text/plain; charset=utf-8\n\n");
        message.push_str(&notification.body());
        message
    }
}

#[async_trait]
impl Notifier for CommandNotifier {
    fn name(&self) -> &str {
        "command"
    }

    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| NotifyError::Command(format!("{}: {}", self.program, e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            // A command that exits early closes the pipe; its exit status is reported below.
            if let Err(e) = stdin.write_all(self.message(notification).as_bytes()).await {
                if e.kind() != std::io::ErrorKind::BrokenPipe {
                    return Err(e.into());
                }
            }
        }

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                NotifyError::Command(format!(
                    "{} timed out after {}s",
                    self.program,
                    self.timeout.as_secs()
                ))
            })??;

        if !output.status.success() {
            return Err(NotifyError::Command(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

/// Build the configured notifier.
pub fn build_notifier(config: &NotifyConfig) -> Result<Arc<dyn Notifier>, NotifyError> {
    Ok(match config.backend {
        NotifyBackend::Log => Arc::new(LogNotifier),
        NotifyBackend::File => Arc::new(FileNotifier::new(config.file.clone())),
        NotifyBackend::Command => Arc::new(CommandNotifier::new(
            &config.command,
            config.sender.clone(),
            config.recipients.clone(),
            Duration::from_secs(config.command_timeout_secs),
        )?),
    })
}
