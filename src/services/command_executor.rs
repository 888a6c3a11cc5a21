use async_trait::async_trait;
use serde_json::{Value as JsonValue, json};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

use crate::error::{AppError, AppResult};
use crate::models::{Command, CommandOutcome, ExecutionOutcome};

const MAX_STDERR: usize = 4 * 1024;

/// Runs a leased command to a terminal outcome.
///
/// Failures are outcomes, not errors: a command that cannot run still gets a
/// `failed` receipt.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(&self, command: &Command) -> ExecutionOutcome;
}

/// Executes commands through the wrapped CLI as `<bin> <intent> <argv...>`
#[derive(Debug, Clone)]
pub struct CliCommandExecutor {
    bin: String,
    timeout: Option<Duration>,
}

impl CliCommandExecutor {
    pub fn new(bin: impl Into<String>, timeout: Option<Duration>) -> Self {
        Self {
            bin: bin.into(),
            timeout,
        }
    }

    /// `args` may be a string array, an object with an `argv` array, or any
    /// other JSON value which is passed as `--json <value>`.
    fn argv(command: &Command) -> Vec<String> {
        let mut argv = vec![command.intent.clone()];
        match &command.args {
            JsonValue::Null => {}
            JsonValue::Array(items) if items.iter().all(JsonValue::is_string) => {
                argv.extend(items.iter().filter_map(|v| v.as_str().map(str::to_string)));
            }
            JsonValue::Object(map) if map.get("argv").is_some_and(JsonValue::is_array) => {
                if let Some(JsonValue::Array(items)) = map.get("argv") {
                    argv.extend(items.iter().map(|v| match v {
                        JsonValue::String(s) => s.clone(),
                        other => other.to_string(),
                    }));
                }
            }
            other => {
                argv.push("--json".to_string());
                argv.push(other.to_string());
            }
        }
        argv
    }

    async fn run(&self, argv: &[String]) -> AppResult<(std::process::ExitStatus, Vec<u8>, Vec<u8>)> {
        let mut child = tokio::process::Command::new(&self.bin)
            .args(argv)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AppError::execution(format!("failed to spawn {}: {}", self.bin, e)))?;

        let mut stdout_handle = child.stdout.take();
        let mut stderr_handle = child.stderr.take();

        let completion = async {
            let (status, stdout, stderr) = tokio::join!(
                child.wait(),
                async {
                    let mut buf = Vec::new();
                    if let Some(ref mut h) = stdout_handle {
                        let _ = h.read_to_end(&mut buf).await;
                    }
                    buf
                },
                async {
                    let mut buf = Vec::new();
                    if let Some(ref mut h) = stderr_handle {
                        let _ = h.read_to_end(&mut buf).await;
                    }
                    buf
                },
            );
            status
                .map(|s| (s, stdout, stderr))
                .map_err(|e| AppError::execution(format!("waiting for {}: {}", self.bin, e)))
        };

        match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, completion).await {
                Ok(result) => result,
                Err(_) => Err(AppError::timeout(format!("{} after {}ms", self.bin, limit.as_millis()))),
            },
            None => completion.await,
        }
    }
}

#[async_trait]
impl CommandExecutor for CliCommandExecutor {
    async fn execute(&self, command: &Command) -> ExecutionOutcome {
        let argv = Self::argv(command);
        debug!(command_id = %command.command_id, bin = %self.bin, ?argv, "executing command");

        let (status, stdout, stderr) = match self.run(&argv).await {
            Ok(output) => output,
            Err(e) => {
                warn!(command_id = %command.command_id, error = %e, "command execution failed");
                return ExecutionOutcome::failed(e.to_string());
            }
        };

        if status.success() {
            return ExecutionOutcome::result(stdout_payload(&stdout));
        }

        let stderr = String::from_utf8_lossy(&stderr);
        let stderr: String = stderr.chars().take(MAX_STDERR).collect();
        ExecutionOutcome {
            outcome: CommandOutcome::Failed,
            payload: json!({
                "error": format!("{} exited with {}", self.bin, status),
                "exitCode": status.code(),
                "stderr": stderr.trim_end(),
            }),
        }
    }
}

/// JSON stdout is passed through; other text is wrapped; nothing means null.
fn stdout_payload(stdout: &[u8]) -> JsonValue {
    let text = String::from_utf8_lossy(stdout);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return JsonValue::Null;
    }
    serde_json::from_str(trimmed).unwrap_or_else(|_| json!({ "stdout": trimmed }))
}
