//! Bash tool - Execute shell commands

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout};

use crate::error::ErrorCategory;
use crate::tools::registry::{parse_params, Tool, ToolContext, ToolError, ToolOutput};

const MAX_OUTPUT_LINES: usize = 2000;
const MAX_OUTPUT_BYTES: usize = 50_000; // 50KB
const READER_JOIN_TIMEOUT_MS: u64 = 2_000;
const KILL_GRACE_MS: u64 = 800;
const DEFAULT_TIMEOUT_MS: u64 = 120_000;

static ANSI_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\x1b\[[0-9;?]*[a-zA-Z]|\x1b\][^\x07]*\x07").expect("valid regex")
});

pub struct BashTool;

#[derive(Deserialize)]
struct Params {
    command: String,
    /// Milliseconds
    #[serde(default)]
    timeout: Option<u64>,
}

/// Keeps the tail of the combined stdout/stderr stream.
struct BoundedOutputBuffer {
    lines: VecDeque<String>,
    total_bytes: usize,
    dropped_lines: usize,
}

impl BoundedOutputBuffer {
    fn new() -> Self {
        Self {
            lines: VecDeque::new(),
            total_bytes: 0,
            dropped_lines: 0,
        }
    }

    fn push_line(&mut self, line: &str) {
        let kept = tail_by_bytes(line, MAX_OUTPUT_BYTES);
        self.total_bytes = self.total_bytes.saturating_add(kept.len());
        self.lines.push_back(kept);

        while self.lines.len() > MAX_OUTPUT_LINES || self.total_bytes > MAX_OUTPUT_BYTES {
            let Some(removed) = self.lines.pop_front() else {
                break;
            };
            self.total_bytes = self.total_bytes.saturating_sub(removed.len());
            self.dropped_lines += 1;
        }
    }

    fn into_text(self) -> String {
        let mut out = self.lines.into_iter().collect::<Vec<_>>().join("\n");
        if self.dropped_lines > 0 {
            out = format!(
                "[... omitted {} earlier line(s) ...]\n{}",
                self.dropped_lines, out
            );
        }
        ANSI_RE.replace_all(&out, "").into_owned()
    }
}

/// Keep the tail of a string within `max_bytes`, preserving UTF-8 boundaries.
fn tail_by_bytes(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }

    let mut start = text.len().saturating_sub(max_bytes);
    while start < text.len() && !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}

fn build_shell_command(command: &str, ctx: &ToolContext) -> Command {
    let mut cmd = if cfg!(windows) {
        let mut c = Command::new("cmd");
        c.arg("/C").arg(command);
        c
    } else {
        let mut c = Command::new("sh");
        c.arg("-c").arg(command);
        c
    };

    cmd.env("NO_COLOR", "1")
        .current_dir(&ctx.working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    #[cfg(unix)]
    cmd.process_group(0);

    cmd
}

async fn collect_pipe_output<R>(pipe: Option<R>, buffer: Arc<Mutex<BoundedOutputBuffer>>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let Some(pipe) = pipe else {
        return;
    };

    let mut reader = BufReader::new(pipe).lines();
    while let Ok(Some(line)) = reader.next_line().await {
        buffer.lock().await.push_line(&line);
    }
}

async fn join_reader_with_timeout(mut handle: tokio::task::JoinHandle<()>) {
    if timeout(Duration::from_millis(READER_JOIN_TIMEOUT_MS), &mut handle)
        .await
        .is_err()
    {
        handle.abort();
        let _ = handle.await;
    }
}

/// Signal the whole process group, then force-kill whatever survives.
async fn terminate_process_tree(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        let pgid = format!("-{}", pid);
        let _ = std::process::Command::new("kill")
            .arg("-TERM")
            .arg(&pgid)
            .status();
        sleep(Duration::from_millis(200)).await;
        let _ = std::process::Command::new("kill")
            .arg("-KILL")
            .arg(&pgid)
            .status();
    }

    if timeout(Duration::from_millis(KILL_GRACE_MS), child.wait())
        .await
        .is_err()
    {
        let _ = child.kill().await;
        let _ = child.wait().await;
    }
}

enum Outcome {
    Exited(i32),
    TimedOut,
    Cancelled,
}

#[async_trait]
impl Tool for BashTool {
    fn name(&self) -> &str {
        "bash"
    }

    fn description(&self) -> &str {
        "Execute a shell command in the working directory. Returns combined stdout/stderr and the exit code. A non-zero exit code is reported as a failure."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The command to execute"
                },
                "timeout": {
                    "type": "number",
                    "description": "Optional timeout in milliseconds (default 120000)"
                }
            },
            "required": ["command"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> ToolOutput {
        let params: Params = parse_params(params)?;
        if params.command.trim().is_empty() {
            return Err(ToolError::invalid_parameters("Invalid parameters: empty command"));
        }

        let limit = Duration::from_millis(params.timeout.unwrap_or(DEFAULT_TIMEOUT_MS));
        let mut child = build_shell_command(&params.command, ctx)
            .spawn()
            .map_err(|e| ToolError::classified(format!("Failed to spawn command: {}", e)))?;

        let buffer = Arc::new(Mutex::new(BoundedOutputBuffer::new()));
        let stdout_handle = tokio::spawn(collect_pipe_output(
            child.stdout.take(),
            Arc::clone(&buffer),
        ));
        let stderr_handle = tokio::spawn(collect_pipe_output(
            child.stderr.take(),
            Arc::clone(&buffer),
        ));

        let outcome = tokio::select! {
            _ = ctx.cancel.cancelled() => Outcome::Cancelled,
            waited = timeout(limit, child.wait()) => match waited {
                Ok(Ok(status)) => Outcome::Exited(status.code().unwrap_or(-1)),
                Ok(Err(e)) => {
                    tracing::error!("Process wait error: {}", e);
                    Outcome::Exited(-1)
                }
                Err(_) => Outcome::TimedOut,
            },
        };

        if matches!(outcome, Outcome::TimedOut | Outcome::Cancelled) {
            terminate_process_tree(&mut child).await;
        }

        join_reader_with_timeout(stdout_handle).await;
        join_reader_with_timeout(stderr_handle).await;

        let output = {
            let mut guard = buffer.lock().await;
            std::mem::replace(&mut *guard, BoundedOutputBuffer::new()).into_text()
        };

        match outcome {
            Outcome::Exited(0) => Ok(json!({ "output": output, "exit_code": 0 })),
            Outcome::Exited(code) => Err(ToolError::new(
                ErrorCategory::Unknown,
                format!("Command exited with code {}: {}", code, tail_by_bytes(&output, 2_000)),
            )),
            Outcome::TimedOut => Err(ToolError::new(
                ErrorCategory::Timeout,
                format!("Command timed out after {} ms", limit.as_millis()),
            )),
            Outcome::Cancelled => Err(ToolError::new(
                ErrorCategory::Cancelled,
                "Command cancelled",
            )),
        }
    }
}
