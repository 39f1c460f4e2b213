//! Child-process plumbing shared by the shell and script handlers.
//!
//! - Runs in the invocation's working directory
//! - Captures stdout and stderr, truncating very large output
//! - Kills the child when cancelled or when the future is dropped (timeout)

use std::process::Stdio;

use serde_json::{Value, json};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::error::ActionError;

/// Maximum captured size per stream before truncation (64KB).
const MAX_OUTPUT_SIZE: usize = 64 * 1024;

/// Captured result of a finished process.
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the process was killed by a signal.
    pub exit_code: Option<i32>,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    pub fn to_json(&self) -> Value {
        json!({
            "stdout": self.stdout,
            "stderr": self.stderr,
            "exit_code": self.exit_code,
        })
    }

    /// Map a non-zero exit into a retryable failure.
    pub fn into_result(self, action: &str) -> Result<Value, ActionError> {
        if self.success() {
            return Ok(self.to_json());
        }
        let code = self
            .exit_code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string());
        let detail = if self.stderr.trim().is_empty() {
            self.stdout.trim()
        } else {
            self.stderr.trim()
        };
        Err(ActionError::transient(
            action,
            format!("exited with {code}: {}", truncate_for_error(detail)),
        ))
    }
}

/// Spawn `command` and wait for it, or kill it when `cancel` fires.
pub async fn run_process(
    action: &str,
    mut command: Command,
    cancel: &CancellationToken,
) -> Result<ProcessOutput, ActionError> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = command.spawn().map_err(|e| {
        ActionError::transient(action, format!("Failed to spawn process: {e}"))
    })?;

    // Dropping the wait future drops the child, and kill_on_drop terminates it.
    let output = tokio::select! {
        out = child.wait_with_output() => out.map_err(|e| {
            ActionError::transient(action, format!("Process execution failed: {e}"))
        })?,
        _ = cancel.cancelled() => return Err(ActionError::Cancelled),
    };

    Ok(ProcessOutput {
        stdout: truncate_output(&String::from_utf8_lossy(&output.stdout)),
        stderr: truncate_output(&String::from_utf8_lossy(&output.stderr)),
        exit_code: output.status.code(),
    })
}

/// Keep the head and tail of oversized output.
fn truncate_output(s: &str) -> String {
    if s.len() <= MAX_OUTPUT_SIZE {
        s.to_string()
    } else {
        let half = MAX_OUTPUT_SIZE / 2;
        let head_end = floor_char_boundary(s, half);
        let tail_start = floor_char_boundary(s, s.len() - half);
        format!(
            "{}\n\n... [truncated {} bytes] ...\n\n{}",
            &s[..head_end],
            s.len() - MAX_OUTPUT_SIZE,
            &s[tail_start..]
        )
    }
}

/// Find the largest byte index <= `i` that is a valid char boundary.
fn floor_char_boundary(s: &str, i: usize) -> usize {
    if i >= s.len() {
        return s.len();
    }
    let mut pos = i;
    while pos > 0 && !s.is_char_boundary(pos) {
        pos -= 1;
    }
    pos
}

fn truncate_for_error(s: &str) -> String {
    if s.chars().count() <= 200 {
        s.to_string()
    } else {
        format!("{}...", s.chars().take(200).collect::<String>())
    }
}
