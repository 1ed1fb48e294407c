//! External tool collaborator.
//!
//! Epistemic foundation:
//! - K_i: A tool runs to completion and exposes exit code, stdout and stderr
//! - K_i: Success = exit 0 ∧ empty stderr ∧ expected output on disk
//! - B_i: The tool may be missing or crash → ToolInvocation, classified per item
//! - I^B: Tool-specific output is never interpreted

use crate::models::{Result, TiltflowError, WorkItem, WorkKey};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// A fully rendered tool call for one work item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub key: WorkKey,
    /// Program followed by its arguments
    pub argv: Vec<String>,
    /// Text piped to standard input
    pub stdin: Option<String>,
    /// File the call must produce
    pub output: PathBuf,
}

impl Invocation {
    /// Shell-like rendering for logs.
    pub fn display_command(&self) -> String {
        self.argv.join(" ")
    }
}

/// Captured result of one tool run.
#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    /// Exit code (None when killed by a signal)
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

/// Turns work items into tool calls.
pub trait CommandRenderer: Send + Sync {
    fn render(&self, item: &WorkItem) -> Result<Invocation>;
}

/// Runs the external tool for one work item.
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    /// Run the tool to completion.
    ///
    /// Errors other than `ToolInvocation` abort the stage.
    async fn invoke(&self, item: &WorkItem) -> Result<ToolOutput>;
}

#[async_trait]
impl<T: ToolInvoker + ?Sized> ToolInvoker for &T {
    async fn invoke(&self, item: &WorkItem) -> Result<ToolOutput> {
        (**self).invoke(item).await
    }
}

/// Tool invoker spawning a child process per item.
pub struct ProcessTool<R: CommandRenderer> {
    renderer: R,
}

impl<R: CommandRenderer> ProcessTool<R> {
    pub fn new(renderer: R) -> Self {
        Self { renderer }
    }

    pub fn renderer(&self) -> &R {
        &self.renderer
    }
}

#[async_trait]
impl<R: CommandRenderer> ToolInvoker for ProcessTool<R> {
    async fn invoke(&self, item: &WorkItem) -> Result<ToolOutput> {
        let invocation = self.renderer.render(item)?;
        run_process(&invocation).await
    }
}

/// Spawn the rendered command and wait for it.
pub async fn run_process(invocation: &Invocation) -> Result<ToolOutput> {
    let start = Instant::now();
    let (program, args) = invocation.argv.split_first().ok_or_else(|| {
        TiltflowError::tool(invocation.key, None, "empty command line")
    })?;

    debug!(key = %invocation.key, command = %invocation.display_command(), "Invoking tool");

    let mut child = Command::new(program)
        .args(args)
        .stdin(if invocation.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| TiltflowError::tool(invocation.key, None, format!("failed to spawn {program}: {e}")))?;

    if let (Some(input), Some(mut stdin)) = (&invocation.stdin, child.stdin.take()) {
        stdin.write_all(input.as_bytes()).await.map_err(|e| {
            TiltflowError::tool(invocation.key, None, format!("writing stdin: {e}"))
        })?;
        // Dropping stdin closes the pipe so the tool sees EOF.
        drop(stdin);
    }

    let output = child.wait_with_output().await.map_err(|e| {
        TiltflowError::tool(invocation.key, None, format!("waiting for {program}: {e}"))
    })?;

    Ok(ToolOutput {
        exit_code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        duration: start.elapsed(),
    })
}

/// Verdict on one tool run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Succeeded,
    Failed {
        exit_code: Option<i32>,
        message: String,
    },
}

/// Classify a finished tool run.
pub fn classify<F>(output: &ToolOutput, expected: &Path, exists: F) -> Outcome
where
    F: Fn(&Path) -> bool,
{
    let stderr = output.stderr.trim();
    if output.exit_code != Some(0) {
        let message = if stderr.is_empty() {
            "tool exited unsuccessfully".to_string()
        } else {
            last_line(stderr)
        };
        return Outcome::Failed {
            exit_code: output.exit_code,
            message,
        };
    }
    if !stderr.is_empty() {
        return Outcome::Failed {
            exit_code: output.exit_code,
            message: format!("diagnostics on stderr: {}", last_line(stderr)),
        };
    }
    if !exists(expected) {
        return Outcome::Failed {
            exit_code: output.exit_code,
            message: format!("expected output {} was not written", expected.display()),
        };
    }
    Outcome::Succeeded
}

fn last_line(text: &str) -> String {
    text.lines().last().unwrap_or_default().trim().to_string()
}
