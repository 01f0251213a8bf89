//! External tool execution.
//!
//! Every subprocess the scan engine starts goes through [`ProcessRunner`]:
//! commands are spawned in argv form (never via a shell) with the current
//! environment, bounded by a timeout, interruptible through the session's
//! cancel token, and logged identically to the owning scan log.
//!
//! Spawning itself sits behind the [`CommandExecutor`] trait so tests can
//! substitute a mock that never touches the host.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::debug;

use crate::error::{PatrolError, Result};
use crate::observability::metrics as scan_metrics;
use crate::session::{LogLevel, ScanHandle};

/// Output placeholder when a failed command printed nothing.
pub const UNKNOWN_FAILURE: &str = "Unknown error";

/// Default timeout when an invocation does not set one.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// One external command to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    /// Human-readable description used in scan logs.
    pub description: String,
    pub timeout: Duration,
}

impl Invocation {
    pub fn new(program: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            description: description.into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Space-joined rendering for logs only. Never executed.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Short tool name for metrics labels.
    pub fn tool_name(&self) -> String {
        tool_name(&self.program)
    }

    /// Value following `flag` in the argument list, if any.
    pub fn flag_value(&self, flag: &str) -> Option<&str> {
        self.args
            .iter()
            .position(|a| a == flag)
            .and_then(|i| self.args.get(i + 1))
            .map(String::as_str)
    }
}

/// Captured result of a finished (or timed out) process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    /// Exit code; `None` if killed by a signal or timed out.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }

    /// stderr if non-empty, else stdout, else a generic marker.
    pub fn failure_text(&self) -> String {
        if !self.stderr.trim().is_empty() {
            self.stderr.clone()
        } else if !self.stdout.trim().is_empty() {
            self.stdout.clone()
        } else {
            UNKNOWN_FAILURE.to_string()
        }
    }
}

/// Process spawning backend.
///
/// Implementations must honour `invocation.timeout` and must not pass the
/// arguments through a shell.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Run the invocation to completion.
    ///
    /// Returns `Err` only when the process could not be started.
    async fn execute(&self, invocation: &Invocation) -> Result<ProcessOutput>;
}

/// Executor backed by `tokio::process`.
#[derive(Debug, Clone, Default)]
pub struct TokioExecutor;

#[async_trait]
impl CommandExecutor for TokioExecutor {
    async fn execute(&self, invocation: &Invocation) -> Result<ProcessOutput> {
        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Dropping the wait future (timeout or cancellation) kills the child
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|e| PatrolError::SpawnFailed {
            program: invocation.program.clone(),
            source: e,
        })?;

        match tokio::time::timeout(invocation.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => Ok(ProcessOutput {
                exit_code: output.status.code(),
                stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
                timed_out: false,
            }),
            Ok(Err(e)) => Err(PatrolError::Internal(format!(
                "Failed to wait for {}: {}",
                invocation.program, e
            ))),
            Err(_) => Ok(ProcessOutput { timed_out: true, ..Default::default() }),
        }
    }
}

/// Result of a logged tool run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub ok: bool,
    /// stdout on success; failure text otherwise.
    pub output: String,
}

impl RunOutcome {
    fn failed(output: impl Into<String>) -> Self {
        Self { ok: false, output: output.into() }
    }
}

/// Logged, cancellable front end over a [`CommandExecutor`].
#[derive(Clone)]
pub struct ProcessRunner {
    executor: Arc<dyn CommandExecutor>,
}

impl ProcessRunner {
    pub fn new(executor: Arc<dyn CommandExecutor>) -> Self {
        Self { executor }
    }

    /// Runner that spawns real processes.
    pub fn system() -> Self {
        Self::new(Arc::new(TokioExecutor))
    }

    /// Run `invocation` on behalf of `scan`, appending the invocation and its
    /// outcome to the scan log before returning.
    pub async fn run(&self, scan: &ScanHandle, invocation: &Invocation) -> RunOutcome {
        let token = scan.cancel_token();
        let tool = invocation.tool_name();

        if token.is_cancelled() {
            scan.warn(format!("Skipped (scan cancelled): {}", invocation.description)).await;
            scan_metrics::record_tool_invocation(&tool, "cancelled");
            return RunOutcome::failed("Scan cancelled");
        }

        scan.info(format!("Running: {}", invocation.description)).await;
        scan.info(format!("Command: {}", invocation.command_line())).await;

        let started = Instant::now();
        let result = tokio::select! {
            result = self.executor.execute(invocation) => Some(result),
            _ = token.cancelled() => None,
        };
        let elapsed = started.elapsed();

        let outcome = match result {
            None => {
                scan.warn(format!("Cancelled: {}", invocation.description)).await;
                scan_metrics::record_tool_invocation(&tool, "cancelled");
                RunOutcome::failed("Scan cancelled")
            }
            Some(Err(e)) => {
                scan.error(format!("Exception running {}: {}", invocation.description, e)).await;
                scan_metrics::record_tool_invocation(&tool, "spawn_error");
                RunOutcome::failed(e.to_string())
            }
            Some(Ok(output)) if output.success() => {
                scan.success(format!("Completed: {}", invocation.description)).await;
                scan_metrics::record_tool_invocation(&tool, "success");
                RunOutcome { ok: true, output: output.stdout }
            }
            Some(Ok(output)) if output.timed_out => {
                let message = format!("Command timed out after {}s", invocation.timeout.as_secs());
                scan.error(format!("Failed: {} ({})", invocation.description, message)).await;
                scan_metrics::record_tool_invocation(&tool, "timeout");
                RunOutcome::failed(message)
            }
            Some(Ok(output)) => {
                let code = output
                    .exit_code
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "terminated by signal".to_string());
                scan.error(format!("Failed: {}", invocation.description)).await;
                let detail = output.failure_text();
                scan.log_detail(LogLevel::Error, format!("Return code: {}", code), detail.clone())
                    .await;
                scan_metrics::record_tool_invocation(&tool, "failure");
                RunOutcome::failed(detail)
            }
        };

        debug!(
            scan_id = %scan.id(),
            tool = %tool,
            ok = outcome.ok,
            elapsed_ms = elapsed.as_millis() as u64,
            "Tool invocation finished"
        );
        outcome
    }

    /// Run a short informational command outside any scan (e.g. version queries).
    ///
    /// Returns trimmed stdout on success.
    pub async fn query(&self, invocation: &Invocation) -> Option<String> {
        match self.executor.execute(invocation).await {
            Ok(output) if output.success() => Some(output.stdout.trim().to_string()),
            Ok(output) => {
                let reason = output.failure_text();
                debug!(program = %invocation.program, "Version query failed: {}", reason.trim());
                None
            }
            Err(e) => {
                debug!(program = %invocation.program, "Version query could not start: {}", e);
                None
            }
        }
    }
}

/// File name of `program`, e.g. `syft` for `/usr/local/bin/syft`.
pub fn tool_name(program: &str) -> String {
    Path::new(program)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| program.to_string())
}

/// Locate `program` the way the OS would: absolute paths as-is, bare names on `PATH`.
pub fn find_program(program: &str) -> Option<PathBuf> {
    let candidate = Path::new(program);
    if candidate.components().count() > 1 {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }

    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path).map(|dir| dir.join(program)).find(|p| p.is_file())
}
