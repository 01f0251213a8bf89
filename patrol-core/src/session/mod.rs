//! In-memory scan session state.
//!
//! Each running or recently finished session owns a [`ScanHandle`]: status,
//! progress, current step and an append-only log. The orchestrator is the only
//! writer; request-layer readers take cheap snapshots. Locks are held for the
//! duration of a single field update, never across a tool invocation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::scanner::SeverityHistogram;

mod cancel;
mod registry;

pub use cancel::CancelToken;
pub use registry::ScanRegistry;

/// Lifecycle status of a scan session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanStatus {
    Initializing,
    Running,
    Completed,
    Failed,
}

impl ScanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanStatus::Initializing => "initializing",
            ScanStatus::Running => "running",
            ScanStatus::Completed => "completed",
            ScanStatus::Failed => "failed",
        }
    }

    /// Completed and failed are final.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ScanStatus::Completed | ScanStatus::Failed)
    }

    /// Whether the state machine permits moving from `self` to `next`.
    pub fn can_transition_to(&self, next: ScanStatus) -> bool {
        match (self, next) {
            (ScanStatus::Initializing, ScanStatus::Running | ScanStatus::Failed) => true,
            (ScanStatus::Running, ScanStatus::Completed | ScanStatus::Failed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ScanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Level of a scan log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
    Success,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
            LogLevel::Success => "success",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single timestamped scan log line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Caller-supplied descriptive metadata for a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionOptions {
    /// Who started the scan.
    pub initiator: String,
    pub project_name: Option<String>,
    pub environment: Option<String>,
    pub compliance_policy: Option<String>,
    pub tags: Vec<String>,
    /// e.g. `FULL`.
    pub scan_type: String,
    /// Where the target list came from, e.g. `FILE_UPLOAD`.
    pub scan_source: String,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            initiator: "system".to_string(),
            project_name: None,
            environment: None,
            compliance_policy: None,
            tags: Vec::new(),
            scan_type: "FULL".to_string(),
            scan_source: "FILE_UPLOAD".to_string(),
        }
    }
}

impl SessionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn initiator(mut self, initiator: impl Into<String>) -> Self {
        self.initiator = initiator.into();
        self
    }

    pub fn project(mut self, project: impl Into<String>) -> Self {
        self.project_name = Some(project.into());
        self
    }

    pub fn environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = Some(environment.into());
        self
    }

    pub fn compliance_policy(mut self, policy: impl Into<String>) -> Self {
        self.compliance_policy = Some(policy.into());
        self
    }

    pub fn tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }
}

/// Terminal outcome recorded with the session metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SessionOutcome {
    Success,
    Failed,
}

impl SessionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionOutcome::Success => "SUCCESS",
            SessionOutcome::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Self {
        if s.eq_ignore_ascii_case("SUCCESS") {
            SessionOutcome::Success
        } else {
            SessionOutcome::Failed
        }
    }
}

/// Aggregate figures for one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMetrics {
    pub image_count: u32,
    pub total_packages: u64,
    pub total_vulnerabilities: u64,
    pub severity: SeverityHistogram,
    pub exploitable: u64,
    pub risk_score: f64,
    pub duration_secs: f64,
    pub outcome: SessionOutcome,
}

impl SessionMetrics {
    /// Metrics for a session that ended before producing any results.
    pub fn failed(duration_secs: f64) -> Self {
        Self {
            image_count: 0,
            total_packages: 0,
            total_vulnerabilities: 0,
            severity: SeverityHistogram::default(),
            exploitable: 0,
            risk_score: 0.0,
            duration_secs,
            outcome: SessionOutcome::Failed,
        }
    }
}

/// Point-in-time view of a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanState {
    pub id: String,
    pub name: String,
    pub status: ScanStatus,
    /// 0-100, never decreases.
    pub progress: u32,
    pub current_step: String,
    pub logs: Vec<LogEntry>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub targets: Vec<String>,
    pub current_target: Option<String>,
    pub total_targets: u32,
    pub completed_targets: u32,
    pub failed_targets: u32,
    pub options: SessionOptions,
    pub metrics: Option<SessionMetrics>,
}

/// Shared handle to one session's state plus its cancellation token.
#[derive(Clone)]
pub struct ScanHandle {
    id: Arc<str>,
    state: Arc<RwLock<ScanState>>,
    cancel: CancelToken,
}

impl ScanHandle {
    /// Create a session in `initializing` state with zero progress.
    pub fn new(id: &str, name: &str, targets: Vec<String>, options: SessionOptions) -> Self {
        let state = ScanState {
            id: id.to_string(),
            name: name.to_string(),
            status: ScanStatus::Initializing,
            progress: 0,
            current_step: "Preparing scan environment...".to_string(),
            logs: Vec::new(),
            started_at: Utc::now(),
            finished_at: None,
            total_targets: targets.len() as u32,
            targets,
            current_target: None,
            completed_targets: 0,
            failed_targets: 0,
            options,
            metrics: None,
        };
        Self { id: Arc::from(id), state: Arc::new(RwLock::new(state)), cancel: CancelToken::new() }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Append a log entry and mirror it to tracing.
    pub async fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.push_log(level, message.into(), None).await;
    }

    /// Append a log entry carrying extra detail (e.g. tool stderr).
    pub async fn log_detail(
        &self,
        level: LogLevel,
        message: impl Into<String>,
        detail: impl Into<String>,
    ) {
        self.push_log(level, message.into(), Some(detail.into())).await;
    }

    pub async fn info(&self, message: impl Into<String>) {
        self.log(LogLevel::Info, message).await;
    }

    pub async fn success(&self, message: impl Into<String>) {
        self.log(LogLevel::Success, message).await;
    }

    pub async fn warn(&self, message: impl Into<String>) {
        self.log(LogLevel::Warn, message).await;
    }

    pub async fn error(&self, message: impl Into<String>) {
        self.log(LogLevel::Error, message).await;
    }

    async fn push_log(&self, level: LogLevel, message: String, detail: Option<String>) {
        match level {
            LogLevel::Info | LogLevel::Success => {
                info!(scan_id = %self.id, level = %level, "{}", message)
            }
            LogLevel::Warn => warn!(scan_id = %self.id, "{}", message),
            LogLevel::Error => error!(scan_id = %self.id, "{}", message),
        }

        // Stamped under the lock so append order and timestamp order agree
        let mut state = self.state.write().await;
        state.logs.push(LogEntry { timestamp: Utc::now(), level, message, detail });
    }

    /// Move to `next` if the state machine allows it.
    ///
    /// Returns `false` (and changes nothing) for illegal transitions, which
    /// includes any attempt to leave a terminal state.
    pub async fn set_status(&self, next: ScanStatus) -> bool {
        let mut state = self.state.write().await;
        if state.status == next {
            return true;
        }
        if !state.status.can_transition_to(next) {
            return false;
        }
        state.status = next;
        if next.is_terminal() {
            state.finished_at = Some(Utc::now());
            state.current_target = None;
        }
        true
    }

    /// Raise progress to `percent` (clamped to 100). Lower values are ignored.
    pub async fn set_progress(&self, percent: u32) {
        let mut state = self.state.write().await;
        state.progress = state.progress.max(percent.min(100));
    }

    pub async fn set_step(&self, step: impl Into<String>) {
        self.state.write().await.current_step = step.into();
    }

    /// Update progress and step description together.
    pub async fn advance(&self, percent: u32, step: impl Into<String>) {
        let mut state = self.state.write().await;
        state.progress = state.progress.max(percent.min(100));
        state.current_step = step.into();
    }

    pub async fn set_current_target(&self, target: Option<String>) {
        self.state.write().await.current_target = target;
    }

    pub async fn record_target_completed(&self) {
        self.state.write().await.completed_targets += 1;
    }

    pub async fn record_target_failed(&self) {
        self.state.write().await.failed_targets += 1;
    }

    pub async fn set_metrics(&self, metrics: SessionMetrics) {
        self.state.write().await.metrics = Some(metrics);
    }

    pub async fn status(&self) -> ScanStatus {
        self.state.read().await.status
    }

    pub async fn snapshot(&self) -> ScanState {
        self.state.read().await.clone()
    }

    pub async fn logs(&self) -> Vec<LogEntry> {
        self.state.read().await.logs.clone()
    }

    pub(crate) async fn name(&self) -> String {
        self.state.read().await.name.clone()
    }

    pub(crate) async fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.state.read().await.finished_at
    }
}
