//! Scan session orchestration.
//!
//! [`ScanOrchestrator`] owns the session registry and drives each session
//! through `initializing → running → completed | failed`:
//!
//! 1. reject names already used by a persisted or in-memory session
//! 2. register the session
//! 3. validate every target, logging each invalid one
//! 4. mark the session running
//! 5. scan valid targets through a bounded pool, collecting results by index
//! 6. aggregate metrics, score risk, persist
//! 7. mark the session completed
//!
//! Per-target failures are logged and skipped. Anything unexpected after
//! registration ends the session `failed`, with whatever was gathered so far
//! persisted on a best-effort basis.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{info, info_span, instrument, warn, Instrument};
use uuid::Uuid;

use crate::config::ScannerConfig;
use crate::error::{PatrolError, Result};
use crate::events::{Event, EventBus, EventSubscriber, EventType};
use crate::observability::metrics as scan_metrics;
use crate::process::{find_program, tool_name, ProcessRunner};
use crate::risk;
use crate::scanner::{ImageScanResult, ImageScanner, SeverityHistogram, TargetFailure, ToolVersions};
use crate::session::{
    LogEntry, ScanHandle, ScanRegistry, ScanState, ScanStatus, SessionMetrics, SessionOptions,
    SessionOutcome,
};
use crate::store::{ResultStore, SessionRecord};
use crate::validation::validate_image_reference;

/// A request to scan a list of images.
#[derive(Debug, Clone)]
pub struct ScanRequest {
    /// Caller-chosen id; a UUID is generated when absent.
    pub id: Option<String>,
    /// Display name, unique across all sessions ever persisted.
    pub name: String,
    /// Untrusted image references, scanned in order.
    pub targets: Vec<String>,
    pub options: SessionOptions,
}

impl ScanRequest {
    pub fn new(name: impl Into<String>, targets: Vec<String>) -> Self {
        Self { id: None, name: name.into(), targets, options: SessionOptions::default() }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_options(mut self, options: SessionOptions) -> Self {
        self.options = options;
        self
    }
}

/// How a session ended without completing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Abort {
    Failed,
    Cancelled,
}

/// Drives scan sessions. Cloning shares the registry, store and event bus.
#[derive(Clone)]
pub struct ScanOrchestrator {
    config: Arc<ScannerConfig>,
    store: ResultStore,
    scanner: ImageScanner,
    registry: ScanRegistry,
    events: EventBus,
    tool_versions: ToolVersions,
    scan_engine: String,
}

impl ScanOrchestrator {
    /// Build an orchestrator from its collaborators. Detects tool versions once.
    pub async fn new(
        config: ScannerConfig,
        store: ResultStore,
        runner: ProcessRunner,
        events: EventBus,
    ) -> Result<Self> {
        config.validate()?;

        let scanner = ImageScanner::new(runner, config.tools.clone());
        let tool_versions = scanner.detect_versions().await;
        info!(
            sbom = %tool_versions.sbom,
            matcher = %tool_versions.matcher,
            "Scan tool versions"
        );

        let scan_engine = format!(
            "{} + {}",
            tool_name(&config.tools.sbom_program),
            tool_name(&config.tools.matcher_program)
        );

        Ok(Self {
            registry: ScanRegistry::new(config.session_retention()),
            config: Arc::new(config),
            store,
            scanner,
            events,
            tool_versions,
            scan_engine,
        })
    }

    /// Orchestrator with a file-backed store and real process execution.
    pub async fn from_config(config: ScannerConfig) -> Result<Self> {
        let store = ResultStore::new(&config.database_path).await?;
        Self::new(config, store, ProcessRunner::system(), EventBus::new()).await
    }

    pub fn config(&self) -> &ScannerConfig {
        &self.config
    }

    pub fn store(&self) -> &ResultStore {
        &self.store
    }

    pub fn tool_versions(&self) -> &ToolVersions {
        &self.tool_versions
    }

    /// Start a session in the background and return its id immediately.
    ///
    /// Duplicate names and ids are rejected here, before anything is spawned.
    pub async fn start_scan(&self, request: ScanRequest) -> Result<String> {
        let (scan, started) = self.prepare(request).await?;
        let scan_id = scan.id().to_string();

        let this = self.clone();
        let span = info_span!("scan_session", scan_id = %scan_id);
        tokio::spawn(async move { this.execute(scan, started).await }.instrument(span));

        Ok(scan_id)
    }

    /// Run a session to completion on the current task and return its final state.
    pub async fn run_scan(&self, request: ScanRequest) -> Result<ScanState> {
        let (scan, started) = self.prepare(request).await?;
        self.execute(scan.clone(), started).await;
        Ok(scan.snapshot().await)
    }

    /// Current state of a session held in memory.
    pub async fn get_progress(&self, scan_id: &str) -> Result<ScanState> {
        Ok(self.handle(scan_id).await?.snapshot().await)
    }

    pub async fn get_logs(&self, scan_id: &str) -> Result<Vec<LogEntry>> {
        Ok(self.handle(scan_id).await?.logs().await)
    }

    /// Snapshots of every session held in memory, oldest first.
    pub async fn list_active_scans(&self) -> Vec<ScanState> {
        self.evict_expired().await;

        let mut scans = Vec::new();
        for id in self.registry.ids().await {
            if let Some(handle) = self.registry.get(&id).await {
                scans.push(handle.snapshot().await);
            }
        }
        scans.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.id.cmp(&b.id)));
        scans
    }

    /// Request cancellation of a session.
    ///
    /// Returns `false` if the session had already finished.
    pub async fn cancel_scan(&self, scan_id: &str) -> Result<bool> {
        let scan = self.handle(scan_id).await?;
        if scan.status().await.is_terminal() {
            return Ok(false);
        }
        scan.warn("Cancellation requested").await;
        scan.cancel_token().cancel();
        Ok(true)
    }

    /// Configured tools that cannot be found on `PATH`.
    pub fn check_tools(&self) -> Vec<String> {
        let tools = &self.config.tools;
        let mut programs = Vec::new();
        if tools.pull_images {
            programs.push(&tools.fetch_program);
        }
        programs.push(&tools.sbom_program);
        programs.push(&tools.matcher_program);

        programs.into_iter().filter(|p| find_program(p).is_none()).cloned().collect()
    }

    /// Fail if any configured tool is missing.
    pub fn require_tools(&self) -> Result<()> {
        let missing = self.check_tools();
        if missing.is_empty() {
            return Ok(());
        }
        Err(PatrolError::ToolUnavailable {
            tool: missing.join(", "),
            hint: "Install the missing tools or set absolute paths in the tools configuration"
                .to_string(),
        })
    }

    /// Drop finished sessions past the retention period.
    pub async fn evict_expired(&self) -> usize {
        let evicted = self.registry.evict_expired().await;
        scan_metrics::set_active_scans(self.registry.len().await);
        evicted
    }

    /// Subscribe to scan events. See [`EventBus::subscribe`] for filter syntax.
    pub fn subscribe(&self, filters: Vec<String>) -> EventSubscriber {
        self.events.subscribe(filters)
    }

    async fn handle(&self, scan_id: &str) -> Result<ScanHandle> {
        self.registry
            .get(scan_id)
            .await
            .ok_or_else(|| PatrolError::ScanNotFound { scan_id: scan_id.to_string() })
    }

    /// Steps 1 and 2: uniqueness checks and registration.
    #[instrument(skip(self, request), fields(name = %request.name))]
    async fn prepare(&self, request: ScanRequest) -> Result<(ScanHandle, Instant)> {
        if self.store.session_name_exists(&request.name).await? {
            return Err(PatrolError::DuplicateScanName { name: request.name });
        }

        let scan_id = request.id.unwrap_or_else(|| Uuid::new_v4().to_string());
        if self.store.get_session(&scan_id).await?.is_some() {
            return Err(PatrolError::DuplicateScanId { scan_id });
        }

        self.registry.evict_expired().await;

        let scan = ScanHandle::new(&scan_id, &request.name, request.targets, request.options);
        self.registry.register(scan.clone(), &request.name).await?;
        let started = Instant::now();

        scan_metrics::record_scan_started();
        scan_metrics::set_active_scans(self.registry.len().await);
        info!(scan_id = %scan_id, "Registered scan session");

        Ok((scan, started))
    }

    /// Steps 3 to 7. Never returns an error: every outcome ends in a terminal status.
    async fn execute(&self, scan: ScanHandle, started: Instant) {
        if let Err(e) = self.drive(&scan, started).await {
            scan.error(format!("Scan failed: {}", e)).await;
            self.abort(&scan, started, &e.to_string(), Vec::new(), Abort::Failed).await;
        }
    }

    async fn drive(&self, scan: &ScanHandle, started: Instant) -> Result<()> {
        let state = scan.snapshot().await;
        self.events.publish(
            Event::new(EventType::Started, scan.id(), format!("Scan '{}' started", state.name))
                .with_metadata("targets", state.targets.len()),
        );
        scan.info(format!(
            "Starting scan session \"{}\" with {} image references",
            state.name,
            state.targets.len()
        ))
        .await;
        scan.info(format!(
            "Tool versions: {} {}, {} {}",
            tool_name(&self.config.tools.sbom_program),
            self.tool_versions.sbom,
            tool_name(&self.config.tools.matcher_program),
            self.tool_versions.matcher
        ))
        .await;

        // Step 3
        scan.set_step("Validating image references...").await;
        let mut valid = Vec::new();
        for target in &state.targets {
            if validate_image_reference(target) {
                let target = target.trim().to_string();
                scan.info(format!("Valid image reference: {}", target)).await;
                valid.push(target);
            } else {
                scan.error(format!("Invalid image reference: {}", target)).await;
                scan_metrics::record_target("invalid_reference");
            }
        }
        scan.info(format!(
            "Validated {} out of {} image references",
            valid.len(),
            state.targets.len()
        ))
        .await;

        if valid.is_empty() {
            scan.error("No valid image references to scan").await;
            self.abort(scan, started, "No valid image references", Vec::new(), Abort::Failed).await;
            return Ok(());
        }

        // Step 4
        scan.set_status(ScanStatus::Running).await;
        scan.advance(10, "Preparing scan environment...").await;

        let work_root = PathBuf::from(&self.config.work_dir);
        tokio::fs::create_dir_all(&work_root)
            .await
            .map_err(|e| PatrolError::IoError { path: work_root.clone(), source: e })?;
        let work_dir = tempfile::Builder::new()
            .prefix("patrol-scan-")
            .tempdir_in(&work_root)
            .map_err(|e| PatrolError::IoError { path: work_root.clone(), source: e })?;

        // Step 5
        let results = self.scan_targets(scan, &valid, work_dir.path()).await;

        if let Err(e) = work_dir.close() {
            warn!(scan_id = %scan.id(), "Failed to remove scan work directory: {}", e);
        }

        if scan.cancel_token().is_cancelled() {
            scan.warn("Scan cancelled").await;
            self.abort(scan, started, "cancelled", results, Abort::Cancelled).await;
            return Ok(());
        }

        // Step 6
        scan.set_current_target(None).await;
        scan.advance(90, "Calculating metrics and saving results...").await;
        let metrics = aggregate(&results, started.elapsed().as_secs_f64(), SessionOutcome::Success);
        scan.set_metrics(metrics.clone()).await;
        self.persist(scan, &metrics, &results).await;

        scan.info(format!(
            "Scan summary: {} images, {} packages, {} vulnerabilities ({} exploitable)",
            metrics.image_count,
            metrics.total_packages,
            metrics.total_vulnerabilities,
            metrics.exploitable
        ))
        .await;
        scan.info(format!("Risk score: {}/100", metrics.risk_score)).await;
        scan.info(format!("Duration: {:.1}s", metrics.duration_secs)).await;

        // Step 7
        scan.set_status(ScanStatus::Completed).await;
        scan.advance(100, "Scan completed successfully").await;
        scan.success(format!("Scan completed successfully: \"{}\"", state.name)).await;

        scan_metrics::record_scan_finished(ScanStatus::Completed.as_str(), metrics.duration_secs);
        scan_metrics::record_risk_score(metrics.risk_score);
        self.events.publish(
            Event::new(EventType::Completed, scan.id(), format!("Scan '{}' completed", state.name))
                .with_metadata("images", metrics.image_count)
                .with_metadata("vulnerabilities", metrics.total_vulnerabilities)
                .with_metadata("risk_score", metrics.risk_score),
        );
        Ok(())
    }

    /// Step 5: scan targets through a pool of `max_concurrent_targets` workers.
    ///
    /// Results come back in target order regardless of completion order.
    async fn scan_targets(
        &self,
        scan: &ScanHandle,
        targets: &[String],
        work_dir: &Path,
    ) -> Vec<ImageScanResult> {
        let total = targets.len();
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_targets.max(1)));
        let collected = Arc::new(Mutex::new(Vec::with_capacity(total)));
        let mut tasks = JoinSet::new();

        for (index, target) in targets.iter().enumerate() {
            let permit = tokio::select! {
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = scan.cancel_token().cancelled() => break,
            };
            if scan.cancel_token().is_cancelled() {
                break;
            }

            let this = self.clone();
            let scan = scan.clone();
            let target = target.clone();
            let target_dir = work_dir.join(format!("target-{}", index));
            let collected = collected.clone();

            tasks.spawn(async move {
                let _permit = permit;
                let result = this.scan_target(&scan, index, total, &target, &target_dir).await;
                if let Some(result) = result {
                    collected.lock().await.push((index, result));
                }
            });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                scan.error(format!("Target worker aborted: {}", e)).await;
            }
        }

        let mut collected = std::mem::take(&mut *collected.lock().await);
        collected.sort_by_key(|(index, _)| *index);
        collected.into_iter().map(|(_, result)| result).collect()
    }

    async fn scan_target(
        &self,
        scan: &ScanHandle,
        index: usize,
        total: usize,
        target: &str,
        target_dir: &Path,
    ) -> Option<ImageScanResult> {
        scan.set_current_target(Some(target.to_string())).await;
        let percent = 20 + (60 * index / total) as u32;
        scan.advance(percent, format!("Scanning image {}/{}: {}", index + 1, total, target)).await;

        let outcome = match tokio::fs::create_dir_all(target_dir).await {
            Ok(()) => self.scanner.scan_image(scan, target, target_dir).await,
            Err(e) => Err(TargetFailure::SbomFailed {
                image: target.to_string(),
                output: format!("Failed to create work directory {:?}: {}", target_dir, e),
            }),
        };

        match outcome {
            Ok(result) => {
                scan.success(format!("Completed scan for {}", target)).await;
                scan.record_target_completed().await;
                scan_metrics::record_target("completed");
                self.events.publish(
                    Event::new(
                        EventType::TargetCompleted,
                        scan.id(),
                        format!("Completed scan for {}", target),
                    )
                    .with_metadata("image", target)
                    .with_metadata("vulnerabilities", result.vulnerability_count),
                );
                Some(result)
            }
            Err(TargetFailure::Cancelled { .. }) => {
                scan_metrics::record_target("cancelled");
                None
            }
            Err(failure) => {
                scan.error(format!("Failed to scan {}: {}", target, failure)).await;
                scan.record_target_failed().await;
                scan_metrics::record_target(failure.kind());
                self.events.publish(
                    Event::new(EventType::TargetFailed, scan.id(), failure.to_string())
                        .with_metadata("image", target)
                        .with_metadata("reason", failure.kind()),
                );
                None
            }
        }
    }

    /// End a session as failed, persisting what exists on a best-effort basis.
    async fn abort(
        &self,
        scan: &ScanHandle,
        started: Instant,
        reason: &str,
        results: Vec<ImageScanResult>,
        how: Abort,
    ) {
        let metrics = aggregate(&results, started.elapsed().as_secs_f64(), SessionOutcome::Failed);
        scan.set_metrics(metrics.clone()).await;
        self.persist(scan, &metrics, &results).await;

        scan.set_status(ScanStatus::Failed).await;
        scan.set_step(format!("Scan failed: {}", reason)).await;

        let (status, event_type) = match how {
            Abort::Failed => ("failed", EventType::Failed),
            Abort::Cancelled => ("cancelled", EventType::Cancelled),
        };
        scan_metrics::record_scan_finished(status, metrics.duration_secs);
        self.events.publish(
            Event::new(event_type, scan.id(), format!("Scan failed: {}", reason))
                .with_metadata("reason", reason),
        );
    }

    /// Persist a session. Failures are logged to the scan and never change its status.
    async fn persist(
        &self,
        scan: &ScanHandle,
        metrics: &SessionMetrics,
        results: &[ImageScanResult],
    ) {
        let state = scan.snapshot().await;
        let record = SessionRecord {
            id: state.id,
            name: state.name,
            started_at: state.started_at,
            targets: state.targets,
            options: state.options,
            metrics: metrics.clone(),
            scan_engine: self.scan_engine.clone(),
            tool_versions: self.tool_versions.clone(),
        };

        match self.store.persist(&record, results).await {
            Ok(_) => {
                scan.success(format!("Stored results for {} images in database", results.len()))
                    .await
            }
            Err(e) => scan.error(format!("Failed to store scan results: {}", e)).await,
        }
    }
}

fn aggregate(
    results: &[ImageScanResult],
    duration_secs: f64,
    outcome: SessionOutcome,
) -> SessionMetrics {
    let mut severity = SeverityHistogram::default();
    for result in results {
        severity.merge(&result.severity);
    }

    SessionMetrics {
        image_count: results.len() as u32,
        total_packages: results.iter().map(|r| r.package_count).sum(),
        total_vulnerabilities: results.iter().map(|r| r.vulnerability_count).sum(),
        exploitable: severity.exploitable(),
        risk_score: risk::score_histogram(&severity),
        severity,
        duration_secs,
        outcome,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{CommandExecutor, Invocation, ProcessOutput};
    use crate::scanner::{Finding, Severity};
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    #[test]
    fn test_aggregate_sums_results() {
        let finding = |severity| Finding {
            vulnerability_id: "CVE-1".into(),
            severity,
            package_name: "p".into(),
            installed_version: "1".into(),
            fixed_in: vec![],
        };
        let results = vec![
            ImageScanResult::new(
                "a",
                10,
                vec![finding(Severity::Critical), finding(Severity::Unknown)],
            ),
            ImageScanResult::new("b", 5, vec![finding(Severity::High)]),
        ];

        let metrics = aggregate(&results, 1.5, SessionOutcome::Success);
        assert_eq!(metrics.image_count, 2);
        assert_eq!(metrics.total_packages, 15);
        assert_eq!(metrics.total_vulnerabilities, 3);
        assert_eq!(metrics.exploitable, 2);
        assert_eq!(metrics.severity.unknown, 1);
        assert_eq!(metrics.risk_score, risk::score(&results));
        assert_eq!(metrics.outcome, SessionOutcome::Success);
    }

    #[test]
    fn test_aggregate_empty_is_zero_risk() {
        let metrics = aggregate(&[], 0.0, SessionOutcome::Failed);
        assert_eq!(metrics, SessionMetrics::failed(0.0));
    }

    /// Samples session progress each time an image fetch starts.
    #[derive(Default)]
    struct ProgressSampler {
        scan: StdMutex<Option<ScanHandle>>,
        samples: StdMutex<Vec<u32>>,
    }

    #[async_trait]
    impl CommandExecutor for ProgressSampler {
        async fn execute(&self, invocation: &Invocation) -> Result<ProcessOutput> {
            let ok = ProcessOutput { exit_code: Some(0), ..Default::default() };
            if invocation.args == ["version"] {
                return Ok(ok);
            }
            let document = match invocation.program.as_str() {
                "docker" => {
                    let scan = self.scan.lock().unwrap().clone();
                    if let Some(scan) = scan {
                        let progress = scan.snapshot().await.progress;
                        self.samples.lock().unwrap().push(progress);
                    }
                    return Ok(ok);
                }
                "syft" => r#"{"artifacts": []}"#,
                _ => r#"{"matches": []}"#,
            };
            std::fs::write(invocation.flag_value("--file").unwrap(), document).unwrap();
            Ok(ok)
        }
    }

    #[tokio::test]
    async fn test_progress_per_target() {
        let cases: [(&[&str], &[u32]); 2] = [
            (&["a", "b", "c"][..], &[20, 40, 60][..]),
            (&["a", "b", "c", "d", "e", "f", "g"][..], &[20, 28, 37, 45, 54, 62, 71][..]),
        ];

        for (n, (targets, expected)) in cases.into_iter().enumerate() {
            let dir = tempfile::tempdir().unwrap();
            let config = ScannerConfig {
                work_dir: dir.path().to_string_lossy().to_string(),
                ..ScannerConfig::default()
            };
            let sampler = Arc::new(ProgressSampler::default());
            let store = ResultStore::new_in_memory().await.unwrap();
            let runner = ProcessRunner::new(sampler.clone());
            let orchestrator =
                ScanOrchestrator::new(config, store, runner, EventBus::new()).await.unwrap();

            let targets = targets.iter().map(|t| t.to_string()).collect();
            let request = ScanRequest::new(format!("progress-{}", n), targets);
            let (scan, started) = orchestrator.prepare(request).await.unwrap();
            *sampler.scan.lock().unwrap() = Some(scan.clone());
            orchestrator.execute(scan.clone(), started).await;

            assert_eq!(sampler.samples.lock().unwrap().as_slice(), expected);
            let state = scan.snapshot().await;
            assert_eq!(state.status, ScanStatus::Completed);
            assert_eq!(state.progress, 100);
            assert_eq!(state.current_step, "Scan completed successfully");
        }
    }

    #[test]
    fn test_scan_request_builder() {
        let request = ScanRequest::new("weekly", vec!["nginx".into()])
            .with_id("scan-1")
            .with_options(SessionOptions::new().initiator("ci"));
        assert_eq!(request.id.as_deref(), Some("scan-1"));
        assert_eq!(request.options.initiator, "ci");
    }
}
