use std::path::Path;
use std::time::Duration;
use tracing::{debug, instrument};

use super::{matcher, sbom, ImageScanResult, TargetFailure};
use crate::config::ToolConfig;
use crate::process::{Invocation, ProcessRunner, RunOutcome};
use crate::session::ScanHandle;
use crate::validation::{sanitize_reference, validate_image_reference};

/// Recorded when a tool's version cannot be determined.
pub const UNKNOWN_VERSION: &str = "unknown";

const VERSION_QUERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Versions of the SBOM generator and matcher, as reported by the tools.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolVersions {
    pub sbom: String,
    pub matcher: String,
}

impl Default for ToolVersions {
    fn default() -> Self {
        Self { sbom: UNKNOWN_VERSION.to_string(), matcher: UNKNOWN_VERSION.to_string() }
    }
}

/// Runs the fetch → SBOM → match pipeline for one image.
#[derive(Clone)]
pub struct ImageScanner {
    runner: ProcessRunner,
    tools: ToolConfig,
}

impl ImageScanner {
    pub fn new(runner: ProcessRunner, tools: ToolConfig) -> Self {
        Self { runner, tools }
    }

    pub fn tools(&self) -> &ToolConfig {
        &self.tools
    }

    /// Scan one image, writing intermediate documents into `work_dir`.
    ///
    /// The reference is validated again here; nothing is spawned for a
    /// reference that fails validation. Every failure is returned as a
    /// [`TargetFailure`] after being logged to `scan`.
    #[instrument(skip(self, scan, work_dir), fields(scan_id = %scan.id()))]
    pub async fn scan_image(
        &self,
        scan: &ScanHandle,
        image_ref: &str,
        work_dir: &Path,
    ) -> Result<ImageScanResult, TargetFailure> {
        if !validate_image_reference(image_ref) {
            scan.error(format!("Invalid image reference: {}", image_ref)).await;
            return Err(TargetFailure::InvalidReference { image: image_ref.to_string() });
        }
        let image = image_ref.trim();
        if scan.cancel_token().is_cancelled() {
            return Err(TargetFailure::Cancelled { image: image.to_string() });
        }

        scan.info(format!("Scanning image: {}", image)).await;

        if self.tools.pull_images {
            let outcome = self.runner.run(scan, &self.fetch_invocation(image)).await;
            if !outcome.ok {
                return Err(self.failure(scan, image, outcome, |image, output| {
                    TargetFailure::FetchFailed { image, output }
                }));
            }
        }

        let stem = sanitize_reference(image);
        let sbom_path = work_dir.join(format!("{}_sbom.json", stem));
        let outcome = self.runner.run(scan, &self.sbom_invocation(image, &sbom_path)).await;
        if !outcome.ok {
            return Err(self.failure(scan, image, outcome, |image, output| {
                TargetFailure::SbomFailed { image, output }
            }));
        }

        match tokio::fs::metadata(&sbom_path).await {
            Ok(meta) if meta.len() > 0 => {}
            _ => {
                scan.error(format!("SBOM file not generated for {}", image)).await;
                return Err(TargetFailure::SbomMissing {
                    image: image.to_string(),
                    path: sbom_path,
                });
            }
        }

        let package_count = match read_sbom(&sbom_path).await {
            Ok(count) => {
                scan.success(format!("Found {} packages in {}", count, image)).await;
                count
            }
            Err(reason) => {
                scan.warn(format!("Could not parse SBOM for {}: {}", image, reason)).await;
                0
            }
        };

        let vulns_path = work_dir.join(format!("{}_vulns.json", stem));
        let invocation = self.matcher_invocation(&sbom_path, &vulns_path);
        let outcome = self.runner.run(scan, &invocation).await;
        if !outcome.ok {
            return Err(self.failure(scan, image, outcome, |image, output| {
                TargetFailure::MatchFailed { image, output }
            }));
        }

        let findings = match read_findings(&vulns_path).await {
            Ok(findings) => findings,
            Err(reason) => {
                let message =
                    format!("Could not read vulnerability results for {}: {}", image, reason);
                scan.error(message).await;
                return Err(TargetFailure::MatchOutputUnreadable {
                    image: image.to_string(),
                    path: vulns_path,
                    reason,
                });
            }
        };

        let result = ImageScanResult::new(image, package_count, findings);
        let count = result.vulnerability_count;
        scan.info(format!("Found {} vulnerabilities in {}", count, image)).await;
        if result.vulnerability_count > 0 {
            let s = &result.severity;
            scan.warn(format!(
                "Severity breakdown for {}: Critical: {}, High: {}, \
                 Medium: {}, Low: {}, Unknown: {}",
                image, s.critical, s.high, s.medium, s.low, s.unknown
            ))
            .await;
        }

        Ok(result)
    }

    /// Ask both tools for their versions. Never fails.
    pub async fn detect_versions(&self) -> ToolVersions {
        ToolVersions {
            sbom: self.detect_version(&self.tools.sbom_program).await,
            matcher: self.detect_version(&self.tools.matcher_program).await,
        }
    }

    async fn detect_version(&self, program: &str) -> String {
        let invocation = Invocation::new(program, format!("{} version", program))
            .arg("version")
            .timeout(VERSION_QUERY_TIMEOUT);
        let version =
            self.runner.query(&invocation).await.and_then(|out| parse_version_output(&out));
        debug!(program = %program, version = ?version, "Detected tool version");
        version.unwrap_or_else(|| UNKNOWN_VERSION.to_string())
    }

    fn failure(
        &self,
        scan: &ScanHandle,
        image: &str,
        outcome: RunOutcome,
        make: impl FnOnce(String, String) -> TargetFailure,
    ) -> TargetFailure {
        if scan.cancel_token().is_cancelled() {
            TargetFailure::Cancelled { image: image.to_string() }
        } else {
            make(image.to_string(), outcome.output.trim().to_string())
        }
    }

    // References may start with `-`, so they always follow `--`
    fn fetch_invocation(&self, image: &str) -> Invocation {
        Invocation::new(&self.tools.fetch_program, format!("Pulling image {}", image))
            .args(self.tools.fetch_args.iter().cloned())
            .args(["--", image])
            .timeout(self.tools.fetch_timeout())
    }

    fn sbom_invocation(&self, image: &str, sbom_path: &Path) -> Invocation {
        Invocation::new(&self.tools.sbom_program, format!("Generating SBOM for {}", image))
            .args(["scan", "-o", "json", "--file"])
            .arg(path_arg(sbom_path))
            .args(["--", image])
            .timeout(self.tools.sbom_timeout())
    }

    fn matcher_invocation(&self, sbom_path: &Path, output_path: &Path) -> Invocation {
        Invocation::new(&self.tools.matcher_program, "Scanning SBOM for vulnerabilities")
            .arg(format!("sbom:{}", path_arg(sbom_path)))
            .args(["-o", "json", "--file"])
            .arg(path_arg(output_path))
            .timeout(self.tools.matcher_timeout())
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

async fn read_sbom(path: &Path) -> Result<u64, String> {
    let bytes = tokio::fs::read(path).await.map_err(|e| e.to_string())?;
    sbom::count_packages(&bytes).map_err(|e| e.to_string())
}

async fn read_findings(path: &Path) -> Result<Vec<super::Finding>, String> {
    let bytes = tokio::fs::read(path).await.map_err(|e| e.to_string())?;
    matcher::parse_findings(&bytes).map_err(|e| e.to_string())
}

/// Pick the version out of `<tool> version` output.
///
/// Understands both the multi-line `Version:   1.4.1` layout and a bare
/// single-line `syft 1.4.1`.
fn parse_version_output(output: &str) -> Option<String> {
    for line in output.lines() {
        if let Some(rest) = line.trim().strip_prefix("Version:") {
            let version = rest.trim();
            if !version.is_empty() {
                return Some(version.to_string());
            }
        }
    }
    output
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .and_then(|l| l.split_whitespace().last())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::process::{CommandExecutor, ProcessOutput};
    use crate::scanner::Severity;
    use crate::session::{LogLevel, SessionOptions};
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};

    const SBOM: &str =
        r#"{"artifacts": [{"name": "openssl"}, {"name": "zlib"}, {"name": "bash"}]}"#;
    const MATCHES: &str = r#"{"matches": [
        {"vulnerability": {"id": "CVE-2024-0001", "severity": "Critical",
                           "fix": {"versions": ["3.0.13"]}},
         "artifact": {"name": "openssl", "version": "3.0.2"}},
        {"vulnerability": {"id": "CVE-2024-0002", "severity": "medium"},
         "artifact": {"name": "zlib", "version": "1.2.13"}}
    ]}"#;

    /// Writes canned documents to wherever the tools were told to write.
    struct FixtureExecutor {
        sbom: Option<&'static str>,
        matches: Option<&'static str>,
        failing_program: Option<&'static str>,
        calls: Mutex<Vec<Invocation>>,
    }

    impl FixtureExecutor {
        fn new() -> Self {
            Self {
                sbom: Some(SBOM),
                matches: Some(MATCHES),
                failing_program: None,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn programs(&self) -> Vec<String> {
            self.calls.lock().unwrap().iter().map(|c| c.program.clone()).collect()
        }
    }

    #[async_trait]
    impl CommandExecutor for FixtureExecutor {
        async fn execute(&self, invocation: &Invocation) -> Result<ProcessOutput> {
            self.calls.lock().unwrap().push(invocation.clone());
            if self.failing_program == Some(invocation.program.as_str()) {
                return Ok(ProcessOutput {
                    exit_code: Some(1),
                    stderr: "boom".into(),
                    ..Default::default()
                });
            }
            let document = match invocation.program.as_str() {
                "syft" => self.sbom,
                "grype" => self.matches,
                _ => None,
            };
            if let (Some(doc), Some(path)) = (document, invocation.flag_value("--file")) {
                std::fs::write(path, doc).unwrap();
            }
            Ok(ProcessOutput { exit_code: Some(0), ..Default::default() })
        }
    }

    fn setup(executor: FixtureExecutor) -> (ImageScanner, Arc<FixtureExecutor>, ScanHandle) {
        let executor = Arc::new(executor);
        let scanner =
            ImageScanner::new(ProcessRunner::new(executor.clone()), ToolConfig::default());
        let scan = ScanHandle::new("scan-img", "img", vec![], SessionOptions::default());
        (scanner, executor, scan)
    }

    #[tokio::test]
    async fn test_scan_image_success() {
        let (scanner, executor, scan) = setup(FixtureExecutor::new());
        let dir = tempfile::tempdir().unwrap();

        let result = scanner.scan_image(&scan, "  nginx:latest ", dir.path()).await.unwrap();
        assert_eq!(result.image, "nginx:latest");
        assert_eq!(result.package_count, 3);
        assert_eq!(result.vulnerability_count, 2);
        assert_eq!(result.severity.critical, 1);
        assert_eq!(result.severity.medium, 1);
        assert_eq!(result.exploitable_count, 1);
        assert_eq!(result.findings[0].severity, Severity::Critical);
        assert_eq!(result.findings[0].fixed_in, vec!["3.0.13"]);

        assert_eq!(executor.programs(), vec!["docker", "syft", "grype"]);
        let calls = executor.calls.lock().unwrap().clone();
        assert_eq!(calls[0].args, vec!["pull", "--", "nginx:latest"]);
        assert_eq!(&calls[1].args[..4], ["scan", "-o", "json", "--file"]);
        assert_eq!(&calls[1].args[5..], ["--", "nginx:latest"]);
        assert!(calls[1].flag_value("--file").unwrap().ends_with("nginx-latest_sbom.json"));
        assert!(calls[2].args[0].starts_with("sbom:"));

        let logs = scan.logs().await;
        assert!(logs.iter().any(|l| l.message == "Found 3 packages in nginx:latest"));
        assert!(logs
            .iter()
            .any(|l| l.level == LogLevel::Warn && l.message.starts_with("Severity breakdown")));
    }

    #[tokio::test]
    async fn test_invalid_reference_spawns_nothing() {
        let (scanner, executor, scan) = setup(FixtureExecutor::new());
        let dir = tempfile::tempdir().unwrap();

        let err = scanner.scan_image(&scan, "nginx; rm -rf /", dir.path()).await.unwrap_err();
        assert!(matches!(err, TargetFailure::InvalidReference { .. }));
        assert!(executor.programs().is_empty());
        assert_eq!(scan.logs().await[0].level, LogLevel::Error);
    }

    #[tokio::test]
    async fn test_fetch_failure_stops_pipeline() {
        let mut fixture = FixtureExecutor::new();
        fixture.failing_program = Some("docker");
        let (scanner, executor, scan) = setup(fixture);
        let dir = tempfile::tempdir().unwrap();

        let err = scanner.scan_image(&scan, "nginx:latest", dir.path()).await.unwrap_err();
        match err {
            TargetFailure::FetchFailed { output, .. } => assert_eq!(output, "boom"),
            other => panic!("unexpected failure: {:?}", other),
        }
        assert_eq!(executor.programs(), vec!["docker"]);
    }

    #[tokio::test]
    async fn test_unparsable_sbom_degrades_package_count() {
        let mut fixture = FixtureExecutor::new();
        fixture.sbom = Some("this is not json");
        let (scanner, _executor, scan) = setup(fixture);
        let dir = tempfile::tempdir().unwrap();

        let result = scanner.scan_image(&scan, "alpine:3.19", dir.path()).await.unwrap();
        assert_eq!(result.package_count, 0);
        assert_eq!(result.vulnerability_count, 2);
        assert!(scan
            .logs()
            .await
            .iter()
            .any(|l| l.level == LogLevel::Warn && l.message.starts_with("Could not parse SBOM")));
    }

    #[tokio::test]
    async fn test_missing_sbom_fails_target() {
        let mut fixture = FixtureExecutor::new();
        fixture.sbom = Some("");
        let (scanner, executor, scan) = setup(fixture);
        let dir = tempfile::tempdir().unwrap();

        let err = scanner.scan_image(&scan, "alpine", dir.path()).await.unwrap_err();
        assert!(matches!(err, TargetFailure::SbomMissing { .. }));
        assert_eq!(executor.programs(), vec!["docker", "syft"]);
    }

    #[tokio::test]
    async fn test_unreadable_matcher_output_fails_target() {
        let mut fixture = FixtureExecutor::new();
        fixture.matches = None;
        let (scanner, _executor, scan) = setup(fixture);
        let dir = tempfile::tempdir().unwrap();

        let err = scanner.scan_image(&scan, "alpine", dir.path()).await.unwrap_err();
        assert!(matches!(err, TargetFailure::MatchOutputUnreadable { .. }));
    }

    #[tokio::test]
    async fn test_pull_disabled_skips_fetch() {
        let executor = Arc::new(FixtureExecutor::new());
        let tools = ToolConfig { pull_images: false, ..ToolConfig::default() };
        let scanner = ImageScanner::new(ProcessRunner::new(executor.clone()), tools);
        let scan = ScanHandle::new("scan-np", "np", vec![], SessionOptions::default());
        let dir = tempfile::tempdir().unwrap();

        let image = "registry.local:5000/team/app@sha256:abc";
        scanner.scan_image(&scan, image, dir.path()).await.unwrap();
        assert_eq!(executor.programs(), vec!["syft", "grype"]);
    }

    #[tokio::test]
    async fn test_dash_prefixed_reference_is_never_a_flag() {
        let (scanner, executor, scan) = setup(FixtureExecutor::new());
        let dir = tempfile::tempdir().unwrap();

        for image in ["--help", "-q", "--platform"] {
            assert!(validate_image_reference(image));
            scanner.scan_image(&scan, image, dir.path()).await.unwrap();
        }

        let calls = executor.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 9);
        for call in calls.iter().filter(|c| c.program != "grype") {
            // The reference only ever appears after the end-of-options marker
            let marker = call.args.iter().position(|a| a == "--").unwrap();
            assert_eq!(marker, call.args.len() - 2, "{:?}", call.args);
            let flags = &call.args[..marker];
            assert!(flags.iter().all(|a| !["--help", "-q", "--platform"].contains(&a.as_str())));
        }
        for call in calls.iter().filter(|c| c.program == "grype") {
            assert!(call.args[0].starts_with("sbom:"), "{:?}", call.args);
        }
    }

    #[test]
    fn test_parse_version_output() {
        let multi = "Application:   syft\nVersion:       1.4.1\nBuildDate:     2024-05-01\n";
        assert_eq!(parse_version_output(multi).as_deref(), Some("1.4.1"));
        assert_eq!(parse_version_output("grype 0.77.0\n").as_deref(), Some("0.77.0"));
        assert_eq!(parse_version_output("   \n"), None);
    }
}
