//! Per-image vulnerability scanning.
//!
//! An image is scanned in three tool steps: fetch the image, produce an SBOM,
//! match the SBOM against vulnerability data. This module holds the result
//! types; [`ImageScanner`] drives the steps and the `sbom`/`matcher` modules
//! parse the tools' JSON documents.
//!
//! # Example
//!
//! ```no_run
//! use patrol_core::config::ToolConfig;
//! use patrol_core::process::ProcessRunner;
//! use patrol_core::scanner::ImageScanner;
//! use patrol_core::session::{ScanHandle, SessionOptions};
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let scanner = ImageScanner::new(ProcessRunner::system(), ToolConfig::default());
//!     let scan = ScanHandle::new("demo", "demo", vec![], SessionOptions::default());
//!     let work_dir = tempfile::tempdir()?;
//!
//!     let result = scanner.scan_image(&scan, "nginx:latest", work_dir.path()).await?;
//!     println!("{} packages", result.package_count);
//!     println!("{} vulnerabilities", result.vulnerability_count);
//!     Ok(())
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

mod image;
pub mod matcher;
pub mod sbom;

pub use image::{ImageScanner, ToolVersions};

/// Vulnerability severity tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
    /// Anything the matcher reports outside the four tiers (e.g. "Negligible").
    #[default]
    Unknown,
}

impl Severity {
    /// Parse severity from string, case-insensitively.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_uppercase().as_str() {
            "CRITICAL" => Severity::Critical,
            "HIGH" => Severity::High,
            "MEDIUM" => Severity::Medium,
            "LOW" => Severity::Low,
            _ => Severity::Unknown,
        }
    }

    /// Convert to string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Critical => "CRITICAL",
            Severity::High => "HIGH",
            Severity::Medium => "MEDIUM",
            Severity::Low => "LOW",
            Severity::Unknown => "UNKNOWN",
        }
    }

    /// Critical and high findings count as exploitable.
    pub fn is_exploitable(&self) -> bool {
        matches!(self, Severity::Critical | Severity::High)
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Finding counts by severity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeverityHistogram {
    pub critical: u64,
    pub high: u64,
    pub medium: u64,
    pub low: u64,
    /// Not counted toward any of the four tiers.
    pub unknown: u64,
}

impl SeverityHistogram {
    pub fn from_findings(findings: &[Finding]) -> Self {
        let mut histogram = Self::default();
        for finding in findings {
            histogram.record(finding.severity);
        }
        histogram
    }

    pub fn record(&mut self, severity: Severity) {
        match severity {
            Severity::Critical => self.critical += 1,
            Severity::High => self.high += 1,
            Severity::Medium => self.medium += 1,
            Severity::Low => self.low += 1,
            Severity::Unknown => self.unknown += 1,
        }
    }

    /// Add another histogram's counts into this one.
    pub fn merge(&mut self, other: &SeverityHistogram) {
        self.critical += other.critical;
        self.high += other.high;
        self.medium += other.medium;
        self.low += other.low;
        self.unknown += other.unknown;
    }

    pub fn exploitable(&self) -> u64 {
        self.critical + self.high
    }

    pub fn total(&self) -> u64 {
        self.critical + self.high + self.medium + self.low + self.unknown
    }
}

/// A single (vulnerability, package) match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    /// CVE or advisory id (e.g. "CVE-2024-12345", "GHSA-...").
    pub vulnerability_id: String,
    pub severity: Severity,
    pub package_name: String,
    pub installed_version: String,
    /// Versions that fix the vulnerability; empty if none is known.
    pub fixed_in: Vec<String>,
}

/// Structured result of scanning one image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageScanResult {
    pub image: String,
    pub package_count: u64,
    pub vulnerability_count: u64,
    pub severity: SeverityHistogram,
    pub exploitable_count: u64,
    pub findings: Vec<Finding>,
}

impl ImageScanResult {
    /// Build a result, deriving counts from the findings.
    pub fn new(image: impl Into<String>, package_count: u64, findings: Vec<Finding>) -> Self {
        let severity = SeverityHistogram::from_findings(&findings);
        Self {
            image: image.into(),
            package_count,
            vulnerability_count: findings.len() as u64,
            exploitable_count: severity.exploitable(),
            severity,
            findings,
        }
    }
}

/// Why a single image could not be scanned.
///
/// Never fatal to a session: the orchestrator logs it and moves on.
#[derive(Error, Debug)]
pub enum TargetFailure {
    #[error("Invalid image reference: {image}")]
    InvalidReference { image: String },

    #[error("Scan cancelled before {image} finished")]
    Cancelled { image: String },

    #[error("Failed to fetch {image}: {output}")]
    FetchFailed { image: String, output: String },

    #[error("SBOM generation failed for {image}: {output}")]
    SbomFailed { image: String, output: String },

    #[error("SBOM file not generated for {image} at {path:?}")]
    SbomMissing { image: String, path: PathBuf },

    #[error("Vulnerability matching failed for {image}: {output}")]
    MatchFailed { image: String, output: String },

    #[error("Could not read vulnerability results for {image} at {path:?}: {reason}")]
    MatchOutputUnreadable { image: String, path: PathBuf, reason: String },
}

impl TargetFailure {
    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            TargetFailure::InvalidReference { .. } => "invalid_reference",
            TargetFailure::Cancelled { .. } => "cancelled",
            TargetFailure::FetchFailed { .. } => "fetch_failed",
            TargetFailure::SbomFailed { .. } => "sbom_failed",
            TargetFailure::SbomMissing { .. } => "sbom_missing",
            TargetFailure::MatchFailed { .. } => "match_failed",
            TargetFailure::MatchOutputUnreadable { .. } => "match_output_unreadable",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finding(id: &str, severity: Severity) -> Finding {
        Finding {
            vulnerability_id: id.to_string(),
            severity,
            package_name: "openssl".to_string(),
            installed_version: "1.1.1".to_string(),
            fixed_in: vec![],
        }
    }

    #[test]
    fn test_severity_parse() {
        assert_eq!(Severity::parse("CRITICAL"), Severity::Critical);
        assert_eq!(Severity::parse("high"), Severity::High);
        assert_eq!(Severity::parse("Medium"), Severity::Medium);
        assert_eq!(Severity::parse(" low "), Severity::Low);
        assert_eq!(Severity::parse("Negligible"), Severity::Unknown);
        assert_eq!(Severity::parse(""), Severity::Unknown);
    }

    #[test]
    fn test_histogram_excludes_unknown_from_tiers() {
        let findings = vec![
            finding("CVE-1", Severity::Critical),
            finding("CVE-2", Severity::Critical),
            finding("CVE-3", Severity::High),
            finding("CVE-4", Severity::Medium),
            finding("CVE-5", Severity::Low),
            finding("CVE-6", Severity::Unknown),
        ];

        let result = ImageScanResult::new("nginx:latest", 42, findings);
        assert_eq!(result.vulnerability_count, 6);
        assert_eq!(result.severity.critical, 2);
        assert_eq!(result.severity.high, 1);
        assert_eq!(result.severity.medium, 1);
        assert_eq!(result.severity.low, 1);
        assert_eq!(result.severity.unknown, 1);
        assert_eq!(result.exploitable_count, 3);
        assert_eq!(result.severity.total(), 6);
    }

    #[test]
    fn test_histogram_merge() {
        let mut a = SeverityHistogram { critical: 1, high: 2, medium: 0, low: 3, unknown: 0 };
        let b = SeverityHistogram { critical: 0, high: 1, medium: 4, low: 0, unknown: 2 };
        a.merge(&b);
        assert_eq!(a, SeverityHistogram { critical: 1, high: 3, medium: 4, low: 3, unknown: 2 });
        assert_eq!(a.exploitable(), 4);
    }
}
