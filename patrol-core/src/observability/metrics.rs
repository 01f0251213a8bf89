//! Scan engine metrics definitions.
//!
//! All metrics follow Prometheus naming conventions:
//! - `_total` suffix for counters
//! - `_seconds` suffix for histograms measuring duration

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};

/// Register all scan metrics with descriptions.
///
/// This ensures metrics appear in `/metrics` with proper metadata.
pub fn register_scan_metrics() {
    // Session lifecycle
    describe_counter!("patrol_scans_started_total", "Total number of scan sessions started");
    describe_counter!(
        "patrol_scans_finished_total",
        "Total number of scan sessions finished (by status: completed, failed, cancelled)"
    );
    describe_histogram!(
        "patrol_scan_duration_seconds",
        "Wall-clock duration of a scan session (by status)"
    );
    describe_gauge!("patrol_active_scans", "Scan sessions currently held in memory");
    describe_histogram!("patrol_scan_risk_score", "Risk score of completed scan sessions");

    // Targets and tools
    describe_counter!(
        "patrol_targets_scanned_total",
        "Total number of image targets processed (by outcome)"
    );
    describe_counter!(
        "patrol_tool_invocations_total",
        "Total number of external tool invocations (by tool, outcome)"
    );

    // Database
    describe_counter!("patrol_db_errors_total", "Total database errors (by operation)");
}

pub fn record_scan_started() {
    counter!("patrol_scans_started_total").increment(1);
}

pub fn record_scan_finished(status: &str, duration_secs: f64) {
    counter!("patrol_scans_finished_total", "status" => status.to_string()).increment(1);
    histogram!("patrol_scan_duration_seconds", "status" => status.to_string())
        .record(duration_secs);
}

pub fn record_risk_score(score: f64) {
    histogram!("patrol_scan_risk_score").record(score);
}

/// `outcome` is `completed` or a failure kind such as `fetch_failed`.
pub fn record_target(outcome: &str) {
    counter!("patrol_targets_scanned_total", "outcome" => outcome.to_string()).increment(1);
}

pub fn record_tool_invocation(tool: &str, outcome: &str) {
    counter!(
        "patrol_tool_invocations_total",
        "tool" => tool.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

pub fn set_active_scans(count: usize) {
    gauge!("patrol_active_scans").set(count as f64);
}
