//! Session risk scoring.
//!
//! Severity counts are weighted (critical 25, high 10, medium 3, low 1),
//! summed, and compressed onto 0-100 as `20 * log10(raw + 1)`.

use crate::scanner::{ImageScanResult, SeverityHistogram};

pub const CRITICAL_WEIGHT: u64 = 25;
pub const HIGH_WEIGHT: u64 = 10;
pub const MEDIUM_WEIGHT: u64 = 3;
pub const LOW_WEIGHT: u64 = 1;

pub const MAX_SCORE: f64 = 100.0;

/// Risk score over a set of image results.
pub fn score(results: &[ImageScanResult]) -> f64 {
    let mut total = SeverityHistogram::default();
    for result in results {
        total.merge(&result.severity);
    }
    score_histogram(&total)
}

/// Risk score for aggregated severity counts. Unknown-severity findings do not contribute.
pub fn score_histogram(histogram: &SeverityHistogram) -> f64 {
    let raw = CRITICAL_WEIGHT * histogram.critical
        + HIGH_WEIGHT * histogram.high
        + MEDIUM_WEIGHT * histogram.medium
        + LOW_WEIGHT * histogram.low;
    if raw == 0 {
        return 0.0;
    }

    let scaled = (20.0 * ((raw + 1) as f64).log10()).min(MAX_SCORE);
    (scaled * 10.0).round() / 10.0
}
