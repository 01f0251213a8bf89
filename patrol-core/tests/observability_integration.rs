//! Integration tests for observability infrastructure.
//!
//! These tests check that subscriber installation, metric helpers and
//! session-log mirroring work end to end. No Prometheus endpoint is started;
//! metrics are recorded into whatever recorder is installed (none by default).
//!
//! Run with output to see tracing logs:
//! ```bash
//! cargo test --test observability_integration -- --nocapture
//! ```

use patrol_core::observability::{self, metrics::*, ObservabilityConfig};
use patrol_core::session::{LogLevel, ScanHandle, SessionOptions};
use patrol_core::ScannerConfig;

/// Installing the global subscriber succeeds once and is refused afterwards.
#[tokio::test]
async fn test_init_is_single_shot() {
    let config =
        ObservabilityConfig { log_level: "patrol_core=debug".to_string(), metrics_port: None };

    observability::init(&config).expect("first init should succeed");
    assert!(observability::init(&config).is_err(), "second init must not replace the subscriber");

    tracing::info!(scan_id = "scan-obs", "Observability test event");
}

#[test]
fn test_config_conversion() {
    let scanner = ScannerConfig {
        log_level: "warn".to_string(),
        metrics_port: Some(9464),
        ..Default::default()
    };
    let config = ObservabilityConfig::from(&scanner);
    assert_eq!(config.log_level, "warn");
    assert_eq!(config.metrics_port, Some(9464));
}

/// Metric helpers record without a recorder and under concurrent load.
#[tokio::test]
async fn test_metric_helpers_concurrent() {
    register_scan_metrics();

    let mut handles = vec![];
    for i in 0..8 {
        handles.push(tokio::spawn(async move {
            let tool = if i % 2 == 0 { "syft" } else { "grype" };
            for _ in 0..50 {
                record_scan_started();
                record_tool_invocation(tool, "success");
                record_target("completed");
                record_target("fetch_failed");
                record_risk_score(42.0);
                record_scan_finished("completed", 1.25);
            }
        }));
    }
    for handle in handles {
        handle.await.expect("Task should complete successfully");
    }

    set_active_scans(0);
}

/// Session log entries keep their order and levels when written from several tasks.
#[tokio::test]
async fn test_session_log_from_concurrent_writers() {
    let scan = ScanHandle::new("scan-log", "log-test", vec![], SessionOptions::default());

    let mut handles = vec![];
    for worker in 0..4 {
        let scan = scan.clone();
        handles.push(tokio::spawn(async move {
            for n in 0..25 {
                scan.info(format!("worker {} line {}", worker, n)).await;
            }
            scan.warn(format!("worker {} done", worker)).await;
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let logs = scan.logs().await;
    assert_eq!(logs.len(), 4 * 26);
    assert_eq!(logs.iter().filter(|l| l.level == LogLevel::Warn).count(), 4);
    assert!(logs.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));

    // Each worker's own lines stay in the order it wrote them
    for worker in 0..4 {
        let prefix = format!("worker {} line ", worker);
        let lines: Vec<u32> = logs
            .iter()
            .filter_map(|l| l.message.strip_prefix(&prefix))
            .map(|n| n.parse().unwrap())
            .collect();
        assert_eq!(lines, (0..25).collect::<Vec<_>>());
    }
}

#[tokio::test]
async fn test_tracing_spans_across_await() {
    use tracing::Instrument;

    let span = tracing::info_span!("scan_session", scan_id = "scan-span");
    async {
        tracing::info!("Starting");
        tokio::task::yield_now().await;
        tracing::debug!(tool = "syft", "Tool invocation finished");
    }
    .instrument(span)
    .await;
}
