//! Scan a handful of images with the locally installed syft and grype.
//!
//! ```bash
//! cargo run --example scan_images -- alpine:3.19 nginx:1.25
//! ```

use anyhow::{Context, Result};
use patrol_core::{
    init_observability, ObservabilityConfig, ScanOrchestrator, ScanRequest, ScannerConfig,
    SessionOptions,
};

#[tokio::main]
async fn main() -> Result<()> {
    let targets: Vec<String> = std::env::args().skip(1).collect();
    if targets.is_empty() {
        eprintln!("usage: scan_images <image> [<image>...]");
        std::process::exit(2);
    }

    let config = ScannerConfig::load().context("Failed to load configuration")?;
    init_observability(&ObservabilityConfig::from(&config))
        .context("Failed to initialize logging")?;

    let orchestrator = ScanOrchestrator::from_config(config)
        .await
        .context("Failed to open the scan results store")?;
    let missing = orchestrator.check_tools();
    if !missing.is_empty() {
        eprintln!("missing scanner tools: {}", missing.join(", "));
        std::process::exit(1);
    }

    let name = format!("demo-{}", chrono::Utc::now().format("%Y%m%d%H%M%S"));
    let request = ScanRequest::new(name, targets)
        .with_options(SessionOptions::new().initiator("scan_images example"));
    let state = orchestrator.run_scan(request).await.context("Scan could not be started")?;

    println!("=== Scan {} ({}) ===", state.name, state.status.as_str());
    for entry in &state.logs {
        println!("[{}] {}", entry.level.as_str(), entry.message);
    }
    if let Some(metrics) = &state.metrics {
        println!();
        println!("Images:          {}", metrics.image_count);
        println!("Packages:        {}", metrics.total_packages);
        println!("Vulnerabilities: {}", metrics.total_vulnerabilities);
        println!("Exploitable:     {}", metrics.exploitable);
        println!("Risk score:      {:.1}", metrics.risk_score);
    }

    Ok(())
}
