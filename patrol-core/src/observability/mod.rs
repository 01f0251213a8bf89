//! Observability infrastructure: tracing and metrics.
//!
//! Library code only emits `tracing` events and `metrics` samples. Binaries
//! (and the demo) call [`init`] once to install a subscriber and, if a port is
//! configured, a Prometheus scrape endpoint.

use metrics_exporter_prometheus::PrometheusBuilder;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::ScannerConfig;
use crate::error::{PatrolError, Result};

pub mod metrics;

/// Settings for [`init`].
#[derive(Debug, Clone)]
pub struct ObservabilityConfig {
    /// Default filter directive when `RUST_LOG` is unset (e.g. `info`, `patrol_core=debug`).
    pub log_level: String,
    /// Port for the Prometheus listener; metrics are recorded but not exported when unset.
    pub metrics_port: Option<u16>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self { log_level: "info".to_string(), metrics_port: None }
    }
}

impl From<&ScannerConfig> for ObservabilityConfig {
    fn from(config: &ScannerConfig) -> Self {
        Self { log_level: config.log_level.clone(), metrics_port: config.metrics_port }
    }
}

/// Initialize the global observability infrastructure.
///
/// Call once at startup. A second call fails instead of panicking.
pub fn init(config: &ObservabilityConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .map_err(|e| PatrolError::InvalidConfig {
            reason: format!("Invalid log level '{}': {}", config.log_level, e),
        })?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true).with_level(true))
        .try_init()
        .map_err(PatrolError::internal)?;

    if let Some(port) = config.metrics_port {
        PrometheusBuilder::new()
            .with_http_listener(([0, 0, 0, 0], port))
            .install()
            .map_err(PatrolError::internal)?;
        tracing::info!("Prometheus metrics exporter listening on port {}", port);
    }

    metrics::register_scan_metrics();

    tracing::info!("Observability initialized");
    Ok(())
}
