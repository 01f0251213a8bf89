//! Configuration management.

use crate::error::{PatrolError, Result};
use crate::paths;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// External tool settings.
///
/// Programs are resolved through `PATH` unless an absolute path is given.
/// Arguments are always passed in argv form; nothing here is ever handed to a shell.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolConfig {
    /// Program used to fetch images (e.g. `docker`, `podman`).
    pub fetch_program: String,
    /// Arguments placed before the image reference (e.g. `["pull"]`).
    pub fetch_args: Vec<String>,
    /// SBOM generator program.
    pub sbom_program: String,
    /// Matcher program.
    pub matcher_program: String,
    /// Whether to fetch the image before generating the SBOM.
    pub pull_images: bool,
    pub fetch_timeout_secs: u64,
    pub sbom_timeout_secs: u64,
    pub matcher_timeout_secs: u64,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            fetch_program: "docker".to_string(),
            fetch_args: vec!["pull".to_string()],
            sbom_program: "syft".to_string(),
            matcher_program: "grype".to_string(),
            pull_images: true,
            fetch_timeout_secs: 120,
            sbom_timeout_secs: 600,
            matcher_timeout_secs: 600,
        }
    }
}

impl ToolConfig {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn sbom_timeout(&self) -> Duration {
        Duration::from_secs(self.sbom_timeout_secs)
    }

    pub fn matcher_timeout(&self) -> Duration {
        Duration::from_secs(self.matcher_timeout_secs)
    }
}

/// Persistent configuration for the scan engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    pub database_path: String,
    pub work_dir: String,
    pub tools: ToolConfig,
    /// Upper bound on images scanned at once within one session.
    pub max_concurrent_targets: usize,
    /// How long finished sessions stay queryable in memory.
    pub session_retention_secs: u64,
    pub log_level: String,
    /// Prometheus listener port; no exporter when unset.
    pub metrics_port: Option<u16>,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            database_path: paths::db_path().to_string_lossy().to_string(),
            work_dir: paths::work_dir().to_string_lossy().to_string(),
            tools: ToolConfig::default(),
            max_concurrent_targets: 1,
            session_retention_secs: 60 * 60,
            log_level: "info".to_string(),
            metrics_port: None,
        }
    }
}

impl ScannerConfig {
    /// Get the path to the configuration file.
    pub fn config_path() -> PathBuf {
        paths::config_dir().join("config.json")
    }

    /// Load configuration from the default location.
    pub fn load() -> Result<Self> {
        Self::load_from(Self::config_path())
    }

    /// Load configuration from a file, falling back to defaults when it is absent.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|e| PatrolError::InvalidConfig {
            reason: format!("Failed to read config: {}", e),
        })?;
        let config: Self = serde_json::from_str(&content).map_err(|e| {
            PatrolError::InvalidConfig { reason: format!("Failed to parse config: {}", e) }
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a file.
    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| PatrolError::IoError { path: parent.to_path_buf(), source: e })?;
        }
        let content = serde_json::to_string_pretty(self).map_err(|e| {
            PatrolError::InvalidConfig { reason: format!("Failed to serialize config: {}", e) }
        })?;
        std::fs::write(path, content)
            .map_err(|e| PatrolError::IoError { path: path.to_path_buf(), source: e })
    }

    /// Save configuration to the default location.
    pub fn save(&self) -> Result<()> {
        self.save_to(Self::config_path())
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_targets == 0 {
            return Err(PatrolError::InvalidConfig {
                reason: "max_concurrent_targets must be at least 1".to_string(),
            });
        }
        let tools = [
            ("fetch_program", &self.tools.fetch_program),
            ("sbom_program", &self.tools.sbom_program),
            ("matcher_program", &self.tools.matcher_program),
        ];
        for (field, program) in tools {
            if program.trim().is_empty() {
                return Err(PatrolError::InvalidConfig {
                    reason: format!("{} must not be empty", field),
                });
            }
        }
        Ok(())
    }

    pub fn session_retention(&self) -> Duration {
        Duration::from_secs(self.session_retention_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_are_valid() {
        let config = ScannerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.tools.fetch_timeout(), Duration::from_secs(120));
        assert_eq!(config.max_concurrent_targets, 1);
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let config = ScannerConfig::load_from(dir.path().join("nope.json")).unwrap();
        assert_eq!(config.tools.sbom_program, "syft");
    }

    #[test]
    fn test_save_and_load_partial() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let mut config = ScannerConfig::default();
        config.max_concurrent_targets = 3;
        config.tools.pull_images = false;
        config.save_to(&path).unwrap();

        let loaded = ScannerConfig::load_from(&path).unwrap();
        assert_eq!(loaded.max_concurrent_targets, 3);
        assert!(!loaded.tools.pull_images);

        // Missing fields fall back to defaults
        std::fs::write(&path, r#"{"tools": {"matcher_program": "/opt/grype"}}"#).unwrap();
        let loaded = ScannerConfig::load_from(&path).unwrap();
        assert_eq!(loaded.tools.matcher_program, "/opt/grype");
        assert_eq!(loaded.tools.sbom_program, "syft");
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"max_concurrent_targets": 0}"#).unwrap();

        let err = ScannerConfig::load_from(&path).unwrap_err();
        assert!(matches!(err, PatrolError::InvalidConfig { .. }));
    }
}
