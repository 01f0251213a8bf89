//! Error types for the scan engine.
//!
//! All errors use `thiserror` for ergonomic error handling and proper error chains.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for scan engine operations.
pub type Result<T> = std::result::Result<T, PatrolError>;

/// Main error type for the scan engine.
#[derive(Error, Debug)]
pub enum PatrolError {
    // Session errors
    #[error("Scan name already in use: {name}")]
    DuplicateScanName { name: String },

    #[error("Scan id already registered: {scan_id}")]
    DuplicateScanId { scan_id: String },

    #[error("Scan not found: {scan_id}")]
    ScanNotFound { scan_id: String },

    // Tool errors
    #[error("Required tool not available: {tool}. {hint}")]
    ToolUnavailable { tool: String, hint: String },

    #[error("Failed to spawn {program}: {source}")]
    SpawnFailed {
        program: String,
        #[source]
        source: std::io::Error,
    },

    // Database errors
    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Database migration failed: {reason}")]
    MigrationFailed { reason: String },

    // Configuration errors
    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    // File system errors
    #[error("I/O error at {path:?}: {source}")]
    IoError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl PatrolError {
    /// Create an Internal error from any error type.
    pub fn internal(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<sqlx::Error> for PatrolError {
    fn from(err: sqlx::Error) -> Self {
        Self::DatabaseError(err.to_string())
    }
}
