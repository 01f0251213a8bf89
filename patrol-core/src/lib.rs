//! Patrol Core Library
//!
//! Container image vulnerability scan orchestration: validates untrusted image
//! references, drives SBOM and vulnerability-matching tools as subprocesses,
//! tracks progress and logs for concurrent scan sessions, scores risk, and
//! persists results to SQLite.

pub mod config;
pub mod error;
pub mod events;
pub mod observability;
pub mod orchestrator;
pub mod paths;
pub mod process;
pub mod risk;
pub mod scanner;
pub mod session;
pub mod store;
pub mod validation;

// Re-export commonly used items
pub use config::{ScannerConfig, ToolConfig};
pub use error::{PatrolError, Result};
pub use events::{Event, EventBus, EventType};
pub use observability::{init as init_observability, ObservabilityConfig};
pub use orchestrator::{ScanOrchestrator, ScanRequest};
pub use process::{CommandExecutor, Invocation, ProcessOutput, ProcessRunner};
pub use scanner::{
    Finding, ImageScanResult, ImageScanner, Severity, SeverityHistogram, TargetFailure,
};
pub use session::{LogEntry, LogLevel, ScanState, ScanStatus, SessionMetrics, SessionOptions};
pub use store::{ResultStore, SessionRecord, StoredFinding, StoredSession};
pub use validation::validate_image_reference;
