//! Scan result persistence with SQLite.
//!
//! The ResultStore owns two tables:
//! - `scan_sessions`: one metadata row per scan session
//! - `scan_findings`: one row per matcher finding plus one summary row per
//!   image, each carrying its `session_id` and the index of its image result
//!
//! Finding rows are never deduplicated: the finding rows of a session always
//! add up to its `total_vulnerabilities`.
//!
//! Every row written by one [`ResultStore::persist`] call carries the same
//! `scan_timestamp`, captured once at the start of the call.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{ConnectOptions, Row};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info, instrument};

use crate::error::{PatrolError, Result};
use crate::scanner::{ImageScanResult, Severity, SeverityHistogram, ToolVersions};
use crate::session::{SessionMetrics, SessionOptions, SessionOutcome};

pub mod migrations;


/// Everything written to `scan_sessions` for one session.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub id: String,
    pub name: String,
    pub started_at: DateTime<Utc>,
    pub targets: Vec<String>,
    pub options: SessionOptions,
    pub metrics: SessionMetrics,
    /// e.g. `syft + grype`.
    pub scan_engine: String,
    pub tool_versions: ToolVersions,
}

/// Discriminates real findings from per-image summary rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RowKind {
    Finding,
    Summary,
}

impl RowKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RowKind::Finding => "finding",
            RowKind::Summary => "summary",
        }
    }
}

impl fmt::Display for RowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A persisted session metadata row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredSession {
    pub id: String,
    pub name: String,
    /// RFC 3339; shared with every finding row of the same persist.
    pub scan_timestamp: String,
    pub started_at: DateTime<Utc>,
    pub status: SessionOutcome,
    pub scan_type: String,
    pub scan_source: String,
    pub scan_engine: String,
    pub initiator: String,
    pub compliance_policy: Option<String>,
    pub project_name: Option<String>,
    pub environment: Option<String>,
    pub tags: Vec<String>,
    pub targets: Vec<String>,
    pub image_count: u32,
    pub total_packages: u64,
    pub total_vulnerabilities: u64,
    pub severity: SeverityHistogram,
    pub exploitable: u64,
    pub risk_score: f64,
    pub duration_secs: f64,
    pub sbom_tool_version: String,
    pub matcher_tool_version: String,
}

/// A persisted `scan_findings` row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredFinding {
    pub session_id: String,
    pub scan_timestamp: String,
    pub image: String,
    /// Position of the image result within the persisted session.
    pub target_index: u32,
    pub row_kind: RowKind,
    /// `None` on summary rows.
    pub vulnerability_id: Option<String>,
    pub severity: Option<Severity>,
    /// On summary rows this holds the package count text, e.g. `"42 packages"`.
    pub package_name: String,
    pub installed_version: String,
    pub fixed_in: Vec<String>,
}

/// Result store for scan sessions and findings.
#[derive(Clone)]
pub struct ResultStore {
    pool: SqlitePool,
}

fn db_error(operation: &'static str) -> impl FnOnce(sqlx::Error) -> PatrolError {
    move |e| {
        metrics::counter!("patrol_db_errors_total", "operation" => operation).increment(1);
        PatrolError::DatabaseError(e.to_string())
    }
}

fn to_json(value: &[String]) -> Result<String> {
    serde_json::to_string(value)
        .map_err(|e| PatrolError::DatabaseError(format!("Failed to serialize list: {}", e)))
}

fn from_json(value: &str) -> Result<Vec<String>> {
    serde_json::from_str(value)
        .map_err(|e| PatrolError::DatabaseError(format!("Failed to deserialize list: {}", e)))
}

impl ResultStore {
    /// Create a store backed by a private in-memory database (for tests).
    pub async fn new_in_memory() -> Result<Self> {
        Self::new(":memory:").await
    }

    /// Get a reference to the underlying SQLite pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Open (creating if needed) the database at `db_path` and migrate it.
    #[instrument(skip(db_path))]
    pub async fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();
        info!("Initializing result store at {:?}", db_path);

        let in_memory = db_path == Path::new(":memory:");
        if !in_memory {
            if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| PatrolError::IoError { path: parent.to_path_buf(), source: e })?;
            }
        }

        let mut options = SqliteConnectOptions::from_str(db_path.to_str().ok_or_else(|| {
            PatrolError::InvalidConfig { reason: "Invalid database path".to_string() }
        })?)
        .map_err(|e| PatrolError::DatabaseError(e.to_string()))?;

        options = options
            .create_if_missing(true)
            .foreign_keys(true)
            .log_statements(tracing::log::LevelFilter::Debug);

        // An in-memory database lives only as long as its connection
        let pool_options = if in_memory {
            SqlitePoolOptions::new().max_connections(1).idle_timeout(None).max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };

        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(|e| PatrolError::DatabaseError(e.to_string()))?;

        let store = Self { pool };
        store.run_migrations().await?;

        info!("Result store initialized successfully");
        Ok(store)
    }

    #[instrument(skip(self))]
    async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");
        migrations::run(&self.pool).await?;
        info!("Database migrations complete");
        Ok(())
    }

    /// Persist one session and its per-image results in a single transaction.
    ///
    /// Re-persisting a session id replaces its metadata row and all of its
    /// finding rows. Returns the timestamp shared by every row written.
    #[instrument(skip(self, record, results), fields(scan_id = %record.id, images = results.len()))]
    pub async fn persist(
        &self,
        record: &SessionRecord,
        results: &[ImageScanResult],
    ) -> Result<String> {
        let scan_timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);
        let metrics = &record.metrics;
        let options = &record.options;

        let mut tx = self.pool.begin().await.map_err(db_error("persist_begin"))?;

        sqlx::query(
            r#"
            INSERT INTO scan_sessions (
                id, name, scan_timestamp, started_at, status, scan_type, scan_source,
                scan_engine, initiator, compliance_policy, project_name, environment,
                tags, targets, image_count, total_packages, total_vulnerabilities,
                critical_count, high_count, medium_count, low_count, unknown_count,
                exploitable_count, risk_score, duration_secs,
                sbom_tool_version, matcher_tool_version
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                scan_timestamp = excluded.scan_timestamp,
                started_at = excluded.started_at,
                status = excluded.status,
                scan_type = excluded.scan_type,
                scan_source = excluded.scan_source,
                scan_engine = excluded.scan_engine,
                initiator = excluded.initiator,
                compliance_policy = excluded.compliance_policy,
                project_name = excluded.project_name,
                environment = excluded.environment,
                tags = excluded.tags,
                targets = excluded.targets,
                image_count = excluded.image_count,
                total_packages = excluded.total_packages,
                total_vulnerabilities = excluded.total_vulnerabilities,
                critical_count = excluded.critical_count,
                high_count = excluded.high_count,
                medium_count = excluded.medium_count,
                low_count = excluded.low_count,
                unknown_count = excluded.unknown_count,
                exploitable_count = excluded.exploitable_count,
                risk_score = excluded.risk_score,
                duration_secs = excluded.duration_secs,
                sbom_tool_version = excluded.sbom_tool_version,
                matcher_tool_version = excluded.matcher_tool_version
            "#,
        )
        .bind(&record.id)
        .bind(&record.name)
        .bind(&scan_timestamp)
        .bind(record.started_at.to_rfc3339_opts(SecondsFormat::Micros, true))
        .bind(metrics.outcome.as_str())
        .bind(&options.scan_type)
        .bind(&options.scan_source)
        .bind(&record.scan_engine)
        .bind(&options.initiator)
        .bind(&options.compliance_policy)
        .bind(&options.project_name)
        .bind(&options.environment)
        .bind(to_json(&options.tags)?)
        .bind(to_json(&record.targets)?)
        .bind(metrics.image_count as i64)
        .bind(metrics.total_packages as i64)
        .bind(metrics.total_vulnerabilities as i64)
        .bind(metrics.severity.critical as i64)
        .bind(metrics.severity.high as i64)
        .bind(metrics.severity.medium as i64)
        .bind(metrics.severity.low as i64)
        .bind(metrics.severity.unknown as i64)
        .bind(metrics.exploitable as i64)
        .bind(metrics.risk_score)
        .bind(metrics.duration_secs)
        .bind(&record.tool_versions.sbom)
        .bind(&record.tool_versions.matcher)
        .execute(&mut *tx)
        .await
        .map_err(db_error("persist_session"))?;

        sqlx::query("DELETE FROM scan_findings WHERE session_id = ?")
            .bind(&record.id)
            .execute(&mut *tx)
            .await
            .map_err(db_error("persist_clear_findings"))?;

        let mut rows = 0usize;
        for (target_index, result) in results.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO scan_findings
                    (session_id, scan_timestamp, image, target_index, row_kind,
                     vulnerability_id, severity, package_name, installed_version, fixed_in)
                VALUES (?, ?, ?, ?, ?, NULL, NULL, ?, '', '[]')
                "#,
            )
            .bind(&record.id)
            .bind(&scan_timestamp)
            .bind(&result.image)
            .bind(target_index as i64)
            .bind(RowKind::Summary.as_str())
            .bind(format!("{} packages", result.package_count))
            .execute(&mut *tx)
            .await
            .map_err(db_error("persist_summary"))?;
            rows += 1;

            for finding in &result.findings {
                sqlx::query(
                    r#"
                    INSERT INTO scan_findings
                        (session_id, scan_timestamp, image, target_index, row_kind,
                         vulnerability_id, severity, package_name, installed_version, fixed_in)
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(&record.id)
                .bind(&scan_timestamp)
                .bind(&result.image)
                .bind(target_index as i64)
                .bind(RowKind::Finding.as_str())
                .bind(&finding.vulnerability_id)
                .bind(finding.severity.as_str())
                .bind(&finding.package_name)
                .bind(&finding.installed_version)
                .bind(to_json(&finding.fixed_in)?)
                .execute(&mut *tx)
                .await
                .map_err(db_error("persist_finding"))?;
                rows += 1;
            }
        }

        tx.commit().await.map_err(db_error("persist_commit"))?;

        debug!(rows, "Persisted scan session");
        Ok(scan_timestamp)
    }

    /// Whether any persisted session already uses `name`.
    #[instrument(skip(self))]
    pub async fn session_name_exists(&self, name: &str) -> Result<bool> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM scan_sessions WHERE name = ?")
            .bind(name)
            .fetch_one(&self.pool)
            .await
            .map_err(db_error("session_name_exists"))?;
        Ok(count > 0)
    }

    /// Get a persisted session by id.
    #[instrument(skip(self), fields(scan_id = %id))]
    pub async fn get_session(&self, id: &str) -> Result<Option<StoredSession>> {
        let row = sqlx::query("SELECT * FROM scan_sessions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error("get_session"))?;

        row.map(|r| self.row_to_session(r)).transpose()
    }

    /// All persisted sessions, newest first.
    #[instrument(skip(self))]
    pub async fn list_sessions(&self) -> Result<Vec<StoredSession>> {
        let rows = sqlx::query("SELECT * FROM scan_sessions ORDER BY scan_timestamp DESC, id")
            .fetch_all(&self.pool)
            .await
            .map_err(db_error("list_sessions"))?;

        rows.into_iter().map(|r| self.row_to_session(r)).collect()
    }

    /// Finding and summary rows for one session, in insertion order.
    #[instrument(skip(self), fields(scan_id = %session_id))]
    pub async fn list_findings(&self, session_id: &str) -> Result<Vec<StoredFinding>> {
        let rows = sqlx::query("SELECT * FROM scan_findings WHERE session_id = ? ORDER BY id")
            .bind(session_id)
            .fetch_all(&self.pool)
            .await
            .map_err(db_error("list_findings"))?;

        rows.into_iter().map(|r| self.row_to_finding(r)).collect()
    }

    fn row_to_session(&self, row: sqlx::sqlite::SqliteRow) -> Result<StoredSession> {
        let started_at: String = row.get("started_at");
        let started_at = DateTime::parse_from_rfc3339(&started_at)
            .map_err(|e| PatrolError::DatabaseError(format!("Invalid started_at: {}", e)))?
            .with_timezone(&Utc);

        let status: String = row.get("status");
        let tags: String = row.get("tags");
        let targets: String = row.get("targets");

        Ok(StoredSession {
            id: row.get("id"),
            name: row.get("name"),
            scan_timestamp: row.get("scan_timestamp"),
            started_at,
            status: SessionOutcome::parse(&status),
            scan_type: row.get("scan_type"),
            scan_source: row.get("scan_source"),
            scan_engine: row.get("scan_engine"),
            initiator: row.get("initiator"),
            compliance_policy: row.get("compliance_policy"),
            project_name: row.get("project_name"),
            environment: row.get("environment"),
            tags: from_json(&tags)?,
            targets: from_json(&targets)?,
            image_count: row.get::<i64, _>("image_count") as u32,
            total_packages: row.get::<i64, _>("total_packages") as u64,
            total_vulnerabilities: row.get::<i64, _>("total_vulnerabilities") as u64,
            severity: SeverityHistogram {
                critical: row.get::<i64, _>("critical_count") as u64,
                high: row.get::<i64, _>("high_count") as u64,
                medium: row.get::<i64, _>("medium_count") as u64,
                low: row.get::<i64, _>("low_count") as u64,
                unknown: row.get::<i64, _>("unknown_count") as u64,
            },
            exploitable: row.get::<i64, _>("exploitable_count") as u64,
            risk_score: row.get("risk_score"),
            duration_secs: row.get("duration_secs"),
            sbom_tool_version: row.get("sbom_tool_version"),
            matcher_tool_version: row.get("matcher_tool_version"),
        })
    }

    fn row_to_finding(&self, row: sqlx::sqlite::SqliteRow) -> Result<StoredFinding> {
        let row_kind = match row.get::<String, _>("row_kind").as_str() {
            "summary" => RowKind::Summary,
            _ => RowKind::Finding,
        };
        let fixed_in: String = row.get("fixed_in");

        Ok(StoredFinding {
            session_id: row.get("session_id"),
            scan_timestamp: row.get("scan_timestamp"),
            image: row.get("image"),
            target_index: row.get::<i64, _>("target_index") as u32,
            row_kind,
            vulnerability_id: row.get("vulnerability_id"),
            severity: row.get::<Option<String>, _>("severity").map(|s| Severity::parse(&s)),
            package_name: row.get("package_name"),
            installed_version: row.get("installed_version"),
            fixed_in: from_json(&fixed_in)?,
        })
    }
}
