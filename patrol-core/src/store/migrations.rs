//! Database migrations.

use crate::error::{PatrolError, Result};
use sqlx::SqlitePool;
use tracing::{info, instrument};

const SCHEMA_VERSION: i64 = 2;

#[instrument(skip(pool))]
pub async fn run(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(migration_failed)?;

    let current_version: Option<i64> =
        sqlx::query_scalar("SELECT version FROM schema_version LIMIT 1")
            .fetch_optional(pool)
            .await
            .map_err(migration_failed)?;

    let current_version = current_version.unwrap_or(0);

    if current_version >= SCHEMA_VERSION {
        info!("Database schema is up to date (version {})", current_version);
        return Ok(());
    }

    info!("Migrating database from version {} to {}", current_version, SCHEMA_VERSION);

    if current_version < 1 {
        migrate_to_v1(pool).await?;
    }

    if current_version < 2 {
        migrate_to_v2(pool).await?;
    }

    Ok(())
}

/// Current schema version, 0 for a fresh database.
pub async fn current_version(pool: &SqlitePool) -> Result<i64> {
    let version: Option<i64> = sqlx::query_scalar("SELECT version FROM schema_version LIMIT 1")
        .fetch_optional(pool)
        .await
        .map_err(migration_failed)?;
    Ok(version.unwrap_or(0))
}

fn migration_failed(e: sqlx::Error) -> PatrolError {
    PatrolError::MigrationFailed { reason: e.to_string() }
}

async fn set_version(pool: &SqlitePool, version: i64) -> Result<()> {
    sqlx::query("DELETE FROM schema_version").execute(pool).await.map_err(migration_failed)?;
    sqlx::query("INSERT INTO schema_version (version) VALUES (?)")
        .bind(version)
        .execute(pool)
        .await
        .map_err(migration_failed)?;
    Ok(())
}

#[instrument(skip(pool))]
async fn migrate_to_v1(pool: &SqlitePool) -> Result<()> {
    info!("Running migration to schema version 1");

    // One row per scan session
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS scan_sessions (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            scan_timestamp TEXT NOT NULL,
            started_at TEXT NOT NULL,
            status TEXT NOT NULL,
            scan_type TEXT NOT NULL,
            scan_source TEXT NOT NULL,
            scan_engine TEXT NOT NULL,
            initiator TEXT NOT NULL,
            compliance_policy TEXT,
            project_name TEXT,
            environment TEXT,
            tags TEXT NOT NULL DEFAULT '[]',
            targets TEXT NOT NULL DEFAULT '[]',
            image_count INTEGER NOT NULL DEFAULT 0,
            total_packages INTEGER NOT NULL DEFAULT 0,
            total_vulnerabilities INTEGER NOT NULL DEFAULT 0,
            critical_count INTEGER NOT NULL DEFAULT 0,
            high_count INTEGER NOT NULL DEFAULT 0,
            medium_count INTEGER NOT NULL DEFAULT 0,
            low_count INTEGER NOT NULL DEFAULT 0,
            unknown_count INTEGER NOT NULL DEFAULT 0,
            exploitable_count INTEGER NOT NULL DEFAULT 0,
            risk_score REAL NOT NULL DEFAULT 0,
            duration_secs REAL NOT NULL DEFAULT 0,
            sbom_tool_version TEXT NOT NULL DEFAULT 'unknown',
            matcher_tool_version TEXT NOT NULL DEFAULT 'unknown'
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(migration_failed)?;

    // Findings plus per-image summary rows, keyed to their session
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS scan_findings (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            session_id TEXT NOT NULL REFERENCES scan_sessions(id) ON DELETE CASCADE,
            scan_timestamp TEXT NOT NULL,
            image TEXT NOT NULL,
            target_index INTEGER NOT NULL DEFAULT 0,
            row_kind TEXT NOT NULL CHECK (row_kind IN ('finding', 'summary')),
            vulnerability_id TEXT,
            severity TEXT,
            package_name TEXT NOT NULL,
            installed_version TEXT NOT NULL DEFAULT '',
            fixed_in TEXT NOT NULL DEFAULT '[]'
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(migration_failed)?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_scan_findings_session ON scan_findings(session_id)")
        .execute(pool)
        .await
        .map_err(migration_failed)?;

    set_version(pool, 1).await?;
    info!("Migration to schema version 1 complete");
    Ok(())
}

#[instrument(skip(pool))]
async fn migrate_to_v2(pool: &SqlitePool) -> Result<()> {
    info!("Running migration to schema version 2");

    // Lookups by CVE and by time window for downstream reporting
    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_scan_findings_vulnerability
        ON scan_findings(vulnerability_id)
        "#,
    )
    .execute(pool)
    .await
    .map_err(migration_failed)?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_scan_sessions_timestamp ON scan_sessions(scan_timestamp)",
    )
    .execute(pool)
    .await
    .map_err(migration_failed)?;

    // Rows are never deduplicated; the same image may be targeted twice in one session
    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_scan_findings_target
        ON scan_findings(session_id, target_index)
        "#,
    )
    .execute(pool)
    .await
    .map_err(migration_failed)?;

    set_version(pool, 2).await?;
    info!("Migration to schema version 2 complete");
    Ok(())
}
