//! Centralized path configuration.
//!
//! All data paths should go through this module so the library and any
//! embedding service agree on where the database and scratch space live.

use std::path::PathBuf;

/// Get the data directory.
///
/// Resolution order:
/// 1. `PATROL_DATA_DIR` environment variable
/// 2. `/var/lib/patrol` if it exists (system install)
/// 3. `~/.patrol` for user-only installs
pub fn data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("PATROL_DATA_DIR") {
        return PathBuf::from(dir);
    }

    let system_dir = PathBuf::from("/var/lib/patrol");
    if system_dir.exists() {
        return system_dir;
    }

    dirs::home_dir().map(|h| h.join(".patrol")).unwrap_or(system_dir)
}

/// Get the configuration directory.
///
/// `PATROL_CONFIG_DIR` wins, then the platform config dir, then the data dir.
pub fn config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("PATROL_CONFIG_DIR") {
        return PathBuf::from(dir);
    }

    dirs::config_dir().map(|c| c.join("patrol")).unwrap_or_else(data_dir)
}

/// Get the database path.
pub fn db_path() -> PathBuf {
    if let Ok(path) = std::env::var("DATABASE_PATH") {
        return PathBuf::from(path);
    }
    data_dir().join("app_patrol.db")
}

/// Root under which per-session scratch directories are created.
pub fn work_dir() -> PathBuf {
    std::env::temp_dir().join("patrol-scans")
}
