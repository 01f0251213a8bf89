//! Registry of sessions owned by one orchestrator.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

use super::ScanHandle;
use crate::error::{PatrolError, Result};

/// Concurrent id → session map with time-based eviction of finished sessions.
#[derive(Clone)]
pub struct ScanRegistry {
    scans: Arc<RwLock<HashMap<String, ScanHandle>>>,
    retention: Duration,
}

impl ScanRegistry {
    /// Finished sessions are dropped once they have been terminal for `retention`.
    pub fn new(retention: Duration) -> Self {
        Self { scans: Arc::new(RwLock::new(HashMap::new())), retention }
    }

    /// Register a new session.
    ///
    /// Fails if the id is taken or another in-memory session already uses
    /// `name`. Both checks happen under one write lock so two concurrent
    /// starts with the same name cannot both succeed.
    pub async fn register(&self, handle: ScanHandle, name: &str) -> Result<()> {
        let mut scans = self.scans.write().await;
        if scans.contains_key(handle.id()) {
            return Err(PatrolError::DuplicateScanId { scan_id: handle.id().to_string() });
        }
        for existing in scans.values() {
            if existing.name().await == name {
                return Err(PatrolError::DuplicateScanName { name: name.to_string() });
            }
        }
        scans.insert(handle.id().to_string(), handle);
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Option<ScanHandle> {
        self.scans.read().await.get(id).cloned()
    }

    /// Ids of all sessions currently held, sorted.
    pub async fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.scans.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn len(&self) -> usize {
        self.scans.read().await.len()
    }

    /// Drop sessions that finished more than the retention period ago.
    ///
    /// Returns the number of sessions removed.
    pub async fn evict_expired(&self) -> usize {
        let retention = chrono::Duration::from_std(self.retention)
            .unwrap_or_else(|_| chrono::Duration::weeks(52 * 100));
        let now = Utc::now();

        let mut scans = self.scans.write().await;
        let mut expired = Vec::new();
        for (id, handle) in scans.iter() {
            if let Some(finished_at) = handle.finished_at().await {
                if now - finished_at >= retention {
                    expired.push(id.clone());
                }
            }
        }
        for id in &expired {
            scans.remove(id);
            debug!(scan_id = %id, "Evicted finished scan session");
        }
        expired.len()
    }
}
