//! In-process run registry: at most one backup per bucket at a time, each
//! with a cancellation token that `stop` can fire.

use super::backup_service::BackupEngine;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Default)]
pub struct RunRegistry {
    active: Mutex<HashMap<i64, CancellationToken>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn active(&self) -> MutexGuard<'_, HashMap<i64, CancellationToken>> {
        self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Claim the bucket. `None` when a run is already active for it.
    pub fn begin(&self, bucket_id: i64) -> Option<CancellationToken> {
        let mut active = self.active();
        if active.contains_key(&bucket_id) {
            return None;
        }
        let token = CancellationToken::new();
        active.insert(bucket_id, token.clone());
        Some(token)
    }

    pub fn finish(&self, bucket_id: i64) {
        self.active().remove(&bucket_id);
    }

    /// Request a cooperative stop. Returns false if nothing is running.
    pub fn stop(&self, bucket_id: i64) -> bool {
        match self.active().get(&bucket_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self, bucket_id: i64) -> bool {
        self.active().contains_key(&bucket_id)
    }
}

/// Start a background run for `bucket_id` unless one is already active.
pub fn spawn_backup(engine: BackupEngine, runs: Arc<RunRegistry>, bucket_id: i64) -> bool {
    let Some(cancel) = runs.begin(bucket_id) else {
        return false;
    };

    tokio::spawn(async move {
        match engine.run_bucket_backup(bucket_id, &cancel).await {
            Ok(report) => info!(
                bucket_id,
                status = ?report.status,
                files_processed = report.files_processed,
                "background backup done"
            ),
            Err(err) => error!(bucket_id, error = %err, "background backup failed"),
        }
        runs.finish(bucket_id);
    });
    true
}
