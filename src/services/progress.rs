//! Live run progress, published to an expiring key-value store.
//!
//! Entries are advisory: pollers may see nothing at all once a run ends or
//! the TTL lapses, and nothing here reads them back during a run.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::Mutex;

/// How long an entry survives without being refreshed.
pub const PROGRESS_TTL: Duration = Duration::from_secs(3600);

/// Snapshot of a run in flight.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Progress {
    pub total: u64,
    pub done: u64,
    pub last_key: String,
}

/// Shared expiring key-value store.
#[async_trait]
pub trait ProgressStore: Send + Sync {
    async fn set(&self, key: &str, value: Progress, ttl: Duration);
    async fn get(&self, key: &str) -> Option<Progress>;
    async fn delete(&self, key: &str);
}

/// In-process store; expired entries are dropped lazily on access.
#[derive(Default)]
pub struct MemoryProgressStore {
    entries: Mutex<HashMap<String, (Progress, Instant)>>,
}

impl MemoryProgressStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProgressStore for MemoryProgressStore {
    async fn set(&self, key: &str, value: Progress, ttl: Duration) {
        let expires_at = Instant::now() + ttl;
        self.entries
            .lock()
            .await
            .insert(key.to_string(), (value, expires_at));
    }

    async fn get(&self, key: &str) -> Option<Progress> {
        let mut entries = self.entries.lock().await;
        let expired = match entries.get(key) {
            Some((value, expires_at)) if *expires_at > Instant::now() => {
                return Some(value.clone());
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            entries.remove(key);
        }
        None
    }

    async fn delete(&self, key: &str) {
        self.entries.lock().await.remove(key);
    }
}

/// Progress key for a bucket.
pub fn progress_key(bucket_id: i64) -> String {
    format!("bucket_{bucket_id}_progress")
}

/// Publishes one bucket's run counters.
pub struct ProgressTracker {
    store: Arc<dyn ProgressStore>,
    key: String,
}

impl ProgressTracker {
    pub fn new(store: Arc<dyn ProgressStore>, bucket_id: i64) -> Self {
        Self {
            store,
            key: progress_key(bucket_id),
        }
    }

    pub async fn publish(&self, total: u64, done: u64, last_key: &str) {
        let value = Progress {
            total,
            done,
            last_key: last_key.to_string(),
        };
        self.store.set(&self.key, value, PROGRESS_TTL).await;
    }

    pub async fn clear(&self) {
        self.store.delete(&self.key).await;
    }
}
