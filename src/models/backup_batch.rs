//! One incremental run against one bucket.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Bookkeeping row for a single run. `(bucket_id, batch_number)` is unique
/// and `batch_number` doubles as the `batch_id` stamped on every
/// `FileRecord` written by the run.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct BackupBatch {
    pub id: i64,
    pub bucket_id: i64,
    pub batch_number: i64,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub successful_files: i64,
    pub failed_files: i64,
    pub completed: bool,
}
