//! Represents a mirrored remote bucket and its backup ledger.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A remote bucket registered for mirroring.
///
/// The name is globally unique. The two backup counters only ever grow;
/// the ledger increments them with single `UPDATE ... SET x = x + 1`
/// statements so concurrent runs never lose an increment.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct Bucket {
    /// Internal row id, also used in the progress key `bucket_<id>_progress`.
    pub id: i64,

    /// Actual bucket name at the provider.
    pub name: String,

    /// Optional human-friendly name.
    pub display_name: Option<String>,

    /// Reserved for prefix-scoped syncing.
    pub prefix_1: Option<String>,
    pub prefix_2: Option<String>,

    /// Whether the most recent run finished successfully.
    pub last_backup_completed: bool,

    /// When the last successful run finished.
    pub last_backup_at: Option<DateTime<Utc>>,

    pub successful_backups: i64,
    pub failed_backups: i64,

    /// Precomputed from `file_records` after each successful run.
    pub total_files: i64,
    pub total_size: i64,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Bucket {
    /// Name shown to operators: the display name when set, else the bucket name.
    pub fn label(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.name)
    }
}
