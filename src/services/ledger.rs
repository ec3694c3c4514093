//! Bucket ledger: per-bucket backup outcome counters.
//!
//! Each update is a single statement, so the counter increment and the
//! flag/timestamp change land together or not at all.

use super::catalog::{Catalog, CatalogError, CatalogResult};
use chrono::{DateTime, Utc};

impl Catalog {
    /// Mark a run as successfully completed at `at`.
    pub async fn record_success(&self, bucket_id: i64, at: DateTime<Utc>) -> CatalogResult<()> {
        let result = sqlx::query(
            "UPDATE buckets
             SET last_backup_at = ?, last_backup_completed = 1,
                 successful_backups = successful_backups + 1, updated_at = ?
             WHERE id = ?",
        )
        .bind(at)
        .bind(at)
        .bind(bucket_id)
        .execute(&*self.db)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CatalogError::BucketNotFound(bucket_id));
        }
        Ok(())
    }

    /// Count a fatal run failure. `last_backup_at` keeps pointing at the
    /// last successful run.
    pub async fn record_failure(&self, bucket_id: i64) -> CatalogResult<()> {
        let result = sqlx::query(
            "UPDATE buckets
             SET last_backup_completed = 0, failed_backups = failed_backups + 1, updated_at = ?
             WHERE id = ?",
        )
        .bind(Utc::now())
        .bind(bucket_id)
        .execute(&*self.db)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CatalogError::BucketNotFound(bucket_id));
        }
        Ok(())
    }

    /// A stopped run is neither a success nor a failure, but the mirror is
    /// no longer known to be complete.
    pub async fn record_stopped(&self, bucket_id: i64) -> CatalogResult<()> {
        let result = sqlx::query(
            "UPDATE buckets SET last_backup_completed = 0, updated_at = ? WHERE id = ?",
        )
        .bind(Utc::now())
        .bind(bucket_id)
        .execute(&*self.db)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CatalogError::BucketNotFound(bucket_id));
        }
        Ok(())
    }
}
