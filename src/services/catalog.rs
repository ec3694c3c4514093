//! src/services/catalog.rs
//!
//! Catalog: durable metadata for mirrored buckets, backed by SQLite.
//! Holds the `buckets`, `file_records` and `backup_batches` tables and the
//! three operations a run needs from them: load the `{key: etag}` snapshot,
//! bulk-write file records, and update the bucket ledger (see `ledger.rs`).

use crate::models::{backup_batch::BackupBatch, bucket::Bucket, file_record::FileRecord};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::{QueryBuilder, SqlitePool, sqlite::Sqlite};
use std::{collections::HashMap, sync::Arc};
use thiserror::Error;
use tracing::debug;

const MIGRATION_SQL: &str = include_str!("../../migrations/0001_init.sql");

/// Columns bound per file record in a bulk write.
const FILE_RECORD_COLUMNS: usize = 13;

/// SQLite's default host-parameter limit.
const SQLITE_MAX_VARIABLES: usize = 32_766;

/// Largest chunk a single bulk write can carry.
pub const MAX_CHUNK_SIZE: usize = SQLITE_MAX_VARIABLES / FILE_RECORD_COLUMNS;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("bucket {0} not found")]
    BucketNotFound(i64),
    #[error("bucket `{0}` not found")]
    BucketNameNotFound(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type CatalogResult<T> = Result<T, CatalogError>;

/// How a bulk write treats rows whose `(bucket_id, remote_key)` already exists.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteMode {
    /// Keep the existing row untouched (`ON CONFLICT DO NOTHING`).
    InsertOrIgnore,
    /// Overwrite the transfer fields of the existing row.
    Upsert,
}

/// Destination for completed transfer records.
#[async_trait]
pub trait RecordSink: Send + Sync {
    /// Write all `records` in one bulk statement and return rows affected.
    async fn write_records(&self, records: &[FileRecord], mode: WriteMode) -> CatalogResult<u64>;
}

/// SQLite-backed catalog shared by the engine and the HTTP surface.
#[derive(Clone)]
pub struct Catalog {
    /// Shared SQLite connection pool.
    pub db: Arc<SqlitePool>,
}

impl Catalog {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Apply the embedded schema. Every statement is `IF NOT EXISTS`, so
    /// running it against an initialised database is a no-op.
    pub async fn migrate(&self) -> CatalogResult<usize> {
        let statements = MIGRATION_SQL
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        for stmt in &statements {
            debug!("Executing migration SQL: {}", stmt);
            sqlx::query(stmt).execute(&*self.db).await?;
        }

        Ok(statements.len())
    }

    /// Fetch a bucket by id.
    pub async fn bucket(&self, id: i64) -> CatalogResult<Bucket> {
        sqlx::query_as::<_, Bucket>("SELECT * FROM buckets WHERE id = ?")
            .bind(id)
            .fetch_one(&*self.db)
            .await
            .map_err(|err| match err {
                sqlx::Error::RowNotFound => CatalogError::BucketNotFound(id),
                other => CatalogError::Sqlx(other),
            })
    }

    /// Fetch a bucket by its provider name.
    pub async fn bucket_by_name(&self, name: &str) -> CatalogResult<Bucket> {
        sqlx::query_as::<_, Bucket>("SELECT * FROM buckets WHERE name = ?")
            .bind(name)
            .fetch_one(&*self.db)
            .await
            .map_err(|err| match err {
                sqlx::Error::RowNotFound => CatalogError::BucketNameNotFound(name.to_string()),
                other => CatalogError::Sqlx(other),
            })
    }

    /// All registered buckets ordered by name.
    pub async fn list_buckets(&self) -> CatalogResult<Vec<Bucket>> {
        Ok(
            sqlx::query_as::<_, Bucket>("SELECT * FROM buckets ORDER BY name ASC")
                .fetch_all(&*self.db)
                .await?,
        )
    }

    /// Get-or-create a bucket by name. Returns the row and whether it was
    /// created by this call. New rows use the name as display name.
    pub async fn register_bucket(&self, name: &str) -> CatalogResult<(Bucket, bool)> {
        let now = Utc::now();
        let inserted = sqlx::query(
            "INSERT INTO buckets (name, display_name, created_at, updated_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(name) DO NOTHING",
        )
        .bind(name)
        .bind(name)
        .bind(now)
        .bind(now)
        .execute(&*self.db)
        .await?;

        let bucket = self.bucket_by_name(name).await?;
        Ok((bucket, inserted.rows_affected() == 1))
    }

    /// Last-known etag per key for one bucket. Only the two projected
    /// columns are read to bound memory on large buckets.
    pub async fn load_etag_snapshot(&self, bucket_id: i64) -> CatalogResult<HashMap<String, String>> {
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT remote_key, etag FROM file_records WHERE bucket_id = ?")
                .bind(bucket_id)
                .fetch_all(&*self.db)
                .await?;

        Ok(rows.into_iter().collect())
    }

    /// Recompute `total_files` and `total_size` from the bucket's records.
    pub async fn refresh_stats(&self, bucket_id: i64) -> CatalogResult<()> {
        let result = sqlx::query(
            "UPDATE buckets SET
                total_files = (SELECT COUNT(*) FROM file_records WHERE bucket_id = ?1),
                total_size = (SELECT COALESCE(SUM(size_bytes), 0) FROM file_records WHERE bucket_id = ?1),
                updated_at = ?2
             WHERE id = ?1",
        )
        .bind(bucket_id)
        .bind(Utc::now())
        .execute(&*self.db)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CatalogError::BucketNotFound(bucket_id));
        }
        Ok(())
    }

    /// Open the next batch for a bucket and return its number.
    pub async fn open_batch(&self, bucket_id: i64) -> CatalogResult<i64> {
        let batch_number: i64 = sqlx::query_scalar(
            "INSERT INTO backup_batches (bucket_id, batch_number, started_at)
             SELECT ?1, COALESCE(MAX(batch_number), 0) + 1, ?2
             FROM backup_batches WHERE bucket_id = ?1
             RETURNING batch_number",
        )
        .bind(bucket_id)
        .bind(Utc::now())
        .fetch_one(&*self.db)
        .await?;

        Ok(batch_number)
    }

    /// Run history of a bucket, newest batch first.
    pub async fn list_batches(&self, bucket_id: i64) -> CatalogResult<Vec<BackupBatch>> {
        Ok(sqlx::query_as::<_, BackupBatch>(
            "SELECT * FROM backup_batches WHERE bucket_id = ? ORDER BY batch_number DESC",
        )
        .bind(bucket_id)
        .fetch_all(&*self.db)
        .await?)
    }

    /// Stamp a batch with its outcome.
    pub async fn close_batch(
        &self,
        bucket_id: i64,
        batch_number: i64,
        successful_files: u64,
        failed_files: u64,
        completed: bool,
    ) -> CatalogResult<()> {
        sqlx::query(
            "UPDATE backup_batches
             SET finished_at = ?, successful_files = ?, failed_files = ?, completed = ?
             WHERE bucket_id = ? AND batch_number = ?",
        )
        .bind(Utc::now())
        .bind(successful_files as i64)
        .bind(failed_files as i64)
        .bind(completed)
        .bind(bucket_id)
        .bind(batch_number)
        .execute(&*self.db)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl RecordSink for Catalog {
    async fn write_records(&self, records: &[FileRecord], mode: WriteMode) -> CatalogResult<u64> {
        if records.is_empty() {
            return Ok(0);
        }

        let mut builder = QueryBuilder::<Sqlite>::new(
            "INSERT INTO file_records (bucket_id, remote_key, key_hash, etag, last_modified, \
             size_bytes, local_path, local_etag, last_synced, batch_id, status, created_at, \
             updated_at) ",
        );
        builder.push_values(records, |mut row, rec| {
            row.push_bind(rec.bucket_id)
                .push_bind(rec.key())
                .push_bind(rec.key_hash())
                .push_bind(&rec.etag)
                .push_bind(rec.last_modified)
                .push_bind(rec.size_bytes)
                .push_bind(&rec.local_path)
                .push_bind(rec.local_etag.as_deref())
                .push_bind(rec.last_synced)
                .push_bind(rec.batch_id)
                .push_bind(rec.status)
                .push_bind(rec.created_at)
                .push_bind(rec.updated_at);
        });

        match mode {
            WriteMode::InsertOrIgnore => {
                builder.push(" ON CONFLICT(bucket_id, remote_key) DO NOTHING");
            }
            WriteMode::Upsert => {
                builder.push(
                    " ON CONFLICT(bucket_id, remote_key) DO UPDATE SET
                        etag = excluded.etag,
                        last_modified = excluded.last_modified,
                        size_bytes = excluded.size_bytes,
                        local_path = excluded.local_path,
                        local_etag = excluded.local_etag,
                        last_synced = excluded.last_synced,
                        batch_id = excluded.batch_id,
                        status = excluded.status,
                        updated_at = excluded.updated_at",
                );
            }
        }

        let result = builder.build().execute(&*self.db).await?;
        debug!(
            rows = records.len(),
            affected = result.rows_affected(),
            ?mode,
            "wrote file record chunk"
        );
        Ok(result.rows_affected())
    }
}
