//! Core data models for the bucket mirror.
//!
//! `Bucket`, `FileRecord` and `BackupBatch` map to the SQLite tables via
//! `sqlx::FromRow` and serialize as JSON via `serde`. `RemoteObject` is the
//! provider-side descriptor produced by listing and never stored directly.

pub mod backup_batch;
pub mod bucket;
pub mod file_record;
pub mod remote_object;
