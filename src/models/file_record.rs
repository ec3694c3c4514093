//! Represents the locally tracked counterpart of one remote object.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::FromRow;
use std::path::Path;

/// Sync state of a mirrored object.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum FileStatus {
    Synced,
    Pending,
    Failed,
}

/// Metadata for one object mirrored from a bucket.
///
/// `(bucket_id, remote_key)` is unique. `key_hash` is the SHA-256 hex of the
/// key; both are private and set together in [`FileRecord::synced`], so the
/// fingerprint cannot drift from the key it was computed from.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct FileRecord {
    /// Row id, `None` until persisted.
    pub id: Option<i64>,

    /// Owning bucket; rows are cascade-deleted with it.
    pub bucket_id: i64,

    remote_key: String,
    key_hash: String,

    /// Provider checksum at the time of transfer.
    pub etag: String,

    /// Provider last-modified timestamp.
    pub last_modified: DateTime<Utc>,

    pub size_bytes: i64,

    /// Where the object lives under the mirror root.
    pub local_path: String,

    /// MD5 of the bytes actually written to disk.
    pub local_etag: Option<String>,

    pub last_synced: Option<DateTime<Utc>>,

    /// Batch number of the run that wrote this row.
    pub batch_id: i64,

    pub status: FileStatus,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fixed-length fingerprint of an object key.
pub fn key_fingerprint(key: &str) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}

/// Everything a completed download knows about the object it wrote.
#[derive(Clone, Debug)]
pub struct SyncedObject<'a> {
    pub bucket_id: i64,
    pub key: &'a str,
    pub etag: &'a str,
    pub last_modified: DateTime<Utc>,
    pub size_bytes: i64,
    pub local_path: &'a Path,
    pub local_etag: String,
    pub batch_id: i64,
}

impl FileRecord {
    /// Build a `synced` record for an object that was just written to disk.
    pub fn synced(object: SyncedObject<'_>) -> Self {
        let now = Utc::now();
        Self {
            id: None,
            bucket_id: object.bucket_id,
            remote_key: object.key.to_string(),
            key_hash: key_fingerprint(object.key),
            etag: object.etag.to_string(),
            last_modified: object.last_modified,
            size_bytes: object.size_bytes,
            local_path: object.local_path.to_string_lossy().into_owned(),
            local_etag: Some(object.local_etag),
            last_synced: Some(now),
            batch_id: object.batch_id,
            status: FileStatus::Synced,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn key(&self) -> &str {
        &self.remote_key
    }

    pub fn key_hash(&self) -> &str {
        &self.key_hash
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(key: &str) -> FileRecord {
        FileRecord::synced(SyncedObject {
            bucket_id: 1,
            key,
            etag: "abc",
            last_modified: Utc::now(),
            size_bytes: 3,
            local_path: Path::new("/mirror/alpha/a"),
            local_etag: "abc".into(),
            batch_id: 1,
        })
    }

    #[test]
    fn fingerprint_is_sha256_hex() {
        let hash = key_fingerprint("docs/readme.txt");
        assert_eq!(hash.len(), 64);
        assert_eq!(hash, key_fingerprint("docs/readme.txt"));
        assert_ne!(hash, key_fingerprint("docs/readme.md"));
    }

    #[test]
    fn fingerprint_follows_key() {
        let rec = record("old/key.bin");
        assert_eq!(rec.key(), "old/key.bin");
        assert_eq!(rec.key_hash(), key_fingerprint("old/key.bin"));
    }

    #[test]
    fn synced_record_defaults() {
        let rec = record("photos/2025/img.jpg");
        assert_eq!(rec.status, FileStatus::Synced);
        assert!(rec.id.is_none());
        assert!(rec.last_synced.is_some());
        assert_eq!(rec.local_etag.as_deref(), Some("abc"));
    }
}
