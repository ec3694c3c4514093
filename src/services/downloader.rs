//! src/services/downloader.rs
//!
//! Single-object transfer: stream one remote object into
//! `mirror_root/{bucket}/{key}` through a temp file, hashing as it goes,
//! with bounded retry. The coordinator in `backup_service.rs` decides how
//! many of these run at once.

use super::{
    error::{ObjectTransferError, TransferCause},
    remote::RemoteStore,
    retry::RetryPolicy,
};
use crate::models::{
    file_record::{FileRecord, SyncedObject},
    remote_object::RemoteObject,
};
use futures::StreamExt;
use md5::Context;
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::{debug, warn};
use uuid::Uuid;

const MAX_OBJECT_KEY_LEN: usize = 1024;

pub type TransferResult = Result<FileRecord, ObjectTransferError>;

/// Reject keys that cannot be mapped safely beneath the bucket directory.
///
/// Empty segments, `.`/`..`, a leading `/`, a trailing `/` on a non-empty
/// object, backslashes and control characters are all refused.
pub fn ensure_key_safe(key: &str) -> Result<(), TransferCause> {
    if key.is_empty() || key.len() > MAX_OBJECT_KEY_LEN {
        return Err(TransferCause::UnsafeKey);
    }
    if key
        .bytes()
        .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
    {
        return Err(TransferCause::UnsafeKey);
    }
    if key
        .split('/')
        .any(|segment| segment.is_empty() || segment == "." || segment == "..")
    {
        return Err(TransferCause::UnsafeKey);
    }
    Ok(())
}

/// `mirror_root/bucket/seg/seg/...` for a key already checked by
/// [`ensure_key_safe`].
pub fn mirror_path(mirror_root: &Path, bucket: &str, key: &str) -> PathBuf {
    let mut path = mirror_root.join(bucket);
    path.extend(key.split('/'));
    path
}

/// What a download wrote to disk.
struct Written {
    local_etag: String,
}

/// Downloads objects of one bucket for one run.
pub struct Downloader {
    client: Arc<dyn RemoteStore>,
    bucket_id: i64,
    bucket_name: String,
    mirror_root: PathBuf,
    batch_id: i64,
    retry: RetryPolicy,
}

impl Downloader {
    pub fn new(
        client: Arc<dyn RemoteStore>,
        bucket_id: i64,
        bucket_name: impl Into<String>,
        mirror_root: impl Into<PathBuf>,
        batch_id: i64,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            client,
            bucket_id,
            bucket_name: bucket_name.into(),
            mirror_root: mirror_root.into(),
            batch_id,
            retry,
        }
    }

    /// Mirror one object, retrying retryable failures with backoff.
    pub async fn transfer(&self, object: RemoteObject) -> TransferResult {
        if let Err(source) = ensure_key_safe(&object.key) {
            return Err(ObjectTransferError {
                key: object.key,
                attempts: 0,
                source,
            });
        }
        let local_path = mirror_path(&self.mirror_root, &self.bucket_name, &object.key);

        let attempts = self.retry.attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.download_once(&object.key, &local_path).await {
                Ok(written) => {
                    debug!(key = %object.key, path = %local_path.display(), "downloaded object");
                    return Ok(FileRecord::synced(SyncedObject {
                        bucket_id: self.bucket_id,
                        key: &object.key,
                        etag: &object.etag,
                        last_modified: object.last_modified,
                        size_bytes: object.size,
                        local_path: &local_path,
                        local_etag: written.local_etag,
                        batch_id: self.batch_id,
                    }));
                }
                Err(cause) if cause.is_retryable() && attempt < attempts => {
                    let delay = self.retry.delay_after(attempt);
                    warn!(
                        key = %object.key,
                        attempt,
                        attempts,
                        error = %cause,
                        "download failed, retrying in {delay:?}"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(source) => {
                    return Err(ObjectTransferError {
                        key: object.key,
                        attempts: attempt,
                        source,
                    });
                }
            }
        }
    }

    /// One attempt: stream into a temp file beside the target, fsync, then
    /// rename into place. The temp file is removed on any error.
    async fn download_once(&self, key: &str, file_path: &Path) -> Result<Written, TransferCause> {
        let parent = file_path.parent().map(Path::to_path_buf).ok_or_else(|| {
            io::Error::new(ErrorKind::Other, "mirror path missing parent directory")
        })?;
        fs::create_dir_all(&parent).await?;

        let mut body = self.client.fetch_object(&self.bucket_name, key).await?;

        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let mut file = File::create(&tmp_path).await?;
        let mut digest = Context::new();

        while let Some(chunk_res) = body.next().await {
            let chunk = match chunk_res {
                Ok(chunk) => chunk,
                Err(err) => {
                    let _ = fs::remove_file(&tmp_path).await;
                    return Err(TransferCause::Io(err));
                }
            };
            digest.consume(&chunk);
            if let Err(err) = file.write_all(&chunk).await {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(TransferCause::Io(err));
            }
        }
        if let Err(err) = file.flush().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(TransferCause::Io(err));
        }
        if let Err(err) = file.sync_all().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(TransferCause::Io(err));
        }
        drop(file);

        if let Err(err) = fs::rename(&tmp_path, file_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(TransferCause::Io(err));
        }

        Ok(Written {
            local_etag: format!("{:x}", digest.compute()),
        })
    }
}
