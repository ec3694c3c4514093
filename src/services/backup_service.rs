//! src/services/backup_service.rs
//!
//! BackupEngine: runs one bucket backup end to end,
//! resolve region -> load snapshot -> list (lazily) -> diff -> download with
//! bounded concurrency -> persist in chunks -> update the ledger.
//!
//! A single coordinator loop owns the listing stream, the set of in-flight
//! downloads and the progress counters. Completed records go over a bounded
//! channel to one persister task, so a slow database slows the downloads
//! instead of piling records up in memory.

use super::{
    catalog::{Catalog, CatalogError, WriteMode},
    diff::{Decision, DiffEngine},
    downloader::{Downloader, TransferResult},
    error::{AtStage, RunError, RunStage, SyncError},
    lister::list_objects,
    persister::BatchPersister,
    progress::{ProgressStore, ProgressTracker},
    regions::RegionTable,
    remote::{RemoteConnector, RemoteStore},
    resolver::EndpointResolver,
    retry::RetryPolicy,
};
use crate::models::{bucket::Bucket, file_record::FileRecord};
use chrono::Utc;
use futures::{FutureExt, StreamExt, future::BoxFuture, stream::FuturesUnordered};
use serde::Serialize;
use std::{path::PathBuf, sync::Arc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const DEFAULT_CHUNK_SIZE: usize = 500;
pub const DEFAULT_MAX_TRANSFERS: usize = 10;

/// Tunables of a run.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub mirror_root: PathBuf,
    /// Records per bulk write; also the capacity of the persister channel.
    pub chunk_size: usize,
    /// Upper bound on downloads in flight.
    pub max_transfers: usize,
    pub write_mode: WriteMode,
    pub retry: RetryPolicy,
}

impl EngineSettings {
    pub fn new(mirror_root: impl Into<PathBuf>) -> Self {
        Self {
            mirror_root: mirror_root.into(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_transfers: DEFAULT_MAX_TRANSFERS,
            write_mode: WriteMode::InsertOrIgnore,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Completed,
    /// Cancelled; in-flight transfers were drained and persisted.
    Stopped,
}

/// Outcome of a run that did not fail.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub status: RunStatus,
    pub bucket_name: String,
    /// Objects seen in the listing, whether transferred, skipped or failed.
    pub files_processed: u64,
    pub listed: u64,
    pub transferred: u64,
    pub skipped: u64,
    pub failed: u64,
    pub batch_number: i64,
}

/// Result of the discover-and-enqueue operation.
#[derive(Debug, Clone, Serialize)]
pub struct DiscoveryReport {
    pub status: &'static str,
    pub discovered: usize,
    pub registered: usize,
    pub bucket_ids: Vec<i64>,
}

/// Counters kept across stages so a failed run can still close its batch.
#[derive(Debug, Default, Clone, Copy)]
struct RunCounters {
    listed: u64,
    transferred: u64,
    skipped: u64,
    failed: u64,
    persisted: u64,
}

/// Runs bucket backups. Cheap to clone; every field is shared.
#[derive(Clone)]
pub struct BackupEngine {
    catalog: Catalog,
    regions: Arc<RegionTable>,
    connector: Arc<dyn RemoteConnector>,
    progress: Arc<dyn ProgressStore>,
    settings: Arc<EngineSettings>,
}

impl BackupEngine {
    pub fn new(
        catalog: Catalog,
        regions: Arc<RegionTable>,
        connector: Arc<dyn RemoteConnector>,
        progress: Arc<dyn ProgressStore>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            catalog,
            regions,
            connector,
            progress,
            settings: Arc::new(settings),
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn progress_store(&self) -> &Arc<dyn ProgressStore> {
        &self.progress
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Mirror one registered bucket.
    ///
    /// Fatal failures are recorded in the ledger (`failed_backups + 1`) and
    /// returned with the stage they happened in. Cancelling `cancel` stops
    /// new downloads; in-flight ones finish and are persisted, and the run
    /// reports `RunStatus::Stopped`. The progress entry is deleted on every
    /// outcome.
    pub async fn run_bucket_backup(
        &self,
        bucket_id: i64,
        cancel: &CancellationToken,
    ) -> Result<RunReport, RunError> {
        let bucket = self
            .catalog
            .bucket(bucket_id)
            .await
            .map_err(|err| match err {
                CatalogError::BucketNotFound(id) => SyncError::BucketNotFound(id),
                other => SyncError::Persistence(other),
            })
            .at(bucket_id, RunStage::Resolving)?;

        info!(bucket = %bucket.label(), bucket_id, "Starting backup");

        let tracker = ProgressTracker::new(self.progress.clone(), bucket.id);
        let mut counters = RunCounters::default();
        let mut batch = None;
        let outcome = self
            .execute(&bucket, &tracker, cancel, &mut counters, &mut batch)
            .await;
        tracker.clear().await;

        match outcome {
            Ok((batch_number, status)) => {
                self.close_batch(
                    bucket.id,
                    batch_number,
                    &counters,
                    status == RunStatus::Completed,
                )
                .await;

                info!(
                    bucket = %bucket.name,
                    bucket_id,
                    batch_number,
                    ?status,
                    listed = counters.listed,
                    transferred = counters.transferred,
                    skipped = counters.skipped,
                    failed = counters.failed,
                    "Backup finished"
                );

                Ok(RunReport {
                    status,
                    bucket_name: bucket.name,
                    files_processed: counters.listed,
                    listed: counters.listed,
                    transferred: counters.transferred,
                    skipped: counters.skipped,
                    failed: counters.failed,
                    batch_number,
                })
            }
            Err(err) => {
                error!(
                    bucket = %bucket.name,
                    bucket_id,
                    stage = %err.stage,
                    error = %err.source,
                    "Backup failed"
                );
                if let Err(ledger_err) = self.catalog.record_failure(bucket.id).await {
                    error!(bucket_id, error = %ledger_err, "could not record failed backup");
                }
                if let Some(batch_number) = batch {
                    self.close_batch(bucket.id, batch_number, &counters, false)
                        .await;
                }
                Err(err)
            }
        }
    }

    /// Everything after the bucket lookup: open the batch, sync, and update
    /// the ledger. Any error returned here is recorded as a failed run by
    /// the caller; `batch` is set as soon as the batch exists so the caller
    /// can close it.
    async fn execute(
        &self,
        bucket: &Bucket,
        tracker: &ProgressTracker,
        cancel: &CancellationToken,
        counters: &mut RunCounters,
        batch: &mut Option<i64>,
    ) -> Result<(i64, RunStatus), RunError> {
        let batch_number = self
            .catalog
            .open_batch(bucket.id)
            .await
            .map_err(SyncError::Persistence)
            .at(bucket.id, RunStage::Resolving)?;
        *batch = Some(batch_number);
        debug!(bucket_id = bucket.id, batch_number, "opened backup batch");

        let status = self
            .sync_bucket(bucket, batch_number, tracker, cancel, counters)
            .await?;

        match status {
            RunStatus::Completed => {
                self.catalog
                    .record_success(bucket.id, Utc::now())
                    .await
                    .map_err(SyncError::LedgerUpdate)
                    .at(bucket.id, RunStage::LedgerUpdate)?;
                if let Err(err) = self.catalog.refresh_stats(bucket.id).await {
                    warn!(bucket_id = bucket.id, error = %err, "could not refresh bucket stats");
                }
            }
            RunStatus::Stopped => {
                self.catalog
                    .record_stopped(bucket.id)
                    .await
                    .map_err(SyncError::LedgerUpdate)
                    .at(bucket.id, RunStage::LedgerUpdate)?;
            }
        }
        Ok((batch_number, status))
    }

    /// List the buckets visible at the anchor endpoint, register the ones
    /// the catalog has not seen, and hand every bucket to `enqueue`.
    pub async fn run_all_buckets_backup<F>(&self, mut enqueue: F) -> Result<DiscoveryReport, SyncError>
    where
        F: FnMut(&Bucket),
    {
        let resolver = EndpointResolver::new(&self.regions, self.connector.as_ref());
        let names = resolver
            .anchor_client()
            .list_buckets()
            .await
            .map_err(SyncError::Discovery)?;

        let mut report = DiscoveryReport {
            status: "all triggered",
            discovered: names.len(),
            registered: 0,
            bucket_ids: Vec::with_capacity(names.len()),
        };

        for name in names {
            let (bucket, created) = self
                .catalog
                .register_bucket(&name)
                .await
                .map_err(SyncError::Persistence)?;
            if created {
                info!(bucket = %bucket.name, bucket_id = bucket.id, "Registered new bucket");
                report.registered += 1;
            }
            enqueue(&bucket);
            report.bucket_ids.push(bucket.id);
        }

        info!(
            discovered = report.discovered,
            registered = report.registered,
            "Global backup triggered"
        );
        Ok(report)
    }

    async fn sync_bucket(
        &self,
        bucket: &Bucket,
        batch_number: i64,
        tracker: &ProgressTracker,
        cancel: &CancellationToken,
        counters: &mut RunCounters,
    ) -> Result<RunStatus, RunError> {
        let bucket_id = bucket.id;
        let resolver = EndpointResolver::new(&self.regions, self.connector.as_ref());
        let resolved = resolver
            .resolve(&bucket.name)
            .await
            .at(bucket_id, RunStage::Resolving)?;
        debug!(
            bucket_id,
            region = %resolved.region,
            endpoint = %resolved.endpoint,
            "listing from regional endpoint"
        );

        let snapshot = self
            .catalog
            .load_etag_snapshot(bucket_id)
            .await
            .map_err(SyncError::Persistence)
            .at(bucket_id, RunStage::Diffing)?;
        let mut diff = DiffEngine::new(snapshot);

        let downloader = Downloader::new(
            resolved.client.clone(),
            bucket_id,
            bucket.name.as_str(),
            self.settings.mirror_root.clone(),
            batch_number,
            self.settings.retry,
        );

        let chunk_size = self.settings.chunk_size.max(1);
        let (tx, rx) = mpsc::channel(chunk_size);
        let persister = BatchPersister::new(
            Arc::new(self.catalog.clone()),
            chunk_size,
            self.settings.write_mode,
        );
        let persist_task = tokio::spawn(persister.run(rx));

        let transferred = self
            .transfer_all(
                bucket,
                &resolved.client,
                &downloader,
                &mut diff,
                tx,
                tracker,
                cancel,
                counters,
            )
            .await;
        counters.listed = diff.total_listed();

        let persisted = match persist_task.await {
            Ok(result) => result.at(bucket_id, RunStage::Persisting),
            Err(join_err) => Err(SyncError::from(join_err)).at(bucket_id, RunStage::Persisting),
        };

        match (transferred, persisted) {
            (Ok(status), Ok(report)) => {
                counters.persisted = report.records;
                Ok(status)
            }
            (Ok(_), Err(err)) => Err(err),
            (Err(err), Ok(report)) => {
                counters.persisted = report.records;
                Err(err)
            }
            (Err(err), Err(persist_err)) => {
                warn!(bucket_id, error = %persist_err, "persister also failed");
                Err(err)
            }
        }
    }

    /// The coordinator loop. Pulls the next listed object only while fewer
    /// than `max_transfers` downloads are in flight; stops pulling once
    /// `cancel` fires and drains what is already running.
    ///
    /// A listing error or a dead persister also stops the pulling, but the
    /// in-flight downloads are still awaited so none is dropped halfway
    /// through writing its temp file.
    #[allow(clippy::too_many_arguments)]
    async fn transfer_all(
        &self,
        bucket: &Bucket,
        client: &Arc<dyn RemoteStore>,
        downloader: &Downloader,
        diff: &mut DiffEngine,
        tx: mpsc::Sender<FileRecord>,
        tracker: &ProgressTracker,
        cancel: &CancellationToken,
        counters: &mut RunCounters,
    ) -> Result<RunStatus, RunError> {
        let bucket_id = bucket.id;
        let max_transfers = self.settings.max_transfers.max(1);
        let mut listing = list_objects(client.clone(), bucket.name.clone());
        let mut in_flight: FuturesUnordered<BoxFuture<'_, TransferResult>> = FuturesUnordered::new();
        let mut listing_open = true;
        let mut persister_gone = false;
        let mut fatal: Option<RunError> = None;
        let mut status = RunStatus::Completed;

        loop {
            tokio::select! {
                biased;

                Some(outcome) = in_flight.next(), if !in_flight.is_empty() => match outcome {
                    Ok(record) => {
                        counters.transferred += 1;
                        tracker
                            .publish(
                                diff.total_listed(),
                                diff.already_complete() + counters.transferred,
                                record.key(),
                            )
                            .await;
                        if !persister_gone && tx.send(record).await.is_err() {
                            // its error is reported by the caller
                            warn!(bucket_id, in_flight = in_flight.len(), "persister stopped, draining in-flight transfers");
                            persister_gone = true;
                            listing_open = false;
                        }
                    }
                    Err(failure) => {
                        counters.failed += 1;
                        warn!(bucket_id, key = %failure.key, error = %failure, "Object transfer failed");
                    }
                },

                _ = cancel.cancelled(), if listing_open => {
                    info!(bucket_id, in_flight = in_flight.len(), "Stop requested, draining in-flight transfers");
                    listing_open = false;
                    status = RunStatus::Stopped;
                }

                next = listing.next(), if listing_open && in_flight.len() < max_transfers => match next {
                    Some(Ok(object)) => match diff.classify(&object) {
                        Decision::Transfer => in_flight.push(downloader.transfer(object).boxed()),
                        Decision::Unchanged | Decision::Placeholder => counters.skipped += 1,
                    },
                    Some(Err(err)) => {
                        warn!(bucket_id, in_flight = in_flight.len(), "listing failed, draining in-flight transfers");
                        fatal = Some(RunError { bucket_id, stage: RunStage::Listing, source: err });
                        listing_open = false;
                    }
                    None => listing_open = false,
                },

                else => break,
            }
        }

        fatal.map_or(Ok(status), Err)
    }

    async fn close_batch(&self, bucket_id: i64, batch_number: i64, counters: &RunCounters, completed: bool) {
        if let Err(err) = self
            .catalog
            .close_batch(
                bucket_id,
                batch_number,
                counters.persisted,
                counters.failed,
                completed,
            )
            .await
        {
            warn!(bucket_id, batch_number, error = %err, "could not close backup batch");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{
        catalog::tests::{memory_catalog, stored_records},
        progress::{MemoryProgressStore, Progress, progress_key},
        remote::testing::{FakeConnector, FakeRemote},
    };
    use async_trait::async_trait;
    use std::{
        sync::{
            Mutex,
            atomic::{AtomicUsize, Ordering},
        },
        time::Duration,
    };

    /// Wraps the in-memory store and remembers every published value.
    #[derive(Default)]
    struct RecordingStore {
        inner: MemoryProgressStore,
        published: Mutex<Vec<Progress>>,
        deletes: AtomicUsize,
    }

    #[async_trait]
    impl ProgressStore for RecordingStore {
        async fn set(&self, key: &str, value: Progress, ttl: Duration) {
            self.published.lock().unwrap().push(value.clone());
            self.inner.set(key, value, ttl).await;
        }

        async fn get(&self, key: &str) -> Option<Progress> {
            self.inner.get(key).await
        }

        async fn delete(&self, key: &str) {
            self.deletes.fetch_add(1, Ordering::SeqCst);
            self.inner.delete(key).await;
        }
    }

    struct Harness {
        engine: BackupEngine,
        catalog: Catalog,
        connector: Arc<FakeConnector>,
        progress: Arc<RecordingStore>,
        mirror: tempfile::TempDir,
    }

    impl Harness {
        fn remote(&self) -> &FakeRemote {
            &self.connector.remote
        }
    }

    fn regions() -> Arc<RegionTable> {
        Arc::new(
            RegionTable::new(
                [
                    ("us-east-1", "https://s3.wasabisys.com"),
                    ("eu-west-1", "https://s3.eu-west-1.wasabisys.com"),
                ],
                "us-east-1",
            )
            .unwrap(),
        )
    }

    fn no_wait() -> RetryPolicy {
        RetryPolicy {
            attempts: 2,
            base_delay_ms: 0,
            max_delay_ms: 0,
        }
    }

    async fn harness_with(remote: FakeRemote, tune: impl FnOnce(&mut EngineSettings)) -> Harness {
        let catalog = memory_catalog().await;
        let connector = Arc::new(FakeConnector::new(remote));
        let progress = Arc::new(RecordingStore::default());
        let mirror = tempfile::tempdir().unwrap();

        let mut settings = EngineSettings::new(mirror.path());
        settings.retry = no_wait();
        tune(&mut settings);

        let engine = BackupEngine::new(
            catalog.clone(),
            regions(),
            connector.clone(),
            progress.clone(),
            settings,
        );
        Harness {
            engine,
            catalog,
            connector,
            progress,
            mirror,
        }
    }

    async fn harness(remote: FakeRemote) -> Harness {
        harness_with(remote, |_| {}).await
    }

    async fn register(h: &Harness, name: &str) -> i64 {
        h.catalog.register_bucket(name).await.unwrap().0.id
    }

    /// Make the catalog reject a statement, the way a locked or broken
    /// database would.
    async fn install_trigger(h: &Harness, sql: &str) {
        sqlx::query(sql).execute(&*h.catalog.db).await.unwrap();
    }

    /// Half-written downloads left anywhere under the mirror root.
    fn temp_files(root: &std::path::Path) -> Vec<PathBuf> {
        let mut found = Vec::new();
        let mut dirs = vec![root.to_path_buf()];
        while let Some(dir) = dirs.pop() {
            for entry in std::fs::read_dir(&dir).unwrap() {
                let path = entry.unwrap().path();
                if path.is_dir() {
                    dirs.push(path);
                } else if path
                    .file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| name.starts_with(".tmp-"))
                {
                    found.push(path);
                }
            }
        }
        found
    }

    #[tokio::test]
    async fn first_backup_mirrors_every_object() {
        let h = harness(FakeRemote::new().with_bucket("alpha", Some("eu-west-1"))).await;
        for (key, body) in [("a.txt", "one"), ("dir/b.txt", "two"), ("dir/c.txt", "three")] {
            h.remote().put("alpha", key, &format!("etag-{key}"), body.as_bytes());
        }
        let id = register(&h, "alpha").await;

        let report = h
            .engine
            .run_bucket_backup(id, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(report.transferred, 3);
        assert_eq!(report.files_processed, 3);
        assert_eq!(report.batch_number, 1);

        let rows = stored_records(&h.catalog, id).await;
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|r| r.status == crate::models::file_record::FileStatus::Synced));
        assert!(rows.iter().all(|r| r.batch_id == 1));
        assert_eq!(
            std::fs::read(h.mirror.path().join("alpha").join("dir").join("c.txt")).unwrap(),
            b"three"
        );

        let bucket = h.catalog.bucket(id).await.unwrap();
        assert_eq!(bucket.successful_backups, 1);
        assert_eq!(bucket.failed_backups, 0);
        assert!(bucket.last_backup_completed);
        assert!(bucket.last_backup_at.is_some());
        assert_eq!(bucket.total_files, 3);
        assert_eq!(bucket.total_size, 11);

        // the eu-west-1 endpoint served the listing and the downloads
        let connections = h.connector.connections.lock().unwrap().clone();
        assert!(connections.contains(&(
            "eu-west-1".to_string(),
            "https://s3.eu-west-1.wasabisys.com".to_string()
        )));

        assert_eq!(h.progress.published.lock().unwrap().len(), 3);
        assert_eq!(h.progress.get(&progress_key(id)).await, None);
        assert_eq!(h.progress.deletes.load(Ordering::SeqCst), 1);

        let batch = &h.catalog.list_batches(id).await.unwrap()[0];
        assert!(batch.completed);
        assert_eq!(batch.successful_files, 3);
        assert_eq!(batch.failed_files, 0);
    }

    #[tokio::test]
    async fn incremental_backup_only_transfers_changes() {
        let h = harness(FakeRemote::new().with_bucket("alpha", Some("eu-west-1"))).await;
        for key in ["a", "b", "c"] {
            h.remote().put("alpha", key, "v1", key.as_bytes());
        }
        let id = register(&h, "alpha").await;
        let cancel = CancellationToken::new();
        h.engine.run_bucket_backup(id, &cancel).await.unwrap();

        h.remote().put("alpha", "b", "v2", b"b2");
        h.remote().put("alpha", "d", "v1", b"d");
        h.remote().remove("alpha", "c");
        let downloads_before = h.remote().downloads();

        let report = h.engine.run_bucket_backup(id, &cancel).await.unwrap();
        assert_eq!(report.transferred, 2);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.batch_number, 2);
        assert_eq!(h.remote().downloads() - downloads_before, 2);

        let rows = stored_records(&h.catalog, id).await;
        assert_eq!(rows.len(), 4);
        // insert-or-ignore keeps the first recorded etag
        let b = rows.iter().find(|r| r.key() == "b").unwrap();
        assert_eq!(b.etag, "v1");
        let d = rows.iter().find(|r| r.key() == "d").unwrap();
        assert_eq!(d.batch_id, 2);

        let bucket = h.catalog.bucket(id).await.unwrap();
        assert_eq!(bucket.successful_backups, 2);
    }

    #[tokio::test]
    async fn upsert_mode_refreshes_changed_rows() {
        let h = harness_with(FakeRemote::new().with_bucket("alpha", None), |s| {
            s.write_mode = WriteMode::Upsert;
        })
        .await;
        h.remote().put("alpha", "b", "v1", b"b");
        let id = register(&h, "alpha").await;
        let cancel = CancellationToken::new();
        h.engine.run_bucket_backup(id, &cancel).await.unwrap();

        h.remote().put("alpha", "b", "v2", b"b2");
        h.engine.run_bucket_backup(id, &cancel).await.unwrap();

        let rows = stored_records(&h.catalog, id).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].etag, "v2");
        assert_eq!(rows[0].batch_id, 2);
    }

    #[tokio::test]
    async fn unchanged_bucket_transfers_nothing() {
        let h = harness(FakeRemote::new().with_bucket("alpha", None)).await;
        for key in ["a", "b", "c", "d", "e"] {
            h.remote().put("alpha", key, "v1", b"x");
        }
        let id = register(&h, "alpha").await;
        let cancel = CancellationToken::new();
        h.engine.run_bucket_backup(id, &cancel).await.unwrap();
        let downloads = h.remote().downloads();

        let report = h.engine.run_bucket_backup(id, &cancel).await.unwrap();
        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(report.transferred, 0);
        assert_eq!(report.skipped, 5);
        assert_eq!(report.listed, 5);
        // every listed object counts, transferred or not
        assert_eq!(report.files_processed, 5);
        assert_eq!(h.remote().downloads(), downloads);
        assert_eq!(stored_records(&h.catalog, id).await.len(), 5);
    }

    #[tokio::test]
    async fn directory_placeholders_are_skipped() {
        let h = harness(FakeRemote::new().with_bucket("alpha", None)).await;
        h.remote().put("alpha", "photos/", "d41d8cd98f00b204e9800998ecf8427e", b"");
        h.remote().put("alpha", "photos/a.jpg", "e1", b"jpeg");
        let id = register(&h, "alpha").await;

        let report = h
            .engine
            .run_bucket_backup(id, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.transferred, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(h.remote().downloads(), 1);
    }

    #[tokio::test]
    async fn unknown_region_fails_before_listing() {
        let h = harness(FakeRemote::new().with_bucket("gamma", Some("mars-1"))).await;
        h.remote().put("gamma", "a", "v1", b"x");
        let id = register(&h, "gamma").await;

        let err = h
            .engine
            .run_bucket_backup(id, &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(err.bucket_id, id);
        assert_eq!(err.stage, RunStage::Resolving);
        assert!(matches!(err.source, SyncError::UnknownRegion { ref region, .. } if region == "mars-1"));
        assert_eq!(h.remote().list_calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.remote().downloads(), 0);

        let bucket = h.catalog.bucket(id).await.unwrap();
        assert_eq!(bucket.failed_backups, 1);
        assert_eq!(bucket.successful_backups, 0);
        assert!(!bucket.last_backup_completed);
        assert_eq!(h.progress.deletes.load(Ordering::SeqCst), 1);

        let batch = &h.catalog.list_batches(id).await.unwrap()[0];
        assert!(!batch.completed);
        assert!(batch.finished_at.is_some());
    }

    #[tokio::test]
    async fn unregistered_bucket_is_reported() {
        let h = harness(FakeRemote::new()).await;
        let err = h
            .engine
            .run_bucket_backup(404, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err.source, SyncError::BucketNotFound(404)));
        assert_eq!(h.remote().location_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn listing_failure_fails_the_run() {
        let h = harness(FakeRemote::new().with_bucket("alpha", None)).await;
        h.remote().put("alpha", "a", "v1", b"x");
        h.remote().break_listing("alpha");
        let id = register(&h, "alpha").await;

        let err = h
            .engine
            .run_bucket_backup(id, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.stage, RunStage::Listing);
        assert!(matches!(err.source, SyncError::Listing { .. }));

        let bucket = h.catalog.bucket(id).await.unwrap();
        assert_eq!(bucket.failed_backups, 1);
        assert!(!bucket.last_backup_completed);
    }

    #[tokio::test]
    async fn ledger_failure_is_recorded_as_failed_run() {
        let h = harness(FakeRemote::new().with_bucket("alpha", None)).await;
        for key in ["a", "b"] {
            h.remote().put("alpha", key, "v1", b"x");
        }
        let id = register(&h, "alpha").await;
        install_trigger(
            &h,
            "CREATE TRIGGER reject_success BEFORE UPDATE OF successful_backups ON buckets
             BEGIN SELECT RAISE(ABORT, 'ledger unavailable'); END",
        )
        .await;

        let err = h
            .engine
            .run_bucket_backup(id, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.stage, RunStage::LedgerUpdate);
        assert!(matches!(err.source, SyncError::LedgerUpdate(_)));

        let bucket = h.catalog.bucket(id).await.unwrap();
        assert_eq!(bucket.successful_backups, 0);
        assert_eq!(bucket.failed_backups, 1);
        assert!(!bucket.last_backup_completed);
        assert!(bucket.last_backup_at.is_none());

        let batch = &h.catalog.list_batches(id).await.unwrap()[0];
        assert!(!batch.completed);
        assert!(batch.finished_at.is_some());
        assert_eq!(h.progress.get(&progress_key(id)).await, None);
    }

    #[tokio::test]
    async fn batch_open_failure_is_recorded_as_failed_run() {
        let h = harness(FakeRemote::new().with_bucket("alpha", None)).await;
        h.remote().put("alpha", "a", "v1", b"x");
        let id = register(&h, "alpha").await;
        install_trigger(
            &h,
            "CREATE TRIGGER reject_batch BEFORE INSERT ON backup_batches
             BEGIN SELECT RAISE(ABORT, 'database is locked'); END",
        )
        .await;

        let err = h
            .engine
            .run_bucket_backup(id, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.stage, RunStage::Resolving);
        assert!(matches!(err.source, SyncError::Persistence(_)));
        assert_eq!(h.remote().list_calls.load(Ordering::SeqCst), 0);

        let bucket = h.catalog.bucket(id).await.unwrap();
        assert_eq!(bucket.failed_backups, 1);
        assert!(!bucket.last_backup_completed);
        assert!(h.catalog.list_batches(id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn persister_failure_fails_the_run_after_draining_downloads() {
        let mut remote = FakeRemote::new().with_bucket("alpha", None);
        remote.chunk_delay = Duration::from_millis(5);
        let h = harness_with(remote, |s| {
            s.chunk_size = 1;
            s.max_transfers = 3;
        })
        .await;
        for i in 0..8 {
            h.remote().put("alpha", &format!("obj-{i}"), "v1", b"twelve bytes");
        }
        let id = register(&h, "alpha").await;
        install_trigger(
            &h,
            "CREATE TRIGGER reject_records BEFORE INSERT ON file_records
             BEGIN SELECT RAISE(ABORT, 'disk I/O error'); END",
        )
        .await;

        let err = h
            .engine
            .run_bucket_backup(id, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.stage, RunStage::Persisting);
        assert!(matches!(err.source, SyncError::Persistence(_)));
        assert!(stored_records(&h.catalog, id).await.is_empty());

        let bucket = h.catalog.bucket(id).await.unwrap();
        assert_eq!(bucket.failed_backups, 1);
        assert_eq!(bucket.successful_backups, 0);
        assert!(!bucket.last_backup_completed);
        assert!(!h.catalog.list_batches(id).await.unwrap()[0].completed);

        assert_eq!(temp_files(h.mirror.path()), Vec::<PathBuf>::new());
    }

    #[tokio::test]
    async fn listing_failure_mid_run_finishes_started_downloads() {
        let mut remote = FakeRemote::new().with_bucket("alpha", None);
        remote.chunk_delay = Duration::from_millis(10);
        let h = harness(remote).await;
        for key in ["a", "b", "c", "d", "e", "f"] {
            h.remote().put("alpha", key, "v1", b"abcdefgh");
        }
        // first page (a, b) is served, the second one fails
        h.remote().fail_listing_after("alpha", 1);
        let id = register(&h, "alpha").await;

        let err = h
            .engine
            .run_bucket_backup(id, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.stage, RunStage::Listing);
        assert!(matches!(err.source, SyncError::Listing { .. }));

        assert_eq!(h.remote().downloads(), 2);
        assert_eq!(temp_files(h.mirror.path()), Vec::<PathBuf>::new());
        for key in ["a", "b"] {
            assert_eq!(
                std::fs::read(h.mirror.path().join("alpha").join(key)).unwrap(),
                b"abcdefgh"
            );
        }
        assert_eq!(stored_records(&h.catalog, id).await.len(), 2);
        assert_eq!(h.catalog.bucket(id).await.unwrap().failed_backups, 1);
    }

    #[tokio::test]
    async fn failed_object_does_not_abort_the_run() {
        let h = harness(FakeRemote::new().with_bucket("alpha", None)).await;
        for key in ["a", "b", "c", "d"] {
            h.remote().put("alpha", key, "v1", b"x");
        }
        h.remote().fail_downloads("c", 10);
        let id = register(&h, "alpha").await;

        let report = h
            .engine
            .run_bucket_backup(id, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(report.transferred, 3);
        assert_eq!(report.failed, 1);

        let rows = stored_records(&h.catalog, id).await;
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|r| r.key() != "c"));

        let batch = &h.catalog.list_batches(id).await.unwrap()[0];
        assert_eq!(batch.successful_files, 3);
        assert_eq!(batch.failed_files, 1);

        // the failed object is picked up again next time
        h.remote().fail_downloads("c", 0);
        let report = h
            .engine
            .run_bucket_backup(id, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.transferred, 1);
        assert_eq!(stored_records(&h.catalog, id).await.len(), 4);
    }

    #[tokio::test]
    async fn downloads_stay_within_the_concurrency_bound() {
        let mut remote = FakeRemote::new().with_bucket("alpha", None);
        remote.page_size = 7;
        remote.download_delay = Duration::from_millis(5);
        let h = harness_with(remote, |s| {
            s.max_transfers = 4;
            s.chunk_size = 3;
        })
        .await;
        for i in 0..25 {
            h.remote().put("alpha", &format!("obj-{i:02}"), "v1", b"payload");
        }
        let id = register(&h, "alpha").await;

        let report = h
            .engine
            .run_bucket_backup(id, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.transferred, 25);
        assert_eq!(stored_records(&h.catalog, id).await.len(), 25);

        let peak = h.remote().max_active.load(Ordering::SeqCst);
        assert!(peak <= 4, "peak concurrency {peak}");
        assert!(peak > 1, "downloads never overlapped");
    }

    #[tokio::test]
    async fn progress_is_monotonic() {
        let h = harness(FakeRemote::new().with_bucket("alpha", None)).await;
        for key in ["a", "b", "c", "d", "e"] {
            h.remote().put("alpha", key, "v1", b"x");
        }
        let id = register(&h, "alpha").await;
        h.engine
            .run_bucket_backup(id, &CancellationToken::new())
            .await
            .unwrap();

        let published = h.progress.published.lock().unwrap().clone();
        assert_eq!(published.len(), 5);
        assert!(published.windows(2).all(|w| w[0].done <= w[1].done));
        assert!(published.iter().all(|p| p.done <= p.total));
        assert_eq!(published.last().unwrap().done, 5);
    }

    #[tokio::test]
    async fn cancelled_run_stops_without_counting_as_success() {
        let h = harness(FakeRemote::new().with_bucket("alpha", None)).await;
        for key in ["a", "b", "c"] {
            h.remote().put("alpha", key, "v1", b"x");
        }
        let id = register(&h, "alpha").await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = h.engine.run_bucket_backup(id, &cancel).await.unwrap();
        assert_eq!(report.status, RunStatus::Stopped);
        assert_eq!(h.remote().downloads(), 0);

        let bucket = h.catalog.bucket(id).await.unwrap();
        assert_eq!(bucket.successful_backups, 0);
        assert_eq!(bucket.failed_backups, 0);
        assert!(!bucket.last_backup_completed);
        assert_eq!(h.progress.get(&progress_key(id)).await, None);
        assert!(!h.catalog.list_batches(id).await.unwrap()[0].completed);
    }

    #[tokio::test]
    async fn cancel_mid_run_persists_in_flight_transfers() {
        let mut remote = FakeRemote::new().with_bucket("alpha", None);
        remote.download_delay = Duration::from_millis(20);
        let h = harness_with(remote, |s| s.max_transfers = 2).await;
        for i in 0..20 {
            h.remote().put("alpha", &format!("k{i:02}"), "v1", b"x");
        }
        let id = register(&h, "alpha").await;

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            trigger.cancel();
        });

        let report = h.engine.run_bucket_backup(id, &cancel).await.unwrap();
        assert_eq!(report.status, RunStatus::Stopped);
        assert!(report.transferred < 20);
        assert_eq!(report.transferred as usize, h.remote().downloads());
        assert_eq!(
            stored_records(&h.catalog, id).await.len() as u64,
            report.transferred
        );
        assert_eq!(report.files_processed, report.listed);
    }

    #[tokio::test]
    async fn discovery_registers_and_enqueues_every_bucket() {
        let h = harness(
            FakeRemote::new()
                .with_bucket("alpha", None)
                .with_bucket("beta", Some("eu-west-1")),
        )
        .await;
        let alpha = register(&h, "alpha").await;

        let mut enqueued = Vec::new();
        let report = h
            .engine
            .run_all_buckets_backup(|bucket| enqueued.push(bucket.name.clone()))
            .await
            .unwrap();

        assert_eq!(report.status, "all triggered");
        assert_eq!(report.discovered, 2);
        assert_eq!(report.registered, 1);
        assert_eq!(enqueued, vec!["alpha".to_string(), "beta".to_string()]);
        assert!(report.bucket_ids.contains(&alpha));
        assert_eq!(h.catalog.list_buckets().await.unwrap().len(), 2);

        // discovery uses the anchor endpoint only
        let connections = h.connector.connections.lock().unwrap().clone();
        assert!(connections.iter().all(|(region, _)| region == "us-east-1"));
    }
}
