//! Chunked persistence of completed transfer records.

use super::{
    catalog::{RecordSink, WriteMode},
    error::SyncError,
};
use crate::models::file_record::FileRecord;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Counters reported once the persister has drained its channel.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PersistReport {
    pub records: u64,
    pub rows_written: u64,
    pub chunks: u64,
}

/// Single consumer that accumulates records and writes them in chunks.
pub struct BatchPersister {
    sink: Arc<dyn RecordSink>,
    chunk_size: usize,
    mode: WriteMode,
}

impl BatchPersister {
    pub fn new(sink: Arc<dyn RecordSink>, chunk_size: usize, mode: WriteMode) -> Self {
        Self {
            sink,
            chunk_size: chunk_size.max(1),
            mode,
        }
    }

    /// Drain `rx` until every sender is gone, flushing each full chunk and
    /// the final partial one. Returns on the first chunk that still fails
    /// after one retry; dropping `rx` then tells the producer to stop.
    pub async fn run(self, mut rx: mpsc::Receiver<FileRecord>) -> Result<PersistReport, SyncError> {
        let mut pending = Vec::with_capacity(self.chunk_size);
        let mut report = PersistReport::default();

        while let Some(record) = rx.recv().await {
            pending.push(record);
            if pending.len() >= self.chunk_size {
                self.flush(&mut pending, &mut report).await?;
            }
        }
        if !pending.is_empty() {
            self.flush(&mut pending, &mut report).await?;
        }

        Ok(report)
    }

    async fn flush(
        &self,
        pending: &mut Vec<FileRecord>,
        report: &mut PersistReport,
    ) -> Result<(), SyncError> {
        let rows = match self.sink.write_records(pending, self.mode).await {
            Ok(rows) => rows,
            Err(err) => {
                warn!(records = pending.len(), error = %err, "chunk write failed, retrying once");
                self.sink
                    .write_records(pending, self.mode)
                    .await
                    .map_err(SyncError::Persistence)?
            }
        };

        report.records += pending.len() as u64;
        report.rows_written += rows;
        report.chunks += 1;
        debug!(records = pending.len(), rows, chunk = report.chunks, "flushed chunk");
        pending.clear();
        Ok(())
    }
}
