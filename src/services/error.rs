//! Error taxonomy of a backup run.

use super::{catalog::CatalogError, remote::RemoteError};
use serde::Serialize;
use std::{fmt, io};
use thiserror::Error;

/// Why a single object could not be mirrored.
#[derive(Debug, Error)]
pub enum TransferCause {
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error("writing local copy: {0}")]
    Io(#[from] io::Error),
    #[error("key would escape the mirror root")]
    UnsafeKey,
}

impl TransferCause {
    /// Network and disk failures may succeed on another attempt.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::UnsafeKey)
    }
}

/// Per-object failure. Contained by the download coordinator: logged,
/// counted, and excluded from persistence.
#[derive(Debug, Error)]
#[error("transfer of `{key}` failed after {attempts} attempt(s): {source}")]
pub struct ObjectTransferError {
    pub key: String,
    pub attempts: u32,
    #[source]
    pub source: TransferCause,
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("bucket {0} is not registered")]
    BucketNotFound(i64),
    #[error("region `{region}` of bucket `{bucket}` has no known endpoint")]
    UnknownRegion { bucket: String, region: String },
    #[error("location lookup for bucket `{bucket}` failed: {source}")]
    Location {
        bucket: String,
        #[source]
        source: RemoteError,
    },
    #[error("listing bucket `{bucket}` failed: {source}")]
    Listing {
        bucket: String,
        #[source]
        source: RemoteError,
    },
    #[error("bucket discovery failed: {0}")]
    Discovery(#[source] RemoteError),
    #[error(transparent)]
    ObjectTransfer(#[from] ObjectTransferError),
    #[error("persisting file records failed: {0}")]
    Persistence(#[source] CatalogError),
    #[error("updating bucket ledger failed: {0}")]
    LedgerUpdate(#[source] CatalogError),
    #[error("persister task ended abnormally: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Stage a fatal failure happened in, in run order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunStage {
    Resolving,
    Listing,
    Diffing,
    Persisting,
    LedgerUpdate,
}

impl fmt::Display for RunStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Resolving => "resolving",
            Self::Listing => "listing",
            Self::Diffing => "diffing",
            Self::Persisting => "persisting",
            Self::LedgerUpdate => "ledger-update",
        };
        f.write_str(name)
    }
}

/// A fatal run failure with the context an operator needs.
#[derive(Debug, Error)]
#[error("backup of bucket {bucket_id} failed while {stage}: {source}")]
pub struct RunError {
    pub bucket_id: i64,
    pub stage: RunStage,
    #[source]
    pub source: SyncError,
}

/// Attach run context to a stage result.
pub trait AtStage<T> {
    fn at(self, bucket_id: i64, stage: RunStage) -> Result<T, RunError>;
}

impl<T, E: Into<SyncError>> AtStage<T> for Result<T, E> {
    fn at(self, bucket_id: i64, stage: RunStage) -> Result<T, RunError> {
        self.map_err(|err| RunError {
            bucket_id,
            stage,
            source: err.into(),
        })
    }
}
