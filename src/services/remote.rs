//! src/services/remote.rs
//!
//! Remote object storage seam. `RemoteStore` is the three provider calls a
//! run needs (location lookup, paginated listing, download) plus bucket
//! discovery; `S3Remote` implements it for any S3-compatible endpoint.

use crate::models::remote_object::{RemoteObject, normalize_etag};
use async_trait::async_trait;
use aws_config::Region;
use aws_sdk_s3::config::{Credentials, StalledStreamProtectionConfig};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{StreamExt, stream::BoxStream};
use std::{io, sync::Arc};
use thiserror::Error;
use tokio_util::io::ReaderStream;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Streamed object payload.
pub type ObjectBody = BoxStream<'static, io::Result<Bytes>>;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("{operation} on `{target}` failed: {source}")]
    Request {
        operation: &'static str,
        target: String,
        #[source]
        source: BoxError,
    },
    #[error("{operation} on `{target}` returned an unusable response: {reason}")]
    Malformed {
        operation: &'static str,
        target: String,
        reason: String,
    },
}

impl RemoteError {
    pub fn request(operation: &'static str, target: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::Request {
            operation,
            target: target.into(),
            source: source.into(),
        }
    }
}

/// One page of a bucket listing.
#[derive(Debug, Default)]
pub struct ObjectPage {
    pub objects: Vec<RemoteObject>,
    /// Present only when the provider reports more pages.
    pub next_continuation_token: Option<String>,
}

/// Provider operations used by the sync engine.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Raw location constraint of `bucket`; `None` or empty means the
    /// provider's default region.
    async fn bucket_location(&self, bucket: &str) -> Result<Option<String>, RemoteError>;

    /// Fetch one listing page, starting at `continuation` when given.
    async fn list_page(
        &self,
        bucket: &str,
        continuation: Option<String>,
    ) -> Result<ObjectPage, RemoteError>;

    /// Open a streaming download of one object.
    async fn fetch_object(&self, bucket: &str, key: &str) -> Result<ObjectBody, RemoteError>;

    /// Names of every bucket visible to the credentials.
    async fn list_buckets(&self) -> Result<Vec<String>, RemoteError>;
}

/// Builds region-bound clients.
pub trait RemoteConnector: Send + Sync {
    fn connect(&self, region: &str, endpoint: &str) -> Arc<dyn RemoteStore>;
}

/// Static access-key credentials for an S3-compatible provider.
#[derive(Clone)]
pub struct S3Connector {
    access_key: String,
    secret_key: String,
}

impl S3Connector {
    pub fn new(access_key: impl Into<String>, secret_key: impl Into<String>) -> Self {
        Self {
            access_key: access_key.into(),
            secret_key: secret_key.into(),
        }
    }
}

impl RemoteConnector for S3Connector {
    fn connect(&self, region: &str, endpoint: &str) -> Arc<dyn RemoteStore> {
        let creds = Credentials::new(&self.access_key, &self.secret_key, None, None, "bucket-mirror");

        let config = aws_sdk_s3::Config::builder()
            .endpoint_url(endpoint)
            .region(Region::new(region.to_string()))
            .credentials_provider(creds)
            .force_path_style(true)
            .stalled_stream_protection(StalledStreamProtectionConfig::disabled())
            .build();

        Arc::new(S3Remote {
            client: aws_sdk_s3::Client::from_conf(config),
        })
    }
}

/// `RemoteStore` over the AWS SDK client.
pub struct S3Remote {
    client: aws_sdk_s3::Client,
}

#[async_trait]
impl RemoteStore for S3Remote {
    async fn bucket_location(&self, bucket: &str) -> Result<Option<String>, RemoteError> {
        let output = self
            .client
            .get_bucket_location()
            .bucket(bucket)
            .send()
            .await
            .map_err(|e| RemoteError::request("GetBucketLocation", bucket, e))?;

        Ok(output
            .location_constraint()
            .map(|constraint| constraint.as_str().to_string()))
    }

    async fn list_page(
        &self,
        bucket: &str,
        continuation: Option<String>,
    ) -> Result<ObjectPage, RemoteError> {
        let output = self
            .client
            .list_objects_v2()
            .bucket(bucket)
            .set_continuation_token(continuation)
            .send()
            .await
            .map_err(|e| RemoteError::request("ListObjectsV2", bucket, e))?;

        let mut objects = Vec::with_capacity(output.contents().len());
        for entry in output.contents() {
            let Some(key) = entry.key() else {
                return Err(RemoteError::Malformed {
                    operation: "ListObjectsV2",
                    target: bucket.to_string(),
                    reason: "object entry without a key".into(),
                });
            };
            let last_modified = entry
                .last_modified()
                .and_then(|t| DateTime::<Utc>::from_timestamp(t.secs(), t.subsec_nanos()))
                .unwrap_or_default();

            objects.push(RemoteObject {
                key: key.to_string(),
                etag: normalize_etag(entry.e_tag().unwrap_or_default()),
                size: entry.size().unwrap_or(0),
                last_modified,
            });
        }

        let next_continuation_token = if output.is_truncated().unwrap_or(false) {
            output.next_continuation_token().map(str::to_string)
        } else {
            None
        };

        Ok(ObjectPage {
            objects,
            next_continuation_token,
        })
    }

    async fn fetch_object(&self, bucket: &str, key: &str) -> Result<ObjectBody, RemoteError> {
        let output = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| RemoteError::request("GetObject", format!("{bucket}/{key}"), e))?;

        Ok(ReaderStream::new(output.body.into_async_read()).boxed())
    }

    async fn list_buckets(&self) -> Result<Vec<String>, RemoteError> {
        let output = self
            .client
            .list_buckets()
            .send()
            .await
            .map_err(|e| RemoteError::request("ListBuckets", "*", e))?;

        Ok(output
            .buckets()
            .iter()
            .filter_map(|b| b.name().map(str::to_string))
            .collect())
    }
}
