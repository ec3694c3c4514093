//! Endpoint resolution: find which regional endpoint serves a bucket.

use super::{
    error::SyncError,
    regions::{RegionTable, normalize_region},
    remote::{RemoteConnector, RemoteStore},
};
use std::sync::Arc;
use tracing::info;

/// A client bound to the bucket's own region.
pub struct ResolvedBucket {
    pub client: Arc<dyn RemoteStore>,
    pub region: String,
    pub endpoint: String,
}

pub struct EndpointResolver<'a> {
    regions: &'a RegionTable,
    connector: &'a dyn RemoteConnector,
}

impl<'a> EndpointResolver<'a> {
    pub fn new(regions: &'a RegionTable, connector: &'a dyn RemoteConnector) -> Self {
        Self { regions, connector }
    }

    /// Client for the anchor endpoint, used for location lookups and
    /// bucket discovery.
    pub fn anchor_client(&self) -> Arc<dyn RemoteStore> {
        self.connector
            .connect(self.regions.anchor(), self.regions.anchor_endpoint())
    }

    /// Ask the anchor endpoint where `bucket` lives and connect there.
    ///
    /// Fails closed: a region missing from the table is `UnknownRegion`,
    /// never a guessed endpoint.
    pub async fn resolve(&self, bucket: &str) -> Result<ResolvedBucket, SyncError> {
        let location = self
            .anchor_client()
            .bucket_location(bucket)
            .await
            .map_err(|source| SyncError::Location {
                bucket: bucket.to_string(),
                source,
            })?;

        let region = match location.as_deref().map(str::trim) {
            Some(raw) if !raw.is_empty() => normalize_region(raw),
            _ => self.regions.anchor().to_string(),
        };

        let endpoint = self
            .regions
            .endpoint(&region)
            .ok_or_else(|| SyncError::UnknownRegion {
                bucket: bucket.to_string(),
                region: region.clone(),
            })?
            .to_string();

        info!(bucket, %region, %endpoint, "resolved bucket region");
        Ok(ResolvedBucket {
            client: self.connector.connect(&region, &endpoint),
            region,
            endpoint,
        })
    }
}
