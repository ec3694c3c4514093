//! Lazy, paginated enumeration of a remote bucket.

use super::{error::SyncError, remote::RemoteStore};
use crate::models::remote_object::RemoteObject;
use futures::{
    StreamExt, TryStreamExt,
    stream::{self, BoxStream},
};
use std::sync::Arc;
use tracing::debug;

/// Stream every object in `bucket`, one provider page at a time.
///
/// Pages are fetched only as the stream is polled, so downloads can start
/// before the listing finishes. Continuation tokens stay internal. Order is
/// whatever the provider returns.
pub fn list_objects(
    client: Arc<dyn RemoteStore>,
    bucket: String,
) -> BoxStream<'static, Result<RemoteObject, SyncError>> {
    // `None` once the provider reports no further pages.
    let start: Option<Option<String>> = Some(None);

    stream::try_unfold(start, move |cursor| {
        let client = client.clone();
        let bucket = bucket.clone();
        async move {
            let Some(token) = cursor else {
                return Ok(None);
            };

            let page = client
                .list_page(&bucket, token)
                .await
                .map_err(|source| SyncError::Listing {
                    bucket: bucket.clone(),
                    source,
                })?;
            debug!(
                bucket = %bucket,
                objects = page.objects.len(),
                more = page.next_continuation_token.is_some(),
                "listed page"
            );

            Ok::<_, SyncError>(Some((page.objects, page.next_continuation_token.map(Some))))
        }
    })
    .map_ok(|objects| stream::iter(objects.into_iter().map(Ok::<_, SyncError>)))
    .try_flatten()
    .boxed()
}
