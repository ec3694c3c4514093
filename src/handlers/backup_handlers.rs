//! HTTP handlers that trigger, observe and stop backups.
//! Runs execute on background tasks; these handlers only start them, read
//! their published progress, or fire their cancellation token.

use crate::{
    errors::AppError,
    models::bucket::Bucket,
    routes::routes::AppState,
    services::{progress::progress_key, runs::spawn_backup},
};
use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Serialize;
use tracing::info;

/// Bucket row plus whether a run is active for it right now.
#[derive(Debug, Serialize)]
pub struct BucketSummary {
    #[serde(flatten)]
    pub bucket: Bucket,
    pub running: bool,
}

#[derive(Debug, Serialize)]
pub struct RunAccepted {
    pub status: &'static str,
    pub bucket_id: i64,
}

/// `GET /buckets`
pub async fn list_buckets(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    let buckets = state.engine.catalog().list_buckets().await?;
    let body: Vec<BucketSummary> = buckets
        .into_iter()
        .map(|bucket| BucketSummary {
            running: state.runs.is_running(bucket.id),
            bucket,
        })
        .collect();
    Ok(Json(body))
}

/// `GET /buckets/{id}/batches`
///
/// Run history of one bucket, newest first; 404 for an unknown bucket.
pub async fn list_batches(
    State(state): State<AppState>,
    Path(bucket_id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    let catalog = state.engine.catalog();
    let bucket = catalog.bucket(bucket_id).await?;
    Ok(Json(catalog.list_batches(bucket.id).await?))
}

/// `POST /buckets/{id}/backup`
///
/// 202 once the run is scheduled, 404 for an unknown bucket, 409 when a run
/// for the bucket is still active.
pub async fn start_backup(
    State(state): State<AppState>,
    Path(bucket_id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    let bucket = state.engine.catalog().bucket(bucket_id).await?;

    if !spawn_backup(state.engine.clone(), state.runs.clone(), bucket.id) {
        return Err(AppError::conflict(format!(
            "a backup of bucket {} is already running",
            bucket.id
        )));
    }

    info!(bucket = %bucket.name, bucket_id, "Backup scheduled");
    Ok((
        StatusCode::ACCEPTED,
        Json(RunAccepted {
            status: "started",
            bucket_id: bucket.id,
        }),
    ))
}

/// `POST /backup`
///
/// Discovery itself runs inline so provider errors surface here; the
/// per-bucket runs are scheduled in the background. Buckets that are already
/// running are left alone.
pub async fn backup_all(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    let engine = state.engine.clone();
    let runs = state.runs.clone();
    let report = state
        .engine
        .run_all_buckets_backup(|bucket| {
            if !spawn_backup(engine.clone(), runs.clone(), bucket.id) {
                info!(bucket = %bucket.name, bucket_id = bucket.id, "Backup already running, skipped");
            }
        })
        .await?;

    Ok((StatusCode::ACCEPTED, Json(report)))
}

/// `GET /buckets/{id}/progress`
pub async fn get_progress(
    State(state): State<AppState>,
    Path(bucket_id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    state
        .engine
        .progress_store()
        .get(&progress_key(bucket_id))
        .await
        .map(Json)
        .ok_or_else(|| AppError::not_found(format!("no backup in progress for bucket {bucket_id}")))
}

/// `POST /buckets/{id}/stop`
pub async fn stop_backup(
    State(state): State<AppState>,
    Path(bucket_id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    if !state.runs.stop(bucket_id) {
        return Err(AppError::not_found(format!(
            "no backup running for bucket {bucket_id}"
        )));
    }
    info!(bucket_id, "Stop requested");
    Ok((
        StatusCode::ACCEPTED,
        Json(RunAccepted {
            status: "stopping",
            bucket_id,
        }),
    ))
}
