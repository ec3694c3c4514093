//! Routes of the backup control surface.
//!
//! ## Structure
//! - **Probes**
//!   - `GET  /healthz`, `GET /readyz`
//!
//! - **Buckets**
//!   - `GET  /buckets`: registered buckets with their ledger fields
//!   - `POST /buckets/{id}/backup`: start a run in the background
//!   - `GET  /buckets/{id}/progress`: live progress of a running backup
//!   - `GET  /buckets/{id}/batches`: run history, newest first
//!   - `POST /buckets/{id}/stop`: ask a running backup to stop
//!
//! - **Global**
//!   - `POST /backup`: discover every remote bucket and back each one up

use crate::{
    handlers::{
        backup_handlers::{
            backup_all, get_progress, list_batches, list_buckets, start_backup, stop_backup,
        },
        health_handlers::{healthz, readyz},
    },
    services::{backup_service::BackupEngine, runs::RunRegistry},
};
use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub engine: BackupEngine,
    pub runs: Arc<RunRegistry>,
}

impl AppState {
    pub fn new(engine: BackupEngine) -> Self {
        Self {
            engine,
            runs: Arc::new(RunRegistry::new()),
        }
    }
}

/// Build and return the router; the caller supplies `AppState`.
pub fn routes() -> Router<AppState> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // bucket-level routes
        .route("/buckets", get(list_buckets))
        .route("/buckets/{id}/backup", post(start_backup))
        .route("/buckets/{id}/progress", get(get_progress))
        .route("/buckets/{id}/batches", get(list_batches))
        .route("/buckets/{id}/stop", post(stop_backup))
        // global
        .route("/backup", post(backup_all))
}
