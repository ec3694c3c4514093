use anyhow::{Context, Result};
use axum::Router;
use sqlx::sqlite::SqlitePoolOptions;
use std::{fs, io::ErrorKind, path::Path, sync::Arc};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

mod config;
mod errors;
mod handlers;
mod models;
mod routes;
mod services;

use config::{AppConfig, Command};
use services::{
    backup_service::BackupEngine, catalog::Catalog, progress::MemoryProgressStore,
    regions::RegionTable, remote::S3Connector,
};

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + command ---
    let (cfg, command) = AppConfig::from_env_and_args()?;
    tracing::info!("Starting bucket-mirror ({:?}) with config: {:?}", command, cfg);

    // --- Initialize SQLite connection ---
    let db_url = &cfg.database_url;
    let db_path = db_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .trim_start_matches("file:");
    tracing::debug!("Interpreted SQLite path => {}", db_path);

    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating database directory {}", parent.display()))?;
            tracing::info!("Created missing directory {:?}", parent);
        }
    }
    // SQLx does not create the file on its own
    if let Err(e) = fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(db_path)
    {
        tracing::warn!("Failed to open database file manually: {}", e);
    }

    let db = Arc::new(
        SqlitePoolOptions::new()
            .max_connections(5)
            .connect(db_url)
            .await
            .with_context(|| format!("connecting to {}", db_url))?,
    );
    let catalog = Catalog::new(db);

    // --- Handle migration mode ---
    if command == Command::Migrate {
        let applied = catalog.migrate().await.context("running migrations")?;
        tracing::info!("Database migration complete ({} statements).", applied);
        return Ok(());
    }

    // --- Ensure mirror directory exists ---
    if !cfg.mirror_root.exists() {
        fs::create_dir_all(&cfg.mirror_root)
            .with_context(|| format!("creating mirror root {}", cfg.mirror_root.display()))?;
        tracing::info!("Created mirror root at {}", cfg.mirror_root.display());
    }

    let engine = build_engine(&cfg, catalog)?;

    match command {
        Command::Migrate => Ok(()),
        Command::Backup { bucket_id } => backup_one(&engine, bucket_id).await,
        Command::BackupAll => backup_all(&engine).await,
        Command::Serve => serve(&cfg, engine).await,
    }
}

fn build_engine(cfg: &AppConfig, catalog: Catalog) -> Result<BackupEngine> {
    let regions = RegionTable::load(&cfg.regions_file, &cfg.anchor_region)
        .with_context(|| format!("loading region table {}", cfg.regions_file.display()))?;
    tracing::info!(
        "Loaded {} regions (anchor {} -> {})",
        regions.len(),
        regions.anchor(),
        regions.anchor_endpoint()
    );

    let (access_key, secret_key) = cfg.credentials()?;
    Ok(BackupEngine::new(
        catalog,
        Arc::new(regions),
        Arc::new(S3Connector::new(access_key, secret_key)),
        Arc::new(MemoryProgressStore::new()),
        cfg.engine_settings(),
    ))
}

/// Cancel `token` on Ctrl-C so in-flight transfers drain before exit.
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, stopping after in-flight transfers");
            token.cancel();
        }
    });
}

async fn backup_one(engine: &BackupEngine, bucket_id: i64) -> Result<()> {
    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let report = engine.run_bucket_backup(bucket_id, &cancel).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// Discover every bucket, then back them up one after another. A failed
/// bucket is logged and does not stop the rest.
async fn backup_all(engine: &BackupEngine) -> Result<()> {
    let mut queue = Vec::new();
    let discovery = engine
        .run_all_buckets_backup(|bucket| queue.push(bucket.id))
        .await?;
    println!("{}", serde_json::to_string_pretty(&discovery)?);

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let mut failures = 0usize;
    for bucket_id in queue {
        if cancel.is_cancelled() {
            break;
        }
        match engine.run_bucket_backup(bucket_id, &cancel).await {
            Ok(report) => println!("{}", serde_json::to_string_pretty(&report)?),
            Err(err) => {
                failures += 1;
                tracing::error!("{}", err);
            }
        }
    }

    if failures > 0 {
        anyhow::bail!("{} bucket backup(s) failed", failures);
    }
    Ok(())
}

async fn serve(cfg: &AppConfig, engine: BackupEngine) -> Result<()> {
    // --- Build router ---
    let app: Router = routes::routes::routes().with_state(routes::routes::AppState::new(engine));

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}
