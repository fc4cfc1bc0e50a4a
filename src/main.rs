use anyhow::{Context, Result};
use axum::Router;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::{io::ErrorKind, path::Path, str::FromStr, sync::Arc};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

mod config;
mod errors;
mod handlers;
mod models;
mod routes;
mod services;
mod state;

use config::StorageConfig;
use services::{
    disk_storage::LocalObjectStorage,
    event_publisher::PubSubPublisher,
    file_service::{EventSink, FileService},
    metadata_store::SqliteMetadataStore,
    object_storage::ObjectStorage,
    s3_storage::S3ObjectStorage,
};
use state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = config::AppConfig::from_env_and_args()?;

    tracing::info!("Starting upload-store with config: {:?}", cfg);

    // --- Initialize SQLite connection ---
    let db_path = cfg
        .database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .trim_start_matches("file:");
    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() && !db_path.starts_with(":memory:") {
            std::fs::create_dir_all(parent)?;
            tracing::info!("Created missing directory {:?}", parent);
        }
    }

    let connect_options = SqliteConnectOptions::from_str(&cfg.database_url)
        .with_context(|| format!("parsing DATABASE_URL `{}`", cfg.database_url))?
        .create_if_missing(true);
    let db = Arc::new(
        SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await
            .context("connecting to metadata database")?,
    );

    let metadata = SqliteMetadataStore::new(db.clone(), cfg.metadata_table.clone())?;
    metadata.ensure_schema().await?;

    // --- Handle migration mode ---
    if migrate {
        tracing::info!("Metadata schema ready in table `{}`.", metadata.table());
        db.close().await;
        return Ok(()); // exit after migration
    }

    // --- Object storage backend ---
    let (objects, local_objects): (Arc<dyn ObjectStorage>, Option<Arc<LocalObjectStorage>>) =
        match &cfg.storage {
            StorageConfig::S3(s3) => (Arc::new(S3ObjectStorage::new(s3).await), None),
            StorageConfig::Local(local) => {
                std::fs::create_dir_all(&local.storage_dir)?;
                tracing::info!("Storing objects on disk under {}", local.storage_dir);
                let storage = Arc::new(
                    LocalObjectStorage::new(local).context("preparing local object storage")?,
                );
                (storage.clone(), Some(storage))
            }
        };

    // --- Event topic ---
    let events = match &cfg.pubsub {
        Some(pubsub) => {
            let publisher = PubSubPublisher::connect(pubsub)
                .await
                .context("building Pub/Sub client")?;
            tracing::info!("Publishing file events to topic `{}`", pubsub.topic);
            Some(EventSink::new(Arc::new(publisher), pubsub.topic.clone()))
        }
        None => {
            tracing::warn!("PUBSUB_TOPIC_NAME not set; file events will not be published");
            None
        }
    };

    // --- Initialize core service ---
    let files = FileService::new(objects, Arc::new(metadata), events, cfg.presign_expiry);

    // --- Build router ---
    let app: Router = routes::routes::routes(cfg.max_upload_bytes).with_state(AppState {
        files,
        local_objects,
    });

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
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // --- Teardown ---
    db.close().await;
    tracing::info!("Server stopped");

    Ok(())
}

/// Resolve on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for Ctrl-C: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!("failed to listen for SIGTERM: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, draining connections...");
}
