use anyhow::{Context, Result};
use clap::Parser;
use faceprint_core::Config;
use faceprint_store::ObjectStore;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod engine;
mod error;
mod input;
mod routes;

#[derive(Parser)]
#[command(name = "faceprintd", about = "Faceprint enrollment and verification daemon")]
struct Args {
    /// TOML config file (defaults to $FACEPRINT_CONFIG, then built-in defaults)
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config = Config::load(args.config.as_deref()).context("failed to load config")?;
    tracing::info!(
        bind = %config.bind_addr,
        store = %config.store_root.display(),
        queue = %config.queue_path.display(),
        models = %config.model_dir.display(),
        "faceprintd starting"
    );

    let store = Arc::new(config.open_store().context("failed to open object store")?);

    faceprint_queue::create_parent_dir(&config.queue_path)?;
    let queue = tokio_rusqlite::Connection::open(&config.queue_path)
        .await
        .with_context(|| format!("failed to open task queue {}", config.queue_path.display()))?;
    queue
        .call(|conn| faceprint_queue::initialize(conn).map_err(routes::queue_error))
        .await
        .context("failed to initialize task queue")?;

    let engine_store: Arc<dyn ObjectStore> = store.clone();
    let engine = engine::spawn_engine(config.engine_slot(), engine_store)
        .context("failed to spawn engine thread")?;

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;

    let app = routes::router(routes::AppState {
        engine,
        queue,
        store,
        config: Arc::new(config),
    });

    tracing::info!("faceprintd ready");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("faceprintd shutting down");
        })
        .await
        .context("HTTP server failed")?;

    Ok(())
}
