use anyhow::{Context, Result};
use clap::Parser;
use faceprint_core::Config;
use faceprint_store::ObjectStore;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

mod notify;
mod worker;

use notify::LogNotifier;
use worker::Worker;

#[derive(Parser)]
#[command(name = "faceprint-worker", about = "Runs queued face enrollments")]
struct Args {
    /// TOML config file (defaults to $FACEPRINT_CONFIG, then built-in defaults)
    #[arg(long)]
    config: Option<PathBuf>,
    /// Process whatever is queued, then exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config = Config::load(args.config.as_deref()).context("failed to load config")?;
    tracing::info!(
        queue = %config.queue_path.display(),
        store = %config.store_root.display(),
        models = %config.model_dir.display(),
        "faceprint-worker starting"
    );

    let store: Arc<dyn ObjectStore> =
        Arc::new(config.open_store().context("failed to open object store")?);
    let queue = faceprint_queue::open(&config.queue_path)
        .with_context(|| format!("failed to open task queue {}", config.queue_path.display()))?;

    let mut worker = Worker::new(
        queue,
        config.engine_slot(),
        store,
        LogNotifier,
        config.max_attempts,
    );

    let stale_after = Duration::from_secs(config.stale_after_secs);
    let recovered = worker.recover_stale(stale_after)?;
    if recovered > 0 {
        tracing::warn!(recovered, "requeued tasks abandoned by a previous worker");
    }

    // Load the models now so a broken install shows up at boot. Tasks still
    // run and record `engine_unavailable` outcomes.
    if let Err(e) = worker.extractor_mut().get() {
        tracing::error!(error = %e, "face engine failed to load; enrollments will fail until restart");
    }

    if args.once {
        let handled = tokio::task::spawn_blocking(move || worker.drain()).await??;
        tracing::info!(handled, "queue drained");
        return Ok(());
    }

    let stop = Arc::new(AtomicBool::new(false));
    let poll_interval = Duration::from_millis(config.poll_interval_ms);
    let loop_stop = Arc::clone(&stop);
    let mut handle =
        tokio::task::spawn_blocking(move || worker.run(poll_interval, stale_after, &loop_stop));

    tracing::info!("faceprint-worker ready");
    tokio::select! {
        result = &mut handle => {
            result.context("worker loop panicked")?;
            return Ok(());
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("faceprint-worker shutting down after the current task");
            stop.store(true, Ordering::SeqCst);
        }
    }

    handle.await.context("worker loop panicked")?;
    Ok(())
}
