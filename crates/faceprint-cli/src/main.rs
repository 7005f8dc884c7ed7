use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use faceprint_core::codec;
use faceprint_core::enroll::enroll_user;
use faceprint_core::extractor::{select_best, FaceExtractor};
use faceprint_core::types::Metric;
use faceprint_core::verify::{verify_user, VerifyRequest};
use faceprint_core::{Config, UserId};
use faceprint_queue::{TaskId, TaskPayload};
use faceprint_store::{MemoryObjectStore, ObjectStore};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::time::Instant;

#[derive(Parser)]
#[command(name = "faceprint", about = "Faceprint enrollment and verification CLI")]
struct Cli {
    /// TOML config file (defaults to $FACEPRINT_CONFIG, then built-in defaults)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll a user from one or more photos
    Enroll {
        #[arg(short, long)]
        user: String,
        /// Photos of the user's face
        #[arg(required = true)]
        images: Vec<PathBuf>,
        /// Run the enrollment in this process instead of queueing it
        #[arg(long)]
        now: bool,
        /// With --now, write to a scratch in-memory store
        #[arg(long, requires = "now")]
        dry_run: bool,
    },
    /// Verify a photo against a user's baseline
    Verify {
        #[arg(short, long)]
        user: String,
        image: PathBuf,
        /// cosine or euclidean
        #[arg(long, default_value = "cosine")]
        metric: Metric,
        /// Overrides the configured threshold for the metric
        #[arg(long)]
        threshold: Option<f32>,
    },
    /// List a user's stored objects with signed links
    List {
        #[arg(short, long)]
        user: String,
    },
    /// Show a queued task's status and outcome
    Task {
        id: String,
    },
    /// Load the face models and optionally run them on a photo
    Test {
        image: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref()).context("failed to load config")?;
    tracing::debug!(
        store = %config.store_root.display(),
        queue = %config.queue_path.display(),
        models = %config.model_dir.display(),
        "config loaded"
    );

    let report = match cli.command {
        Commands::Enroll {
            user,
            images,
            now,
            dry_run,
        } => {
            let images = read_images(&images)?;
            if now {
                let mut slot = config.engine_slot();
                if dry_run {
                    let store = MemoryObjectStore::new();
                    let mut report = enroll_now(&user, &images, &mut slot, &store)?;
                    report["written"] = json!(store.keys());
                    report
                } else {
                    let store = config.open_store().context("failed to open object store")?;
                    enroll_now(&user, &images, &mut slot, &store)?
                }
            } else {
                let user = UserId::parse(&user)?;
                let conn = faceprint_queue::open(&config.queue_path)?;
                let count = images.len();
                let task_id = faceprint_queue::enqueue(
                    &conn,
                    &TaskPayload::EnrollUser {
                        user_id: user.to_string(),
                        images,
                    },
                )?;
                json!({"status": "queued", "task_id": task_id, "user_id": user.as_str(), "images": count})
            }
        }
        Commands::Verify {
            user,
            image,
            metric,
            threshold,
        } => {
            let probe = std::fs::read(&image)
                .with_context(|| format!("failed to read {}", image.display()))?;
            let store = config.open_store().context("failed to open object store")?;
            let request = VerifyRequest {
                user_id: user,
                probe,
                metric,
                threshold: Some(threshold.unwrap_or_else(|| config.threshold_for(metric))),
            };
            let result = verify_user(&request, &mut config.engine_slot(), &store)?;
            serde_json::to_value(result)?
        }
        Commands::List { user } => {
            let store = config.open_store().context("failed to open object store")?;
            list_objects(&UserId::parse(&user)?, &store)?
        }
        Commands::Task { id } => {
            let id = TaskId::parse(&id).with_context(|| format!("{id:?} is not a task id"))?;
            let conn = faceprint_queue::open(&config.queue_path)?;
            match faceprint_queue::get(&conn, &id)? {
                Some(record) => serde_json::to_value(record)?,
                None => bail!("task {id} not found"),
            }
        }
        Commands::Test { image } => engine_diagnostics(&config, image.as_deref())?,
    };

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn read_images(paths: &[PathBuf]) -> Result<Vec<Vec<u8>>> {
    paths
        .iter()
        .map(|p| std::fs::read(p).with_context(|| format!("failed to read {}", p.display())))
        .collect()
}

fn enroll_now<X: FaceExtractor + ?Sized>(
    user: &str,
    images: &[Vec<u8>],
    extractor: &mut X,
    store: &dyn ObjectStore,
) -> Result<serde_json::Value> {
    let user = UserId::parse(user)?;
    let outcome = enroll_user(&user, images, extractor, store, chrono::Utc::now().timestamp());
    Ok(serde_json::to_value(outcome)?)
}

fn list_objects(user: &UserId, store: &dyn ObjectStore) -> Result<serde_json::Value> {
    let items = store
        .list(&user.root())?
        .into_iter()
        .map(|entry| -> Result<serde_json::Value> {
            let path = user.object_key(&entry.name);
            let signed_url = store.sign(&path)?;
            Ok(json!({"name": entry.name, "path": path, "size": entry.size, "signed_url": signed_url}))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(json!({
        "user_id": user.as_str(),
        "prefix": user.root(),
        "count": items.len(),
        "items": items,
    }))
}

fn engine_diagnostics(config: &Config, image: Option<&Path>) -> Result<serde_json::Value> {
    let detector = config.scrfd_model_path();
    let recognizer = config.arcface_model_path();

    let mut slot = config.engine_slot();
    let started = Instant::now();
    let loaded = slot.get().map(|_| ()).map_err(|e| e.to_string());
    let load_ms = started.elapsed().as_millis() as u64;

    let mut report = json!({
        "models": {
            "detector": {"path": detector, "exists": detector.is_file()},
            "recognizer": {"path": recognizer, "exists": recognizer.is_file()},
        },
        "engine": slot.status(),
        "load_ms": load_ms,
    });
    if let Err(reason) = loaded {
        report["error"] = json!(reason);
        return Ok(report);
    }

    if let Some(path) = image {
        let bytes =
            std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
        let grid = codec::decode(&bytes)?;
        let started = Instant::now();
        let faces = slot.extract(&grid)?;
        let extract_ms = started.elapsed().as_millis() as u64;
        let count = faces.len();
        let best = select_best(faces);
        report["probe"] = json!({
            "path": path,
            "width": grid.width(),
            "height": grid.height(),
            "faces": count,
            "best_confidence": best.as_ref().map(|f| f.confidence),
            "embedding_dim": best.as_ref().map(|f| f.embedding.dim()),
            "extract_ms": extract_ms,
        });
    }
    Ok(report)
}
