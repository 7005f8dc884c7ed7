use crate::engine::EngineHandle;
use crate::error::ApiError;
use crate::input::{read_enroll, read_verify, required_user};
use axum::extract::{DefaultBodyLimit, Path, Query, Request, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use faceprint_core::extractor::EngineStatus;
use faceprint_core::verify::{VerificationResult, VerifyRequest};
use faceprint_core::Config;
use faceprint_queue::{TaskId, TaskPayload, TaskRecord};
use faceprint_store::{FsObjectStore, ObjectStore, StoreError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub engine: EngineHandle,
    pub queue: tokio_rusqlite::Connection,
    pub store: Arc<FsObjectStore>,
    pub config: Arc<Config>,
}

pub fn router(state: AppState) -> Router {
    let body_limit = state.config.max_body_bytes;
    Router::new()
        .route("/health", get(health))
        .route("/api/face/enroll", post(enroll))
        .route("/api/face/verify", post(verify))
        .route("/api/face/tasks/{task_id}", get(task_status))
        .route("/api/face/{user_id}", get(list_user_objects))
        .route("/storage/{*key}", get(signed_object))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

/// Adapts queue errors to the error type `tokio_rusqlite` closures return.
pub fn queue_error(e: faceprint_queue::QueueError) -> tokio_rusqlite::Error {
    tokio_rusqlite::Error::Other(Box::new(e))
}

#[derive(Serialize)]
struct EnrollAccepted {
    status: &'static str,
    task_id: TaskId,
    user_id: String,
    images: usize,
}

async fn enroll(
    State(state): State<AppState>,
    request: Request,
) -> Result<(StatusCode, Json<EnrollAccepted>), ApiError> {
    let input = read_enroll(request).await?;
    let images = input.images.len();
    let user_id = input.user_id.to_string();

    let payload = TaskPayload::EnrollUser {
        user_id: user_id.clone(),
        images: input.images,
    };
    let task_id = state
        .queue
        .call(move |conn| faceprint_queue::enqueue(conn, &payload).map_err(queue_error))
        .await?;

    tracing::info!(user_id, %task_id, images, "enroll: queued");
    Ok((
        StatusCode::ACCEPTED,
        Json(EnrollAccepted {
            status: "queued",
            task_id,
            user_id,
            images,
        }),
    ))
}

async fn verify(
    State(state): State<AppState>,
    request: Request,
) -> Result<Json<VerificationResult>, ApiError> {
    let input = read_verify(request).await?;
    let threshold = input
        .threshold
        .unwrap_or_else(|| state.config.threshold_for(input.metric));

    let result = state
        .engine
        .verify(VerifyRequest {
            user_id: input.user_id.to_string(),
            probe: input.image,
            metric: input.metric,
            threshold: Some(threshold),
        })
        .await?;
    Ok(Json(result))
}

#[derive(Serialize)]
struct UserObjects {
    user_id: String,
    prefix: String,
    count: usize,
    items: Vec<StoredObject>,
}

#[derive(Serialize)]
struct StoredObject {
    name: String,
    path: String,
    size: u64,
    signed_url: String,
}

async fn list_user_objects(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<UserObjects>, ApiError> {
    let user = required_user(Some(&user_id))?;
    let prefix = user.root();

    let store = Arc::clone(&state.store);
    let listing_user = user.clone();
    let items = tokio::task::spawn_blocking(move || -> Result<Vec<StoredObject>, StoreError> {
        store
            .list(&listing_user.root())?
            .into_iter()
            .map(|entry| -> Result<StoredObject, StoreError> {
                let path = listing_user.object_key(&entry.name);
                let signed_url = store.sign(&path)?;
                Ok(StoredObject {
                    name: entry.name,
                    path,
                    size: entry.size,
                    signed_url,
                })
            })
            .collect()
    })
    .await??;

    Ok(Json(UserObjects {
        user_id: user.to_string(),
        prefix,
        count: items.len(),
        items,
    }))
}

async fn task_status(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<TaskRecord>, ApiError> {
    let not_found = || ApiError::NotFound(format!("task {task_id} not found"));
    let id = TaskId::parse(&task_id).map_err(|_| not_found())?;
    let record = state
        .queue
        .call(move |conn| faceprint_queue::get(conn, &id).map_err(queue_error))
        .await?;
    record.map(Json).ok_or_else(not_found)
}

#[derive(Deserialize)]
struct SignedQuery {
    expires: Option<i64>,
    signature: Option<String>,
}

async fn signed_object(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(query): Query<SignedQuery>,
) -> Result<Response, ApiError> {
    let (Some(expires), Some(signature)) = (query.expires, query.signature) else {
        return Err(ApiError::Forbidden("missing signature".into()));
    };
    let store = Arc::clone(&state.store);
    let object =
        tokio::task::spawn_blocking(move || store.open_signed(&key, expires, &signature)).await??;
    Ok(([(header::CONTENT_TYPE, object.content_type)], object.bytes).into_response())
}

#[derive(Serialize)]
struct Health {
    status: &'static str,
    version: &'static str,
    engine: EngineStatus,
    queue: QueueHealth,
}

#[derive(Serialize)]
struct QueueHealth {
    reachable: bool,
    pending: Option<u64>,
}

async fn health(State(state): State<AppState>) -> Json<Health> {
    let engine = state
        .engine
        .status()
        .await
        .unwrap_or_else(|e| EngineStatus::Failed(e.to_string()));
    let pending = state
        .queue
        .call(|conn| faceprint_queue::pending(conn).map_err(queue_error))
        .await;
    if let Err(e) = &pending {
        tracing::warn!(error = %e, "health: task queue unreachable");
    }

    let healthy = engine == EngineStatus::Ready && pending.is_ok();
    Json(Health {
        status: if healthy { "ok" } else { "degraded" },
        version: env!("CARGO_PKG_VERSION"),
        engine,
        queue: QueueHealth {
            reachable: pending.is_ok(),
            pending: pending.ok(),
        },
    })
}
