//! Error types for the HTTP handlers.

use crate::engine::EngineError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use faceprint_core::verify::VerifyError;
use faceprint_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    EngineUnavailable(String),
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::EngineUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), error = %self, "request failed");
        }
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

impl From<VerifyError> for ApiError {
    fn from(e: VerifyError) -> Self {
        let message = e.to_string();
        match e {
            VerifyError::InvalidUserId(_)
            | VerifyError::InvalidImage(_)
            | VerifyError::NoFaceDetected => Self::BadRequest(message),
            VerifyError::UserNotEnrolled(_) | VerifyError::ReferenceUnavailable(_) => {
                Self::NotFound(message)
            }
            VerifyError::EngineUnavailable(_) => Self::EngineUnavailable(message),
            VerifyError::IncompatibleReference { .. }
            | VerifyError::Storage(_)
            | VerifyError::Extraction(_) => Self::Internal(message),
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::Verify(e) => e.into(),
            EngineError::ChannelClosed => Self::EngineUnavailable("engine thread exited".into()),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        let message = e.to_string();
        match e {
            StoreError::NotFound(_) => Self::NotFound(message),
            StoreError::InvalidKey(_) => Self::BadRequest(message),
            StoreError::Expired | StoreError::InvalidSignature => Self::Forbidden(message),
            StoreError::Io { .. } | StoreError::SigningKey(_) => Self::Internal(message),
        }
    }
}

impl From<tokio_rusqlite::Error> for ApiError {
    fn from(e: tokio_rusqlite::Error) -> Self {
        Self::Internal(format!("task queue: {e}"))
    }
}

impl From<tokio::task::JoinError> for ApiError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Internal(format!("blocking task failed: {e}"))
    }
}
