//! Baseline enrollment: turn a batch of uploaded photos into a user's stored
//! reference embedding.
//!
//! Runs detached from any caller, so every failure is reported through
//! [`EnrollOutcome`] rather than an `Err`.

use crate::baseline::{UserId, BASELINE_CONTENT_TYPE, EMBEDDING_CONTENT_TYPE};
use crate::codec;
use crate::extractor::{best_embedding, ExtractorError, FaceExtractor};
use crate::npy;
use crate::types::Embedding;
use faceprint_store::ObjectStore;
use serde::{Deserialize, Serialize};

/// Why one image of a batch did not contribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    InvalidImage,
    NoFaceDetected,
    ExtractionFailed,
    StorageError,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedImage {
    /// 1-based position in the submitted batch.
    pub index: usize,
    pub reason: SkipReason,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    InvalidUserId,
    NoUsableFace,
    EngineUnavailable,
    StorageError,
}

/// Result of one enrollment run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EnrollOutcome {
    Success {
        user_id: String,
        images_count: usize,
        embedding_key: String,
        image_keys: Vec<String>,
        skipped: Vec<SkippedImage>,
    },
    Failure {
        user_id: String,
        reason: FailureReason,
        message: String,
        skipped: Vec<SkippedImage>,
    },
}

impl EnrollOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, EnrollOutcome::Success { .. })
    }

    pub fn user_id(&self) -> &str {
        match self {
            EnrollOutcome::Success { user_id, .. } | EnrollOutcome::Failure { user_id, .. } => {
                user_id
            }
        }
    }

    /// Outcome for a payload whose user id never passed validation.
    pub fn invalid_user(raw: &str, message: impl Into<String>) -> Self {
        EnrollOutcome::Failure {
            user_id: raw.to_string(),
            reason: FailureReason::InvalidUserId,
            message: message.into(),
            skipped: Vec::new(),
        }
    }
}

enum ImageError {
    Skip(SkipReason, String),
    Abort(ExtractorError),
}

/// Enroll `user` from `images`, uploading the usable ones and the aggregated
/// baseline embedding. `unix_ts` and a random run id stamp the uploaded
/// image keys.
pub fn enroll_user<X: FaceExtractor + ?Sized>(
    user: &UserId,
    images: &[Vec<u8>],
    extractor: &mut X,
    store: &dyn ObjectStore,
    unix_ts: i64,
) -> EnrollOutcome {
    let run = format!("{:08x}", rand::random::<u32>());
    tracing::info!(user_id = %user, images = images.len(), run, "enroll: started");

    let mut embeddings: Vec<Embedding> = Vec::with_capacity(images.len());
    let mut image_keys = Vec::with_capacity(images.len());
    let mut skipped = Vec::new();

    for (i, bytes) in images.iter().enumerate() {
        let index = i + 1;
        match enroll_image(user, bytes, index, extractor, store, unix_ts, &run) {
            Ok((embedding, key)) => {
                tracing::debug!(user_id = %user, index, key, "enroll: image accepted");
                embeddings.push(embedding);
                image_keys.push(key);
            }
            Err(ImageError::Skip(reason, detail)) => {
                tracing::warn!(user_id = %user, index, ?reason, detail, "enroll: image skipped");
                skipped.push(SkippedImage {
                    index,
                    reason,
                    detail,
                });
            }
            Err(ImageError::Abort(e)) => {
                tracing::error!(user_id = %user, index, error = %e, "enroll: aborted");
                return EnrollOutcome::Failure {
                    user_id: user.to_string(),
                    reason: FailureReason::EngineUnavailable,
                    message: e.to_string(),
                    skipped,
                };
            }
        }
    }

    if embeddings.is_empty() {
        let upload_failures = skipped.iter().any(|s| s.reason == SkipReason::StorageError);
        let (reason, message) = if upload_failures {
            (
                FailureReason::StorageError,
                "no usable image could be uploaded".to_string(),
            )
        } else {
            (
                FailureReason::NoUsableFace,
                "no face detected in any submitted image".to_string(),
            )
        };
        tracing::warn!(user_id = %user, ?reason, "enroll: nothing to aggregate");
        return EnrollOutcome::Failure {
            user_id: user.to_string(),
            reason,
            message,
            skipped,
        };
    }

    let baseline = match Embedding::mean(&embeddings) {
        Ok(mean) => mean.normalized(),
        Err(e) => {
            return EnrollOutcome::Failure {
                user_id: user.to_string(),
                reason: FailureReason::NoUsableFace,
                message: e.to_string(),
                skipped,
            }
        }
    };

    let embedding_key = user.embedding_key();
    if let Err(e) = store.put(&embedding_key, &npy::encode(&baseline), EMBEDDING_CONTENT_TYPE) {
        tracing::error!(user_id = %user, key = embedding_key, error = %e, "enroll: baseline upload failed");
        return EnrollOutcome::Failure {
            user_id: user.to_string(),
            reason: FailureReason::StorageError,
            message: e.to_string(),
            skipped,
        };
    }

    tracing::info!(
        user_id = %user,
        images_count = image_keys.len(),
        skipped = skipped.len(),
        key = embedding_key,
        "enroll: baseline stored"
    );

    EnrollOutcome::Success {
        user_id: user.to_string(),
        images_count: image_keys.len(),
        embedding_key,
        image_keys,
        skipped,
    }
}

fn enroll_image<X: FaceExtractor + ?Sized>(
    user: &UserId,
    bytes: &[u8],
    index: usize,
    extractor: &mut X,
    store: &dyn ObjectStore,
    unix_ts: i64,
    run: &str,
) -> Result<(Embedding, String), ImageError> {
    let grid =
        codec::decode(bytes).map_err(|e| ImageError::Skip(SkipReason::InvalidImage, e.to_string()))?;

    let embedding = match best_embedding(extractor, &grid) {
        Ok(Some(embedding)) => embedding,
        Ok(None) => {
            return Err(ImageError::Skip(
                SkipReason::NoFaceDetected,
                "no face detected".into(),
            ))
        }
        Err(e) if e.is_engine_unavailable() => return Err(ImageError::Abort(e)),
        Err(e) => return Err(ImageError::Skip(SkipReason::ExtractionFailed, e.to_string())),
    };

    let jpeg = codec::encode_jpeg(&grid)
        .map_err(|e| ImageError::Skip(SkipReason::InvalidImage, e.to_string()))?;
    let key = user.baseline_image_key(unix_ts, run, index);
    store
        .put(&key, &jpeg, BASELINE_CONTENT_TYPE)
        .map_err(|e| ImageError::Skip(SkipReason::StorageError, e.to_string()))?;

    Ok((embedding, key))
}
