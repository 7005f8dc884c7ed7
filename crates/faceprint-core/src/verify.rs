//! Synchronous verification of a probe photo against a user's baseline.

use crate::baseline::{is_baseline_image, UserId, UserIdError};
use crate::codec;
use crate::extractor::{best_embedding, ExtractorError, FaceExtractor};
use crate::npy;
use crate::types::{Embedding, Metric, VectorError};
use faceprint_store::{ObjectStore, StoreError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Baseline images used to rebuild a missing embedding.
pub const FALLBACK_IMAGE_LIMIT: usize = 3;

#[derive(Error, Debug)]
pub enum VerifyError {
    #[error(transparent)]
    InvalidUserId(#[from] UserIdError),
    #[error("invalid image: {0}")]
    InvalidImage(String),
    #[error("no face detected in probe image")]
    NoFaceDetected,
    #[error("face engine unavailable: {0}")]
    EngineUnavailable(String),
    #[error("user {0} has no baseline")]
    UserNotEnrolled(String),
    #[error("no usable baseline image for user {0}")]
    ReferenceUnavailable(String),
    #[error("baseline has {reference} dimensions, probe has {probe}")]
    IncompatibleReference { reference: usize, probe: usize },
    #[error("storage: {0}")]
    Storage(#[from] StoreError),
    #[error("extraction failed: {0}")]
    Extraction(String),
}

impl From<ExtractorError> for VerifyError {
    fn from(e: ExtractorError) -> Self {
        match e {
            ExtractorError::EngineUnavailable(reason) => VerifyError::EngineUnavailable(reason),
            other => VerifyError::Extraction(other.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct VerifyRequest {
    pub user_id: String,
    pub probe: Vec<u8>,
    pub metric: Metric,
    /// Falls back to [`Metric::default_threshold`].
    pub threshold: Option<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub user_id: String,
    pub metric: Metric,
    pub threshold: f32,
    pub score: f32,
    #[serde(rename = "match")]
    pub is_match: bool,
}

pub fn verify_user<X: FaceExtractor + ?Sized>(
    request: &VerifyRequest,
    extractor: &mut X,
    store: &dyn ObjectStore,
) -> Result<VerificationResult, VerifyError> {
    let user = UserId::parse(&request.user_id)?;

    let grid = codec::decode(&request.probe).map_err(|e| VerifyError::InvalidImage(e.to_string()))?;
    let probe = best_embedding(extractor, &grid)?.ok_or(VerifyError::NoFaceDetected)?;

    let reference = load_reference(&user, extractor, store)?;
    if reference.dim() != probe.dim() {
        return Err(VerifyError::IncompatibleReference {
            reference: reference.dim(),
            probe: probe.dim(),
        });
    }

    let metric = request.metric;
    let threshold = request.threshold.unwrap_or_else(|| metric.default_threshold());
    let score = metric.score(&probe, &reference);
    let is_match = metric.is_match(score, threshold);

    tracing::info!(user_id = %user, %metric, threshold, score, is_match, "verify: scored");

    Ok(VerificationResult {
        user_id: user.to_string(),
        metric,
        threshold,
        score,
        is_match,
    })
}

/// Stored embedding, or one rebuilt from the raw baseline images when the
/// blob is missing or unreadable.
fn load_reference<X: FaceExtractor + ?Sized>(
    user: &UserId,
    extractor: &mut X,
    store: &dyn ObjectStore,
) -> Result<Embedding, VerifyError> {
    let key = user.embedding_key();
    let stored = match store.get(&key) {
        Ok(bytes) => {
            match npy::decode(&bytes) {
                Ok(embedding) if embedding.dim() > 0 => return Ok(embedding.normalized()),
                Ok(_) => tracing::warn!(user_id = %user, key, "verify: stored embedding is empty"),
                Err(e) => {
                    tracing::warn!(user_id = %user, key, error = %e, "verify: stored embedding unreadable")
                }
            }
            true
        }
        Err(e) if e.is_not_found() => {
            tracing::debug!(user_id = %user, key, "verify: no stored embedding");
            false
        }
        Err(e) => {
            tracing::warn!(user_id = %user, key, error = %e, "verify: embedding fetch failed");
            true
        }
    };

    rebuild_reference(user, stored, extractor, store)
}

/// Reference from the user's first baseline images. `stored` is whether an
/// embedding object exists for the user, usable or not.
fn rebuild_reference<X: FaceExtractor + ?Sized>(
    user: &UserId,
    stored: bool,
    extractor: &mut X,
    store: &dyn ObjectStore,
) -> Result<Embedding, VerifyError> {
    let names: Vec<String> = store
        .list(&user.root())?
        .into_iter()
        .map(|entry| entry.name)
        .filter(|name| is_baseline_image(name))
        .take(FALLBACK_IMAGE_LIMIT)
        .collect();

    if names.is_empty() {
        return Err(if stored {
            VerifyError::ReferenceUnavailable(user.to_string())
        } else {
            VerifyError::UserNotEnrolled(user.to_string())
        });
    }

    let mut embeddings = Vec::with_capacity(names.len());
    for name in &names {
        let key = user.object_key(name);
        match baseline_embedding(&key, extractor, store) {
            Ok(Some(embedding)) => embeddings.push(embedding),
            Ok(None) => tracing::warn!(user_id = %user, key, "verify: no face in baseline image"),
            Err(VerifyError::EngineUnavailable(reason)) => {
                return Err(VerifyError::EngineUnavailable(reason))
            }
            Err(e) => tracing::warn!(user_id = %user, key, error = %e, "verify: baseline image skipped"),
        }
    }

    tracing::info!(
        user_id = %user,
        attempted = names.len(),
        usable = embeddings.len(),
        "verify: rebuilt reference from baseline images"
    );

    match Embedding::mean(&embeddings) {
        Ok(mean) => Ok(mean.normalized()),
        Err(VectorError::Empty) => Err(VerifyError::ReferenceUnavailable(user.to_string())),
        Err(VectorError::DimensionMismatch { expected, actual }) => {
            Err(VerifyError::IncompatibleReference {
                reference: actual,
                probe: expected,
            })
        }
    }
}

fn baseline_embedding<X: FaceExtractor + ?Sized>(
    key: &str,
    extractor: &mut X,
    store: &dyn ObjectStore,
) -> Result<Option<Embedding>, VerifyError> {
    let bytes = store.get(key)?;
    let grid = codec::decode(&bytes).map_err(|e| VerifyError::InvalidImage(e.to_string()))?;
    Ok(best_embedding(extractor, &grid)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::PixelGrid;
    use crate::test_support::{
        solid_grid, solid_png, ColorExtractor, RecordingStore, UnavailableExtractor,
    };
    use image::{Rgb, RgbImage};

    const EMBEDDING_KEY: &str = "face_detection/emp-7/embedding.npy";

    fn request(probe: Vec<u8>, metric: Metric) -> VerifyRequest {
        VerifyRequest {
            user_id: "emp-7".into(),
            probe,
            metric,
            threshold: None,
        }
    }

    fn put_embedding(store: &RecordingStore, values: Vec<f32>) {
        let blob = npy::encode(&Embedding::new(values).normalized());
        store.put(EMBEDDING_KEY, &blob, "application/octet-stream").unwrap();
    }

    fn put_baseline_jpeg(store: &RecordingStore, name: &str, rgb: [u8; 3]) {
        let jpeg = codec::encode_jpeg(&solid_grid(rgb)).unwrap();
        store
            .put(&format!("face_detection/emp-7/{name}"), &jpeg, "image/jpeg")
            .unwrap();
    }

    #[test]
    fn test_stored_embedding_skips_listing() {
        let store = RecordingStore::default();
        put_embedding(&store, vec![200.0, 10.0, 10.0]);

        let result = verify_user(
            &request(solid_png(8, 8, [200, 10, 10]), Metric::Cosine),
            &mut ColorExtractor::default(),
            &store,
        )
        .unwrap();

        assert_eq!(store.list_calls(), 0);
        assert!(result.score > 0.999);
        assert!(result.is_match);
        assert_eq!(result.threshold, 0.45);
        assert_eq!(result.metric, Metric::Cosine);
    }

    #[test]
    fn test_cosine_no_match_below_threshold() {
        let store = RecordingStore::default();
        put_embedding(&store, vec![0.0, 200.0, 0.0]);

        let result = verify_user(
            &request(solid_png(8, 8, [200, 0, 0]), Metric::Cosine),
            &mut ColorExtractor::default(),
            &store,
        )
        .unwrap();

        assert!(result.score.abs() < 1e-6);
        assert!(!result.is_match);
    }

    #[test]
    fn test_explicit_threshold_is_used() {
        let store = RecordingStore::default();
        put_embedding(&store, vec![1.0, 1.0, 0.0]);
        let mut req = request(solid_png(8, 8, [200, 0, 0]), Metric::Cosine);

        req.threshold = Some(0.7);
        let strict = verify_user(&req, &mut ColorExtractor::default(), &store).unwrap();
        req.threshold = Some(0.5);
        let lenient = verify_user(&req, &mut ColorExtractor::default(), &store).unwrap();

        // cos = 1/sqrt(2)
        assert!(strict.is_match);
        assert!(lenient.is_match);
        req.threshold = Some(0.8);
        assert!(!verify_user(&req, &mut ColorExtractor::default(), &store).unwrap().is_match);
    }

    #[test]
    fn test_euclidean_direction() {
        let store = RecordingStore::default();
        put_embedding(&store, vec![0.0, 0.0, 90.0]);

        let same = verify_user(
            &request(solid_png(8, 8, [0, 0, 90]), Metric::Euclidean),
            &mut ColorExtractor::default(),
            &store,
        )
        .unwrap();
        assert!(same.score < 1e-5);
        assert!(same.is_match);
        assert_eq!(same.threshold, 1.4);

        let mut far = request(solid_png(8, 8, [90, 0, 0]), Metric::Euclidean);
        far.threshold = Some(1.0);
        let far = verify_user(&far, &mut ColorExtractor::default(), &store).unwrap();
        assert!((far.score - std::f32::consts::SQRT_2).abs() < 1e-4);
        assert!(!far.is_match);
    }

    #[test]
    fn test_fallback_uses_first_three_baseline_images() {
        let store = RecordingStore::default();
        put_baseline_jpeg(&store, "baseline_100_1.jpg", [200, 0, 0]);
        put_baseline_jpeg(&store, "baseline_100_2.jpg", [200, 0, 0]);
        put_baseline_jpeg(&store, "baseline_100_3.jpg", [200, 0, 0]);
        put_baseline_jpeg(&store, "baseline_200_1.jpg", [0, 200, 0]);
        store
            .put("face_detection/emp-7/notes.txt", b"hello", "text/plain")
            .unwrap();

        let mut extractor = ColorExtractor::default();
        let result = verify_user(
            &request(solid_png(8, 8, [200, 0, 0]), Metric::Cosine),
            &mut extractor,
            &store,
        )
        .unwrap();

        assert_eq!(store.list_calls(), 1);
        // Probe plus three baseline images; the fourth is never read.
        assert_eq!(extractor.calls, 4);
        assert!(result.score > 0.99, "score {}", result.score);
        assert!(result.is_match);
    }

    #[test]
    fn test_unreadable_embedding_falls_back() {
        let store = RecordingStore::default();
        store
            .put(EMBEDDING_KEY, b"not numpy", "application/octet-stream")
            .unwrap();
        put_baseline_jpeg(&store, "baseline_1_1.jpg", [0, 0, 200]);

        let result = verify_user(
            &request(solid_png(8, 8, [0, 0, 200]), Metric::Cosine),
            &mut ColorExtractor::default(),
            &store,
        )
        .unwrap();
        assert_eq!(store.list_calls(), 1);
        assert!(result.is_match);
    }

    #[test]
    fn test_fallback_skips_unusable_images() {
        let store = RecordingStore::default();
        put_baseline_jpeg(&store, "baseline_1_1.jpg", [0, 0, 0]);
        store
            .put("face_detection/emp-7/baseline_1_2.jpg", b"corrupt", "image/jpeg")
            .unwrap();
        put_baseline_jpeg(&store, "baseline_1_3.jpg", [0, 200, 0]);

        let result = verify_user(
            &request(solid_png(8, 8, [0, 200, 0]), Metric::Cosine),
            &mut ColorExtractor::default(),
            &store,
        )
        .unwrap();
        assert!(result.score > 0.99);
    }

    #[test]
    fn test_user_without_baseline_is_not_enrolled() {
        let store = RecordingStore::default();
        store
            .put("face_detection/emp-7/notes.txt", b"hello", "text/plain")
            .unwrap();

        let err = verify_user(
            &request(solid_png(8, 8, [9, 90, 9]), Metric::Cosine),
            &mut ColorExtractor::default(),
            &store,
        )
        .unwrap_err();
        assert!(matches!(err, VerifyError::UserNotEnrolled(ref u) if u == "emp-7"));
    }

    #[test]
    fn test_no_usable_baseline_image_is_reference_unavailable() {
        let store = RecordingStore::default();
        put_baseline_jpeg(&store, "baseline_1_1.jpg", [0, 0, 0]);

        let err = verify_user(
            &request(solid_png(8, 8, [9, 90, 9]), Metric::Cosine),
            &mut ColorExtractor::default(),
            &store,
        )
        .unwrap_err();
        assert!(matches!(err, VerifyError::ReferenceUnavailable(_)));
    }

    #[test]
    fn test_corrupt_embedding_without_images_is_reference_unavailable() {
        let store = RecordingStore::default();
        store
            .put(EMBEDDING_KEY, b"not numpy", "application/octet-stream")
            .unwrap();

        let err = verify_user(
            &request(solid_png(8, 8, [9, 90, 9]), Metric::Cosine),
            &mut ColorExtractor::default(),
            &store,
        )
        .unwrap_err();
        assert_eq!(store.list_calls(), 1);
        assert!(matches!(err, VerifyError::ReferenceUnavailable(ref u) if u == "emp-7"));
    }

    #[test]
    fn test_listing_failure_is_storage_error() {
        let store = RecordingStore {
            fail_lists: true,
            ..Default::default()
        };
        let err = verify_user(
            &request(solid_png(8, 8, [9, 90, 9]), Metric::Cosine),
            &mut ColorExtractor::default(),
            &store,
        )
        .unwrap_err();
        assert!(matches!(err, VerifyError::Storage(_)));
    }

    #[test]
    fn test_dimension_mismatch() {
        let store = RecordingStore::default();
        put_embedding(&store, vec![1.0, 0.0, 0.0, 0.0]);

        let err = verify_user(
            &request(solid_png(8, 8, [9, 90, 9]), Metric::Cosine),
            &mut ColorExtractor::default(),
            &store,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            VerifyError::IncompatibleReference {
                reference: 4,
                probe: 3
            }
        ));
    }

    #[test]
    fn test_probe_errors() {
        let store = RecordingStore::default();
        put_embedding(&store, vec![1.0, 0.0, 0.0]);

        let err = verify_user(&request(b"garbage:xx".to_vec(), Metric::Cosine), &mut ColorExtractor::default(), &store)
            .unwrap_err();
        assert!(matches!(err, VerifyError::InvalidImage(_)));

        let err = verify_user(
            &request(solid_png(8, 8, [0, 0, 0]), Metric::Cosine),
            &mut ColorExtractor::default(),
            &store,
        )
        .unwrap_err();
        assert!(matches!(err, VerifyError::NoFaceDetected));

        let err = verify_user(
            &request(solid_png(8, 8, [9, 90, 9]), Metric::Cosine),
            &mut UnavailableExtractor,
            &store,
        )
        .unwrap_err();
        assert!(matches!(err, VerifyError::EngineUnavailable(_)));
    }

    #[test]
    fn test_invalid_user_id() {
        let store = RecordingStore::default();
        let mut req = request(solid_png(8, 8, [9, 90, 9]), Metric::Cosine);
        req.user_id = "../etc".into();
        let err = verify_user(&req, &mut ColorExtractor::default(), &store).unwrap_err();
        assert!(matches!(err, VerifyError::InvalidUserId(_)));
        assert_eq!(store.gets.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[test]
    fn test_picks_highest_confidence_face_in_probe() {
        // ColorExtractor also reports a low-confidence face with the negated
        // colour; only the confident one should be scored.
        let store = RecordingStore::default();
        put_embedding(&store, vec![50.0, 60.0, 70.0]);
        let grid = PixelGrid::from_rgb(RgbImage::from_pixel(8, 8, Rgb([50, 60, 70]))).unwrap();
        let probe = codec::encode_jpeg(&grid).unwrap();

        let result = verify_user(&request(probe, Metric::Cosine), &mut ColorExtractor::default(), &store).unwrap();
        assert!(result.score > 0.99);
    }

    #[test]
    fn test_result_json_uses_match_key() {
        let result = VerificationResult {
            user_id: "7".into(),
            metric: Metric::Euclidean,
            threshold: 1.4,
            score: 0.5,
            is_match: true,
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["match"], true);
        assert_eq!(json["metric"], "euclidean");
        assert!(json.get("is_match").is_none());
    }
}
