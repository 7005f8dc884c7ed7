//! faceprint-core: face enrollment and verification pipeline.
//!
//! Faces are detected with SCRFD and embedded with ArcFace, both running on
//! ONNX Runtime. Baselines live in an [`faceprint_store::ObjectStore`].

pub mod alignment;
pub mod baseline;
pub mod codec;
pub mod config;
pub mod detector;
pub mod enroll;
pub mod extractor;
pub mod npy;
pub mod recognizer;
pub mod types;
pub mod verify;

#[cfg(test)]
mod test_support;

pub use baseline::UserId;
pub use config::{default_model_dir, Config};
pub use enroll::{enroll_user, EnrollOutcome};
pub use extractor::{EngineSlot, EngineStatus, ExtractorError, FaceExtractor, OnnxExtractor};
pub use types::{BoundingBox, DetectedFace, Embedding, Metric};
pub use verify::{verify_user, VerificationResult, VerifyError, VerifyRequest};
