//! Embedding extraction: the model-backed extractor, the process-wide engine
//! slot that owns it, and best-face selection.

use crate::codec::PixelGrid;
use crate::detector::{DetectorError, FaceDetector};
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::types::{DetectedFace, Embedding};
use serde::Serialize;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExtractorError {
    #[error("face engine unavailable: {0}")]
    EngineUnavailable(String),
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer: {0}")]
    Recognizer(#[from] RecognizerError),
}

impl ExtractorError {
    pub fn is_engine_unavailable(&self) -> bool {
        matches!(self, ExtractorError::EngineUnavailable(_))
    }
}

/// Turns a decoded image into zero or more detected faces.
///
/// The order of the returned faces is unspecified; use [`select_best`].
/// An empty result means no face was found and is not an error.
pub trait FaceExtractor {
    fn extract(&mut self, grid: &PixelGrid) -> Result<Vec<DetectedFace>, ExtractorError>;
}

/// SCRFD detection followed by ArcFace embedding of every detected face.
pub struct OnnxExtractor {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

impl OnnxExtractor {
    pub fn load(
        detector_path: &Path,
        recognizer_path: &Path,
        detection_size: usize,
    ) -> Result<Self, ExtractorError> {
        let detector = FaceDetector::load(detector_path, detection_size)?;
        let recognizer = FaceRecognizer::load(recognizer_path)?;
        Ok(Self {
            detector,
            recognizer,
        })
    }
}

impl FaceExtractor for OnnxExtractor {
    fn extract(&mut self, grid: &PixelGrid) -> Result<Vec<DetectedFace>, ExtractorError> {
        let boxes = self.detector.detect(grid)?;
        let mut faces = Vec::with_capacity(boxes.len());

        for bbox in boxes {
            if bbox.landmarks.is_none() {
                tracing::warn!(confidence = bbox.confidence, "detection without landmarks skipped");
                continue;
            }
            let embedding = self.recognizer.embed(grid, &bbox)?;
            faces.push(DetectedFace {
                embedding,
                confidence: bbox.confidence,
                bbox: Some(bbox),
            });
        }

        tracing::debug!(
            width = grid.width(),
            height = grid.height(),
            faces = faces.len(),
            "extraction finished"
        );
        Ok(faces)
    }
}

/// Highest-confidence face, ignoring NaN confidences.
pub fn select_best(faces: Vec<DetectedFace>) -> Option<DetectedFace> {
    faces
        .into_iter()
        .filter(|f| !f.confidence.is_nan())
        .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
}

/// Extract, keep the best face, and return its normalized embedding.
/// `Ok(None)` when no face was detected.
pub fn best_embedding<X: FaceExtractor + ?Sized>(
    extractor: &mut X,
    grid: &PixelGrid,
) -> Result<Option<Embedding>, ExtractorError> {
    let faces = extractor.extract(grid)?;
    Ok(select_best(faces).map(|face| face.embedding.normalized()))
}

type Loader<E> = Box<dyn Fn() -> Result<E, ExtractorError> + Send>;

enum EngineState<E> {
    Uninitialized,
    Ready(E),
    Failed(String),
}

/// Observable state of an [`EngineSlot`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum EngineStatus {
    Uninitialized,
    Ready,
    Failed(String),
}

/// Owner of the expensive extraction engine for one process.
///
/// `Uninitialized -> Ready | Failed`. The first use runs the loader and the
/// outcome is cached: once `Failed`, every call returns
/// [`ExtractorError::EngineUnavailable`] with the original reason until
/// [`reinitialize`](Self::reinitialize) is called.
pub struct EngineSlot<E> {
    state: EngineState<E>,
    loader: Loader<E>,
}

impl<E> EngineSlot<E> {
    pub fn new(loader: impl Fn() -> Result<E, ExtractorError> + Send + 'static) -> Self {
        Self {
            state: EngineState::Uninitialized,
            loader: Box::new(loader),
        }
    }

    pub fn status(&self) -> EngineStatus {
        match &self.state {
            EngineState::Uninitialized => EngineStatus::Uninitialized,
            EngineState::Ready(_) => EngineStatus::Ready,
            EngineState::Failed(reason) => EngineStatus::Failed(reason.clone()),
        }
    }

    /// The engine, initializing it on first use.
    pub fn get(&mut self) -> Result<&mut E, ExtractorError> {
        if matches!(self.state, EngineState::Uninitialized) {
            self.load();
        }
        match &mut self.state {
            EngineState::Ready(engine) => Ok(engine),
            EngineState::Failed(reason) => Err(ExtractorError::EngineUnavailable(reason.clone())),
            EngineState::Uninitialized => Err(ExtractorError::EngineUnavailable(
                "engine not initialized".into(),
            )),
        }
    }

    /// Drop the current engine (if any) and run the loader again.
    pub fn reinitialize(&mut self) -> Result<&mut E, ExtractorError> {
        self.state = EngineState::Uninitialized;
        self.get()
    }

    fn load(&mut self) {
        self.state = match (self.loader)() {
            Ok(engine) => {
                tracing::info!("face engine initialized");
                EngineState::Ready(engine)
            }
            Err(e) => {
                tracing::error!(
                    error = %e,
                    "face engine failed to initialize; extraction is unavailable until reinitialized"
                );
                EngineState::Failed(match e {
                    ExtractorError::EngineUnavailable(reason) => reason,
                    other => other.to_string(),
                })
            }
        };
    }
}

impl<E: FaceExtractor> FaceExtractor for EngineSlot<E> {
    fn extract(&mut self, grid: &PixelGrid) -> Result<Vec<DetectedFace>, ExtractorError> {
        self.get()?.extract(grid)
    }
}
