use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Added to the L2 norm before dividing so a zero vector normalizes to zero
/// instead of NaN.
pub const NORMALIZE_EPSILON: f32 = 1e-12;

/// Default cosine similarity threshold (match iff score >= threshold).
pub const DEFAULT_COSINE_THRESHOLD: f32 = 0.45;
/// Default Euclidean distance threshold (match iff score <= threshold).
pub const DEFAULT_EUCLIDEAN_THRESHOLD: f32 = 1.4;

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum VectorError {
    #[error("cannot aggregate an empty set of embeddings")]
    Empty,
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
}

/// Face embedding vector (512-dimensional for ArcFace w600k_r50).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    pub fn norm(&self) -> f32 {
        l2_norm(&self.values)
    }

    /// Copy scaled to unit length (see [`normalize`]).
    pub fn normalized(&self) -> Embedding {
        Embedding {
            values: normalize(&self.values),
            model_version: self.model_version.clone(),
        }
    }

    /// Cosine similarity in [-1, 1]. Higher = more similar.
    pub fn cosine_similarity(&self, other: &Embedding) -> f32 {
        cosine_similarity(&self.values, &other.values)
    }

    /// Euclidean distance in [0, inf). Lower = more similar.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        euclidean_distance(&self.values, &other.values)
    }

    /// Element-wise mean of `items`.
    ///
    /// The result is not renormalized; callers aggregating unit vectors
    /// normalize the mean themselves.
    pub fn mean(items: &[Embedding]) -> Result<Embedding, VectorError> {
        let first = items.first().ok_or(VectorError::Empty)?;
        let dim = first.dim();

        let mut sums = vec![0.0f64; dim];
        for item in items {
            if item.dim() != dim {
                return Err(VectorError::DimensionMismatch {
                    expected: dim,
                    actual: item.dim(),
                });
            }
            for (acc, v) in sums.iter_mut().zip(&item.values) {
                *acc += f64::from(*v);
            }
        }

        let n = items.len() as f64;
        let same_model = items.iter().all(|e| e.model_version == first.model_version);

        Ok(Embedding {
            values: sums.into_iter().map(|s| (s / n) as f32).collect(),
            model_version: if same_model {
                first.model_version.clone()
            } else {
                None
            },
        })
    }
}

/// A face found by the extractor: its embedding and detection confidence.
#[derive(Debug, Clone)]
pub struct DetectedFace {
    pub embedding: Embedding,
    pub confidence: f32,
    pub bbox: Option<BoundingBox>,
}

fn l2_norm(v: &[f32]) -> f32 {
    v.iter()
        .map(|&x| f64::from(x) * f64::from(x))
        .sum::<f64>()
        .sqrt() as f32
}

/// Divide by the L2 norm plus [`NORMALIZE_EPSILON`].
pub fn normalize(v: &[f32]) -> Vec<f32> {
    let denom = l2_norm(v) + NORMALIZE_EPSILON;
    v.iter().map(|x| x / denom).collect()
}

/// Normalize both inputs and return their dot product.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let a = normalize(a);
    let b = normalize(b);
    a.iter()
        .zip(&b)
        .map(|(x, y)| f64::from(*x) * f64::from(*y))
        .sum::<f64>() as f32
}

/// L2 norm of `a - b`.
pub fn euclidean_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| {
            let d = f64::from(*x) - f64::from(*y);
            d * d
        })
        .sum::<f64>()
        .sqrt() as f32
}

/// Scoring function, which also fixes the direction of the match comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    /// Cosine similarity; higher is more similar.
    #[default]
    Cosine,
    /// Euclidean distance; lower is more similar.
    #[serde(alias = "l2")]
    Euclidean,
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("unknown metric {0:?}: expected \"cosine\" or \"euclidean\"")]
pub struct MetricParseError(pub String);

impl Metric {
    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::Cosine => "cosine",
            Metric::Euclidean => "euclidean",
        }
    }

    pub fn default_threshold(&self) -> f32 {
        match self {
            Metric::Cosine => DEFAULT_COSINE_THRESHOLD,
            Metric::Euclidean => DEFAULT_EUCLIDEAN_THRESHOLD,
        }
    }

    pub fn score(&self, a: &Embedding, b: &Embedding) -> f32 {
        match self {
            Metric::Cosine => a.cosine_similarity(b),
            Metric::Euclidean => a.euclidean_distance(b),
        }
    }

    /// Similarity matches at or above the threshold, distance at or below it.
    pub fn is_match(&self, score: f32, threshold: f32) -> bool {
        match self {
            Metric::Cosine => score >= threshold,
            Metric::Euclidean => score <= threshold,
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Metric {
    type Err = MetricParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cosine" => Ok(Metric::Cosine),
            "euclidean" | "l2" => Ok(Metric::Euclidean),
            _ => Err(MetricParseError(s.to_string())),
        }
    }
}
