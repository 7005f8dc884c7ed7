//! SCRFD face detector via ONNX Runtime.
//!
//! The input is letterboxed into a square canvas anchored at the top-left
//! corner, decoded per stride (8/16/32, two anchors per cell), and filtered
//! with non-maximum suppression.

use crate::codec::PixelGrid;
use crate::types::BoundingBox;
use image::imageops::{self, FilterType};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_CONFIDENCE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

/// Default square detection canvas (matches insightface's `det_size=(640, 640)`).
pub const DEFAULT_DETECTION_SIZE: usize = 640;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}; download det_10g.onnx from insightface buffalo_l")]
    ModelNotFound(String),
    #[error("detection size {0} must be a positive multiple of 32")]
    InvalidInputSize(usize),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Output tensor indices for one stride: (score, bbox, kps).
type StrideOutputIndices = (usize, usize, usize);

/// Raw per-stride tensors, flattened.
struct StrideOutputs<'a> {
    stride: usize,
    scores: &'a [f32],
    bboxes: &'a [f32],
    kps: &'a [f32],
}

/// SCRFD-based face detector.
pub struct FaceDetector {
    session: Session,
    input_size: usize,
    stride_indices: [StrideOutputIndices; 3],
}

impl FaceDetector {
    /// Load the SCRFD ONNX model. `input_size` is the square canvas edge.
    pub fn load(model_path: &Path, input_size: usize) -> Result<Self, DetectorError> {
        if !model_path.exists() {
            return Err(DetectorError::ModelNotFound(model_path.display().to_string()));
        }
        if input_size == 0 || input_size % 32 != 0 {
            return Err(DetectorError::InvalidInputSize(input_size));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> = session
            .outputs()
            .iter()
            .map(|o| o.name().to_string())
            .collect();

        tracing::info!(
            path = %model_path.display(),
            input_size,
            outputs = ?output_names,
            "loaded SCRFD model"
        );

        if output_names.len() < 9 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD model with keypoints has 9 outputs (3 strides x score/bbox/kps), got {}",
                output_names.len()
            )));
        }

        let stride_indices = discover_output_indices(&output_names);
        tracing::debug!(?stride_indices, "SCRFD output tensor mapping");

        Ok(Self {
            session,
            input_size,
            stride_indices,
        })
    }

    /// Detect faces, highest confidence first.
    pub fn detect(&mut self, grid: &PixelGrid) -> Result<Vec<BoundingBox>, DetectorError> {
        let (input, scale) = preprocess(grid, self.input_size);

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (pos, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx, kps_idx) = self.stride_indices[pos];
            let extract = |idx: usize, what: &'static str| {
                outputs[idx]
                    .try_extract_tensor::<f32>()
                    .map(|(_, data)| data)
                    .map_err(|e| {
                        DetectorError::InferenceFailed(format!("{what} stride {stride}: {e}"))
                    })
            };

            let tensors = StrideOutputs {
                stride,
                scores: extract(score_idx, "scores")?,
                bboxes: extract(bbox_idx, "bboxes")?,
                kps: extract(kps_idx, "kps")?,
            };
            candidates.extend(decode_stride(
                &tensors,
                self.input_size,
                scale,
                SCRFD_CONFIDENCE_THRESHOLD,
            ));
        }

        Ok(nms(candidates, SCRFD_NMS_THRESHOLD))
    }
}

/// Resize into the top-left of a `size`x`size` canvas and convert to a
/// normalized NCHW tensor. Returns the tensor and the resize scale.
fn preprocess(grid: &PixelGrid, size: usize) -> (Array4<f32>, f32) {
    let rgb = grid.as_rgb();
    let (width, height) = (rgb.width() as f32, rgb.height() as f32);
    let scale = (size as f32 / width).min(size as f32 / height);

    let new_w = ((width * scale).round() as u32).clamp(1, size as u32);
    let new_h = ((height * scale).round() as u32).clamp(1, size as u32);
    let resized = imageops::resize(rgb, new_w, new_h, FilterType::Triangle);

    // Canvas padding is black, as in the insightface reference pipeline.
    let pad_value = (0.0 - SCRFD_MEAN) / SCRFD_STD;
    let mut tensor = Array4::<f32>::from_elem((1, 3, size, size), pad_value);
    for (x, y, pixel) in resized.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = (pixel[c] as f32 - SCRFD_MEAN) / SCRFD_STD;
        }
    }

    (tensor, scale)
}

/// Map output tensors to strides.
///
/// Exports either name their outputs (`score_8`, `bbox_16`, `kps_32`, ...) or
/// use opaque numeric names. Named outputs are matched by name; otherwise the
/// standard positional layout is assumed: scores 0-2, bboxes 3-5, kps 6-8.
fn discover_output_indices(names: &[String]) -> [StrideOutputIndices; 3] {
    let find = |kind: &str, stride: usize| {
        let target = format!("{kind}_{stride}");
        names.iter().position(|n| *n == target)
    };

    let by_name: Option<Vec<StrideOutputIndices>> = SCRFD_STRIDES
        .iter()
        .map(|&stride| Some((find("score", stride)?, find("bbox", stride)?, find("kps", stride)?)))
        .collect();

    match by_name {
        Some(found) => {
            tracing::info!("SCRFD: using name-based output tensor mapping");
            [found[0], found[1], found[2]]
        }
        None => {
            tracing::info!(?names, "SCRFD: output names not recognized, using positional mapping");
            [(0, 3, 6), (1, 4, 7), (2, 5, 8)]
        }
    }
}

/// Decode candidate boxes for one stride level into original image space.
fn decode_stride(
    out: &StrideOutputs<'_>,
    input_size: usize,
    scale: f32,
    threshold: f32,
) -> Vec<BoundingBox> {
    let cells_per_row = input_size / out.stride;
    let anchor_count = cells_per_row * cells_per_row * SCRFD_ANCHORS_PER_CELL;
    let stride = out.stride as f32;

    (0..anchor_count)
        .filter_map(|idx| {
            let score = *out.scores.get(idx)?;
            if score <= threshold {
                return None;
            }

            let cell = idx / SCRFD_ANCHORS_PER_CELL;
            let cx = (cell % cells_per_row) as f32 * stride;
            let cy = (cell / cells_per_row) as f32 * stride;

            let d = out.bboxes.get(idx * 4..idx * 4 + 4)?;
            let x1 = (cx - d[0] * stride) / scale;
            let y1 = (cy - d[1] * stride) / scale;
            let x2 = (cx + d[2] * stride) / scale;
            let y2 = (cy + d[3] * stride) / scale;

            let landmarks = out.kps.get(idx * 10..idx * 10 + 10).map(|k| {
                std::array::from_fn(|i| {
                    (
                        (cx + k[i * 2] * stride) / scale,
                        (cy + k[i * 2 + 1] * stride) / scale,
                    )
                })
            });

            Some(BoundingBox {
                x: x1,
                y: y1,
                width: x2 - x1,
                height: y2 - y1,
                confidence: score,
                landmarks,
            })
        })
        .collect()
}

/// Greedy non-maximum suppression. Output is sorted by descending confidence.
fn nms(mut candidates: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept: Vec<BoundingBox> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        if kept.iter().all(|k| iou(k, &candidate) <= iou_threshold) {
            kept.push(candidate);
        }
    }
    kept
}

/// Intersection-over-Union of two boxes.
fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let inter_w = ((a.x + a.width).min(b.x + b.width) - a.x.max(b.x)).max(0.0);
    let inter_h = ((a.y + a.height).min(b.y + b.height) - a.y.max(b.y)).max(0.0);
    let inter = inter_w * inter_h;
    let union = a.width * a.height + b.width * b.height - inter;

    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn bbox(x: f32, y: f32, w: f32, h: f32, conf: f32) -> BoundingBox {
        BoundingBox {
            x,
            y,
            width: w,
            height: h,
            confidence: conf,
            landmarks: None,
        }
    }

    #[test]
    fn test_iou_identical() {
        let a = bbox(0.0, 0.0, 100.0, 100.0, 1.0);
        assert!((iou(&a, &a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_iou_disjoint() {
        let a = bbox(0.0, 0.0, 10.0, 10.0, 1.0);
        let b = bbox(20.0, 20.0, 10.0, 10.0, 1.0);
        assert_eq!(iou(&a, &b), 0.0);
    }

    #[test]
    fn test_iou_half_overlap() {
        let a = bbox(0.0, 0.0, 10.0, 10.0, 1.0);
        let b = bbox(5.0, 0.0, 10.0, 10.0, 1.0);
        assert!((iou(&a, &b) - 50.0 / 150.0).abs() < 1e-6);
    }

    #[test]
    fn test_nms_keeps_best_of_cluster() {
        let kept = nms(
            vec![
                bbox(5.0, 5.0, 100.0, 100.0, 0.8),
                bbox(200.0, 200.0, 50.0, 50.0, 0.7),
                bbox(0.0, 0.0, 100.0, 100.0, 0.9),
            ],
            0.4,
        );
        let confs: Vec<f32> = kept.iter().map(|b| b.confidence).collect();
        assert_eq!(confs, vec![0.9, 0.7]);
    }

    #[test]
    fn test_nms_empty() {
        assert!(nms(Vec::new(), 0.4).is_empty());
    }

    #[test]
    fn test_preprocess_letterbox_top_left() {
        // 64x32 image into a 32x32 canvas: scale 0.5, content fills rows 0..16.
        let grid = PixelGrid::from_rgb(RgbImage::from_pixel(64, 32, Rgb([255, 127, 0]))).unwrap();
        let (tensor, scale) = preprocess(&grid, 32);

        assert_eq!(tensor.shape(), &[1, 3, 32, 32]);
        assert!((scale - 0.5).abs() < 1e-6);

        let red = (255.0 - SCRFD_MEAN) / SCRFD_STD;
        let blue = (0.0 - SCRFD_MEAN) / SCRFD_STD;
        assert!((tensor[[0, 0, 4, 4]] - red).abs() < 1e-3);
        assert!((tensor[[0, 2, 4, 4]] - blue).abs() < 1e-3);
        // Padding rows below the content.
        assert!((tensor[[0, 0, 20, 4]] - blue).abs() < 1e-6);
    }

    #[test]
    fn test_decode_stride_maps_back_through_scale() {
        // Single cell grid at stride 32 on a 32px canvas, two anchors.
        let scores = [0.9, 0.1];
        let bboxes = [0.25, 0.25, 0.5, 0.5, 0.0, 0.0, 0.0, 0.0];
        let kps: Vec<f32> = (0..20).map(|i| if i < 10 { 0.1 * i as f32 } else { 0.0 }).collect();
        let out = StrideOutputs {
            stride: 32,
            scores: &scores,
            bboxes: &bboxes,
            kps: &kps,
        };

        let dets = decode_stride(&out, 32, 0.5, 0.5);
        assert_eq!(dets.len(), 1);
        let d = &dets[0];
        // Anchor centre (0, 0); x1 = -0.25*32 / 0.5 = -16, x2 = 0.5*32 / 0.5 = 32.
        assert!((d.x + 16.0).abs() < 1e-4);
        assert!((d.width - 48.0).abs() < 1e-4);
        let lms = d.landmarks.unwrap();
        // kps[2], kps[3] = 0.2, 0.3 -> (0.2*32/0.5, 0.3*32/0.5)
        assert!((lms[1].0 - 12.8).abs() < 1e-4);
        assert!((lms[1].1 - 19.2).abs() < 1e-4);
    }

    #[test]
    fn test_decode_stride_tolerates_short_tensors() {
        let out = StrideOutputs {
            stride: 32,
            scores: &[0.9, 0.9],
            bboxes: &[0.1, 0.1, 0.1, 0.1],
            kps: &[],
        };
        let dets = decode_stride(&out, 32, 1.0, 0.5);
        assert_eq!(dets.len(), 1);
        assert!(dets[0].landmarks.is_none());
    }

    #[test]
    fn test_discover_output_indices_named() {
        let names: Vec<String> = [
            "score_8", "score_16", "score_32", "bbox_8", "bbox_16", "bbox_32", "kps_8", "kps_16",
            "kps_32",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        assert_eq!(discover_output_indices(&names), [(0, 3, 6), (1, 4, 7), (2, 5, 8)]);
    }

    #[test]
    fn test_discover_output_indices_shuffled() {
        let names: Vec<String> = [
            "bbox_8", "kps_8", "score_8", "bbox_16", "kps_16", "score_16", "bbox_32", "kps_32",
            "score_32",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        assert_eq!(discover_output_indices(&names), [(2, 0, 1), (5, 3, 4), (8, 6, 7)]);
    }

    #[test]
    fn test_discover_output_indices_positional_fallback() {
        let names: Vec<String> = (0..9).map(|i: usize| (448 + i).to_string()).collect();
        assert_eq!(discover_output_indices(&names), [(0, 3, 6), (1, 4, 7), (2, 5, 8)]);
    }

    #[test]
    fn test_load_missing_model() {
        let err = FaceDetector::load(Path::new("/nonexistent/det_10g.onnx"), 640)
            .err()
            .unwrap();
        assert!(matches!(err, DetectorError::ModelNotFound(_)));
    }
}
