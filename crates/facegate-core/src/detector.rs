//! SCRFD face localizer via ONNX Runtime.
//!
//! Letterboxes the grayscale frame into the 640×640 SCRFD input, decodes
//! the three anchor-free stride levels and applies greedy NMS. Results come
//! back in descending score order; that order is the detector's own
//! priority and callers treat the first box as the canonical face.

use crate::types::FaceRect;
use image::imageops::{self, FilterType};
use image::GrayImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// File name of the SCRFD model inside a model directory.
pub const DETECTOR_MODEL_FILE: &str = "det_10g.onnx";

/// Faces smaller than this (shorter side, pixels) are dropped by default.
pub const DEFAULT_MIN_FACE_PX: u32 = 80;

const SCRFD_INPUT_SIZE: u32 = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_SCORE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_IOU: f32 = 0.4;
const SCRFD_STRIDES: [u32; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("detector model not found: {}", .0.display())]
    ModelNotFound(PathBuf),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Finds faces in a grayscale image.
pub trait FaceLocalizer {
    /// Return face rectangles in the detector's own priority order.
    fn detect(&mut self, gray: &GrayImage) -> Result<Vec<FaceRect>, DetectorError>;
}

/// Raw detection in letterboxed input coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Candidate {
    x1: f32,
    y1: f32,
    x2: f32,
    y2: f32,
    score: f32,
}

impl Candidate {
    fn area(&self) -> f32 {
        (self.x2 - self.x1).max(0.0) * (self.y2 - self.y1).max(0.0)
    }
}

/// Scale and padding used to fit a frame into the square model input.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    width: u32,
    height: u32,
    pad_x: u32,
    pad_y: u32,
}

impl Letterbox {
    fn fit(frame_width: u32, frame_height: u32) -> Self {
        let target = SCRFD_INPUT_SIZE as f32;
        let scale = (target / frame_width as f32).min(target / frame_height as f32);
        let width = ((frame_width as f32 * scale).round() as u32).clamp(1, SCRFD_INPUT_SIZE);
        let height = ((frame_height as f32 * scale).round() as u32).clamp(1, SCRFD_INPUT_SIZE);
        Self {
            scale,
            width,
            height,
            pad_x: (SCRFD_INPUT_SIZE - width) / 2,
            pad_y: (SCRFD_INPUT_SIZE - height) / 2,
        }
    }

    /// Map a point from model input space back to frame space.
    fn to_frame(&self, x: f32, y: f32) -> (f32, f32) {
        (
            (x - self.pad_x as f32) / self.scale,
            (y - self.pad_y as f32) / self.scale,
        )
    }
}

/// SCRFD detector session plus per-stride output tensor indices.
pub struct ScrfdDetector {
    session: Session,
    /// (score, bbox) output index for each of strides 8, 16, 32.
    outputs: [(usize, usize); 3],
    min_face_px: u32,
}

impl ScrfdDetector {
    /// Load the SCRFD model. A missing file is reported before ONNX Runtime is touched.
    pub fn load(model_path: &Path, min_face_px: u32) -> Result<Self, DetectorError> {
        if !model_path.is_file() {
            return Err(DetectorError::ModelNotFound(model_path.to_path_buf()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let names: Vec<String> = session
            .outputs()
            .iter()
            .map(|o| o.name().to_string())
            .collect();

        if names.len() < 6 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD model needs score and bbox outputs for 3 strides, got {} outputs",
                names.len()
            )));
        }

        let outputs = output_layout(&names);
        tracing::info!(path = %model_path.display(), ?outputs, min_face_px, "SCRFD detector loaded");

        Ok(Self {
            session,
            outputs,
            min_face_px,
        })
    }
}

impl FaceLocalizer for ScrfdDetector {
    fn detect(&mut self, gray: &GrayImage) -> Result<Vec<FaceRect>, DetectorError> {
        let (frame_width, frame_height) = gray.dimensions();
        if frame_width == 0 || frame_height == 0 {
            return Ok(Vec::new());
        }

        let (input, letterbox) = letterbox_tensor(gray);
        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (level, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx) = self.outputs[level];
            let (_, scores) = outputs[score_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("scores stride {stride}: {e}")))?;
            let (_, deltas) = outputs[bbox_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("bboxes stride {stride}: {e}")))?;
            candidates.extend(decode_level(scores, deltas, stride, SCRFD_SCORE_THRESHOLD));
        }

        let faces: Vec<FaceRect> = non_max_suppression(candidates, SCRFD_NMS_IOU)
            .into_iter()
            .filter_map(|c| {
                let (x1, y1) = letterbox.to_frame(c.x1, c.y1);
                let (x2, y2) = letterbox.to_frame(c.x2, c.y2);
                FaceRect::from_detection(x1, y1, x2 - x1, y2 - y1, frame_width, frame_height)
            })
            .filter(|r| r.min_side() >= self.min_face_px)
            .collect();

        tracing::trace!(count = faces.len(), "faces detected");
        Ok(faces)
    }
}

/// Resize into the letterbox and normalize into an NCHW tensor.
///
/// Padding is left at 0.0, which is exactly the normalized mean.
fn letterbox_tensor(gray: &GrayImage) -> (Array4<f32>, Letterbox) {
    let letterbox = Letterbox::fit(gray.width(), gray.height());
    let resized = imageops::resize(gray, letterbox.width, letterbox.height, FilterType::Triangle);

    let size = SCRFD_INPUT_SIZE as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, pixel) in resized.enumerate_pixels() {
        let value = (pixel.0[0] as f32 - SCRFD_MEAN) / SCRFD_STD;
        let row = (y + letterbox.pad_y) as usize;
        let col = (x + letterbox.pad_x) as usize;
        // Grayscale replicated into all three channels
        for channel in 0..3 {
            tensor[[0, channel, row, col]] = value;
        }
    }

    (tensor, letterbox)
}

/// Work out which output tensor holds which stride.
///
/// Exports that name their tensors `score_8`, `bbox_16`, ... are mapped by
/// name; anything else uses the reference layout where scores occupy
/// outputs 0-2 and boxes 3-5.
fn output_layout(names: &[String]) -> [(usize, usize); 3] {
    let position = |kind: &str, stride: u32| {
        let wanted = format!("{kind}_{stride}");
        names.iter().position(|n| *n == wanted)
    };

    let by_name: Option<Vec<(usize, usize)>> = SCRFD_STRIDES
        .iter()
        .map(|&stride| Some((position("score", stride)?, position("bbox", stride)?)))
        .collect();

    match by_name {
        Some(found) => [found[0], found[1], found[2]],
        None => [(0, 3), (1, 4), (2, 5)],
    }
}

/// Decode one stride level into candidates above `threshold`.
fn decode_level(scores: &[f32], deltas: &[f32], stride: u32, threshold: f32) -> Vec<Candidate> {
    let grid = (SCRFD_INPUT_SIZE / stride) as usize;
    let anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;
    let stride = stride as f32;

    scores
        .iter()
        .take(anchors)
        .enumerate()
        .filter(|&(_, &score)| score > threshold)
        .filter_map(|(idx, &score)| {
            let d = deltas.get(idx * 4..idx * 4 + 4)?;
            let cell = idx / SCRFD_ANCHORS_PER_CELL;
            let cx = (cell % grid) as f32 * stride;
            let cy = (cell / grid) as f32 * stride;
            Some(Candidate {
                x1: cx - d[0] * stride,
                y1: cy - d[1] * stride,
                x2: cx + d[2] * stride,
                y2: cy + d[3] * stride,
                score,
            })
        })
        .collect()
}

/// Greedy NMS; survivors are returned highest score first.
fn non_max_suppression(mut candidates: Vec<Candidate>, iou_threshold: f32) -> Vec<Candidate> {
    candidates.sort_by(|a, b| b.score.total_cmp(&a.score));

    let mut kept: Vec<Candidate> = Vec::new();
    for candidate in candidates {
        if kept.iter().all(|k| iou(k, &candidate) <= iou_threshold) {
            kept.push(candidate);
        }
    }
    kept
}

fn iou(a: &Candidate, b: &Candidate) -> f32 {
    let overlap = Candidate {
        x1: a.x1.max(b.x1),
        y1: a.y1.max(b.y1),
        x2: a.x2.min(b.x2),
        y2: a.y2.min(b.y2),
        score: 0.0,
    };
    let inter = overlap.area();
    let union = a.area() + b.area() - inter;
    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(x: f32, y: f32, w: f32, h: f32, score: f32) -> Candidate {
        Candidate {
            x1: x,
            y1: y,
            x2: x + w,
            y2: y + h,
            score,
        }
    }

    #[test]
    fn test_iou_identical_and_disjoint() {
        let a = candidate(0.0, 0.0, 100.0, 100.0, 1.0);
        let b = candidate(200.0, 200.0, 10.0, 10.0, 1.0);
        assert!((iou(&a, &a) - 1.0).abs() < 1e-6);
        assert!(iou(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn test_iou_partial() {
        let a = candidate(0.0, 0.0, 10.0, 10.0, 1.0);
        let b = candidate(5.0, 0.0, 10.0, 10.0, 1.0);
        assert!((iou(&a, &b) - 50.0 / 150.0).abs() < 1e-6);
    }

    #[test]
    fn test_nms_keeps_highest_of_overlapping_pair() {
        let kept = non_max_suppression(
            vec![
                candidate(5.0, 5.0, 100.0, 100.0, 0.8),
                candidate(200.0, 200.0, 50.0, 50.0, 0.7),
                candidate(0.0, 0.0, 100.0, 100.0, 0.9),
            ],
            SCRFD_NMS_IOU,
        );
        let scores: Vec<f32> = kept.iter().map(|c| c.score).collect();
        assert_eq!(scores, vec![0.9, 0.7]);
    }

    #[test]
    fn test_nms_empty() {
        assert!(non_max_suppression(Vec::new(), SCRFD_NMS_IOU).is_empty());
    }

    #[test]
    fn test_letterbox_landscape_frame() {
        let lb = Letterbox::fit(640, 480);
        assert_eq!((lb.width, lb.height), (640, 480));
        assert_eq!((lb.pad_x, lb.pad_y), (0, 80));

        let (x, y) = lb.to_frame(100.0, 80.0 + 50.0);
        assert!((x - 100.0).abs() < 1e-4 && (y - 50.0).abs() < 1e-4);
    }

    #[test]
    fn test_letterbox_upscales_small_frame() {
        let lb = Letterbox::fit(320, 240);
        assert!((lb.scale - 2.0).abs() < 1e-6);
        let (x, y) = lb.to_frame(200.0, 80.0 + 100.0);
        assert!((x - 100.0).abs() < 1e-4, "x: {x}");
        assert!((y - 50.0).abs() < 1e-4, "y: {y}");
    }

    #[test]
    fn test_letterbox_tensor_pads_with_zero() {
        let gray = GrayImage::from_pixel(640, 480, image::Luma([255]));
        let (tensor, lb) = letterbox_tensor(&gray);
        assert_eq!(tensor.shape(), &[1, 3, 640, 640]);
        assert_eq!(tensor[[0, 0, 0, 0]], 0.0);
        let inside = tensor[[0, 2, lb.pad_y as usize + 10, 10]];
        assert!((inside - (255.0 - SCRFD_MEAN) / SCRFD_STD).abs() < 1e-6);
    }

    #[test]
    fn test_output_layout_by_name() {
        let names: Vec<String> = [
            "bbox_8", "kps_8", "score_8", "bbox_16", "kps_16", "score_16", "bbox_32", "kps_32",
            "score_32",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        assert_eq!(output_layout(&names), [(2, 0), (5, 3), (8, 6)]);
    }

    #[test]
    fn test_output_layout_positional_fallback() {
        let names: Vec<String> = (0..9).map(|i: usize| (448 + i).to_string()).collect();
        assert_eq!(output_layout(&names), [(0, 3), (1, 4), (2, 5)]);
    }

    #[test]
    fn test_decode_level_maps_anchor_cell() {
        let grid = (SCRFD_INPUT_SIZE / 32) as usize;
        let anchors = grid * grid * SCRFD_ANCHORS_PER_CELL;
        let mut scores = vec![0.0f32; anchors];
        let mut deltas = vec![0.0f32; anchors * 4];

        // Second anchor of cell (col 3, row 2).
        let idx = (2 * grid + 3) * SCRFD_ANCHORS_PER_CELL + 1;
        scores[idx] = 0.9;
        deltas[idx * 4..idx * 4 + 4].copy_from_slice(&[1.0, 1.0, 2.0, 2.0]);

        let found = decode_level(&scores, &deltas, 32, SCRFD_SCORE_THRESHOLD);
        assert_eq!(found.len(), 1);
        let c = found[0];
        assert_eq!((c.x1, c.y1, c.x2, c.y2), (64.0, 32.0, 160.0, 128.0));
    }

    #[test]
    fn test_decode_level_skips_low_scores() {
        let scores = vec![0.5f32, 0.2, 0.49];
        let deltas = vec![1.0f32; 12];
        assert!(decode_level(&scores, &deltas, 8, SCRFD_SCORE_THRESHOLD).is_empty());
    }

    #[test]
    fn test_load_missing_model() {
        let err = ScrfdDetector::load(Path::new("/nonexistent/det_10g.onnx"), DEFAULT_MIN_FACE_PX)
            .err()
            .unwrap();
        assert!(matches!(err, DetectorError::ModelNotFound(_)));
    }
}
