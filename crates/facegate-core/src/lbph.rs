//! Local Binary Pattern Histogram (LBPH) identity classifier.
//!
//! Each normalized face crop is turned into 3×3 LBP codes, split into a
//! grid of cells, and described by the concatenation of the per-cell
//! 256-bin histograms (each L1-normalized). Prediction is nearest-neighbour
//! against the enrolled samples using the alternative chi-square distance,
//! so the reported confidence is a distance: lower means a closer match.
//!
//! The model artifact is a JSON document holding the grid parameters and
//! every enrolled histogram with its label.

use crate::types::Prediction;
use image::imageops::{self, FilterType};
use image::GrayImage;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Side length faces are normalized to before classification.
pub const FACE_SIZE: u32 = 200;

/// Default file name of the classifier artifact inside a model directory.
pub const CLASSIFIER_MODEL_FILE: &str = "lbph_model.json";

const MODEL_FORMAT_VERSION: u32 = 1;
const DEFAULT_GRID: u32 = 8;
const BINS: usize = 256;

#[derive(Error, Debug)]
pub enum ClassifierError {
    #[error("classifier model not found: {}", .0.display())]
    ModelNotFound(PathBuf),
    #[error("classifier model has no enrolled samples")]
    EmptyModel,
    #[error("unsupported classifier model format version {0}")]
    UnsupportedVersion(u32),
    #[error("corrupt classifier model: {0}")]
    Corrupt(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Scores a normalized face crop against enrolled identities.
pub trait IdentityClassifier {
    fn predict(&self, face: &GrayImage) -> Prediction;
}

/// One enrolled face: its label and spatial histogram.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LbphSample {
    pub label: i32,
    pub histogram: Vec<f32>,
}

/// Trained LBPH model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LbphModel {
    format_version: u32,
    grid_x: u32,
    grid_y: u32,
    face_size: u32,
    samples: Vec<LbphSample>,
}

impl LbphModel {
    /// Build a model from labeled face crops. Crops are resized to [`FACE_SIZE`] if needed.
    pub fn train<I>(faces: I) -> Result<Self, ClassifierError>
    where
        I: IntoIterator<Item = (i32, GrayImage)>,
    {
        let samples: Vec<LbphSample> = faces
            .into_iter()
            .map(|(label, face)| LbphSample {
                label,
                histogram: spatial_histogram(&normalize_face(&face), DEFAULT_GRID, DEFAULT_GRID),
            })
            .collect();

        if samples.is_empty() {
            return Err(ClassifierError::EmptyModel);
        }

        tracing::info!(samples = samples.len(), "LBPH model trained");

        Ok(Self {
            format_version: MODEL_FORMAT_VERSION,
            grid_x: DEFAULT_GRID,
            grid_y: DEFAULT_GRID,
            face_size: FACE_SIZE,
            samples,
        })
    }

    /// Load a model artifact, validating its shape.
    pub fn load(path: &Path) -> Result<Self, ClassifierError> {
        if !path.is_file() {
            return Err(ClassifierError::ModelNotFound(path.to_path_buf()));
        }

        let raw = std::fs::read_to_string(path)?;
        let model: LbphModel = serde_json::from_str(&raw)?;
        model.validate()?;

        tracing::info!(
            path = %path.display(),
            samples = model.samples.len(),
            grid_x = model.grid_x,
            grid_y = model.grid_y,
            "LBPH model loaded"
        );
        Ok(model)
    }

    /// Write the model as JSON, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<(), ClassifierError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_vec(self)?)?;
        Ok(())
    }

    pub fn samples(&self) -> &[LbphSample] {
        &self.samples
    }

    fn validate(&self) -> Result<(), ClassifierError> {
        if self.format_version != MODEL_FORMAT_VERSION {
            return Err(ClassifierError::UnsupportedVersion(self.format_version));
        }
        if self.samples.is_empty() {
            return Err(ClassifierError::EmptyModel);
        }
        // Every grid cell must cover at least one LBP code.
        let code_side = self.face_size.saturating_sub(2);
        let grid_fits =
            (1..=code_side).contains(&self.grid_x) && (1..=code_side).contains(&self.grid_y);
        let expected = (self.grid_x as usize)
            .checked_mul(self.grid_y as usize)
            .and_then(|cells| cells.checked_mul(BINS))
            .filter(|_| grid_fits)
            .ok_or_else(|| {
                ClassifierError::Corrupt(format!(
                    "grid {}x{} face size {}",
                    self.grid_x, self.grid_y, self.face_size
                ))
            })?;
        if let Some(bad) = self.samples.iter().find(|s| s.histogram.len() != expected) {
            return Err(ClassifierError::Corrupt(format!(
                "sample with label {} has {} bins, expected {expected}",
                bad.label,
                bad.histogram.len()
            )));
        }
        Ok(())
    }
}

impl IdentityClassifier for LbphModel {
    fn predict(&self, face: &GrayImage) -> Prediction {
        let face = if face.dimensions() == (self.face_size, self.face_size) {
            face.clone()
        } else {
            imageops::resize(face, self.face_size, self.face_size, FilterType::Triangle)
        };
        let query = spatial_histogram(&face, self.grid_x, self.grid_y);

        // validate() guarantees at least one sample on loaded models
        self.samples
            .iter()
            .map(|s| Prediction {
                label: s.label,
                confidence: chi_square(&s.histogram, &query),
            })
            .min_by(|a, b| a.confidence.total_cmp(&b.confidence))
            .unwrap_or(Prediction {
                label: -1,
                confidence: f32::MAX,
            })
    }
}

/// Resize a face crop to the canonical classifier size.
pub fn normalize_face(face: &GrayImage) -> GrayImage {
    if face.dimensions() == (FACE_SIZE, FACE_SIZE) {
        return face.clone();
    }
    imageops::resize(face, FACE_SIZE, FACE_SIZE, FilterType::Triangle)
}

/// 3×3 LBP codes. The output is two pixels smaller in each dimension.
///
/// Neighbours are visited clockwise from the top-left; bit 7 is the
/// top-left neighbour, a bit is set when the neighbour is >= the centre.
fn lbp_codes(face: &GrayImage) -> GrayImage {
    const NEIGHBOURS: [(i64, i64); 8] = [
        (-1, -1),
        (0, -1),
        (1, -1),
        (1, 0),
        (1, 1),
        (0, 1),
        (-1, 1),
        (-1, 0),
    ];

    let (w, h) = face.dimensions();
    if w < 3 || h < 3 {
        return GrayImage::new(0, 0);
    }

    GrayImage::from_fn(w - 2, h - 2, |x, y| {
        let (cx, cy) = (x as i64 + 1, y as i64 + 1);
        let centre = face.get_pixel(cx as u32, cy as u32).0[0];
        let code = NEIGHBOURS
            .iter()
            .enumerate()
            .fold(0u8, |code, (bit, (dx, dy))| {
                let neighbour = face.get_pixel((cx + dx) as u32, (cy + dy) as u32).0[0];
                if neighbour >= centre {
                    code | (1u8 << (7 - bit))
                } else {
                    code
                }
            });
        image::Luma([code])
    })
}

/// Concatenated per-cell LBP histograms for a face crop.
fn spatial_histogram(face: &GrayImage, grid_x: u32, grid_y: u32) -> Vec<f32> {
    let codes = lbp_codes(face);
    let (w, h) = codes.dimensions();
    let cell_w = w / grid_x;
    let cell_h = h / grid_y;
    let mut histogram = vec![0.0f32; (grid_x * grid_y) as usize * BINS];

    if cell_w == 0 || cell_h == 0 {
        return histogram;
    }

    let cell_pixels = (cell_w * cell_h) as f32;
    for row in 0..grid_y {
        for col in 0..grid_x {
            let offset = (row * grid_x + col) as usize * BINS;
            let cell = &mut histogram[offset..offset + BINS];
            for y in row * cell_h..(row + 1) * cell_h {
                for x in col * cell_w..(col + 1) * cell_w {
                    cell[codes.get_pixel(x, y).0[0] as usize] += 1.0;
                }
            }
            for bin in cell.iter_mut() {
                *bin /= cell_pixels;
            }
        }
    }

    histogram
}

/// Alternative chi-square distance: `2 * Σ (a - b)² / (a + b)`.
fn chi_square(a: &[f32], b: &[f32]) -> f32 {
    2.0 * a
        .iter()
        .zip(b)
        .filter(|(x, y)| *x + *y > f32::EPSILON)
        .map(|(x, y)| (x - y).powi(2) / (x + y))
        .sum::<f32>()
}
