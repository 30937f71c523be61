use image::GrayImage;
use serde::{Deserialize, Serialize};

/// Axis-aligned face rectangle in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaceRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl FaceRect {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Convert a floating-point detection box to a pixel rectangle clipped to the frame.
    ///
    /// Returns `None` when nothing of the box remains inside the frame.
    pub fn from_detection(
        x: f32,
        y: f32,
        width: f32,
        height: f32,
        frame_width: u32,
        frame_height: u32,
    ) -> Option<Self> {
        let x0 = x.max(0.0).round() as u32;
        let y0 = y.max(0.0).round() as u32;
        let x1 = ((x + width).round().max(0.0) as u32).min(frame_width);
        let y1 = ((y + height).round().max(0.0) as u32).min(frame_height);

        if x1 <= x0 || y1 <= y0 {
            return None;
        }

        Some(Self::new(x0, y0, x1 - x0, y1 - y0))
    }

    /// Smaller of the two sides.
    pub fn min_side(&self) -> u32 {
        self.width.min(self.height)
    }
}

/// Per-face verdict: authorized or not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Outcome {
    Ok,
    Fail,
}

impl Outcome {
    /// A face is authorized only when it is the enrolled identity *and* the
    /// classifier distance is strictly below the acceptance threshold.
    pub fn from_prediction(prediction: &Prediction, policy: &AcceptancePolicy) -> Self {
        if prediction.label == policy.enrolled_label && prediction.confidence < policy.threshold {
            Outcome::Ok
        } else {
            Outcome::Fail
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Ok => f.write_str("OK"),
            Outcome::Fail => f.write_str("FAIL"),
        }
    }
}

/// Identity classifier output for one normalized face crop.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub label: i32,
    /// Distance to the closest enrolled sample. Lower = more similar.
    pub confidence: f32,
}

/// Which label counts as the authorized identity, and how close it must be.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AcceptancePolicy {
    pub enrolled_label: i32,
    pub threshold: f32,
}

impl Default for AcceptancePolicy {
    fn default() -> Self {
        Self {
            enrolled_label: 1,
            threshold: 70.0,
        }
    }
}

/// One classified face from one frame.
///
/// Owns the frame it was found in so a finalized failure can hand it
/// straight to evidence capture.
#[derive(Debug, Clone, PartialEq)]
pub struct FaceObservation {
    pub bbox: FaceRect,
    pub label: i32,
    pub confidence: f32,
    pub outcome: Outcome,
    pub frame: GrayImage,
}

/// Everything evidence capture needs about a finalized failure.
#[derive(Debug, Clone, PartialEq)]
pub struct FailureEvidence {
    pub bbox: FaceRect,
    pub confidence: f32,
    pub frame: GrayImage,
}

/// Event emitted by the verification controller.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    ShowIdle,
    ShowVerifying,
    ShowSuccess,
    ShowFailure(FailureEvidence),
}

impl Decision {
    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Decision::ShowIdle => "idle",
            Decision::ShowVerifying => "verifying",
            Decision::ShowSuccess => "success",
            Decision::ShowFailure(_) => "failure",
        }
    }
}
