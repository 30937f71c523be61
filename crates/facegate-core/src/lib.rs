//! facegate-core: verification logic for the access-control terminal.
//!
//! Face localization (SCRFD via ONNX Runtime), identity classification
//! (LBPH), the classification adapter that combines them, and the
//! debounced verification state machine that turns per-frame observations
//! into access decisions.

pub mod classify;
pub mod controller;
pub mod detector;
pub mod lbph;
pub mod types;

pub use classify::{ClassificationAdapter, ObserveError};
pub use controller::{step, Phase, Timing, VerificationController, VerificationSession};
pub use detector::{DetectorError, FaceLocalizer, ScrfdDetector};
pub use lbph::{ClassifierError, IdentityClassifier, LbphModel};
pub use types::{
    AcceptancePolicy, Decision, FaceObservation, FaceRect, FailureEvidence, Outcome, Prediction,
};

use std::path::{Path, PathBuf};

/// System-wide model directory consulted after the user's own.
pub const SYSTEM_MODEL_DIR: &str = "/usr/share/facegate/models";

/// Per-user model directory: `$XDG_DATA_HOME/facegate/models`, falling back
/// to `~/.local/share/facegate/models`.
pub fn default_model_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facegate/models")
}

/// Find `file_name` in the first directory that contains it.
pub fn locate_model<P: AsRef<Path>>(file_name: &str, dirs: &[P]) -> Option<PathBuf> {
    dirs.iter()
        .map(|dir| dir.as_ref().join(file_name))
        .find(|candidate| candidate.is_file())
}
