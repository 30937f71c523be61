use facegate_core::controller::{DEFAULT_RESULT_HOLD, DEFAULT_STABLE_WINDOW};
use facegate_core::detector::{DEFAULT_MIN_FACE_PX, DETECTOR_MODEL_FILE};
use facegate_core::lbph::CLASSIFIER_MODEL_FILE;
use facegate_core::{AcceptancePolicy, Timing};
use facegate_hw::lcd::{DEFAULT_I2C_ADDRESS, DEFAULT_I2C_BUS};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Terminal configuration.
///
/// Built from defaults, then an optional TOML file named by
/// `FACEGATE_CONFIG`, then `FACEGATE_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    /// Directory searched first for model files.
    pub model_dir: PathBuf,
    /// Explicit SCRFD model path; searched for when unset.
    pub detector_model: Option<PathBuf>,
    /// LBPH classifier artifact.
    pub classifier_model: PathBuf,
    /// Where failure evidence images are written.
    pub evidence_dir: PathBuf,
    /// Label of the authorized identity.
    pub enrolled_label: i32,
    /// Classifier distance below which the enrolled label is accepted.
    pub confidence_threshold: f32,
    /// Faces with a shorter side below this are ignored.
    pub min_face_px: u32,
    pub stable_secs: f32,
    pub result_hold_secs: f32,
    pub tick_ms: u64,
    /// Frames discarded after the camera opens (AGC/AE stabilization).
    pub warmup_frames: usize,
    /// Drive the I2C LCD; when off, screens are only logged.
    pub lcd_enabled: bool,
    pub lcd_bus: String,
    pub lcd_address: u16,
    pub notify_timeout_secs: u64,
    /// LINE channel access token (secret, environment only).
    pub line_access_token: Option<String>,
    /// LINE recipient user id (secret, environment only).
    pub line_user_id: Option<String>,
}

/// Shape of the optional TOML file. Every key may be omitted.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    camera_device: Option<String>,
    model_dir: Option<PathBuf>,
    detector_model: Option<PathBuf>,
    classifier_model: Option<PathBuf>,
    evidence_dir: Option<PathBuf>,
    enrolled_label: Option<i32>,
    confidence_threshold: Option<f32>,
    min_face_px: Option<u32>,
    stable_secs: Option<f32>,
    result_hold_secs: Option<f32>,
    tick_ms: Option<u64>,
    warmup_frames: Option<usize>,
    lcd_enabled: Option<bool>,
    lcd_bus: Option<String>,
    lcd_address: Option<u16>,
    notify_timeout_secs: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        let model_dir = facegate_core::default_model_dir();
        Self {
            camera_device: "/dev/video0".to_string(),
            classifier_model: model_dir.join(CLASSIFIER_MODEL_FILE),
            model_dir,
            detector_model: None,
            evidence_dir: PathBuf::from("evidence"),
            enrolled_label: AcceptancePolicy::default().enrolled_label,
            confidence_threshold: AcceptancePolicy::default().threshold,
            min_face_px: DEFAULT_MIN_FACE_PX,
            stable_secs: DEFAULT_STABLE_WINDOW.as_secs_f32(),
            result_hold_secs: DEFAULT_RESULT_HOLD.as_secs_f32(),
            tick_ms: 20,
            warmup_frames: 4,
            lcd_enabled: true,
            lcd_bus: DEFAULT_I2C_BUS.to_string(),
            lcd_address: DEFAULT_I2C_ADDRESS,
            notify_timeout_secs: 10,
            line_access_token: None,
            line_user_id: None,
        }
    }
}

impl Config {
    /// Load configuration from `FACEGATE_CONFIG` (if set) and the environment.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Ok(path) = std::env::var("FACEGATE_CONFIG") {
            config.apply_file(Path::new(&path))?;
        }
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    fn apply_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let file: FileConfig = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        // A model_dir change moves the default classifier location with it.
        if let Some(dir) = file.model_dir {
            self.classifier_model = dir.join(CLASSIFIER_MODEL_FILE);
            self.model_dir = dir;
        }
        set(&mut self.camera_device, file.camera_device);
        self.detector_model = file.detector_model.or(self.detector_model.take());
        set(&mut self.classifier_model, file.classifier_model);
        set(&mut self.evidence_dir, file.evidence_dir);
        set(&mut self.enrolled_label, file.enrolled_label);
        set(&mut self.confidence_threshold, file.confidence_threshold);
        set(&mut self.min_face_px, file.min_face_px);
        set(&mut self.stable_secs, file.stable_secs);
        set(&mut self.result_hold_secs, file.result_hold_secs);
        set(&mut self.tick_ms, file.tick_ms);
        set(&mut self.warmup_frames, file.warmup_frames);
        set(&mut self.lcd_enabled, file.lcd_enabled);
        set(&mut self.lcd_bus, file.lcd_bus);
        set(&mut self.lcd_address, file.lcd_address);
        set(&mut self.notify_timeout_secs, file.notify_timeout_secs);

        tracing::debug!(path = %path.display(), "config file applied");
        Ok(())
    }

    fn apply_env<F: Fn(&str) -> Option<String>>(&mut self, var: F) {
        if let Some(dir) = var("FACEGATE_MODEL_DIR").map(PathBuf::from) {
            self.classifier_model = dir.join(CLASSIFIER_MODEL_FILE);
            self.model_dir = dir;
        }
        set(&mut self.camera_device, var("FACEGATE_CAMERA_DEVICE"));
        self.detector_model = var("FACEGATE_DETECTOR_MODEL")
            .map(PathBuf::from)
            .or(self.detector_model.take());
        set(&mut self.classifier_model, var("FACEGATE_CLASSIFIER_MODEL").map(PathBuf::from));
        set(&mut self.evidence_dir, var("FACEGATE_EVIDENCE_DIR").map(PathBuf::from));
        set(&mut self.enrolled_label, parsed(&var, "FACEGATE_ENROLLED_LABEL"));
        set(&mut self.confidence_threshold, parsed(&var, "FACEGATE_CONFIDENCE_THRESHOLD"));
        set(&mut self.min_face_px, parsed(&var, "FACEGATE_MIN_FACE_PX"));
        set(&mut self.stable_secs, parsed(&var, "FACEGATE_STABLE_SECS"));
        set(&mut self.result_hold_secs, parsed(&var, "FACEGATE_RESULT_HOLD_SECS"));
        set(&mut self.tick_ms, parsed(&var, "FACEGATE_TICK_MS"));
        set(&mut self.warmup_frames, parsed(&var, "FACEGATE_WARMUP_FRAMES"));
        set(
            &mut self.lcd_enabled,
            var("FACEGATE_LCD_ENABLED").map(|v| v != "0"),
        );
        set(&mut self.lcd_bus, var("FACEGATE_LCD_BUS"));
        set(
            &mut self.lcd_address,
            var("FACEGATE_LCD_ADDRESS").and_then(|v| parse_address(&v)),
        );
        set(&mut self.notify_timeout_secs, parsed(&var, "FACEGATE_NOTIFY_TIMEOUT_SECS"));

        self.line_access_token = var("LINE_CHANNEL_ACCESS_TOKEN").filter(|v| !v.is_empty());
        self.line_user_id = var("LINE_USER_ID").filter(|v| !v.is_empty());
    }

    /// Candidate directories for the detector model, most specific first.
    pub fn model_search_dirs(&self) -> Vec<PathBuf> {
        vec![
            self.model_dir.clone(),
            PathBuf::from("models"),
            PathBuf::from(facegate_core::SYSTEM_MODEL_DIR),
        ]
    }

    /// Resolve the detector model path: explicit setting, else first hit on the search path.
    pub fn resolve_detector_model(&self) -> Option<PathBuf> {
        match &self.detector_model {
            Some(path) => Some(path.clone()),
            None => facegate_core::locate_model(DETECTOR_MODEL_FILE, &self.model_search_dirs()),
        }
    }

    pub fn timing(&self) -> Timing {
        Timing {
            stable_window: secs(self.stable_secs),
            result_hold: secs(self.result_hold_secs),
        }
    }

    pub fn acceptance(&self) -> AcceptancePolicy {
        AcceptancePolicy {
            enrolled_label: self.enrolled_label,
            threshold: self.confidence_threshold,
        }
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn notify_timeout(&self) -> Duration {
        Duration::from_secs(self.notify_timeout_secs)
    }
}

fn set<T>(slot: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *slot = value;
    }
}

fn parsed<T: std::str::FromStr, F: Fn(&str) -> Option<String>>(var: &F, key: &str) -> Option<T> {
    let raw = var(key)?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparseable setting");
            None
        }
    }
}

/// Accept `0x27` or `39`.
fn parse_address(raw: &str) -> Option<u16> {
    match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16).ok(),
        None => raw.parse().ok(),
    }
}

/// Negative or non-finite seconds collapse to zero.
fn secs(value: f32) -> Duration {
    Duration::try_from_secs_f32(value).unwrap_or(Duration::ZERO)
}
