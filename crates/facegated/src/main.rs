use anyhow::Context;
use facegate_core::{
    ClassificationAdapter, ClassifierError, DetectorError, LbphModel, ScrfdDetector,
    VerificationController,
};
use facegate_hw::{Camera, CameraError, CharDisplay, DisplayError, Lcd1602, TracingDisplay};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

mod config;
mod dispatcher;
mod driver;
mod evidence;
mod notifier;

use config::{Config, ConfigError};
use dispatcher::{CachedDisplay, EffectDispatcher, Screen};
use driver::{DriverError, TickDriver};
use evidence::EvidenceStore;
use notifier::{LineCredentials, LineNotifier, NotifyError};

#[derive(Error, Debug)]
enum StartupError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("display unavailable: {0}")]
    Display(#[from] DisplayError),
    #[error("classifier model: {0}")]
    Classifier(#[from] ClassifierError),
    #[error("face detector model not found (searched {0:?})")]
    DetectorNotFound(Vec<PathBuf>),
    #[error("face detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("camera: {0}")]
    Camera(#[from] CameraError),
    #[error("notifier: {0}")]
    Notifier(#[from] NotifyError),
}

impl StartupError {
    /// Screen to leave on the display before exiting, if any.
    fn screen(&self) -> Option<Screen> {
        match self {
            StartupError::Classifier(_) => Some(Screen::MODEL_MISSING),
            StartupError::DetectorNotFound(_) | StartupError::Detector(_) => {
                Some(Screen::DETECTOR_MISSING)
            }
            StartupError::Camera(_) => Some(Screen::CAMERA_ERROR),
            _ => None,
        }
    }
}

type Terminal = TickDriver<Camera, ScrfdDetector, LbphModel, Box<dyn CharDisplay>, LineNotifier>;

/// Everything loaded before the display is handed to the dispatcher.
struct Components {
    adapter: ClassificationAdapter<ScrfdDetector, LbphModel>,
    camera: Camera,
    notifier: LineNotifier,
}

fn main() -> ExitCode {
    let dotenv = dotenvy::dotenv();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Ok(path) = dotenv {
        tracing::debug!(path = %path.display(), "loaded .env");
    }
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "facegated starting");

    let shutdown = Arc::new(AtomicBool::new(false));
    if let Err(e) = spawn_signal_watcher(shutdown.clone()) {
        tracing::error!(error = %format!("{e:#}"), "fatal startup error");
        return Exit::Startup.into();
    }

    let mut terminal = match start() {
        Ok(terminal) => terminal,
        Err(e) => {
            tracing::error!(error = %e, "fatal startup error");
            return Exit::Startup.into();
        }
    };

    tracing::info!("facegated ready");
    let result = terminal.run(&shutdown);
    drop(terminal);

    match &result {
        Ok(()) => tracing::info!("facegated stopped"),
        Err(e) => tracing::error!(error = %e, "tick loop failed"),
    }
    Exit::after_run(&result).into()
}

/// How the process ends: 0 graceful, 1 startup failure, 2 tick loop failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    Graceful,
    Startup,
    Runtime,
}

impl Exit {
    fn after_run(result: &Result<(), DriverError>) -> Self {
        match result {
            Ok(()) => Exit::Graceful,
            Err(_) => Exit::Runtime,
        }
    }

    fn code(self) -> u8 {
        match self {
            Exit::Graceful => 0,
            Exit::Startup => 1,
            Exit::Runtime => 2,
        }
    }
}

impl From<Exit> for ExitCode {
    fn from(exit: Exit) -> Self {
        ExitCode::from(exit.code())
    }
}

fn start() -> Result<Terminal, StartupError> {
    let config = Config::load()?;
    let mut display = CachedDisplay::new(open_display(&config)?);

    let components = match load_components(&config) {
        Ok(components) => components,
        Err(e) => {
            if let Some(screen) = e.screen() {
                if let Err(display_err) = display.show(screen) {
                    tracing::warn!(error = %display_err, "could not show startup error");
                }
            }
            return Err(e);
        }
    };

    let dispatcher = EffectDispatcher::new(
        display,
        EvidenceStore::new(&config.evidence_dir),
        components.notifier,
    );
    tracing::info!(
        evidence_dir = %config.evidence_dir.display(),
        alerts = dispatcher.notifier().is_enabled(),
        "effects configured"
    );

    Ok(TickDriver::new(
        components.camera,
        components.adapter,
        VerificationController::new(config.timing()),
        dispatcher,
        config.tick_interval(),
    ))
}

fn open_display(config: &Config) -> Result<Box<dyn CharDisplay>, DisplayError> {
    if !config.lcd_enabled {
        tracing::info!("LCD disabled; screens go to the log");
        return Ok(Box::new(TracingDisplay));
    }
    Ok(Box::new(Lcd1602::open(&config.lcd_bus, config.lcd_address)?))
}

fn load_components(config: &Config) -> Result<Components, StartupError> {
    let classifier = LbphModel::load(&config.classifier_model)?;

    let detector_path = config
        .resolve_detector_model()
        .ok_or_else(|| StartupError::DetectorNotFound(config.model_search_dirs()))?;
    let detector = ScrfdDetector::load(&detector_path, config.min_face_px)?;

    let mut camera = Camera::open(&config.camera_device)?;
    camera.discard(config.warmup_frames)?;
    tracing::debug!(frames = config.warmup_frames, "camera warm-up discarded");

    let credentials = LineCredentials::from_parts(
        config.line_access_token.clone(),
        config.line_user_id.clone(),
    );
    let notifier = LineNotifier::new(credentials, config.notify_timeout())?;

    Ok(Components {
        adapter: ClassificationAdapter::new(detector, classifier, config.acceptance()),
        camera,
        notifier,
    })
}

/// Raise `shutdown` on SIGINT or SIGTERM from a dedicated thread.
fn spawn_signal_watcher(shutdown: Arc<AtomicBool>) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build signal runtime")?;

    std::thread::Builder::new()
        .name("signal-watcher".into())
        .spawn(move || {
            runtime.block_on(async {
                let mut terminate =
                    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                        Ok(signal) => signal,
                        Err(e) => {
                            tracing::warn!(error = %e, "SIGTERM handler unavailable");
                            let _ = tokio::signal::ctrl_c().await;
                            return;
                        }
                    };
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => tracing::info!("SIGINT received"),
                    _ = terminate.recv() => tracing::info!("SIGTERM received"),
                }
            });
            shutdown.store(true, Ordering::SeqCst);
        })
        .context("failed to spawn signal watcher")?;
    Ok(())
}
