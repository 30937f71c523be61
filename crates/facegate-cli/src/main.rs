use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use facegate_core::detector::{DEFAULT_MIN_FACE_PX, DETECTOR_MODEL_FILE};
use facegate_core::lbph::{self, CLASSIFIER_MODEL_FILE};
use facegate_core::{
    AcceptancePolicy, ClassificationAdapter, FaceLocalizer, LbphModel, ScrfdDetector,
};
use facegate_hw::{Camera, FrameSource};
use image::{imageops, GrayImage};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

#[derive(Parser)]
#[command(name = "facegate", about = "facegate access terminal tools")]
struct Cli {
    /// Directory searched first for model files
    #[arg(long, global = true)]
    model_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List V4L2 capture devices
    Devices,
    /// Capture face crops of the person to enroll
    Collect {
        /// Camera device path
        #[arg(short, long, default_value = "/dev/video0")]
        device: String,
        /// Output directory for face_NNN.png crops
        #[arg(short, long, default_value = "data/me")]
        out: PathBuf,
        /// Number of crops to save
        #[arg(short, long, default_value_t = 100)]
        count: usize,
        /// Minimum seconds between saved crops
        #[arg(short, long, default_value_t = 0.5)]
        interval: f32,
    },
    /// Build the classifier model from a directory of face crops
    Train {
        /// Directory of .png/.jpg/.jpeg face crops
        #[arg(default_value = "data/me")]
        data_dir: PathBuf,
        /// Label assigned to every crop
        #[arg(short, long, default_value_t = 1)]
        label: i32,
        /// Output model path (default: <model-dir>/lbph_model.json)
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// Classify the first face in one image file
    Check {
        image: PathBuf,
        /// Classifier model path (default: <model-dir>/lbph_model.json)
        #[arg(long)]
        model: Option<PathBuf>,
        #[arg(long, default_value_t = 1)]
        enrolled_label: i32,
        #[arg(long, default_value_t = 70.0)]
        threshold: f32,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let model_dir = cli
        .model_dir
        .clone()
        .unwrap_or_else(facegate_core::default_model_dir);

    match cli.command {
        Commands::Devices => {
            let devices = Camera::list_devices();
            if devices.is_empty() {
                println!("No capture devices found");
            }
            for dev in devices {
                println!("{}  {} ({}, {})", dev.path, dev.name, dev.driver, dev.bus);
            }
        }
        Commands::Collect {
            device,
            out,
            count,
            interval,
        } => {
            let interval =
                Duration::try_from_secs_f32(interval).context("invalid --interval")?;
            let mut detector = load_detector(&model_dir)?;
            let mut camera = Camera::open(&device)?;
            camera.discard(4)?;
            std::fs::create_dir_all(&out)
                .with_context(|| format!("creating {}", out.display()))?;
            println!("Collecting {count} face crops into {}", out.display());
            let saved = collect(&mut camera, &mut detector, &out, count, interval)?;
            println!("Saved {saved} face crops");
        }
        Commands::Train {
            data_dir,
            label,
            out,
        } => {
            let out = out.unwrap_or_else(|| model_dir.join(CLASSIFIER_MODEL_FILE));
            let samples = train(&data_dir, label, &out)?;
            println!("Trained on {samples} images; model written to {}", out.display());
        }
        Commands::Check {
            image,
            model,
            enrolled_label,
            threshold,
        } => {
            let model_path = model.unwrap_or_else(|| model_dir.join(CLASSIFIER_MODEL_FILE));
            let classifier = LbphModel::load(&model_path)?;
            let detector = load_detector(&model_dir)?;
            let policy = AcceptancePolicy {
                enrolled_label,
                threshold,
            };
            let frame = image::open(&image)
                .with_context(|| format!("reading {}", image.display()))?
                .to_luma8();

            let mut adapter = ClassificationAdapter::new(detector, classifier, policy);
            match adapter.observe(frame)? {
                Some(obs) => println!(
                    "face at ({}, {}) {}x{}: label={} confidence={:.1} outcome={}",
                    obs.bbox.x,
                    obs.bbox.y,
                    obs.bbox.width,
                    obs.bbox.height,
                    obs.label,
                    obs.confidence,
                    obs.outcome
                ),
                None => println!("No face detected"),
            }
        }
    }

    Ok(())
}

fn load_detector(model_dir: &Path) -> Result<ScrfdDetector> {
    let dirs = [
        model_dir.to_path_buf(),
        PathBuf::from("models"),
        PathBuf::from(facegate_core::SYSTEM_MODEL_DIR),
    ];
    let Some(path) = facegate_core::locate_model(DETECTOR_MODEL_FILE, &dirs) else {
        bail!("{DETECTOR_MODEL_FILE} not found in {dirs:?}");
    };
    Ok(ScrfdDetector::load(&path, DEFAULT_MIN_FACE_PX)?)
}

/// Save the first face of each frame, at most one per `interval`, until `count` are written.
fn collect<S: FrameSource, L: FaceLocalizer>(
    source: &mut S,
    localizer: &mut L,
    out: &Path,
    count: usize,
    interval: Duration,
) -> Result<usize> {
    let mut saved = 0;
    let mut last_saved: Option<Instant> = None;

    while saved < count {
        let frame = source.capture()?.into_image()?;
        let Some(&bbox) = localizer.detect(&frame)?.first() else {
            continue;
        };
        let now = Instant::now();
        if last_saved.is_some_and(|t| now.duration_since(t) < interval) {
            continue;
        }

        let crop = imageops::crop_imm(&frame, bbox.x, bbox.y, bbox.width, bbox.height).to_image();
        let path = out.join(format!("face_{saved:03}.png"));
        lbph::normalize_face(&crop)
            .save(&path)
            .with_context(|| format!("writing {}", path.display()))?;
        println!("Saved {}", path.display());

        saved += 1;
        last_saved = Some(now);
    }
    Ok(saved)
}

/// Train on every image under `data_dir` and write the model to `out`.
fn train(data_dir: &Path, label: i32, out: &Path) -> Result<usize> {
    let faces = load_faces(data_dir)?;
    if faces.is_empty() {
        bail!("no .png/.jpg/.jpeg images in {}", data_dir.display());
    }
    let samples = faces.len();
    let model = LbphModel::train(faces.into_iter().map(|face| (label, face)))?;
    model.save(out)?;
    Ok(samples)
}

fn load_faces(data_dir: &Path) -> Result<Vec<GrayImage>> {
    let mut paths: Vec<PathBuf> = std::fs::read_dir(data_dir)
        .with_context(|| format!("reading {}", data_dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| is_image(path))
        .collect();
    paths.sort();

    let mut faces = Vec::with_capacity(paths.len());
    for path in paths {
        match image::open(&path) {
            Ok(img) => faces.push(img.to_luma8()),
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping unreadable image"),
        }
    }
    Ok(faces)
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| matches!(ext.to_ascii_lowercase().as_str(), "png" | "jpg" | "jpeg"))
        .unwrap_or(false)
}
