//! Annotated failure snapshots on disk.

use chrono::{DateTime, Local};
use facegate_core::{FaceRect, FailureEvidence};
use image::{DynamicImage, Rgb, RgbImage};
use std::path::PathBuf;
use thiserror::Error;

const MARK: Rgb<u8> = Rgb([255, 0, 0]);
const BORDER_PX: u32 = 2;
const GLYPH_W: u32 = 5;
const GLYPH_H: u32 = 7;
const TEXT_SCALE: u32 = 2;

#[derive(Error, Debug)]
pub enum EvidenceError {
    #[error("failed to create evidence directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to write evidence image {path}: {source}")]
    Write {
        path: PathBuf,
        source: image::ImageError,
    },
}

/// Writes one JPEG per finalized failure into a directory.
#[derive(Debug, Clone)]
pub struct EvidenceStore {
    dir: PathBuf,
}

impl EvidenceStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Annotate and persist `evidence`, returning the written path.
    pub fn save(
        &self,
        evidence: &FailureEvidence,
        at: DateTime<Local>,
    ) -> Result<PathBuf, EvidenceError> {
        std::fs::create_dir_all(&self.dir).map_err(|source| EvidenceError::CreateDir {
            path: self.dir.clone(),
            source,
        })?;

        let path = self.dir.join(file_name(at, evidence.confidence));
        let image = annotate(evidence);
        image.save(&path).map_err(|source| EvidenceError::Write {
            path: path.clone(),
            source,
        })?;

        tracing::info!(path = %path.display(), confidence = evidence.confidence, "evidence saved");
        Ok(path)
    }
}

/// `fail_<YYYYmmdd_HHMMSS>_conf<value>.jpg`
pub fn file_name(at: DateTime<Local>, confidence: f32) -> String {
    format!("fail_{}_conf{confidence:.1}.jpg", at.format("%Y%m%d_%H%M%S"))
}

/// Promote the frame to RGB, box the face and write the score above it.
pub fn annotate(evidence: &FailureEvidence) -> RgbImage {
    let mut image = DynamicImage::ImageLuma8(evidence.frame.clone()).to_rgb8();
    draw_rect(&mut image, &evidence.bbox);

    let label = format!("FAIL conf={:.1}", evidence.confidence);
    let text_h = GLYPH_H * TEXT_SCALE;
    let y = evidence.bbox.y.saturating_sub(text_h + 4);
    draw_text(&mut image, evidence.bbox.x, y, &label);
    image
}

fn put(image: &mut RgbImage, x: u32, y: u32) {
    if x < image.width() && y < image.height() {
        image.put_pixel(x, y, MARK);
    }
}

fn draw_rect(image: &mut RgbImage, rect: &FaceRect) {
    if rect.width == 0 || rect.height == 0 {
        return;
    }
    let (x0, y0) = (rect.x, rect.y);
    let (x1, y1) = (rect.x + rect.width - 1, rect.y + rect.height - 1);
    for t in 0..BORDER_PX {
        for x in x0..=x1 {
            put(image, x, y0 + t);
            put(image, x, y1.saturating_sub(t));
        }
        for y in y0..=y1 {
            put(image, x0 + t, y);
            put(image, x1.saturating_sub(t), y);
        }
    }
}

fn draw_text(image: &mut RgbImage, x: u32, y: u32, text: &str) {
    let advance = (GLYPH_W + 1) * TEXT_SCALE;
    for (i, ch) in text.chars().enumerate() {
        let origin_x = x + i as u32 * advance;
        for (row, bits) in glyph(ch).iter().enumerate() {
            for col in 0..GLYPH_W {
                if bits & (0x10 >> col) == 0 {
                    continue;
                }
                for dy in 0..TEXT_SCALE {
                    for dx in 0..TEXT_SCALE {
                        put(
                            image,
                            origin_x + col * TEXT_SCALE + dx,
                            y + row as u32 * TEXT_SCALE + dy,
                        );
                    }
                }
            }
        }
    }
}

/// 5×7 bitmap rows, MSB of the low five bits on the left. Unknown characters are blank.
fn glyph(ch: char) -> [u8; 7] {
    match ch {
        'F' => [0x1F, 0x10, 0x10, 0x1E, 0x10, 0x10, 0x10],
        'A' => [0x0E, 0x11, 0x11, 0x1F, 0x11, 0x11, 0x11],
        'I' => [0x0E, 0x04, 0x04, 0x04, 0x04, 0x04, 0x0E],
        'L' => [0x10, 0x10, 0x10, 0x10, 0x10, 0x10, 0x1F],
        'c' => [0x00, 0x00, 0x0E, 0x10, 0x10, 0x11, 0x0E],
        'o' => [0x00, 0x00, 0x0E, 0x11, 0x11, 0x11, 0x0E],
        'n' => [0x00, 0x00, 0x16, 0x19, 0x11, 0x11, 0x11],
        'f' => [0x06, 0x09, 0x08, 0x1C, 0x08, 0x08, 0x08],
        '=' => [0x00, 0x00, 0x1F, 0x00, 0x1F, 0x00, 0x00],
        '.' => [0x00, 0x00, 0x00, 0x00, 0x00, 0x0C, 0x0C],
        '-' => [0x00, 0x00, 0x00, 0x1F, 0x00, 0x00, 0x00],
        '0' => [0x0E, 0x11, 0x13, 0x15, 0x19, 0x11, 0x0E],
        '1' => [0x04, 0x0C, 0x04, 0x04, 0x04, 0x04, 0x0E],
        '2' => [0x0E, 0x11, 0x01, 0x02, 0x04, 0x08, 0x1F],
        '3' => [0x1F, 0x02, 0x04, 0x02, 0x01, 0x11, 0x0E],
        '4' => [0x02, 0x06, 0x0A, 0x12, 0x1F, 0x02, 0x02],
        '5' => [0x1F, 0x10, 0x1E, 0x01, 0x01, 0x11, 0x0E],
        '6' => [0x06, 0x08, 0x10, 0x1E, 0x11, 0x11, 0x0E],
        '7' => [0x1F, 0x01, 0x02, 0x04, 0x08, 0x08, 0x08],
        '8' => [0x0E, 0x11, 0x11, 0x0E, 0x11, 0x11, 0x0E],
        '9' => [0x0E, 0x11, 0x11, 0x0F, 0x01, 0x02, 0x0C],
        _ => [0; 7],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use image::GrayImage;

    fn evidence(bbox: FaceRect) -> FailureEvidence {
        FailureEvidence {
            bbox,
            confidence: 83.27,
            frame: GrayImage::from_pixel(320, 240, image::Luma([90])),
        }
    }

    fn at() -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap()
    }

    #[test]
    fn test_file_name_format() {
        assert_eq!(file_name(at(), 83.27), "fail_20240309_140507_conf83.3.jpg");
        assert_eq!(file_name(at(), 7.0), "fail_20240309_140507_conf7.0.jpg");
    }

    #[test]
    fn test_annotate_draws_box_outline() {
        let image = annotate(&evidence(FaceRect::new(100, 80, 90, 90)));
        assert_eq!(image.dimensions(), (320, 240));
        assert_eq!(*image.get_pixel(100, 80), MARK);
        assert_eq!(*image.get_pixel(101, 120), MARK);
        assert_eq!(*image.get_pixel(189, 169), MARK);
        // Interior and far background stay gray.
        assert_eq!(*image.get_pixel(140, 120), Rgb([90, 90, 90]));
        assert_eq!(*image.get_pixel(5, 230), Rgb([90, 90, 90]));
    }

    #[test]
    fn test_annotate_writes_label_above_box() {
        let image = annotate(&evidence(FaceRect::new(100, 80, 90, 90)));
        let text_top = 80 - (GLYPH_H * TEXT_SCALE + 4);
        let marked = (text_top..80 - 4)
            .flat_map(|y| (100..190).map(move |x| (x, y)))
            .filter(|&(x, y)| *image.get_pixel(x, y) == MARK)
            .count();
        assert!(marked > 0);
    }

    #[test]
    fn test_annotate_clips_at_frame_edges() {
        let image = annotate(&evidence(FaceRect::new(280, 0, 40, 240)));
        assert_eq!(*image.get_pixel(319, 239), MARK);
    }

    #[test]
    fn test_save_creates_directory_and_jpeg() {
        let root = tempfile::tempdir().unwrap();
        let store = EvidenceStore::new(root.path().join("evidence"));

        let path = store.save(&evidence(FaceRect::new(10, 30, 50, 50)), at()).unwrap();

        assert_eq!(path, root.path().join("evidence/fail_20240309_140507_conf83.3.jpg"));
        let reloaded = image::open(&path).unwrap();
        assert_eq!((reloaded.width(), reloaded.height()), (320, 240));
    }

    #[test]
    fn test_save_fails_when_dir_is_a_file() {
        let root = tempfile::tempdir().unwrap();
        let blocker = root.path().join("evidence");
        std::fs::write(&blocker, b"not a dir").unwrap();

        let err = EvidenceStore::new(&blocker)
            .save(&evidence(FaceRect::new(10, 30, 50, 50)), at())
            .unwrap_err();
        assert!(matches!(err, EvidenceError::CreateDir { .. }));
    }
}
