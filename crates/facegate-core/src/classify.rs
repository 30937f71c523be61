//! Classification adapter: one frame in, zero or one observation out.

use crate::detector::{DetectorError, FaceLocalizer};
use crate::lbph::{self, IdentityClassifier};
use crate::types::{AcceptancePolicy, FaceObservation, Outcome};
use image::{imageops, GrayImage};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ObserveError {
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
}

/// Couples a face localizer with an identity classifier.
///
/// Holds no per-frame state: each call is a function of the frame and the
/// loaded models.
pub struct ClassificationAdapter<L, C> {
    localizer: L,
    classifier: C,
    policy: AcceptancePolicy,
}

impl<L: FaceLocalizer, C: IdentityClassifier> ClassificationAdapter<L, C> {
    pub fn new(localizer: L, classifier: C, policy: AcceptancePolicy) -> Self {
        Self {
            localizer,
            classifier,
            policy,
        }
    }

    /// Classify the first face the localizer reports, if any.
    ///
    /// When several faces are found only the first one in the localizer's
    /// own order is considered; the rest are ignored without re-ranking.
    pub fn observe(&mut self, frame: GrayImage) -> Result<Option<FaceObservation>, ObserveError> {
        let faces = self.localizer.detect(&frame)?;
        let Some(&bbox) = faces.first() else {
            return Ok(None);
        };
        if faces.len() > 1 {
            tracing::debug!(count = faces.len(), "multiple faces; using the first");
        }

        let crop = imageops::crop_imm(&frame, bbox.x, bbox.y, bbox.width, bbox.height).to_image();
        let prediction = self.classifier.predict(&lbph::normalize_face(&crop));
        let outcome = Outcome::from_prediction(&prediction, &self.policy);

        tracing::debug!(
            label = prediction.label,
            confidence = prediction.confidence,
            %outcome,
            "face classified"
        );

        Ok(Some(FaceObservation {
            bbox,
            label: prediction.label,
            confidence: prediction.confidence,
            outcome,
            frame,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FaceRect, Prediction};
    use std::cell::RefCell;

    struct FixedLocalizer(Vec<FaceRect>);

    impl FaceLocalizer for FixedLocalizer {
        fn detect(&mut self, _gray: &GrayImage) -> Result<Vec<FaceRect>, DetectorError> {
            Ok(self.0.clone())
        }
    }

    struct FailingLocalizer;

    impl FaceLocalizer for FailingLocalizer {
        fn detect(&mut self, _gray: &GrayImage) -> Result<Vec<FaceRect>, DetectorError> {
            Err(DetectorError::InferenceFailed("boom".into()))
        }
    }

    /// Classifier that reports the mean brightness of the crop it was given.
    struct BrightnessClassifier {
        seen: RefCell<Vec<(u32, u32, f32)>>,
        prediction: Prediction,
    }

    impl IdentityClassifier for BrightnessClassifier {
        fn predict(&self, face: &GrayImage) -> Prediction {
            let mean = face.pixels().map(|p| p.0[0] as f32).sum::<f32>()
                / (face.width() * face.height()) as f32;
            self.seen.borrow_mut().push((face.width(), face.height(), mean));
            self.prediction
        }
    }

    fn classifier(label: i32, confidence: f32) -> BrightnessClassifier {
        BrightnessClassifier {
            seen: RefCell::new(Vec::new()),
            prediction: Prediction { label, confidence },
        }
    }

    /// 640x480 frame, black except a white square at (100,100)-(200,200).
    fn frame() -> GrayImage {
        GrayImage::from_fn(640, 480, |x, y| {
            let inside = (100..200).contains(&x) && (100..200).contains(&y);
            image::Luma([if inside { 255 } else { 0 }])
        })
    }

    #[test]
    fn test_no_face_returns_none() {
        let mut adapter = ClassificationAdapter::new(
            FixedLocalizer(Vec::new()),
            classifier(1, 10.0),
            AcceptancePolicy::default(),
        );
        assert!(adapter.observe(frame()).unwrap().is_none());
        assert!(adapter.classifier.seen.borrow().is_empty());
    }

    #[test]
    fn test_first_face_is_normalized_and_classified() {
        let faces = vec![FaceRect::new(100, 100, 100, 100), FaceRect::new(0, 0, 300, 300)];
        let mut adapter = ClassificationAdapter::new(
            FixedLocalizer(faces),
            classifier(1, 35.0),
            AcceptancePolicy::default(),
        );

        let obs = adapter.observe(frame()).unwrap().unwrap();
        assert_eq!(obs.bbox, FaceRect::new(100, 100, 100, 100));
        assert_eq!(obs.outcome, Outcome::Ok);
        assert_eq!(obs.frame.dimensions(), (640, 480));

        let seen = adapter.classifier.seen.borrow();
        assert_eq!(seen.len(), 1);
        let (w, h, mean) = seen[0];
        assert_eq!((w, h), (lbph::FACE_SIZE, lbph::FACE_SIZE));
        // Only the white square was cropped, not the larger second box.
        assert!(mean > 250.0, "mean {mean}");
    }

    #[test]
    fn test_wrong_label_fails() {
        let mut adapter = ClassificationAdapter::new(
            FixedLocalizer(vec![FaceRect::new(100, 100, 100, 100)]),
            classifier(7, 5.0),
            AcceptancePolicy::default(),
        );
        let obs = adapter.observe(frame()).unwrap().unwrap();
        assert_eq!(obs.label, 7);
        assert_eq!(obs.outcome, Outcome::Fail);
    }

    #[test]
    fn test_distance_at_threshold_fails() {
        let policy = AcceptancePolicy {
            enrolled_label: 1,
            threshold: 50.0,
        };
        let mut adapter = ClassificationAdapter::new(
            FixedLocalizer(vec![FaceRect::new(100, 100, 100, 100)]),
            classifier(1, 50.0),
            policy,
        );
        let obs = adapter.observe(frame()).unwrap().unwrap();
        assert_eq!(obs.outcome, Outcome::Fail);
    }

    #[test]
    fn test_detector_error_propagates() {
        let mut adapter =
            ClassificationAdapter::new(FailingLocalizer, classifier(1, 1.0), AcceptancePolicy::default());
        assert!(matches!(adapter.observe(frame()), Err(ObserveError::Detector(_))));
    }
}
