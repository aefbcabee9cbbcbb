//! On-device signal extraction.
//!
//! The local path is advisory: it keeps the live bounding box and quality pill
//! responsive while the authoritative validator round-trip is in flight. It
//! never sets `ready`, so nothing it produces can authorize a capture.
//!
//! When a [`FaceLocator`] is plugged in, faces are scored geometrically with
//! [`quality::assess`](crate::quality::assess). Without one, or when it has
//! no answer for a frame, presence and quality follow an elapsed-time
//! confidence ramp. Either way the result is adjusted by a cheap luminance
//! check of the decoded frame.

use image::GrayImage;
use std::path::Path;
use std::time::Duration;

use crate::analyzer::{FrameAnalyzer, FrameSample};
use crate::observation::{
    BoundingBox, DistanceClass, FrameObservation, Issue, ObservationSource, Pose, SizeClass,
};
use crate::quality::{self, DetectedFace, MAX_FACE_AREA, MIN_FACE_AREA};

/// Presence is not reported before this much session time has elapsed.
const RAMP_DELAY: Duration = Duration::from_secs(1);
/// Quality gained per second of ramp.
const RAMP_RATE: f32 = 15.0;
/// The ramp never claims more than this.
const RAMP_CEILING: f32 = 80.0;

/// Mean luminance outside this band tags the frame with a lighting issue.
const MIN_MEAN_LUMA: f32 = 40.0;
const MAX_MEAN_LUMA: f32 = 220.0;
/// Luminance standard deviation below which the frame is considered blank
/// (covered lens, black frame).
const MIN_CONTRAST: f32 = 6.0;
/// Quality multiplier applied when lighting is poor.
const LIGHTING_PENALTY: f32 = 0.6;

/// A richer on-device detector, when one is available.
pub trait FaceLocator: Send + Sync {
    /// Faces in the frame at `path`, whose decoded greyscale form is
    /// `frame`. `None` when the detector could not run.
    fn locate(&self, path: &Path, frame: &GrayImage) -> Option<Vec<DetectedFace>>;
}

/// Mean and standard deviation of a greyscale frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LuminanceStats {
    pub mean: f32,
    pub stddev: f32,
}

pub fn luminance_stats(frame: &GrayImage) -> LuminanceStats {
    let n = (frame.width() as u64 * frame.height() as u64).max(1) as f64;
    let (sum, sum_sq) = frame.pixels().fold((0f64, 0f64), |(s, sq), p| {
        let v = p.0[0] as f64;
        (s + v, sq + v * v)
    });
    let mean = sum / n;
    let variance = (sum_sq / n - mean * mean).max(0.0);
    LuminanceStats {
        mean: mean as f32,
        stddev: variance.sqrt() as f32,
    }
}

/// Local heuristic analyzer.
#[derive(Default)]
pub struct LocalHeuristic {
    locator: Option<Box<dyn FaceLocator>>,
}

impl LocalHeuristic {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_locator(locator: Box<dyn FaceLocator>) -> Self {
        Self {
            locator: Some(locator),
        }
    }

    fn observe(frame: &GrayImage, faces: Option<&[DetectedFace]>, at: Duration) -> FrameObservation {
        let stats = luminance_stats(frame);
        if stats.stddev < MIN_CONTRAST {
            tracing::debug!(mean = stats.mean, stddev = stats.stddev, "local: blank frame");
            let mut obs = FrameObservation::no_face(at, ObservationSource::LocalHeuristic);
            obs.issues.insert(Issue::DetectionFailed);
            return obs;
        }

        let mut obs = match faces {
            Some(faces) => observe_located(faces, frame, at),
            None => observe_ramp(at),
        };

        if obs.has_face && !(MIN_MEAN_LUMA..=MAX_MEAN_LUMA).contains(&stats.mean) {
            obs.issues.insert(Issue::Lighting);
            obs.quality *= LIGHTING_PENALTY;
        }
        obs.normalized()
    }
}

impl FrameAnalyzer for LocalHeuristic {
    fn source(&self) -> ObservationSource {
        ObservationSource::LocalHeuristic
    }

    fn analyze(&self, frame: &FrameSample<'_>) -> FrameObservation {
        match image::open(frame.path) {
            Ok(img) => {
                let gray = img.to_luma8();
                let faces = self.locator.as_ref().and_then(|l| l.locate(frame.path, &gray));
                Self::observe(&gray, faces.as_deref(), frame.at)
            }
            Err(e) => {
                tracing::debug!(error = %e, path = %frame.path.display(), "local: frame decode failed");
                FrameObservation::no_face(frame.at, ObservationSource::LocalHeuristic)
            }
        }
    }
}

fn observe_ramp(at: Duration) -> FrameObservation {
    if at <= RAMP_DELAY {
        return FrameObservation::no_face(at, ObservationSource::LocalHeuristic);
    }
    let quality = ((at - RAMP_DELAY).as_secs_f32() * RAMP_RATE).min(RAMP_CEILING);
    let mut obs = FrameObservation::face(at, ObservationSource::LocalHeuristic, 1, quality.round());
    // Without a detector the subject is assumed centred in the guide circle.
    obs.bounding_box = Some(BoundingBox {
        x: 0.25,
        y: 0.25,
        width: 0.5,
        height: 0.5,
    });
    obs
}

fn observe_located(faces: &[DetectedFace], frame: &GrayImage, at: Duration) -> FrameObservation {
    let (w, h) = frame.dimensions();
    match faces {
        [] => FrameObservation::no_face(at, ObservationSource::LocalHeuristic),
        [face] => {
            let q = quality::assess(face, w, h);
            let mut obs = FrameObservation::face(at, ObservationSource::LocalHeuristic, 1, q.score.round());
            (obs.size, obs.distance) = if q.face_area < MIN_FACE_AREA {
                (SizeClass::TooSmall, DistanceClass::Far)
            } else if q.face_area > MAX_FACE_AREA {
                (SizeClass::TooLarge, DistanceClass::TooClose)
            } else {
                (SizeClass::Good, DistanceClass::Good)
            };
            obs.pose = Pose {
                yaw: face.yaw,
                pitch: face.pitch,
                roll: face.roll,
                angle: face.yaw,
            };
            obs.face_size = face.width;
            obs.bounding_box = Some(BoundingBox::from_pixels(face.x, face.y, face.width, face.height, w, h));
            obs
        }
        many => {
            let mut obs = FrameObservation::face(at, ObservationSource::LocalHeuristic, many.len() as u32, 0.0);
            obs.issues.insert(Issue::MultipleFaces);
            obs
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;
    use std::path::PathBuf;

    fn temp_png(name: &str, img: &GrayImage) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "clockgate-extractor-{name}-{}",
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("frame.png");
        img.save(&path).unwrap();
        path
    }

    fn textured(base: u8) -> GrayImage {
        GrayImage::from_fn(64, 48, |x, y| Luma([base.saturating_add(((x + y) % 32) as u8)]))
    }

    fn sample(path: &std::path::Path, at: Duration) -> FrameSample<'_> {
        FrameSample {
            path,
            width: 64,
            height: 48,
            at,
        }
    }

    struct FixedLocator(Option<Vec<DetectedFace>>);

    impl FaceLocator for FixedLocator {
        fn locate(&self, path: &Path, _frame: &GrayImage) -> Option<Vec<DetectedFace>> {
            assert!(path.exists());
            self.0.clone()
        }
    }

    fn face(x: f32, y: f32, width: f32, height: f32) -> DetectedFace {
        DetectedFace {
            x,
            y,
            width,
            height,
            confidence: 1.0,
            roll: 0.0,
            yaw: 0.0,
            pitch: 0.0,
        }
    }

    #[test]
    fn test_ramp_before_delay_reports_no_face() {
        let obs = LocalHeuristic::observe(&textured(100), None, Duration::from_millis(800));
        assert!(!obs.has_face);
        assert_eq!(obs.quality, 0.0);
    }

    #[test]
    fn test_ramp_rises_and_caps() {
        let obs = LocalHeuristic::observe(&textured(100), None, Duration::from_secs(3));
        assert!(obs.has_face);
        assert_eq!(obs.quality, 30.0);
        assert!(obs.bounding_box.is_some());

        let obs = LocalHeuristic::observe(&textured(100), None, Duration::from_secs(30));
        assert_eq!(obs.quality, RAMP_CEILING);
    }

    #[test]
    fn test_local_never_ready() {
        let obs = LocalHeuristic::observe(&textured(100), None, Duration::from_secs(30));
        assert!(!obs.ready);
        assert_eq!(obs.source, ObservationSource::LocalHeuristic);
    }

    #[test]
    fn test_blank_frame_is_no_face() {
        let blank = GrayImage::from_pixel(64, 48, Luma([0]));
        let obs = LocalHeuristic::observe(&blank, None, Duration::from_secs(10));
        assert!(!obs.has_face);
        assert!(obs.has_issue(&Issue::DetectionFailed));
    }

    #[test]
    fn test_dark_frame_penalised() {
        let obs = LocalHeuristic::observe(&textured(2), None, Duration::from_secs(30));
        assert!(obs.has_issue(&Issue::Lighting));
        assert!((obs.quality - RAMP_CEILING * LIGHTING_PENALTY).abs() < 1e-3);
    }

    #[test]
    fn test_unreadable_file_degrades() {
        let path = std::env::temp_dir().join("clockgate-extractor-does-not-exist.jpg");
        let obs = LocalHeuristic::new().analyze(&sample(&path, Duration::from_secs(5)));
        assert!(!obs.has_face);
    }

    #[test]
    fn test_analyze_reads_file() {
        let path = temp_png("read", &textured(100));
        let obs = LocalHeuristic::new().analyze(&sample(&path, Duration::from_secs(2)));
        assert!(obs.has_face);
        assert_eq!(obs.quality, 15.0);
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn test_locator_scores_geometry() {
        let face = DetectedFace {
            yaw: 3.0,
            ..face(16.0, 12.0, 32.0, 24.0)
        };
        let path = temp_png("located", &textured(100));
        let local = LocalHeuristic::with_locator(Box::new(FixedLocator(Some(vec![face]))));
        let obs = local.analyze(&sample(&path, Duration::from_millis(100)));
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
        assert!(obs.has_face);
        assert_eq!(obs.size, SizeClass::Good);
        assert_eq!(obs.quality, 94.0);
        assert_eq!(obs.pose.yaw, 3.0);
        let bb = obs.bounding_box.unwrap();
        assert!((bb.x - 0.25).abs() < 1e-6);
        assert!((bb.width - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_locator_multiple_faces() {
        let face = face(0.0, 0.0, 10.0, 10.0);
        let obs = LocalHeuristic::observe(&textured(100), Some(&[face.clone(), face]), Duration::from_secs(1));
        assert_eq!(obs.face_count, 2);
        assert!(obs.has_issue(&Issue::MultipleFaces));
        assert!(!obs.ready);
    }

    #[test]
    fn test_size_class_matches_quality_bounds() {
        // 0.12 of a 64x48 frame: below the scorer's minimum.
        let small = face(20.0, 16.0, 24.0, 15.36);
        let obs = LocalHeuristic::observe(&textured(100), Some(&[small.clone()]), Duration::ZERO);
        assert_eq!(obs.size, SizeClass::TooSmall);
        assert_eq!(obs.distance, DistanceClass::Far);
        assert!(quality::assess(&small, 64, 48).issues.contains(&"Face too small - move closer"));

        // 0.45 is inside the scorer's range.
        let mid = face(8.0, 9.6, 48.0, 28.8);
        let obs = LocalHeuristic::observe(&textured(100), Some(&[mid.clone()]), Duration::ZERO);
        assert_eq!(obs.size, SizeClass::Good);
        assert!(quality::assess(&mid, 64, 48).issues.is_empty());
    }

    #[test]
    fn test_locator_without_answer_falls_back_to_ramp() {
        let path = temp_png("fallback", &textured(100));
        let local = LocalHeuristic::with_locator(Box::new(FixedLocator(None)));
        let obs = local.analyze(&sample(&path, Duration::from_secs(3)));
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
        assert!(obs.has_face);
        assert_eq!(obs.quality, 30.0);
    }

    #[test]
    fn test_luminance_stats() {
        let stats = luminance_stats(&GrayImage::from_pixel(4, 4, Luma([128])));
        assert_eq!(stats.mean, 128.0);
        assert_eq!(stats.stddev, 0.0);
    }
}
