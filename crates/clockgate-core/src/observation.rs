//! Per-frame observations shared by the local and remote analysis paths.
//!
//! Both analyzers produce the same [`FrameObservation`] shape so the fuser and
//! the readiness gate never need to know where a sample came from, except for
//! the `ready` verdict, which is only trusted from the authoritative source.

use serde::Serialize;
use std::collections::BTreeSet;
use std::time::Duration;

/// Which analysis path produced an observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ObservationSource {
    /// Cheap on-device heuristics. Advisory only.
    LocalHeuristic,
    /// External validation service. Its `ready` verdict is authoritative.
    RemoteAuthoritative,
}

/// Apparent face size relative to the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SizeClass {
    TooSmall,
    Good,
    TooLarge,
    #[default]
    Unknown,
}

impl SizeClass {
    /// Parse the validator's wire value. Anything unrecognised (`none`,
    /// `multiple`, …) maps to [`SizeClass::Unknown`].
    pub fn from_wire(value: &str) -> Self {
        match value {
            "too_small" => Self::TooSmall,
            "good" => Self::Good,
            "too_large" => Self::TooLarge,
            _ => Self::Unknown,
        }
    }
}

/// Apparent subject distance from the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceClass {
    Far,
    Good,
    TooClose,
    #[default]
    Unknown,
}

impl DistanceClass {
    pub fn from_wire(value: &str) -> Self {
        match value {
            "far" => Self::Far,
            "good" => Self::Good,
            "too_close" => Self::TooClose,
            _ => Self::Unknown,
        }
    }
}

/// Head pose deviations in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct Pose {
    pub yaw: f32,
    pub pitch: f32,
    pub roll: f32,
    /// Combined angle scalar reported by the validator.
    pub angle: f32,
}

impl Pose {
    /// Sum of absolute per-axis deviations.
    pub fn deviation(&self) -> f32 {
        self.yaw.abs() + self.pitch.abs() + self.roll.abs()
    }
}

/// Per-eye openness probabilities in `0..=1`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EyeOpenness {
    pub left: f32,
    pub right: f32,
}

impl Default for EyeOpenness {
    /// Unknown openness is treated as fully open.
    fn default() -> Self {
        Self {
            left: 1.0,
            right: 1.0,
        }
    }
}

impl EyeOpenness {
    pub fn average(&self) -> f32 {
        (self.left + self.right) / 2.0
    }
}

/// Face bounding box, normalised to `0..=1` of the frame dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    /// Build a normalised box from pixel coordinates, clamping into the frame.
    pub fn from_pixels(x: f32, y: f32, width: f32, height: f32, frame_w: u32, frame_h: u32) -> Self {
        let fw = frame_w.max(1) as f32;
        let fh = frame_h.max(1) as f32;
        Self {
            x: clamp_unit(x / fw),
            y: clamp_unit(y / fh),
            width: clamp_unit(width / fw),
            height: clamp_unit(height / fh),
        }
    }
}

fn clamp_unit(v: f32) -> f32 {
    if v.is_finite() {
        v.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// Categorical issue tags attached to an observation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Issue {
    NoFace,
    MultipleFaces,
    TooFar,
    TooClose,
    AngleTooTilted,
    Lighting,
    Blur,
    EyesClosed,
    DetectionFailed,
    ValidationError,
    Other(String),
}

impl Issue {
    /// Map a validator issue tag, folding the aliases it uses for the same condition.
    pub fn from_wire(tag: &str) -> Self {
        match tag {
            "no_face" => Self::NoFace,
            "multiple_faces" => Self::MultipleFaces,
            "too_far" | "face_too_small" => Self::TooFar,
            "too_close" | "face_too_large" => Self::TooClose,
            "angle" | "angle_too_tilted" => Self::AngleTooTilted,
            "lighting" | "brightness" => Self::Lighting,
            "blur" => Self::Blur,
            "eyes_closed" => Self::EyesClosed,
            "detection_failed" => Self::DetectionFailed,
            "validation_error" => Self::ValidationError,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn code(&self) -> &str {
        match self {
            Self::NoFace => "no_face",
            Self::MultipleFaces => "multiple_faces",
            Self::TooFar => "too_far",
            Self::TooClose => "too_close",
            Self::AngleTooTilted => "angle_too_tilted",
            Self::Lighting => "lighting",
            Self::Blur => "blur",
            Self::EyesClosed => "eyes_closed",
            Self::DetectionFailed => "detection_failed",
            Self::ValidationError => "validation_error",
            Self::Other(tag) => tag,
        }
    }
}

/// One sample in time.
///
/// Construct through [`FrameObservation::face`] / [`FrameObservation::no_face`]
/// and finish with [`FrameObservation::normalized`], which enforces
/// `face_count == 0 ⇒ !has_face ⇒ quality == 0`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FrameObservation {
    /// Offset from the start of the capture session.
    pub at: Duration,
    pub source: ObservationSource,
    pub has_face: bool,
    pub face_count: u32,
    /// Quality estimate in `0..=100`.
    pub quality: f32,
    pub pose: Pose,
    pub size: SizeClass,
    pub distance: DistanceClass,
    /// Face size in pixels as reported by the analyzer (0 when unknown).
    pub face_size: f32,
    pub eyes: EyeOpenness,
    pub bounding_box: Option<BoundingBox>,
    pub issues: BTreeSet<Issue>,
    /// Free-form guidance from the validator, if any.
    pub feedback: Option<String>,
    /// Single-frame readiness verdict. Only meaningful for the authoritative source.
    pub ready: bool,
}

impl FrameObservation {
    /// An observation with no face in frame.
    pub fn no_face(at: Duration, source: ObservationSource) -> Self {
        Self {
            at,
            source,
            has_face: false,
            face_count: 0,
            quality: 0.0,
            pose: Pose::default(),
            size: SizeClass::Unknown,
            distance: DistanceClass::Unknown,
            face_size: 0.0,
            eyes: EyeOpenness::default(),
            bounding_box: None,
            issues: BTreeSet::new(),
            feedback: None,
            ready: false,
        }
    }

    /// Safe default returned when the validator is unreachable or replies
    /// with something unparseable.
    pub fn validation_error(at: Duration) -> Self {
        let mut obs = Self::no_face(at, ObservationSource::RemoteAuthoritative);
        obs.issues.insert(Issue::ValidationError);
        obs.feedback = Some("Unable to analyze. Please try again.".to_string());
        obs
    }

    /// An observation with `face_count` faces at the given quality.
    pub fn face(at: Duration, source: ObservationSource, face_count: u32, quality: f32) -> Self {
        let mut obs = Self::no_face(at, source);
        obs.face_count = face_count;
        obs.has_face = face_count > 0;
        obs.quality = quality;
        obs.size = SizeClass::Good;
        obs.distance = DistanceClass::Good;
        obs.normalized()
    }

    /// Enforce the observation invariants.
    pub fn normalized(mut self) -> Self {
        self.has_face = self.face_count > 0;
        self.quality = if self.has_face && self.quality.is_finite() {
            self.quality.clamp(0.0, 100.0)
        } else {
            0.0
        };
        if !self.has_face || self.source == ObservationSource::LocalHeuristic {
            self.ready = false;
        }
        self
    }

    /// `ready` as admitted by the fusion and gate logic: only the
    /// authoritative source can vouch for a frame.
    pub fn authoritative_ready(&self) -> bool {
        self.source == ObservationSource::RemoteAuthoritative && self.ready
    }

    pub fn has_issue(&self, issue: &Issue) -> bool {
        self.issues.contains(issue)
    }
}
