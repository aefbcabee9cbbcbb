//! Geometric face quality scoring for locally detected faces.

use serde::Deserialize;

/// Minimum face area as a fraction of the frame.
pub(crate) const MIN_FACE_AREA: f32 = 0.15;
/// Maximum face area as a fraction of the frame.
pub(crate) const MAX_FACE_AREA: f32 = 0.60;
/// Maximum distance of the face centre from the frame centre, per axis.
const MAX_CENTER_OFFSET: f32 = 0.25;
const MIN_CONFIDENCE: f32 = 0.6;
/// Per-axis angle limit for a frontal face, in degrees.
const MAX_AXIS_ANGLE: f32 = 15.0;
/// Quality required for `is_good`.
const GOOD_SCORE: f32 = 70.0;

/// A face found by a local detector, in pixel coordinates.
///
/// Head angles are in degrees and default to frontal when a detector does
/// not report them.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DetectedFace {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    #[serde(default)]
    pub roll: f32,
    #[serde(default)]
    pub yaw: f32,
    #[serde(default)]
    pub pitch: f32,
}

/// Score breakdown for a [`DetectedFace`].
#[derive(Debug, Clone, PartialEq)]
pub struct FaceQuality {
    /// 0..=100
    pub score: f32,
    pub issues: Vec<&'static str>,
    pub is_good: bool,
    /// Face area as a fraction of the frame area.
    pub face_area: f32,
    pub offset_x: f32,
    pub offset_y: f32,
}

/// Score a detected face against the framing rules.
///
/// Starts at 100 and subtracts penalties for size outside 15–60 % of the
/// frame, off-centre placement, low detector confidence and head angle.
pub fn assess(face: &DetectedFace, frame_w: u32, frame_h: u32) -> FaceQuality {
    let fw = frame_w.max(1) as f32;
    let fh = frame_h.max(1) as f32;

    let face_area = (face.width * face.height) / (fw * fh);
    let center_x = face.x + face.width / 2.0;
    let center_y = face.y + face.height / 2.0;
    let offset_x = (center_x - fw / 2.0).abs() / fw;
    let offset_y = (center_y - fh / 2.0).abs() / fh;

    let mut issues = Vec::new();
    if face_area < MIN_FACE_AREA {
        issues.push("Face too small - move closer");
    } else if face_area > MAX_FACE_AREA {
        issues.push("Face too large - move farther");
    }
    if offset_x > MAX_CENTER_OFFSET {
        issues.push("Face not centered horizontally");
    }
    if offset_y > MAX_CENTER_OFFSET {
        issues.push("Face not centered vertically");
    }
    if face.roll.abs() > MAX_AXIS_ANGLE {
        issues.push("Face tilted - keep head straight");
    }
    if face.yaw.abs() > MAX_AXIS_ANGLE {
        issues.push("Face turned - face the camera");
    }
    if face.pitch.abs() > MAX_AXIS_ANGLE {
        issues.push("Head tilted - keep head level");
    }
    if face.confidence < MIN_CONFIDENCE {
        issues.push("Face detection confidence too low");
    }

    let mut score = 100.0;
    if face_area < MIN_FACE_AREA {
        score -= (MIN_FACE_AREA - face_area) * 300.0;
    }
    if face_area > MAX_FACE_AREA {
        score -= (face_area - MAX_FACE_AREA) * 200.0;
    }
    score -= offset_x * 150.0;
    score -= offset_y * 150.0;
    score -= (1.0 - face.confidence) * 30.0;
    score -= (face.roll.abs() + face.yaw.abs() + face.pitch.abs()) * 2.0;
    let score = if score.is_finite() { score.clamp(0.0, 100.0) } else { 0.0 };

    FaceQuality {
        score,
        is_good: issues.is_empty() && score >= GOOD_SCORE,
        issues,
        face_area,
        offset_x,
        offset_y,
    }
}
