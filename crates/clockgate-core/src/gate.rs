//! Ordered admission gates.
//!
//! Gates are evaluated in a fixed order and the first failure wins, so the
//! subject only ever sees one instruction at a time:
//!
//! 1. face present
//! 2. exactly one face
//! 3. size / distance in band
//! 4. head angle within the ceiling
//! 5. quality at or above the floor (tiered guidance below it)
//! 6. eyes open
//! 7. minimum engagement time elapsed
//! 8. quality stable over the last three readings
//!
//! [`evaluate`] is pure. History it needs (elapsed session time, recent
//! qualities) is passed in by the session that owns it.

use serde::Serialize;
use std::fmt;
use std::time::Duration;

use crate::observation::{DistanceClass, FrameObservation, Issue, SizeClass};
use crate::thresholds::Thresholds;

/// Number of trailing quality readings the stability gate looks at.
pub const STABILITY_WINDOW: usize = 3;

/// Sub-band of the quality gate, used to pick guidance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityTier {
    /// Well below the floor; almost always a lighting problem.
    Lighting,
    /// Close to the floor.
    Almost,
    /// Just below the floor.
    HoldStill,
}

/// A single admission gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Gate {
    NoFace,
    MultipleFaces,
    TooFar,
    TooClose,
    Angle,
    Quality(QualityTier),
    EyesClosed,
    Engagement,
    Unstable,
}

impl Gate {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NoFace => "no_face",
            Self::MultipleFaces => "multiple_faces",
            Self::TooFar => "too_far",
            Self::TooClose => "too_close",
            Self::Angle => "angle",
            Self::Quality(QualityTier::Lighting) => "lighting",
            Self::Quality(_) => "quality",
            Self::EyesClosed => "eyes_closed",
            Self::Engagement => "engagement",
            Self::Unstable => "unstable",
        }
    }

    /// Instruction shown to the subject.
    pub fn guidance(&self) -> &'static str {
        match self {
            Self::NoFace => "Position your face in the frame",
            Self::MultipleFaces => "Multiple faces detected. Only one person please",
            Self::TooFar => "Move closer to the camera",
            Self::TooClose => "Move back a little",
            Self::Angle => "Look straight at the camera",
            Self::Quality(QualityTier::Lighting) => "Find better lighting",
            Self::Quality(QualityTier::Almost) => "Almost there, hold steady",
            Self::Quality(QualityTier::HoldStill) => "Hold still",
            Self::EyesClosed => "Please open your eyes",
            Self::Engagement => "Hold still, checking...",
            Self::Unstable => "Hold still",
        }
    }

    /// Position in the evaluation order (1-based).
    pub fn ordinal(&self) -> u8 {
        match self {
            Self::NoFace => 1,
            Self::MultipleFaces => 2,
            Self::TooFar | Self::TooClose => 3,
            Self::Angle => 4,
            Self::Quality(_) => 5,
            Self::EyesClosed => 6,
            Self::Engagement => 7,
            Self::Unstable => 8,
        }
    }
}

impl fmt::Display for Gate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Session history the gates read but do not own.
#[derive(Debug, Clone, Copy)]
pub struct GateContext<'a> {
    /// Time since the session started.
    pub engaged_for: Duration,
    /// Recent quality readings, oldest first. Only the trailing
    /// [`STABILITY_WINDOW`] values are considered.
    pub recent_qualities: &'a [f32],
}

/// Outcome of one evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GateVerdict {
    /// First failing gate, or `None` when every gate passed.
    pub failed: Option<Gate>,
}

impl GateVerdict {
    pub fn is_ready(&self) -> bool {
        self.failed.is_none()
    }

    pub fn guidance(&self) -> &'static str {
        self.failed.map_or("Perfect! Hold still...", |g| g.guidance())
    }
}

/// Evaluate every gate in order against one observation.
pub fn evaluate(obs: &FrameObservation, ctx: &GateContext<'_>, thresholds: &Thresholds) -> GateVerdict {
    GateVerdict {
        failed: first_failing(obs, ctx, thresholds),
    }
}

fn first_failing(obs: &FrameObservation, ctx: &GateContext<'_>, t: &Thresholds) -> Option<Gate> {
    if !obs.has_face || obs.face_count == 0 {
        return Some(Gate::NoFace);
    }
    if obs.face_count > 1 || obs.has_issue(&Issue::MultipleFaces) {
        return Some(Gate::MultipleFaces);
    }

    if matches!(obs.size, SizeClass::TooSmall) || matches!(obs.distance, DistanceClass::Far) {
        return Some(Gate::TooFar);
    }
    if matches!(obs.size, SizeClass::TooLarge) || matches!(obs.distance, DistanceClass::TooClose) {
        return Some(Gate::TooClose);
    }

    let angle = obs.pose.deviation().max(obs.pose.angle.abs());
    if !angle.is_finite() || angle > t.max_angle_deg {
        return Some(Gate::Angle);
    }

    if obs.quality < t.quality_floor {
        let tier = if obs.quality < t.lighting_floor {
            QualityTier::Lighting
        } else if obs.quality < t.almost_floor {
            QualityTier::Almost
        } else {
            QualityTier::HoldStill
        };
        return Some(Gate::Quality(tier));
    }

    if obs.eyes.average() < t.min_eye_openness {
        return Some(Gate::EyesClosed);
    }

    if ctx.engaged_for < t.min_engagement() {
        return Some(Gate::Engagement);
    }

    let tail = &ctx.recent_qualities[ctx.recent_qualities.len().saturating_sub(STABILITY_WINDOW)..];
    if tail.len() == STABILITY_WINDOW {
        let (lo, hi) = tail
            .iter()
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), q| (lo.min(*q), hi.max(*q)));
        if hi - lo > t.max_quality_spread {
            return Some(Gate::Unstable);
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observation::{EyeOpenness, ObservationSource, Pose};

    fn good() -> FrameObservation {
        let mut obs = FrameObservation::face(
            Duration::from_secs(3),
            ObservationSource::RemoteAuthoritative,
            1,
            90.0,
        );
        obs.ready = true;
        obs
    }

    fn engaged() -> GateContext<'static> {
        GateContext {
            engaged_for: Duration::from_secs(3),
            recent_qualities: &[89.0, 90.0, 91.0],
        }
    }

    fn check(obs: &FrameObservation) -> Option<Gate> {
        evaluate(obs, &engaged(), &Thresholds::default()).failed
    }

    #[test]
    fn test_all_pass() {
        let verdict = evaluate(&good(), &engaged(), &Thresholds::default());
        assert!(verdict.is_ready());
        assert_eq!(verdict.guidance(), "Perfect! Hold still...");
    }

    #[test]
    fn test_no_face_first() {
        let obs = FrameObservation::no_face(Duration::ZERO, ObservationSource::RemoteAuthoritative);
        assert_eq!(check(&obs), Some(Gate::NoFace));
    }

    #[test]
    fn test_multiple_faces_regardless_of_quality() {
        let mut obs = good();
        obs.face_count = 2;
        obs.quality = 100.0;
        let gate = check(&obs).unwrap();
        assert_eq!(gate, Gate::MultipleFaces);
        assert_eq!(gate.code(), "multiple_faces");
    }

    #[test]
    fn test_size_directional() {
        let mut obs = good();
        obs.size = SizeClass::TooSmall;
        assert_eq!(check(&obs), Some(Gate::TooFar));
        let mut obs = good();
        obs.distance = DistanceClass::TooClose;
        assert_eq!(check(&obs), Some(Gate::TooClose));
    }

    #[test]
    fn test_angle_from_axes_or_scalar() {
        let mut obs = good();
        obs.pose = Pose {
            yaw: 5.0,
            pitch: -4.0,
            roll: 3.0,
            angle: 0.0,
        };
        assert_eq!(check(&obs), Some(Gate::Angle));

        let mut obs = good();
        obs.pose.angle = 12.0;
        assert_eq!(check(&obs), Some(Gate::Angle));

        let mut obs = good();
        obs.pose.angle = 9.5;
        assert_eq!(check(&obs), None);
    }

    #[test]
    fn test_quality_tiers() {
        let tier = |q: f32| {
            let mut obs = good();
            obs.quality = q;
            check(&obs)
        };
        assert_eq!(tier(30.0), Some(Gate::Quality(QualityTier::Lighting)));
        assert_eq!(tier(60.0), Some(Gate::Quality(QualityTier::Almost)));
        assert_eq!(tier(80.0), Some(Gate::Quality(QualityTier::HoldStill)));
        assert_eq!(tier(85.0), None);
        assert_eq!(Gate::Quality(QualityTier::Lighting).code(), "lighting");
    }

    #[test]
    fn test_eyes_closed() {
        let mut obs = good();
        obs.eyes = EyeOpenness {
            left: 0.9,
            right: 0.3,
        };
        assert_eq!(check(&obs), Some(Gate::EyesClosed));
    }

    #[test]
    fn test_engagement_before_two_seconds() {
        let ctx = GateContext {
            engaged_for: Duration::from_millis(1_500),
            recent_qualities: &[90.0, 90.0, 90.0],
        };
        assert_eq!(
            evaluate(&good(), &ctx, &Thresholds::default()).failed,
            Some(Gate::Engagement)
        );
    }

    #[test]
    fn test_unstable_quality() {
        let ctx = GateContext {
            engaged_for: Duration::from_secs(5),
            recent_qualities: &[99.0, 70.0, 95.0, 86.0, 90.0],
        };
        // Only the last three count: spread 95 - 86 = 9.
        assert!(evaluate(&good(), &ctx, &Thresholds::default()).is_ready());

        let ctx = GateContext {
            engaged_for: Duration::from_secs(5),
            recent_qualities: &[70.0, 95.0, 90.0],
        };
        assert_eq!(
            evaluate(&good(), &ctx, &Thresholds::default()).failed,
            Some(Gate::Unstable)
        );
    }

    #[test]
    fn test_stability_needs_full_window() {
        let ctx = GateContext {
            engaged_for: Duration::from_secs(5),
            recent_qualities: &[40.0, 90.0],
        };
        assert!(evaluate(&good(), &ctx, &Thresholds::default()).is_ready());
    }

    #[test]
    fn test_first_failure_wins() {
        // Fails angle, quality, eyes and engagement at once; angle comes first.
        let mut obs = good();
        obs.pose.angle = 30.0;
        obs.quality = 20.0;
        obs.eyes = EyeOpenness { left: 0.0, right: 0.0 };
        let ctx = GateContext {
            engaged_for: Duration::ZERO,
            recent_qualities: &[],
        };
        let verdict = evaluate(&obs, &ctx, &Thresholds::default());
        assert_eq!(verdict.failed, Some(Gate::Angle));
        assert_eq!(verdict.failed.unwrap().ordinal(), 4);
    }

    #[test]
    fn test_pure() {
        let obs = good();
        let a = evaluate(&obs, &engaged(), &Thresholds::default());
        let b = evaluate(&obs, &engaged(), &Thresholds::default());
        assert_eq!(a, b);
    }
}
