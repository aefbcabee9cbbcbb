use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ThresholdsError {
    #[error("failed to parse thresholds: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid threshold `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// The single admission threshold set used by the readiness gate and the
/// auto-capture decider.
///
/// Every flow (clock actions and registration captures alike) reads from the
/// same instance so a frame that passes the gate is never held back by a
/// different quality floor further down the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    /// Maximum combined head angle deviation in degrees.
    pub max_angle_deg: f32,
    /// Minimum quality for a frame to be admitted (gate and decider).
    pub quality_floor: f32,
    /// Below this quality the guidance is about lighting.
    pub lighting_floor: f32,
    /// Below this quality (and above `lighting_floor`) the guidance is "almost".
    pub almost_floor: f32,
    /// Minimum average eye openness.
    pub min_eye_openness: f32,
    /// Minimum time since session start before any frame can be admitted.
    pub min_engagement_ms: u64,
    /// Maximum spread (max − min) of the last three quality readings.
    pub max_quality_spread: f32,
    /// Minimum fused liveness score for a ready frame to count.
    pub min_liveness_score: f32,
    /// Minimum number of ticks the session has spent with confirmed liveness.
    pub min_liveness_frames: u32,
    /// Consecutive admitted frames required before auto-capture fires.
    pub required_ready_frames: u32,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            max_angle_deg: 10.0,
            quality_floor: 85.0,
            lighting_floor: 50.0,
            almost_floor: 70.0,
            min_eye_openness: 0.7,
            min_engagement_ms: 2_000,
            max_quality_spread: 15.0,
            min_liveness_score: 60.0,
            min_liveness_frames: 2,
            required_ready_frames: 5,
        }
    }
}

impl Thresholds {
    /// Parse a TOML document. Missing keys keep their defaults.
    pub fn from_toml_str(source: &str) -> Result<Self, ThresholdsError> {
        let thresholds: Self = toml::from_str(source)?;
        thresholds.validate()?;
        Ok(thresholds)
    }

    pub fn min_engagement(&self) -> Duration {
        Duration::from_millis(self.min_engagement_ms)
    }

    pub fn validate(&self) -> Result<(), ThresholdsError> {
        let in_range = |field: &'static str, v: f32, max: f32| {
            if v.is_finite() && (0.0..=max).contains(&v) {
                Ok(())
            } else {
                Err(ThresholdsError::Invalid {
                    field,
                    reason: format!("{v} is outside 0..={max}"),
                })
            }
        };
        in_range("quality_floor", self.quality_floor, 100.0)?;
        in_range("lighting_floor", self.lighting_floor, 100.0)?;
        in_range("almost_floor", self.almost_floor, 100.0)?;
        in_range("min_liveness_score", self.min_liveness_score, 100.0)?;
        in_range("min_eye_openness", self.min_eye_openness, 1.0)?;
        in_range("max_angle_deg", self.max_angle_deg, 180.0)?;
        in_range("max_quality_spread", self.max_quality_spread, 100.0)?;

        if !(self.lighting_floor <= self.almost_floor && self.almost_floor <= self.quality_floor) {
            return Err(ThresholdsError::Invalid {
                field: "almost_floor",
                reason: "expected lighting_floor <= almost_floor <= quality_floor".to_string(),
            });
        }
        if self.required_ready_frames == 0 {
            return Err(ThresholdsError::Invalid {
                field: "required_ready_frames",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}
