//! User-facing readiness updates and engagement tracking.
//!
//! The tracker turns raw observations into a coarse [`FeedbackState`], a
//! quality trend and an advisory message for the fast local path. The
//! authoritative path composes its message from the gate verdict instead; see
//! [`Session`](crate::session::Session).

use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;

use crate::liveness::LivenessReport;
use crate::observation::{BoundingBox, DistanceClass, FrameObservation, Issue, ObservationSource, SizeClass};

const QUALITY_HISTORY: usize = 5;
const TREND_WINDOW: usize = 3;
const TREND_DELTA: f32 = 5.0;
/// A jump of more than this over the previous reading counts as an improvement.
const IMPROVEMENT_DELTA: f32 = 5.0;
/// Before this much time has passed a missing face is still "searching".
const SEARCH_GRACE: Duration = Duration::from_secs(3);

/// Coarse engagement state, driven by presence and quality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackState {
    #[default]
    Initial,
    Searching,
    NoFace,
    Detected,
    Good,
    Excellent,
    Ready,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityTrend {
    Improving,
    Stable,
    Degrading,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EngagementMetrics {
    /// Session time at which a face was first seen.
    pub first_detection: Option<Duration>,
    pub quality_improvements: u32,
    pub average_quality: f32,
    pub trend: QualityTrend,
}

/// One throttleable update for the UI layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReadinessUpdate {
    pub at: Duration,
    pub source: ObservationSource,
    pub message: String,
    pub quality: f32,
    pub bounding_box: Option<BoundingBox>,
    pub is_ready: bool,
    pub state: FeedbackState,
    pub consecutive_ready: u32,
    pub liveness: f32,
}

impl ReadinessUpdate {
    /// Whether this update differs from `other` in anything the UI shows.
    pub fn is_meaningful_change(&self, other: &ReadinessUpdate) -> bool {
        self.message != other.message
            || self.is_ready != other.is_ready
            || self.state != other.state
            || (self.quality - other.quality).abs() >= 1.0
    }
}

/// Guidance for a validator issue tag, when it has a friendlier form than
/// the generic gate message.
pub fn issue_guidance(issue: &Issue) -> Option<&'static str> {
    match issue {
        Issue::ValidationError => Some("Unable to analyze. Please try again."),
        Issue::DetectionFailed => Some("Camera view is blocked or too dark"),
        Issue::Blur => Some("Image is blurry. Hold the device steady"),
        Issue::Lighting => Some("Find better lighting"),
        _ => None,
    }
}

#[derive(Debug, Clone, Default)]
pub struct FeedbackTracker {
    state: FeedbackState,
    qualities: VecDeque<f32>,
    first_detection: Option<Duration>,
    quality_improvements: u32,
}

impl FeedbackTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> FeedbackState {
        self.state
    }

    /// Record an observation. Returns the new state and the advisory message.
    pub fn update(&mut self, obs: &FrameObservation) -> (FeedbackState, &'static str) {
        let previous = self.qualities.back().copied().unwrap_or(0.0);
        if obs.quality > 0.0 {
            self.qualities.push_back(obs.quality);
            while self.qualities.len() > QUALITY_HISTORY {
                self.qualities.pop_front();
            }
        }
        if obs.quality > previous + IMPROVEMENT_DELTA {
            self.quality_improvements += 1;
        }

        self.state = if !obs.has_face {
            if obs.at < SEARCH_GRACE {
                FeedbackState::Searching
            } else {
                FeedbackState::NoFace
            }
        } else {
            if self.first_detection.is_none() {
                tracing::debug!(at = ?obs.at, "feedback: first detection");
                self.first_detection = Some(obs.at);
            }
            match obs.quality {
                q if q >= 85.0 => FeedbackState::Ready,
                q if q >= 70.0 => FeedbackState::Excellent,
                q if q >= 50.0 => FeedbackState::Good,
                _ => FeedbackState::Detected,
            }
        };

        (self.state, advisory_message(obs, previous))
    }

    pub fn trend(&self) -> QualityTrend {
        if self.qualities.len() < 2 {
            return QualityTrend::Stable;
        }
        let recent: Vec<f32> = self.qualities.iter().rev().take(TREND_WINDOW).copied().collect();
        let delta = recent[0] - recent[recent.len() - 1];
        if delta > TREND_DELTA {
            QualityTrend::Improving
        } else if delta < -TREND_DELTA {
            QualityTrend::Degrading
        } else {
            QualityTrend::Stable
        }
    }

    pub fn metrics(&self) -> EngagementMetrics {
        let average_quality = if self.qualities.is_empty() {
            0.0
        } else {
            self.qualities.iter().sum::<f32>() / self.qualities.len() as f32
        };
        EngagementMetrics {
            first_detection: self.first_detection,
            quality_improvements: self.quality_improvements,
            average_quality,
            trend: self.trend(),
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

fn advisory_message(obs: &FrameObservation, previous: f32) -> &'static str {
    if obs.face_count > 1 {
        return "Multiple faces detected. Please ensure only you are in frame";
    }
    if !obs.has_face {
        if let Some(msg) = obs.issues.iter().find_map(issue_guidance) {
            return msg;
        }
        return if obs.at < Duration::from_secs(2) {
            "Position your face in the circle"
        } else {
            "Please bring your face closer to the frame"
        };
    }
    if matches!(obs.size, SizeClass::TooSmall) || matches!(obs.distance, DistanceClass::Far) {
        return "Please bring your face closer to the frame";
    }
    if matches!(obs.size, SizeClass::TooLarge) || matches!(obs.distance, DistanceClass::TooClose) {
        return "Move slightly farther away";
    }
    if obs.pose.angle.abs() > 15.0 {
        return "Look straight into the camera";
    }

    let q = obs.quality;
    if q < 30.0 {
        "Face detected! Move to better lighting"
    } else if q < 50.0 {
        "Good! Adjust lighting for better quality"
    } else if q < 70.0 {
        if (q - previous).abs() > 10.0 {
            "Hold still..."
        } else if q > previous + 3.0 {
            "Improving! Hold still..."
        } else {
            "Good position! Hold still..."
        }
    } else if q > previous + 2.0 {
        "Excellent! Almost ready..."
    } else {
        "Great quality! Hold still..."
    }
}

/// Compose an update from the parts a tick produced.
pub(crate) fn compose(
    obs: &FrameObservation,
    state: FeedbackState,
    message: String,
    is_ready: bool,
    consecutive_ready: u32,
    liveness: &LivenessReport,
) -> ReadinessUpdate {
    ReadinessUpdate {
        at: obs.at,
        source: obs.source,
        message,
        quality: obs.quality,
        bounding_box: obs.bounding_box,
        is_ready,
        state,
        consecutive_ready,
        liveness: liveness.score,
    }
}
