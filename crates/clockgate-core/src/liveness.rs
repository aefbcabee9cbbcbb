//! Temporal liveness fusion over the recent observation history.
//!
//! A printed photograph or a replayed still produces near-identical pose,
//! face size and quality readings frame after frame. A live person drifts:
//! the head moves by fractions of a degree, the eyes blink, and the quality
//! estimate wanders as they settle in front of the camera.
//!
//! Four independent signals are scored over the rolling window and summed
//! into a target confidence:
//!
//! | factor              | points | signal                                          |
//! |---------------------|--------|-------------------------------------------------|
//! | movement            | 40 +10 | pose delta > 0.5° or face size delta > 3 px     |
//! | blink               | 30     | open → closed → open, valid for 5 s             |
//! | quality variation   | 20     | stddev of last 5 qualities inside 2..8          |
//! | persistence         | 10     | face present for ≥ 5 consecutive frames         |
//!
//! The published score chases the target asymmetrically: it rises quickly
//! (+15 per tick) and decays slowly (−3 per tick), so liveness is quick to
//! confirm but a single noisy frame cannot revoke it.
//!
//! # Threat Coverage
//!
//! - **Blocks:** Printed photographs and static images held in front of the camera.
//! - **Does not block:** Video replay with natural motion, 3D masks, or
//!   adversarial displays. Those are the recognition backend's concern.

use std::collections::VecDeque;
use std::time::Duration;

use crate::observation::FrameObservation;

/// Maximum number of observations retained in the rolling window.
pub const MAX_FRAME_HISTORY: usize = 15;
/// Number of quality readings used for the variation factor.
const QUALITY_WINDOW: usize = 5;
/// Minimum history before any factor is scored.
const MIN_HISTORY: usize = 3;

const MOVEMENT_POINTS: f32 = 40.0;
const MICRO_MOVEMENT_POINTS: f32 = 10.0;
const BLINK_POINTS: f32 = 30.0;
const QUALITY_VARIATION_POINTS: f32 = 20.0;
const PERSISTENCE_POINTS: f32 = 10.0;

/// Pose change (degrees) between consecutive frames that counts as movement.
const MOVEMENT_DEG: f32 = 0.5;
/// Smaller pose change that earns the micro-movement bonus.
const MICRO_MOVEMENT_DEG: f32 = 0.2;
/// Face size change (pixels) across the movement window that counts as movement.
const SIZE_DELTA_PX: f32 = 3.0;

const EYES_CLOSED: f32 = 0.5;
const EYES_OPEN: f32 = 0.7;
const BLINK_VALIDITY: Duration = Duration::from_secs(5);

/// Natural quality standard deviation band (exclusive).
const NATURAL_STDDEV_MIN: f32 = 2.0;
const NATURAL_STDDEV_MAX: f32 = 8.0;

const PERSISTENCE_FRAMES: u32 = 5;

const RISE_STEP: f32 = 15.0;
const FALL_STEP: f32 = 3.0;
const NO_FACE_DECAY: f32 = 10.0;
/// Below this score the blink flag and persistence counter are cleared.
const RESET_FLOOR: f32 = 30.0;
/// Ticks at or above this score count towards `liveness_frames`.
const CONFIRMED_SCORE: f32 = 50.0;

/// Which factors fired on the last scored tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LivenessFactors {
    pub movement: bool,
    pub micro_movement: bool,
    pub blink: bool,
    pub quality_variation: bool,
    pub persistence: bool,
}

impl LivenessFactors {
    /// Weighted sum, capped at 100.
    pub fn points(&self) -> f32 {
        let mut points = 0.0;
        if self.movement {
            points += MOVEMENT_POINTS;
            if self.micro_movement {
                points += MICRO_MOVEMENT_POINTS;
            }
        }
        if self.blink {
            points += BLINK_POINTS;
        }
        if self.quality_variation {
            points += QUALITY_VARIATION_POINTS;
        }
        if self.persistence {
            points += PERSISTENCE_POINTS;
        }
        points.min(100.0)
    }
}

/// Result of feeding one observation to the fuser.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LivenessReport {
    pub score: f32,
    /// Target the score is moving towards (`None` when the tick was not scored).
    pub target: Option<f32>,
    pub factors: LivenessFactors,
    pub liveness_frames: u32,
}

/// Per-session liveness accumulator.
///
/// Observations must be fed in capture order. An observation older than the
/// newest one already in the window is ignored.
#[derive(Debug, Clone, Default)]
pub struct LivenessState {
    history: VecDeque<FrameObservation>,
    qualities: VecDeque<f32>,
    score: f32,
    liveness_frames: u32,
    blink_at: Option<Duration>,
    face_streak: u32,
    last_at: Option<Duration>,
    factors: LivenessFactors,
}

impl LivenessState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn score(&self) -> f32 {
        self.score
    }

    /// Ticks spent at or above the confirmed score since it last collapsed.
    pub fn liveness_frames(&self) -> u32 {
        self.liveness_frames
    }

    pub fn history(&self) -> impl Iterator<Item = &FrameObservation> {
        self.history.iter()
    }

    /// Whether a blink was seen within the validity window ending at `now`.
    pub fn blink_valid_at(&self, now: Duration) -> bool {
        self.blink_at
            .is_some_and(|t| now.saturating_sub(t) < BLINK_VALIDITY)
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Fold one observation into the state.
    pub fn update(&mut self, obs: &FrameObservation) -> LivenessReport {
        if self.last_at.is_some_and(|last| obs.at < last) {
            tracing::warn!(at = ?obs.at, last = ?self.last_at, "liveness: out-of-order observation ignored");
            return self.report(None);
        }
        self.last_at = Some(obs.at);

        if !obs.has_face {
            self.score = (self.score - NO_FACE_DECAY).max(0.0);
            if self.score < RESET_FLOOR {
                self.liveness_frames = 0;
                self.blink_at = None;
                self.face_streak = 0;
            }
            self.factors = LivenessFactors::default();
            return self.report(None);
        }

        self.history.push_back(obs.clone());
        while self.history.len() > MAX_FRAME_HISTORY {
            self.history.pop_front();
        }
        self.qualities.push_back(obs.quality);
        while self.qualities.len() > QUALITY_WINDOW {
            self.qualities.pop_front();
        }
        self.face_streak = self.face_streak.saturating_add(1);

        if self.history.len() < MIN_HISTORY {
            return self.report(None);
        }

        let (movement, micro_movement) = self.detect_movement();
        if self.detect_blink() {
            tracing::debug!(at = ?obs.at, "liveness: blink detected");
            self.blink_at = Some(obs.at);
        }
        let blink = self.blink_valid_at(obs.at);
        if !blink {
            self.blink_at = None;
        }

        self.factors = LivenessFactors {
            movement,
            micro_movement,
            blink,
            quality_variation: self.detect_quality_variation(),
            persistence: self.face_streak >= PERSISTENCE_FRAMES,
        };

        let target = self.factors.points();
        if target > self.score {
            self.score = (self.score + RISE_STEP).min(target);
        } else if target < self.score {
            self.score = (self.score - FALL_STEP).max(0.0);
        }

        if self.score >= CONFIRMED_SCORE {
            self.liveness_frames = self.liveness_frames.saturating_add(1);
        } else if self.score < RESET_FLOOR {
            self.liveness_frames = 0;
        }

        tracing::debug!(
            score = self.score,
            target,
            frames = self.liveness_frames,
            movement,
            blink,
            "liveness updated"
        );

        self.report(Some(target))
    }

    fn report(&self, target: Option<f32>) -> LivenessReport {
        LivenessReport {
            score: self.score,
            target,
            factors: self.factors,
            liveness_frames: self.liveness_frames,
        }
    }

    /// Pose and size deltas across the last three frames.
    fn detect_movement(&self) -> (bool, bool) {
        let recent: Vec<&FrameObservation> = self.history.iter().rev().take(MIN_HISTORY).rev().collect();
        let mut movement = false;
        let mut micro = false;

        for pair in recent.windows(2) {
            let (prev, curr) = (&pair[0].pose, &pair[1].pose);
            let angle = (curr.angle - prev.angle).abs();
            let yaw = (curr.yaw - prev.yaw).abs();
            let pitch = (curr.pitch - prev.pitch).abs();
            let roll = (curr.roll - prev.roll).abs();

            if angle > MOVEMENT_DEG || yaw > MOVEMENT_DEG || pitch > MOVEMENT_DEG || roll > MOVEMENT_DEG {
                movement = true;
                if angle > MICRO_MOVEMENT_DEG || yaw > MICRO_MOVEMENT_DEG || pitch > MICRO_MOVEMENT_DEG {
                    micro = true;
                }
            }
        }

        if !movement {
            if let (Some(first), Some(last)) = (recent.first(), recent.last()) {
                if (last.face_size - first.face_size).abs() > SIZE_DELTA_PX {
                    movement = true;
                }
            }
        }

        (movement, micro)
    }

    /// Open → closed → open within the last four frames.
    fn detect_blink(&self) -> bool {
        let eyes: Vec<f32> = self
            .history
            .iter()
            .rev()
            .take(MIN_HISTORY + 1)
            .rev()
            .map(|o| o.eyes.average())
            .collect();
        eyes.windows(3)
            .any(|w| w[0] > EYES_OPEN && w[1] < EYES_CLOSED && w[2] > EYES_OPEN)
    }

    /// Population standard deviation of the last five qualities inside the
    /// natural adjustment band.
    fn detect_quality_variation(&self) -> bool {
        if self.qualities.len() < MIN_HISTORY {
            return false;
        }
        let n = self.qualities.len() as f32;
        let mean = self.qualities.iter().sum::<f32>() / n;
        let variance = self.qualities.iter().map(|q| (q - mean).powi(2)).sum::<f32>() / n;
        let stddev = variance.sqrt();
        stddev > NATURAL_STDDEV_MIN && stddev < NATURAL_STDDEV_MAX
    }
}
