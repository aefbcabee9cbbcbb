//! Hysteresis and the single-shot capture trigger.

use serde::Serialize;

use crate::thresholds::Thresholds;

/// What made the capture fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    Automatic,
    Manual,
}

/// Per-tick inputs to the decider.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeciderInput {
    /// Readiness gate verdict combined with the authoritative `ready` flag.
    pub gate_ready: bool,
    pub liveness_score: f32,
    pub liveness_frames: u32,
    pub quality: f32,
    /// Out-of-band preconditions such as a location fix.
    pub precondition_met: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    /// Not firing yet; `consecutive` ready ticks so far.
    Hold { consecutive: u32 },
    /// Fire now. Returned at most once per session.
    Fire { trigger: Trigger },
    /// A capture already fired and has not been reset.
    Latched,
}

/// Counts consecutive admitted ticks and fires exactly once.
#[derive(Debug, Clone)]
pub struct CaptureDecider {
    thresholds: Thresholds,
    consecutive: u32,
    latched: bool,
}

impl CaptureDecider {
    pub fn new(thresholds: Thresholds) -> Self {
        Self {
            thresholds,
            consecutive: 0,
            latched: false,
        }
    }

    pub fn consecutive_ready_frames(&self) -> u32 {
        self.consecutive
    }

    pub fn is_latched(&self) -> bool {
        self.latched
    }

    fn admitted(&self, input: &DeciderInput) -> bool {
        input.gate_ready
            && input.liveness_score >= self.thresholds.min_liveness_score
            && input.liveness_frames >= self.thresholds.min_liveness_frames
            && input.quality >= self.thresholds.quality_floor
            && input.precondition_met
    }

    pub fn observe(&mut self, input: &DeciderInput) -> Decision {
        if self.latched {
            return Decision::Latched;
        }
        if !self.admitted(input) {
            if self.consecutive > 0 {
                tracing::debug!(was = self.consecutive, "decider: streak broken");
            }
            self.consecutive = 0;
            return Decision::Hold { consecutive: 0 };
        }

        self.consecutive += 1;
        if self.consecutive >= self.thresholds.required_ready_frames {
            self.latched = true;
            tracing::info!(consecutive = self.consecutive, "decider: auto-capture fired");
            return Decision::Fire {
                trigger: Trigger::Automatic,
            };
        }
        Decision::Hold {
            consecutive: self.consecutive,
        }
    }

    /// Explicit user action. Fires immediately unless a capture is already
    /// outstanding.
    pub fn manual_trigger(&mut self) -> Option<Trigger> {
        if self.latched {
            tracing::debug!("decider: manual trigger ignored, capture outstanding");
            return None;
        }
        self.latched = true;
        tracing::info!("decider: manual capture fired");
        Some(Trigger::Manual)
    }

    pub fn reset(&mut self) {
        self.consecutive = 0;
        self.latched = false;
    }
}
