//! One capture session: everything that lives from camera-open to capture.
//!
//! A [`Session`] owns the liveness accumulator, the capture decider, the
//! feedback trackers and the short quality history the stability gate reads.
//! The caller feeds it observations in tick order and acts on the returned
//! [`Decision`]. Nothing here is shared or global; dropping the session
//! discards every signal it collected.

use std::collections::VecDeque;
use std::time::Duration;

use crate::attendance::ActivityType;
use crate::decider::{CaptureDecider, DeciderInput, Decision, Trigger};
use crate::feedback::{self, issue_guidance, EngagementMetrics, FeedbackTracker, ReadinessUpdate};
use crate::gate::{self, GateContext, GateVerdict};
use crate::liveness::{LivenessReport, LivenessState};
use crate::observation::{FrameObservation, Issue, ObservationSource};
use crate::thresholds::Thresholds;

const QUALITY_HISTORY: usize = 5;

/// Everything one authoritative tick produced.
#[derive(Debug, Clone)]
pub struct TickReport {
    pub update: ReadinessUpdate,
    pub verdict: GateVerdict,
    pub liveness: LivenessReport,
    pub decision: Decision,
}

impl TickReport {
    /// The trigger, if this tick fired the capture.
    pub fn fired(&self) -> Option<Trigger> {
        match self.decision {
            Decision::Fire { trigger } => Some(trigger),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Session {
    activity: ActivityType,
    thresholds: Thresholds,
    liveness: LivenessState,
    decider: CaptureDecider,
    tracker: FeedbackTracker,
    advisory: FeedbackTracker,
    qualities: VecDeque<f32>,
    last_at: Option<Duration>,
}

impl Session {
    pub fn new(activity: ActivityType, thresholds: Thresholds) -> Self {
        Self {
            activity,
            decider: CaptureDecider::new(thresholds.clone()),
            thresholds,
            liveness: LivenessState::new(),
            tracker: FeedbackTracker::new(),
            advisory: FeedbackTracker::new(),
            qualities: VecDeque::with_capacity(QUALITY_HISTORY),
            last_at: None,
        }
    }

    pub fn activity(&self) -> ActivityType {
        self.activity
    }

    pub fn thresholds(&self) -> &Thresholds {
        &self.thresholds
    }

    pub fn liveness_score(&self) -> f32 {
        self.liveness.score()
    }

    pub fn consecutive_ready_frames(&self) -> u32 {
        self.decider.consecutive_ready_frames()
    }

    /// A capture has fired and the session has not been reset since.
    pub fn is_latched(&self) -> bool {
        self.decider.is_latched()
    }

    pub fn metrics(&self) -> EngagementMetrics {
        self.tracker.metrics()
    }

    /// Fold one authoritative observation into the session.
    ///
    /// `obs.at` is the offset from session start and doubles as the
    /// engagement time. Observations older than the last one ingested are
    /// dropped and `None` is returned.
    pub fn ingest(&mut self, obs: &FrameObservation, precondition_met: bool) -> Option<TickReport> {
        if self.last_at.is_some_and(|last| obs.at < last) {
            tracing::warn!(at = ?obs.at, "session: stale observation dropped");
            return None;
        }
        self.last_at = Some(obs.at);

        if obs.has_face {
            self.qualities.push_back(obs.quality);
            while self.qualities.len() > QUALITY_HISTORY {
                self.qualities.pop_front();
            }
        }

        let liveness = self.liveness.update(obs);
        let verdict = gate::evaluate(
            obs,
            &GateContext {
                engaged_for: obs.at,
                recent_qualities: self.qualities.make_contiguous(),
            },
            &self.thresholds,
        );
        let gate_ready = obs.authoritative_ready() && verdict.is_ready();

        let decision = self.decider.observe(&DeciderInput {
            gate_ready,
            liveness_score: liveness.score,
            liveness_frames: liveness.liveness_frames,
            quality: obs.quality,
            precondition_met,
        });

        let message = self.message_for(obs, &verdict, &liveness, decision, precondition_met);
        let (state, _) = self.tracker.update(obs);

        if let Some(g) = verdict.failed {
            tracing::debug!(at = ?obs.at, gate = %g, quality = obs.quality, "gate rejected");
        }

        let update = feedback::compose(
            obs,
            state,
            message,
            gate_ready,
            self.decider.consecutive_ready_frames(),
            &liveness,
        );
        Some(TickReport {
            update,
            verdict,
            liveness,
            decision,
        })
    }

    /// Advisory update from the fast local path. Never ready, never touches
    /// liveness or the decider.
    pub fn advise(&mut self, obs: &FrameObservation) -> ReadinessUpdate {
        let (state, message) = self.advisory.update(obs);
        ReadinessUpdate {
            at: obs.at,
            source: ObservationSource::LocalHeuristic,
            message: message.to_string(),
            quality: obs.quality,
            bounding_box: obs.bounding_box,
            is_ready: false,
            state,
            consecutive_ready: self.decider.consecutive_ready_frames(),
            liveness: self.liveness.score(),
        }
    }

    pub fn manual_trigger(&mut self) -> Option<Trigger> {
        self.decider.manual_trigger()
    }

    /// Drop every collected signal. The caller restarts its session clock so
    /// the engagement gate counts from zero again.
    pub fn reset(&mut self) {
        self.liveness.reset();
        self.decider.reset();
        self.tracker.reset();
        self.advisory.reset();
        self.qualities.clear();
        self.last_at = None;
    }

    fn message_for(
        &self,
        obs: &FrameObservation,
        verdict: &GateVerdict,
        liveness: &LivenessReport,
        decision: Decision,
        precondition_met: bool,
    ) -> String {
        if obs.has_issue(&Issue::ValidationError) {
            return obs
                .feedback
                .clone()
                .unwrap_or_else(|| issue_guidance(&Issue::ValidationError).unwrap_or_default().to_string());
        }
        match decision {
            Decision::Fire { .. } => return "Capturing...".to_string(),
            Decision::Latched => return "Processing...".to_string(),
            Decision::Hold { .. } => {}
        }
        if let Some(gate) = verdict.failed {
            return gate.guidance().to_string();
        }
        if !obs.ready {
            return obs.feedback.clone().unwrap_or_else(|| "Hold still, checking...".to_string());
        }
        if !precondition_met {
            return "Waiting for location...".to_string();
        }
        if liveness.score < self.thresholds.min_liveness_score
            || liveness.liveness_frames < self.thresholds.min_liveness_frames
        {
            return "Blink naturally or move slightly".to_string();
        }
        verdict.guidance().to_string()
    }
}
