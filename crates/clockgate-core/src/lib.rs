//! Capture-readiness gating, liveness fusion and the attendance state machine.
//!
//! Everything in this crate is synchronous and free of I/O apart from the
//! local extractor decoding preview frames. The daemon drives it from its
//! tick loop.

pub mod analyzer;
pub mod attendance;
pub mod decider;
pub mod extractor;
pub mod feedback;
pub mod gate;
pub mod liveness;
pub mod observation;
pub mod quality;
pub mod session;
pub mod thresholds;

pub use analyzer::{FrameAnalyzer, FrameSample};
pub use attendance::{transition, ActivityType, AttendanceError, AttendanceState};
pub use decider::{CaptureDecider, Decision, Trigger};
pub use extractor::LocalHeuristic;
pub use feedback::{FeedbackState, ReadinessUpdate};
pub use gate::{Gate, GateVerdict};
pub use liveness::{LivenessReport, LivenessState};
pub use observation::{FrameObservation, Issue, ObservationSource};
pub use session::{Session, TickReport};
pub use thresholds::{Thresholds, ThresholdsError};
