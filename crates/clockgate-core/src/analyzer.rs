use std::path::Path;
use std::time::Duration;

use crate::observation::{FrameObservation, ObservationSource};

/// A preview frame handed to an analyzer.
///
/// The frame file is owned by the tick that captured it and is removed as
/// soon as analysis returns; analyzers must not keep the path around.
#[derive(Debug, Clone, Copy)]
pub struct FrameSample<'a> {
    pub path: &'a Path,
    pub width: u32,
    pub height: u32,
    /// Offset from the start of the capture session.
    pub at: Duration,
}

/// Turns a frame into a [`FrameObservation`].
///
/// Two implementations exist: the on-device
/// [`LocalHeuristic`](crate::extractor::LocalHeuristic) and the daemon's
/// remote validator client. `analyze` is infallible by contract: any internal
/// failure degrades to a no-face observation so the sampling loop keeps going.
///
/// Implementations may block (file I/O, HTTP); callers run them off the
/// scheduler thread.
pub trait FrameAnalyzer: Send + Sync {
    fn source(&self) -> ObservationSource;

    fn analyze(&self, frame: &FrameSample<'_>) -> FrameObservation;
}
