use std::time::Duration;

use clockgate_core::ReadinessUpdate;

/// Minimum spacing between readiness updates pushed to the UI.
pub const MIN_INTERVAL: Duration = Duration::from_millis(500);

/// Rate limiter for readiness updates.
///
/// The first update of a session always goes out. After that at most one
/// update per `interval` is emitted, and only when it differs from the last
/// emitted one in something the UI shows. Times are session offsets, so the
/// throttle is reset together with the session clock.
pub struct UpdateThrottle {
    interval: Duration,
    last: Option<(Duration, ReadinessUpdate)>,
}

impl UpdateThrottle {
    pub fn new(interval: Duration) -> Self {
        Self { interval, last: None }
    }

    /// Offer an update produced at `now`. Returns it if it should be emitted.
    pub fn offer(&mut self, update: ReadinessUpdate, now: Duration) -> Option<ReadinessUpdate> {
        if let Some((at, last)) = &self.last {
            let elapsed = now.saturating_sub(*at);
            if elapsed < self.interval {
                tracing::trace!(?elapsed, "update throttled");
                return None;
            }
            if !update.is_meaningful_change(last) {
                return None;
            }
        }
        self.last = Some((now, update.clone()));
        Some(update)
    }

    pub fn reset(&mut self) {
        self.last = None;
    }
}

impl Default for UpdateThrottle {
    fn default() -> Self {
        Self::new(MIN_INTERVAL)
    }
}
