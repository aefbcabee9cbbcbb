use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;
use zbus::interface;
use zbus::object_server::SignalEmitter;

use clockgate_core::{transition, ActivityType, AttendanceError, AttendanceState};

use crate::engine::{EngineError, EngineHandle};
use crate::store::ClockLogStore;

pub const BUS_NAME: &str = "io.clockgate.Kiosk1";
pub const OBJECT_PATH: &str = "/io/clockgate/Kiosk1";

/// Shared state accessible by D-Bus method handlers.
pub struct AppState {
    pub engine: EngineHandle,
    pub store: ClockLogStore,
    pub session_bus: bool,
}

/// D-Bus interface for the clock kiosk daemon.
///
/// Bus name: io.clockgate.Kiosk1
/// Object path: /io/clockgate/Kiosk1
///
/// Readiness, capture and clock results are pushed as signals carrying a JSON
/// payload; the UI layer subscribes instead of polling.
pub struct ClockgateService {
    pub state: Arc<Mutex<AppState>>,
}

impl ClockgateService {
    async fn engine(&self) -> EngineHandle {
        self.state.lock().await.engine.clone()
    }
}

fn engine_error(op: &str, e: EngineError) -> zbus::fdo::Error {
    match e {
        EngineError::InvalidLocation { .. } => {
            tracing::warn!(op, error = %e, "rejected");
            zbus::fdo::Error::InvalidArgs(e.to_string())
        }
        EngineError::ChannelClosed => {
            tracing::error!(op, error = %e, "engine unavailable");
            zbus::fdo::Error::Failed(e.to_string())
        }
        _ => {
            tracing::warn!(op, error = %e, "refused");
            zbus::fdo::Error::Failed(e.to_string())
        }
    }
}

fn parse_activity(activity: &str) -> zbus::fdo::Result<ActivityType> {
    ActivityType::from_str(activity).map_err(|e| zbus::fdo::Error::InvalidArgs(e.to_string()))
}

#[interface(name = "io.clockgate.Kiosk1")]
impl ClockgateService {
    /// Open a capture session for the given activity. Returns the session UUID.
    async fn start_session(&self, activity: &str) -> zbus::fdo::Result<String> {
        let activity = parse_activity(activity)?;
        tracing::info!(%activity, "start_session requested");
        let id = self
            .engine()
            .await
            .start_session(activity)
            .await
            .map_err(|e| engine_error("start_session", e))?;
        Ok(id.to_string())
    }

    async fn stop_session(&self) -> zbus::fdo::Result<()> {
        self.engine()
            .await
            .stop_session()
            .await
            .map_err(|e| engine_error("stop_session", e))
    }

    /// Pause sampling while the camera view is hidden.
    async fn suspend(&self) -> zbus::fdo::Result<()> {
        self.engine()
            .await
            .suspend()
            .await
            .map_err(|e| engine_error("suspend", e))
    }

    async fn resume(&self) -> zbus::fdo::Result<()> {
        self.engine()
            .await
            .resume()
            .await
            .map_err(|e| engine_error("resume", e))
    }

    /// Capture now, skipping the readiness hysteresis.
    ///
    /// Returns false if this session already captured.
    async fn manual_capture(&self) -> zbus::fdo::Result<bool> {
        tracing::info!("manual_capture requested");
        self.engine()
            .await
            .manual_capture()
            .await
            .map_err(|e| engine_error("manual_capture", e))
    }

    async fn dismiss_result(&self) -> zbus::fdo::Result<()> {
        self.engine()
            .await
            .dismiss_result()
            .await
            .map_err(|e| engine_error("dismiss_result", e))
    }

    async fn set_location(&self, latitude: f64, longitude: f64) -> zbus::fdo::Result<()> {
        self.engine()
            .await
            .set_location(latitude, longitude)
            .await
            .map_err(|e| engine_error("set_location", e))
    }

    /// Return daemon and session status as JSON.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let (engine, store, session_bus) = {
            let state = self.state.lock().await;
            (state.engine.clone(), state.store.clone(), state.session_bus)
        };
        let status = engine.status().await.map_err(|e| engine_error("status", e))?;
        let cached = store.count().await.unwrap_or(0);

        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "session_bus": session_bus,
            "cached_clocks": cached,
            "engine": status,
        })
        .to_string())
    }

    /// Apply `activity` to `state` without touching any stored state.
    ///
    /// Returns the resulting state name.
    async fn transition(&self, state: &str, activity: &str) -> zbus::fdo::Result<String> {
        let state = AttendanceState::from_str(state).map_err(|e| zbus::fdo::Error::InvalidArgs(e.to_string()))?;
        let activity = parse_activity(activity)?;
        match transition(state, activity) {
            Ok(next) => Ok(next.as_str().to_string()),
            Err(e @ AttendanceError::InvalidTransition { .. }) => Err(zbus::fdo::Error::Failed(e.to_string())),
            Err(e) => Err(zbus::fdo::Error::InvalidArgs(e.to_string())),
        }
    }

    /// Most recent cached clock results as JSON, newest first.
    async fn recent_clocks(&self, limit: u32) -> zbus::fdo::Result<String> {
        let store = self.state.lock().await.store.clone();
        let records = store.recent(limit).await.map_err(|e| {
            tracing::error!(error = %e, "recent_clocks failed");
            zbus::fdo::Error::Failed(e.to_string())
        })?;
        serde_json::to_string(&records).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
    }

    /// Last attendance state mirrored locally for a staff member.
    async fn current_state(&self, staff_name: &str) -> zbus::fdo::Result<String> {
        let store = self.state.lock().await.store.clone();
        let state = store.current_state(staff_name).await.map_err(|e| {
            tracing::error!(error = %e, "current_state failed");
            zbus::fdo::Error::Failed(e.to_string())
        })?;
        Ok(state.as_str().to_string())
    }

    /// Throttled authoritative readiness.
    #[zbus(signal)]
    pub async fn readiness_update(emitter: &SignalEmitter<'_>, json: &str) -> zbus::Result<()>;

    /// On-device preview feedback. Never authorizes a capture.
    #[zbus(signal)]
    pub async fn advisory_update(emitter: &SignalEmitter<'_>, json: &str) -> zbus::Result<()>;

    #[zbus(signal)]
    pub async fn capture_triggered(emitter: &SignalEmitter<'_>, json: &str) -> zbus::Result<()>;

    #[zbus(signal)]
    pub async fn clock_result(emitter: &SignalEmitter<'_>, json: &str) -> zbus::Result<()>;
}
