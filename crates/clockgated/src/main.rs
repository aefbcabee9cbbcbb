use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use clockgate_core::LocalHeuristic;
use clockgate_device::DeviceProfile;

mod camera;
mod config;
mod dbus_interface;
mod engine;
mod http;
mod locator;
mod store;
mod submit;
mod throttle;
mod validator;

use camera::CommandCamera;
use locator::CommandLocator;
use dbus_interface::{AppState, ClockgateService, BUS_NAME, OBJECT_PATH};
use engine::{EngineDeps, EngineEvent};
use submit::HttpSubmitter;
use validator::ValidatorClient;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("clockgated starting");

    let config = config::Config::from_env();
    let thresholds = config.load_thresholds()?;

    let profile = DeviceProfile::probe().context("failed to probe device fingerprint")?;
    let headers = profile.headers()?;
    tracing::info!(device_id = %profile.device_id, platform = %profile.platform, "device fingerprint ready");

    let capture_timeout = Duration::from_secs(config.capture_timeout_secs);
    let camera = CommandCamera::new(
        &config.capture_command,
        &config.frame_dir,
        (config.preview_size.0, config.preview_size.1, config.preview_quality),
        (config.full_size.0, config.full_size.1, config.full_quality),
        capture_timeout,
    )?;

    let local = match &config.face_detector_command {
        Some(command) => {
            tracing::info!(%command, "local face detector enabled");
            LocalHeuristic::with_locator(Box::new(CommandLocator::new(command, capture_timeout)?))
        }
        None => LocalHeuristic::new(),
    };

    let store = store::ClockLogStore::open(&config.db_path).await?;
    tracing::info!(path = %config.db_path.display(), "clock log opened");

    let deps = EngineDeps {
        camera: Arc::new(camera),
        local: Arc::new(local),
        remote: Arc::new(ValidatorClient::new(
            config.validator_url(),
            Duration::from_secs(config.validator_timeout_secs),
            headers.clone(),
        )),
        submitter: Arc::new(HttpSubmitter::new(
            config.clock_url(),
            config.verify_url(),
            Duration::from_secs(config.submit_timeout_secs),
            Duration::from_secs(config.verify_timeout_secs),
            headers,
        )),
        store: store.clone(),
        thresholds,
        tick: config.profile.tick_interval(),
        update_interval: throttle::MIN_INTERVAL,
        location: config.location,
    };

    let cancel = CancellationToken::new();
    let engine = engine::spawn_engine(deps, cancel.clone());
    let events = engine.subscribe();

    let service = ClockgateService {
        state: Arc::new(Mutex::new(AppState {
            engine,
            store,
            session_bus: config.session_bus,
        })),
    };

    let builder = if config.session_bus {
        zbus::connection::Builder::session()?
    } else {
        zbus::connection::Builder::system()?
    };
    let conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await?;

    tracing::info!(
        bus = if config.session_bus { "session" } else { "system" },
        api = %config.api_base_url,
        "clockgated ready"
    );

    let forwarder = tokio::spawn(forward_events(conn.clone(), events, cancel.clone()));

    // Keep running until signaled
    tokio::signal::ctrl_c().await?;
    tracing::info!("clockgated shutting down");
    cancel.cancel();
    if let Err(e) = forwarder.await? {
        tracing::warn!(error = %e, "event forwarder exited with error");
    }

    Ok(())
}

/// Re-emit engine events as D-Bus signals.
async fn forward_events(
    conn: zbus::Connection,
    mut events: broadcast::Receiver<EngineEvent>,
    cancel: CancellationToken,
) -> Result<()> {
    let iface = conn
        .object_server()
        .interface::<_, ClockgateService>(OBJECT_PATH)
        .await?;

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            event = events.recv() => event,
        };
        let event = match event {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "signal forwarder lagged, events dropped");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return Ok(()),
        };

        let json = serde_json::to_string(&event)?;
        let emitter = iface.signal_emitter();
        let sent = match Signal::for_event(&event) {
            Signal::AdvisoryUpdate => ClockgateService::advisory_update(emitter, &json).await,
            Signal::ReadinessUpdate => ClockgateService::readiness_update(emitter, &json).await,
            Signal::CaptureTriggered => ClockgateService::capture_triggered(emitter, &json).await,
            Signal::ClockResult => ClockgateService::clock_result(emitter, &json).await,
        };
        if let Err(e) = sent {
            tracing::warn!(error = %e, "failed to emit signal");
        }
    }
}

/// D-Bus signal an engine event is published on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Signal {
    AdvisoryUpdate,
    ReadinessUpdate,
    CaptureTriggered,
    ClockResult,
}

impl Signal {
    fn for_event(event: &EngineEvent) -> Self {
        match event {
            EngineEvent::Advisory { .. } => Self::AdvisoryUpdate,
            EngineEvent::Update { .. } => Self::ReadinessUpdate,
            EngineEvent::CaptureTriggered { .. } => Self::CaptureTriggered,
            EngineEvent::ClockSucceeded { .. } | EngineEvent::ClockFailed { .. } => Self::ClockResult,
        }
    }
}
