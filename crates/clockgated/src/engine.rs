use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use clockgate_core::feedback::EngagementMetrics;
use clockgate_core::{
    ActivityType, AttendanceState, FrameAnalyzer, FrameObservation, FrameSample, ReadinessUpdate, Session, Thresholds,
    Trigger,
};

use crate::camera::{Camera, CaptureMode};
use crate::store::{ClockLogStore, StoreError};
use crate::submit::{submit_with_recovery, ClockOutcome, ClockReceipt, ClockRequest, ClockSubmitter, SubmitError};
use crate::throttle::UpdateThrottle;

const EVENT_CAPACITY: usize = 64;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("no active capture session")]
    NoSession,
    #[error("cannot {action} while {phase}")]
    InvalidPhase { action: &'static str, phase: Phase },
    #[error("location is not available yet")]
    LocationUnavailable,
    #[error("invalid location ({latitude}, {longitude})")]
    InvalidLocation { latitude: f64, longitude: f64 },
    #[error("engine task exited")]
    ChannelClosed,
}

/// Where the active session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Ticking: previews are captured and analyzed.
    Sampling,
    /// Camera view hidden; no ticks run.
    Suspended,
    /// Full capture and submission in flight.
    Capturing,
    /// A success, or a failure that must not be retried blindly, is on
    /// screen until dismissed.
    ShowingResult,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Sampling => "sampling",
            Self::Suspended => "suspended",
            Self::Capturing => "capturing",
            Self::ShowingResult => "showing a result",
        })
    }
}

/// Everything the engine pushes to the UI layer.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    /// Fast, advisory preview feedback (live box and quality pill).
    Advisory { session: Uuid, update: ReadinessUpdate },
    /// Throttled authoritative readiness update.
    Update { session: Uuid, update: ReadinessUpdate },
    CaptureTriggered {
        session: Uuid,
        activity: ActivityType,
        trigger: Trigger,
    },
    ClockSucceeded {
        session: Uuid,
        activity: ActivityType,
        receipt: ClockReceipt,
        /// Locally mirrored state after the action, when it could be advanced.
        state: Option<AttendanceState>,
        late_warning: Option<String>,
        state_warning: Option<String>,
    },
    ClockFailed {
        session: Uuid,
        activity: ActivityType,
        error: String,
        retryable: bool,
        /// The server may or may not have recorded the action.
        unknown_outcome: bool,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub session: Option<Uuid>,
    pub activity: Option<ActivityType>,
    pub phase: Option<Phase>,
    pub liveness: f32,
    pub consecutive_ready: u32,
    pub location: Option<(f64, f64)>,
    pub metrics: Option<EngagementMetrics>,
}

/// What the engine runs against.
pub struct EngineDeps {
    pub camera: Arc<dyn Camera>,
    /// Fast on-device path. Advisory only.
    pub local: Arc<dyn FrameAnalyzer>,
    /// Authoritative path; the only one that feeds the capture decision.
    pub remote: Arc<dyn FrameAnalyzer>,
    pub submitter: Arc<dyn ClockSubmitter>,
    pub store: ClockLogStore,
    pub thresholds: Thresholds,
    pub tick: Duration,
    pub update_interval: Duration,
    pub location: Option<(f64, f64)>,
}

enum EngineRequest {
    StartSession {
        activity: ActivityType,
        reply: oneshot::Sender<Uuid>,
    },
    StopSession {
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    Suspend {
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    Resume {
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    ManualCapture {
        reply: oneshot::Sender<Result<bool, EngineError>>,
    },
    DismissResult {
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    SetLocation {
        latitude: f64,
        longitude: f64,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    Status {
        reply: oneshot::Sender<EngineStatus>,
    },
}

/// Results coming back from blocking work, tagged with the session epoch
/// they were started in.
enum Work {
    Advisory {
        epoch: u64,
        obs: FrameObservation,
    },
    Observed {
        epoch: u64,
        obs: FrameObservation,
    },
    TickFailed {
        epoch: u64,
        error: String,
    },
    Captured {
        epoch: u64,
        activity: ActivityType,
        result: Result<ClockOutcome, String>,
    },
}

/// Clone-safe handle to the engine task.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    events: broadcast::Sender<EngineEvent>,
}

impl EngineHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> EngineRequest) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    /// Open a new capture session, replacing any current one.
    pub async fn start_session(&self, activity: ActivityType) -> Result<Uuid, EngineError> {
        self.request(|reply| EngineRequest::StartSession { activity, reply }).await
    }

    pub async fn stop_session(&self) -> Result<(), EngineError> {
        self.request(|reply| EngineRequest::StopSession { reply }).await?
    }

    pub async fn suspend(&self) -> Result<(), EngineError> {
        self.request(|reply| EngineRequest::Suspend { reply }).await?
    }

    pub async fn resume(&self) -> Result<(), EngineError> {
        self.request(|reply| EngineRequest::Resume { reply }).await?
    }

    /// Fire the capture now, or once the preview in flight finishes.
    /// `Ok(false)` if this session already fired.
    pub async fn manual_capture(&self) -> Result<bool, EngineError> {
        self.request(|reply| EngineRequest::ManualCapture { reply }).await?
    }

    pub async fn dismiss_result(&self) -> Result<(), EngineError> {
        self.request(|reply| EngineRequest::DismissResult { reply }).await?
    }

    pub async fn set_location(&self, latitude: f64, longitude: f64) -> Result<(), EngineError> {
        self.request(|reply| EngineRequest::SetLocation {
            latitude,
            longitude,
            reply,
        })
        .await?
    }

    pub async fn status(&self) -> Result<EngineStatus, EngineError> {
        self.request(|reply| EngineRequest::Status { reply }).await
    }
}

struct Active {
    id: Uuid,
    session: Session,
    phase: Phase,
    started: Instant,
    throttle: UpdateThrottle,
    advisory_throttle: UpdateThrottle,
    /// Manual capture requested while a preview was still in flight.
    pending_capture: Option<Trigger>,
}

impl Active {
    fn new(activity: ActivityType, thresholds: Thresholds, update_interval: Duration) -> Self {
        Self {
            id: Uuid::new_v4(),
            session: Session::new(activity, thresholds),
            phase: Phase::Sampling,
            started: Instant::now(),
            throttle: UpdateThrottle::new(update_interval),
            advisory_throttle: UpdateThrottle::new(update_interval),
            pending_capture: None,
        }
    }

    /// Drop collected signals and restart the session clock.
    fn restart(&mut self) {
        self.session.reset();
        self.started = Instant::now();
        self.throttle.reset();
        self.advisory_throttle.reset();
        self.pending_capture = None;
        self.phase = Phase::Sampling;
    }
}

struct Engine {
    deps: EngineDeps,
    events: broadcast::Sender<EngineEvent>,
    work_tx: mpsc::Sender<Work>,
    location: Option<(f64, f64)>,
    active: Option<Active>,
    /// Bumped whenever the session is replaced or restarted so results from
    /// earlier work are recognised as stale.
    epoch: u64,
    /// One preview at a time; the camera is a single device.
    tick_in_flight: bool,
}

/// Spawn the engine task on the current runtime.
///
/// The task runs until `cancel` fires or every handle is dropped.
pub fn spawn_engine(deps: EngineDeps, cancel: CancellationToken) -> EngineHandle {
    let (tx, rx) = mpsc::channel::<EngineRequest>(16);
    let (work_tx, work_rx) = mpsc::channel::<Work>(16);
    let (events, _) = broadcast::channel(EVENT_CAPACITY);

    let engine = Engine {
        location: deps.location,
        deps,
        events: events.clone(),
        work_tx,
        active: None,
        epoch: 0,
        tick_in_flight: false,
    };
    tokio::spawn(engine.run(rx, work_rx, cancel));

    EngineHandle { tx, events }
}

fn valid_location(latitude: f64, longitude: f64) -> bool {
    latitude.is_finite() && longitude.is_finite() && (-90.0..=90.0).contains(&latitude) && (-180.0..=180.0).contains(&longitude)
}

fn capture_and_submit(
    camera: &dyn Camera,
    submitter: &dyn ClockSubmitter,
    activity: ActivityType,
    (latitude, longitude): (f64, f64),
) -> Result<ClockOutcome, String> {
    let frame = camera.capture(CaptureMode::Full).map_err(|e| e.to_string())?;
    let image = std::fs::read(&frame.path).map_err(|e| format!("failed to read capture: {e}"))?;
    drop(frame);

    let request = ClockRequest {
        activity,
        latitude,
        longitude,
        image,
        requested_at: chrono::Utc::now(),
    };
    Ok(submit_with_recovery(submitter, &request))
}

impl Engine {
    async fn run(
        mut self,
        mut rx: mpsc::Receiver<EngineRequest>,
        mut work_rx: mpsc::Receiver<Work>,
        cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(self.deps.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(tick_ms = self.deps.tick.as_millis() as u64, "engine started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                req = rx.recv() => match req {
                    Some(req) => self.handle_request(req),
                    None => break,
                },
                Some(work) = work_rx.recv() => self.handle_work(work).await,
                _ = ticker.tick() => self.on_tick(),
            }
        }
        tracing::info!("engine stopped");
    }

    fn emit(&self, event: EngineEvent) {
        // No subscribers is fine; the UI may not be attached yet.
        let _ = self.events.send(event);
    }

    fn active_in(&mut self, action: &'static str, phase: Phase) -> Result<&mut Active, EngineError> {
        let active = self.active.as_mut().ok_or(EngineError::NoSession)?;
        if active.phase != phase {
            return Err(EngineError::InvalidPhase {
                action,
                phase: active.phase,
            });
        }
        Ok(active)
    }

    fn handle_request(&mut self, req: EngineRequest) {
        match req {
            EngineRequest::StartSession { activity, reply } => {
                let id = self.start_session(activity);
                let _ = reply.send(id);
            }
            EngineRequest::StopSession { reply } => {
                let result = match self.active.take() {
                    Some(active) => {
                        self.epoch += 1;
                        tracing::info!(session = %active.id, "session stopped");
                        Ok(())
                    }
                    None => Err(EngineError::NoSession),
                };
                let _ = reply.send(result);
            }
            EngineRequest::Suspend { reply } => {
                let result = self.active_in("suspend", Phase::Sampling).map(|active| {
                    active.phase = Phase::Suspended;
                    tracing::info!(session = %active.id, "session suspended");
                });
                if result.is_ok() {
                    self.epoch += 1;
                }
                let _ = reply.send(result);
            }
            EngineRequest::Resume { reply } => {
                let result = self.restart_from("resume", Phase::Suspended);
                let _ = reply.send(result);
            }
            EngineRequest::DismissResult { reply } => {
                let result = self.restart_from("dismiss a result", Phase::ShowingResult);
                let _ = reply.send(result);
            }
            EngineRequest::ManualCapture { reply } => {
                let result = self.manual_capture();
                let _ = reply.send(result);
            }
            EngineRequest::SetLocation {
                latitude,
                longitude,
                reply,
            } => {
                let result = if valid_location(latitude, longitude) {
                    self.location = Some((latitude, longitude));
                    tracing::info!(latitude, longitude, "location set");
                    Ok(())
                } else {
                    tracing::warn!(latitude, longitude, "rejected invalid location");
                    Err(EngineError::InvalidLocation { latitude, longitude })
                };
                let _ = reply.send(result);
            }
            EngineRequest::Status { reply } => {
                let _ = reply.send(self.status());
            }
        }
    }

    fn start_session(&mut self, activity: ActivityType) -> Uuid {
        if let Some(previous) = self.active.take() {
            tracing::info!(session = %previous.id, "session replaced");
        }
        self.epoch += 1;
        let active = Active::new(activity, self.deps.thresholds.clone(), self.deps.update_interval);
        let id = active.id;
        self.active = Some(active);
        tracing::info!(session = %id, %activity, "session started");
        id
    }

    fn restart_from(&mut self, action: &'static str, phase: Phase) -> Result<(), EngineError> {
        let active = self.active_in(action, phase)?;
        active.restart();
        tracing::info!(session = %active.id, "sampling resumed");
        self.epoch += 1;
        Ok(())
    }

    fn manual_capture(&mut self) -> Result<bool, EngineError> {
        let location = self.location;
        let preview_busy = self.tick_in_flight;
        let active = self.active_in("capture", Phase::Sampling)?;
        if location.is_none() {
            return Err(EngineError::LocationUnavailable);
        }
        match active.session.manual_trigger() {
            // The camera is still busy with a preview; start once it settles.
            Some(trigger) if preview_busy => {
                tracing::debug!(session = %active.id, "manual capture queued behind preview");
                active.pending_capture = Some(trigger);
                Ok(true)
            }
            Some(trigger) => {
                self.begin_capture(trigger);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn status(&self) -> EngineStatus {
        match &self.active {
            Some(active) => EngineStatus {
                session: Some(active.id),
                activity: Some(active.session.activity()),
                phase: Some(active.phase),
                liveness: active.session.liveness_score(),
                consecutive_ready: active.session.consecutive_ready_frames(),
                location: self.location,
                metrics: Some(active.session.metrics()),
            },
            None => EngineStatus {
                session: None,
                activity: None,
                phase: None,
                liveness: 0.0,
                consecutive_ready: 0,
                location: self.location,
                metrics: None,
            },
        }
    }

    fn on_tick(&mut self) {
        let Some(active) = &self.active else {
            return;
        };
        if active.phase != Phase::Sampling {
            return;
        }
        if self.tick_in_flight {
            tracing::trace!("previous preview still in flight, tick skipped");
            return;
        }
        self.tick_in_flight = true;

        let epoch = self.epoch;
        let started = active.started;
        let camera = Arc::clone(&self.deps.camera);
        let local = Arc::clone(&self.deps.local);
        let remote = Arc::clone(&self.deps.remote);
        let advisory_tx = self.work_tx.clone();

        let job = tokio::task::spawn_blocking(move || match camera.capture(CaptureMode::Preview) {
            Ok(frame) => {
                let sample = FrameSample {
                    path: &frame.path,
                    width: frame.width,
                    height: frame.height,
                    at: started.elapsed(),
                };
                let advisory = local.analyze(&sample);
                let _ = advisory_tx.blocking_send(Work::Advisory { epoch, obs: advisory });
                Work::Observed {
                    epoch,
                    obs: remote.analyze(&sample),
                }
            }
            Err(e) => Work::TickFailed {
                epoch,
                error: e.to_string(),
            },
        });

        // Every tick reports back, even when the blocking job panics, so
        // `tick_in_flight` is always cleared.
        let work_tx = self.work_tx.clone();
        tokio::spawn(async move {
            let work = job.await.unwrap_or_else(|e| Work::TickFailed {
                epoch,
                error: format!("preview task failed: {e}"),
            });
            let _ = work_tx.send(work).await;
        });
    }

    async fn handle_work(&mut self, work: Work) {
        match work {
            Work::Advisory { epoch, obs } => self.on_advisory(epoch, obs),
            Work::Observed { epoch, obs } => {
                self.tick_in_flight = false;
                self.on_observed(epoch, obs);
                self.start_pending_capture();
            }
            Work::TickFailed { epoch, error } => {
                self.tick_in_flight = false;
                if epoch == self.epoch {
                    tracing::warn!(%error, "preview capture failed");
                }
                self.start_pending_capture();
            }
            Work::Captured {
                epoch,
                activity,
                result,
            } => self.on_captured(epoch, activity, result).await,
        }
    }

    fn sampling(&mut self, epoch: u64) -> Option<&mut Active> {
        if epoch != self.epoch {
            tracing::debug!(epoch, current = self.epoch, "stale result discarded");
            return None;
        }
        self.active.as_mut().filter(|a| a.phase == Phase::Sampling)
    }

    fn on_advisory(&mut self, epoch: u64, obs: FrameObservation) {
        let Some(active) = self.sampling(epoch) else {
            return;
        };
        let session = active.id;
        let update = active.session.advise(&obs);
        if let Some(update) = active.advisory_throttle.offer(update, obs.at) {
            self.emit(EngineEvent::Advisory { session, update });
        }
    }

    fn on_observed(&mut self, epoch: u64, obs: FrameObservation) {
        let precondition_met = self.location.is_some();
        let Some(active) = self.sampling(epoch) else {
            return;
        };
        let Some(report) = active.session.ingest(&obs, precondition_met) else {
            return;
        };
        let session = active.id;
        let update = active.throttle.offer(report.update.clone(), obs.at);

        if let Some(update) = update {
            self.emit(EngineEvent::Update { session, update });
        }
        if let Some(trigger) = report.fired() {
            self.begin_capture(trigger);
        }
    }

    fn start_pending_capture(&mut self) {
        let Some(active) = self.active.as_mut().filter(|a| a.phase == Phase::Sampling) else {
            return;
        };
        if let Some(trigger) = active.pending_capture.take() {
            self.begin_capture(trigger);
        }
    }

    fn begin_capture(&mut self, trigger: Trigger) {
        let Some(location) = self.location else {
            return;
        };
        let Some(active) = self.active.as_mut() else {
            return;
        };
        active.phase = Phase::Capturing;
        let session = active.id;
        let activity = active.session.activity();
        tracing::info!(
            %session,
            %activity,
            ?trigger,
            liveness = active.session.liveness_score(),
            "capture triggered"
        );
        self.emit(EngineEvent::CaptureTriggered {
            session,
            activity,
            trigger,
        });

        let epoch = self.epoch;
        let camera = Arc::clone(&self.deps.camera);
        let submitter = Arc::clone(&self.deps.submitter);
        let work_tx = self.work_tx.clone();
        let job = tokio::task::spawn_blocking(move || capture_and_submit(&*camera, &*submitter, activity, location));
        tokio::spawn(async move {
            let result = job
                .await
                .unwrap_or_else(|e| Err(format!("capture task failed: {e}")));
            let _ = work_tx
                .send(Work::Captured {
                    epoch,
                    activity,
                    result,
                })
                .await;
        });
    }

    /// Cache a success and advance the local state mirror.
    async fn record(&self, activity: ActivityType, receipt: &ClockReceipt) -> (Option<AttendanceState>, Option<String>) {
        if let Err(e) = self.deps.store.record_success(activity, receipt).await {
            tracing::error!(error = %e, "failed to cache clock result");
        }
        let Some(staff) = receipt.staff_name.as_deref() else {
            return (None, None);
        };
        match self.deps.store.advance_state(staff, activity).await {
            Ok(state) => (Some(state), None),
            Err(StoreError::Transition(e)) => {
                tracing::warn!(staff, error = %e, "server accepted an action the local state does not allow");
                (None, Some(e.to_string()))
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to update attendance state");
                (None, None)
            }
        }
    }

    async fn on_captured(&mut self, epoch: u64, activity: ActivityType, result: Result<ClockOutcome, String>) {
        if epoch != self.epoch {
            if let Ok(ClockOutcome::Success(receipt)) = &result {
                tracing::warn!(%activity, "clock action succeeded after its session ended");
                self.record(activity, receipt).await;
            }
            return;
        }
        let Some(session) = self.active.as_ref().map(|a| a.id) else {
            return;
        };

        let (error, retryable, unknown_outcome) = match result {
            Ok(ClockOutcome::Success(receipt)) => {
                let (state, state_warning) = self.record(activity, &receipt).await;
                let late_warning = receipt
                    .time_validation
                    .as_ref()
                    .and_then(|tv| tv.late_warning())
                    .map(str::to_string);
                tracing::info!(
                    %session,
                    %activity,
                    staff = receipt.staff_name.as_deref().unwrap_or("unknown"),
                    verified_after_timeout = receipt.verified_after_timeout,
                    "clock action succeeded"
                );
                if let Some(active) = self.active.as_mut() {
                    active.phase = Phase::ShowingResult;
                }
                self.emit(EngineEvent::ClockSucceeded {
                    session,
                    activity,
                    receipt,
                    state,
                    late_warning,
                    state_warning,
                });
                return;
            }
            Ok(ClockOutcome::Failed(e)) => {
                let retryable = !matches!(e, SubmitError::DevicePendingApproval(_));
                (e.to_string(), retryable, false)
            }
            Ok(ClockOutcome::Unknown(message)) => (message, false, true),
            Err(message) => (message, true, false),
        };

        tracing::error!(%session, %activity, %error, retryable, unknown_outcome, "clock action failed");
        self.emit(EngineEvent::ClockFailed {
            session,
            activity,
            error,
            retryable,
            unknown_outcome,
        });
        let Some(active) = self.active.as_mut() else {
            return;
        };
        if retryable {
            active.restart();
            self.epoch += 1;
        } else {
            // The server may hold this action or will refuse it again; only
            // a dismissal brings the camera back.
            active.phase = Phase::ShowingResult;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{CameraError, CapturedFrame};
    use crate::submit::VerifyOutcome;
    use chrono::{DateTime, Utc};
    use clockgate_core::observation::Pose;
    use clockgate_core::ObservationSource;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn temp_dir(tag: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("clockgate-engine-{tag}-{nanos}"));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    struct FakeCamera {
        dir: PathBuf,
        previews: AtomicUsize,
        fulls: AtomicUsize,
        /// Set by a preview capture; cleared by analyzers that track it.
        preview_busy: Arc<AtomicBool>,
        /// A full capture started while `preview_busy` was set.
        overlapped: AtomicBool,
    }

    impl FakeCamera {
        fn new(tag: &str) -> Self {
            Self {
                dir: temp_dir(tag),
                previews: AtomicUsize::new(0),
                fulls: AtomicUsize::new(0),
                preview_busy: Arc::new(AtomicBool::new(false)),
                overlapped: AtomicBool::new(false),
            }
        }
    }

    impl Camera for FakeCamera {
        fn capture(&self, mode: CaptureMode) -> Result<CapturedFrame, CameraError> {
            let n = match mode {
                CaptureMode::Preview => {
                    self.preview_busy.store(true, Ordering::SeqCst);
                    self.previews.fetch_add(1, Ordering::SeqCst)
                }
                CaptureMode::Full => {
                    if self.preview_busy.load(Ordering::SeqCst) {
                        self.overlapped.store(true, Ordering::SeqCst);
                    }
                    self.fulls.fetch_add(1, Ordering::SeqCst)
                }
            };
            let path = self.dir.join(format!("{mode:?}-{n}.jpg"));
            std::fs::write(&path, b"jpeg").unwrap();
            Ok(CapturedFrame::adopt(path, 640, 480))
        }
    }

    /// A steady, well-lit face with a little natural movement.
    struct SteadyFace {
        source: ObservationSource,
        calls: AtomicUsize,
    }

    impl SteadyFace {
        fn new(source: ObservationSource) -> Self {
            Self {
                source,
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl FrameAnalyzer for SteadyFace {
        fn source(&self) -> ObservationSource {
            self.source
        }

        fn analyze(&self, frame: &FrameSample<'_>) -> FrameObservation {
            assert!(Path::new(frame.path).exists());
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            let wobble = (n % 2) as f32;
            let mut obs = FrameObservation::face(frame.at, self.source, 1, 90.0 + wobble);
            obs.pose = Pose {
                yaw: wobble,
                pitch: 0.0,
                roll: 0.0,
                angle: wobble,
            };
            obs.ready = true;
            obs
        }
    }

    /// Slow authoritative analysis that marks the camera idle when done.
    struct SlowFace {
        inner: SteadyFace,
        preview_busy: Arc<AtomicBool>,
        delay: Duration,
    }

    impl FrameAnalyzer for SlowFace {
        fn source(&self) -> ObservationSource {
            ObservationSource::RemoteAuthoritative
        }

        fn analyze(&self, frame: &FrameSample<'_>) -> FrameObservation {
            std::thread::sleep(self.delay);
            let obs = self.inner.analyze(frame);
            self.preview_busy.store(false, Ordering::SeqCst);
            obs
        }
    }

    /// Panics on its first frame, then behaves.
    struct PanicsOnce {
        inner: SteadyFace,
        panicked: AtomicBool,
    }

    impl FrameAnalyzer for PanicsOnce {
        fn source(&self) -> ObservationSource {
            ObservationSource::RemoteAuthoritative
        }

        fn analyze(&self, frame: &FrameSample<'_>) -> FrameObservation {
            if !self.panicked.swap(true, Ordering::SeqCst) {
                panic!("malformed frame");
            }
            self.inner.analyze(frame)
        }
    }

    struct Scripted {
        reply: Result<ClockReceipt, fn() -> SubmitError>,
        verify_reply: fn() -> Result<VerifyOutcome, SubmitError>,
        requests: Mutex<Vec<ActivityType>>,
    }

    impl Scripted {
        fn ok() -> Self {
            Self {
                reply: Ok(ClockReceipt {
                    success: true,
                    staff_name: Some("Thandi".into()),
                    clock_type: Some("in".into()),
                    ..ClockReceipt::default()
                }),
                verify_reply: || Ok(VerifyOutcome::NotClocked),
                requests: Mutex::new(Vec::new()),
            }
        }

        fn failing(e: fn() -> SubmitError) -> Self {
            Self {
                reply: Err(e),
                verify_reply: || Ok(VerifyOutcome::NotClocked),
                requests: Mutex::new(Vec::new()),
            }
        }

        /// Every submission times out and the status check fails too.
        fn unverifiable() -> Self {
            Self {
                verify_reply: || Err(SubmitError::Network("status endpoint unreachable".into())),
                ..Self::failing(|| SubmitError::Timeout)
            }
        }

        fn submissions(&self) -> usize {
            self.requests.lock().unwrap().len()
        }
    }

    impl ClockSubmitter for Scripted {
        fn submit(&self, request: &ClockRequest) -> Result<ClockReceipt, SubmitError> {
            assert_eq!(request.image, b"jpeg");
            self.requests.lock().unwrap().push(request.activity);
            match &self.reply {
                Ok(receipt) => Ok(receipt.clone()),
                Err(make) => Err(make()),
            }
        }

        fn verify(&self, _activity: ActivityType, _at: DateTime<Utc>) -> Result<VerifyOutcome, SubmitError> {
            (self.verify_reply)()
        }
    }

    struct Harness {
        handle: EngineHandle,
        events: broadcast::Receiver<EngineEvent>,
        camera: Arc<FakeCamera>,
        store: ClockLogStore,
        cancel: CancellationToken,
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            self.cancel.cancel();
        }
    }

    async fn harness(tag: &str, submitter: Scripted, location: Option<(f64, f64)>) -> Harness {
        harness_with(Arc::new(FakeCamera::new(tag)), Arc::new(submitter), location, |_| {}).await
    }

    /// Like [`harness`], with a chance to swap dependencies before the
    /// engine starts.
    async fn harness_with(
        camera: Arc<FakeCamera>,
        submitter: Arc<Scripted>,
        location: Option<(f64, f64)>,
        adjust: impl FnOnce(&mut EngineDeps),
    ) -> Harness {
        let store = ClockLogStore::open(Path::new(":memory:")).await.unwrap();
        let thresholds = Thresholds {
            min_engagement_ms: 0,
            ..Thresholds::default()
        };
        let mut deps = EngineDeps {
            camera: camera.clone(),
            local: Arc::new(SteadyFace::new(ObservationSource::LocalHeuristic)),
            remote: Arc::new(SteadyFace::new(ObservationSource::RemoteAuthoritative)),
            submitter,
            store: store.clone(),
            thresholds,
            tick: Duration::from_millis(10),
            update_interval: Duration::from_millis(10),
            location,
        };
        adjust(&mut deps);
        let cancel = CancellationToken::new();
        let handle = spawn_engine(deps, cancel.clone());
        let events = handle.subscribe();
        Harness {
            handle,
            events,
            camera,
            store,
            cancel,
        }
    }

    /// Wait for the first event matching `pred`.
    async fn wait_for(
        events: &mut broadcast::Receiver<EngineEvent>,
        pred: impl Fn(&EngineEvent) -> bool,
    ) -> EngineEvent {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match events.recv().await {
                    Ok(ev) if pred(&ev) => return ev,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => panic!("engine closed"),
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    const KIOSK: Option<(f64, f64)> = Some((-26.2, 28.04));

    #[tokio::test]
    async fn test_auto_capture_clocks_in_once() {
        let mut h = harness("auto", Scripted::ok(), KIOSK).await;
        let id = h.handle.start_session(ActivityType::ClockIn).await.unwrap();

        let triggered = wait_for(&mut h.events, |e| matches!(e, EngineEvent::CaptureTriggered { .. })).await;
        match triggered {
            EngineEvent::CaptureTriggered { session, trigger, .. } => {
                assert_eq!(session, id);
                assert_eq!(trigger, Trigger::Automatic);
            }
            _ => unreachable!(),
        }

        let done = wait_for(&mut h.events, |e| matches!(e, EngineEvent::ClockSucceeded { .. })).await;
        match done {
            EngineEvent::ClockSucceeded { state, state_warning, .. } => {
                assert_eq!(state, Some(AttendanceState::In));
                assert!(state_warning.is_none());
            }
            _ => unreachable!(),
        }

        let status = h.handle.status().await.unwrap();
        assert_eq!(status.phase, Some(Phase::ShowingResult));
        assert_eq!(h.camera.fulls.load(Ordering::SeqCst), 1);
        assert_eq!(h.store.count().await.unwrap(), 1);

        // No further previews while the result is on screen.
        let previews = h.camera.previews.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h.camera.previews.load(Ordering::SeqCst), previews);
        assert_eq!(h.camera.fulls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dismiss_returns_to_sampling() {
        let mut h = harness("dismiss", Scripted::ok(), KIOSK).await;
        h.handle.start_session(ActivityType::ClockIn).await.unwrap();
        wait_for(&mut h.events, |e| matches!(e, EngineEvent::ClockSucceeded { .. })).await;

        h.handle.dismiss_result().await.unwrap();
        let status = h.handle.status().await.unwrap();
        assert_eq!(status.phase, Some(Phase::Sampling));
        assert_eq!(status.consecutive_ready, 0);

        assert_eq!(
            h.handle.dismiss_result().await.unwrap_err(),
            EngineError::InvalidPhase {
                action: "dismiss a result",
                phase: Phase::Sampling
            }
        );
    }

    #[tokio::test]
    async fn test_no_capture_without_location() {
        let mut h = harness("noloc", Scripted::ok(), None).await;
        h.handle.start_session(ActivityType::ClockOut).await.unwrap();

        wait_for(&mut h.events, |e| {
            matches!(e, EngineEvent::Update { update, .. } if update.message == "Waiting for location...")
        })
        .await;
        assert_eq!(h.camera.fulls.load(Ordering::SeqCst), 0);
        assert_eq!(h.handle.manual_capture().await.unwrap_err(), EngineError::LocationUnavailable);

        h.handle.set_location(-26.2, 28.04).await.unwrap();
        wait_for(&mut h.events, |e| matches!(e, EngineEvent::CaptureTriggered { .. })).await;
    }

    #[tokio::test]
    async fn test_failure_resets_and_keeps_sampling() {
        let mut h = harness("fail", Scripted::failing(|| SubmitError::Network("down".into())), KIOSK).await;
        h.handle.start_session(ActivityType::ClockIn).await.unwrap();

        let failed = wait_for(&mut h.events, |e| matches!(e, EngineEvent::ClockFailed { .. })).await;
        match failed {
            EngineEvent::ClockFailed {
                retryable,
                unknown_outcome,
                error,
                ..
            } => {
                assert!(retryable);
                assert!(!unknown_outcome);
                assert!(error.contains("down"));
            }
            _ => unreachable!(),
        }
        assert_eq!(h.store.count().await.unwrap(), 0);

        // Sampling restarts and the session can fire again.
        wait_for(&mut h.events, |e| matches!(e, EngineEvent::CaptureTriggered { .. })).await;
    }

    #[tokio::test]
    async fn test_pending_device_not_retryable() {
        let mut h = harness(
            "pending",
            Scripted::failing(|| SubmitError::DevicePendingApproval("awaiting admin".into())),
            KIOSK,
        )
        .await;
        h.handle.start_session(ActivityType::ClockIn).await.unwrap();
        let failed = wait_for(&mut h.events, |e| matches!(e, EngineEvent::ClockFailed { .. })).await;
        assert!(matches!(failed, EngineEvent::ClockFailed { retryable: false, .. }));

        // The error stays up; the camera does not come back on its own.
        let previews = h.camera.previews.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h.camera.previews.load(Ordering::SeqCst), previews);
        assert_eq!(h.camera.fulls.load(Ordering::SeqCst), 1);
        assert_eq!(h.handle.status().await.unwrap().phase, Some(Phase::ShowingResult));
    }

    #[tokio::test]
    async fn test_unknown_outcome_is_not_resubmitted() {
        let submitter = Arc::new(Scripted::unverifiable());
        let camera = Arc::new(FakeCamera::new("unknown"));
        let mut h = harness_with(camera, submitter.clone(), KIOSK, |_| {}).await;
        h.handle.start_session(ActivityType::ClockIn).await.unwrap();

        let failed = wait_for(&mut h.events, |e| matches!(e, EngineEvent::ClockFailed { .. })).await;
        assert!(matches!(
            failed,
            EngineEvent::ClockFailed {
                retryable: false,
                unknown_outcome: true,
                ..
            }
        ));

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(submitter.submissions(), 1);
        assert_eq!(h.handle.status().await.unwrap().phase, Some(Phase::ShowingResult));
        assert!(matches!(
            h.handle.manual_capture().await.unwrap_err(),
            EngineError::InvalidPhase { .. }
        ));

        // Dismissing is the only way back to sampling.
        h.handle.dismiss_result().await.unwrap();
        assert_eq!(h.handle.status().await.unwrap().phase, Some(Phase::Sampling));
    }

    #[tokio::test]
    async fn test_panicking_analyzer_does_not_stall_sampling() {
        let camera = Arc::new(FakeCamera::new("panic"));
        let h = harness_with(camera, Arc::new(Scripted::ok()), None, |deps| {
            deps.remote = Arc::new(PanicsOnce {
                inner: SteadyFace::new(ObservationSource::RemoteAuthoritative),
                panicked: AtomicBool::new(false),
            });
        })
        .await;
        h.handle.start_session(ActivityType::ClockIn).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while h.camera.previews.load(Ordering::SeqCst) <= 5 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("sampling stalled after a panicking frame");
    }

    #[tokio::test]
    async fn test_manual_capture_waits_for_preview() {
        let camera = Arc::new(FakeCamera::new("overlap"));
        let preview_busy = camera.preview_busy.clone();
        let mut h = harness_with(camera, Arc::new(Scripted::ok()), KIOSK, |deps| {
            deps.remote = Arc::new(SlowFace {
                inner: SteadyFace::new(ObservationSource::RemoteAuthoritative),
                preview_busy,
                delay: Duration::from_millis(300),
            });
        })
        .await;
        h.handle.start_session(ActivityType::ClockIn).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(h.handle.manual_capture().await.unwrap());
        // Already queued; a second request does not fire again.
        assert!(!h.handle.manual_capture().await.unwrap());

        let triggered = wait_for(&mut h.events, |e| matches!(e, EngineEvent::CaptureTriggered { .. })).await;
        assert!(matches!(
            triggered,
            EngineEvent::CaptureTriggered {
                trigger: Trigger::Manual,
                ..
            }
        ));
        wait_for(&mut h.events, |e| matches!(e, EngineEvent::ClockSucceeded { .. })).await;
        assert!(!h.camera.overlapped.load(Ordering::SeqCst));
        assert_eq!(h.camera.fulls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_advisory_updates_are_throttled() {
        let camera = Arc::new(FakeCamera::new("advisory"));
        let mut h = harness_with(camera, Arc::new(Scripted::ok()), None, |deps| {
            deps.update_interval = Duration::from_millis(200);
        })
        .await;
        h.handle.start_session(ActivityType::ClockIn).await.unwrap();

        let mut advisories = 0;
        let window = tokio::time::sleep(Duration::from_millis(700));
        tokio::pin!(window);
        loop {
            tokio::select! {
                _ = &mut window => break,
                ev = h.events.recv() => {
                    if let Ok(EngineEvent::Advisory { .. }) = ev {
                        advisories += 1;
                    }
                }
            }
        }
        assert!(h.camera.previews.load(Ordering::SeqCst) > 10);
        assert!(advisories >= 1);
        assert!(advisories <= 4, "{advisories} advisory updates in 700ms");
    }

    #[tokio::test]
    async fn test_suspend_stops_previews() {
        let mut h = harness("suspend", Scripted::ok(), None).await;
        h.handle.start_session(ActivityType::ClockIn).await.unwrap();
        wait_for(&mut h.events, |e| matches!(e, EngineEvent::Update { .. })).await;

        h.handle.suspend().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let previews = h.camera.previews.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h.camera.previews.load(Ordering::SeqCst), previews);
        assert_eq!(h.handle.status().await.unwrap().phase, Some(Phase::Suspended));

        h.handle.resume().await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while h.camera.previews.load(Ordering::SeqCst) <= previews {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("sampling did not resume");
    }

    #[tokio::test]
    async fn test_manual_capture() {
        let mut h = harness("manual", Scripted::ok(), KIOSK).await;
        h.handle.start_session(ActivityType::BreakStart).await.unwrap();
        assert!(h.handle.manual_capture().await.unwrap());

        let triggered = wait_for(&mut h.events, |e| matches!(e, EngineEvent::CaptureTriggered { .. })).await;
        assert!(matches!(
            triggered,
            EngineEvent::CaptureTriggered {
                trigger: Trigger::Manual,
                activity: ActivityType::BreakStart,
                ..
            }
        ));

        // Break start from OUT is refused locally but the server's answer stands.
        let done = wait_for(&mut h.events, |e| matches!(e, EngineEvent::ClockSucceeded { .. })).await;
        match done {
            EngineEvent::ClockSucceeded { state, state_warning, .. } => {
                assert!(state.is_none());
                assert!(state_warning.is_some());
            }
            _ => unreachable!(),
        }
        assert_eq!(h.store.current_state("Thandi").await.unwrap(), AttendanceState::Out);
    }

    #[tokio::test]
    async fn test_session_lifecycle_errors() {
        let h = harness("lifecycle", Scripted::ok(), None).await;
        assert_eq!(h.handle.stop_session().await.unwrap_err(), EngineError::NoSession);
        assert_eq!(h.handle.suspend().await.unwrap_err(), EngineError::NoSession);

        h.handle.start_session(ActivityType::ClockIn).await.unwrap();
        assert_eq!(
            h.handle.resume().await.unwrap_err(),
            EngineError::InvalidPhase {
                action: "resume",
                phase: Phase::Sampling
            }
        );
        h.handle.stop_session().await.unwrap();
        let status = h.handle.status().await.unwrap();
        assert!(status.session.is_none());
        assert!(status.phase.is_none());
    }

    #[tokio::test]
    async fn test_rejects_invalid_location() {
        let h = harness("badloc", Scripted::ok(), None).await;
        assert!(matches!(
            h.handle.set_location(91.0, 0.0).await.unwrap_err(),
            EngineError::InvalidLocation { .. }
        ));
        assert!(h.handle.set_location(f64::NAN, 0.0).await.is_err());
        assert!(h.handle.status().await.unwrap().location.is_none());

        h.handle.set_location(-33.9, 18.4).await.unwrap();
        assert_eq!(h.handle.status().await.unwrap().location, Some((-33.9, 18.4)));
    }

    #[tokio::test]
    async fn test_new_session_replaces_old() {
        let h = harness("replace", Scripted::ok(), None).await;
        let first = h.handle.start_session(ActivityType::ClockIn).await.unwrap();
        let second = h.handle.start_session(ActivityType::ClockOut).await.unwrap();
        assert_ne!(first, second);
        let status = h.handle.status().await.unwrap();
        assert_eq!(status.session, Some(second));
        assert_eq!(status.activity, Some(ActivityType::ClockOut));
    }

    #[tokio::test]
    async fn test_closed_engine_reports_channel_closed() {
        let h = harness("closed", Scripted::ok(), None).await;
        h.cancel.cancel();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            h.handle.start_session(ActivityType::ClockIn).await.unwrap_err(),
            EngineError::ChannelClosed
        );
    }
}
