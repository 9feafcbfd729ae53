// Multi-camera recording session orchestration
//
// Lock order: session lock -> pipeline registry lock -> pipeline entry lock.
// The health lock is taken either under the session lock (start) or with no
// other lock held (check_health), never the other way round. Bus callbacks
// only push onto the fault channel; the dispatcher thread and the recovery
// workers are the ones that take the session lock.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use serde::Serialize;

use super::health::{CameraCheck, HealthMonitor, HealthReport};
use super::integrity::{SegmentIntegrity, SegmentProber};
use super::overload::{CpuSampler, OverloadGuard, OverloadSnapshot, SysinfoCpuSampler};
use super::recovery::{CameraRecoveryState, FaultDecision};
use super::segments;
use super::RecordingStatus;
use crate::config::{self, CameraConfig, Config};
use crate::error::{Error, Result};
use crate::pipeline::{
    DescriptionBuilder, PipelineBackend, PipelineCallbacks, PipelineMetadata, PipelineRequest,
    StopDetails,
};
use crate::postprocess::{ManifestWriter, PostProcessJob, PostProcessQueue, PostProcessor};
use crate::session::{SessionStateFile, SessionStore};

const FAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Registry name of a camera's recording pipeline
pub fn pipeline_name(camera_id: &str) -> String {
    format!("rec-cam{}", camera_id)
}

/// External collaborators injected at construction
#[derive(Clone)]
pub struct Collaborators {
    pub backend: Arc<dyn PipelineBackend>,
    pub builder: Arc<dyn DescriptionBuilder>,
    pub prober: Arc<dyn SegmentProber>,
    pub post_processor: Arc<dyn PostProcessor>,
    pub cpu: Arc<dyn CpuSampler>,
}

impl Collaborators {
    /// Manifest-writing post-processor and sysinfo CPU sampling by default
    pub fn new(
        backend: Arc<dyn PipelineBackend>,
        builder: Arc<dyn DescriptionBuilder>,
        prober: Arc<dyn SegmentProber>,
    ) -> Self {
        Self {
            backend,
            builder,
            prober,
            post_processor: Arc::new(ManifestWriter),
            cpu: Arc::new(SysinfoCpuSampler::new()),
        }
    }

    pub fn with_post_processor(mut self, post_processor: Arc<dyn PostProcessor>) -> Self {
        self.post_processor = post_processor;
        self
    }

    pub fn with_cpu_sampler(mut self, cpu: Arc<dyn CpuSampler>) -> Self {
        self.cpu = cpu;
        self
    }
}

// ============================================================================
// Results
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct StartResult {
    pub success: bool,
    pub message: String,
    pub match_id: Option<String>,
    pub cameras_started: Vec<String>,
    pub cameras_failed: BTreeMap<String, String>,
}

impl StartResult {
    fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            match_id: None,
            cameras_started: Vec::new(),
            cameras_failed: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CameraStopReport {
    /// Stopped cleanly with EOS, no timeout and no error
    pub finalized: bool,
    pub stop: StopDetails,
    pub degraded_reason: Option<String>,
    pub latest_segment: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct IntegritySummary {
    /// `None` when any camera could not be checked
    pub all_ok: Option<bool>,
    pub cameras: BTreeMap<String, SegmentIntegrity>,
}

impl IntegritySummary {
    fn from_cameras(cameras: BTreeMap<String, SegmentIntegrity>) -> Self {
        let all_ok = if cameras.values().any(|c| c.ok.is_none()) {
            None
        } else {
            Some(cameras.values().all(|c| c.ok == Some(true)))
        };
        Self { all_ok, cameras }
    }

    fn failed_cameras(&self) -> Vec<String> {
        self.cameras
            .iter()
            .filter(|(_, c)| c.ok == Some(false))
            .map(|(id, _)| id.clone())
            .collect()
    }

    fn unverified_cameras(&self) -> Vec<String> {
        self.cameras
            .iter()
            .filter(|(_, c)| c.ok.is_none())
            .map(|(id, _)| id.clone())
            .collect()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StopResult {
    pub success: bool,
    pub message: String,
    /// Every pipeline reached NULL
    pub transport_success: bool,
    /// Every pipeline finalized with EOS
    pub graceful_stop: bool,
    pub match_id: Option<String>,
    pub duration_secs: Option<f64>,
    pub cameras: BTreeMap<String, CameraStopReport>,
    pub integrity: IntegritySummary,
    pub degraded_cameras: BTreeMap<String, String>,
    pub post_processing_queued: bool,
}

impl StopResult {
    fn not_recording() -> Self {
        Self::rejected(true, "not recording")
    }

    fn rejected(success: bool, message: impl Into<String>) -> Self {
        Self {
            success,
            message: message.into(),
            transport_success: success,
            graceful_stop: success,
            match_id: None,
            duration_secs: None,
            cameras: BTreeMap::new(),
            integrity: IntegritySummary::default(),
            degraded_cameras: BTreeMap::new(),
            post_processing_queued: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CameraStatus {
    pub pipeline_name: String,
    /// Pipeline state, or `degraded` / `recovering` / `missing`
    pub state: String,
    pub run: u32,
    pub start_time: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// A persisted session found at startup whose pipelines no longer exist
#[derive(Debug, Clone, Serialize)]
pub struct StaleSession {
    pub match_id: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub detected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecordingStatusReport {
    pub recording: bool,
    pub status: RecordingStatus,
    pub match_id: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub duration_secs: Option<f64>,
    pub process_after_recording: bool,
    pub cameras: BTreeMap<String, CameraStatus>,
    /// Any camera degraded or the overload guard active
    pub degraded: bool,
    pub degraded_cameras: BTreeMap<String, String>,
    pub recovery_state: BTreeMap<String, CameraRecoveryState>,
    pub overload_guard: OverloadSnapshot,
    pub stale_session: Option<StaleSession>,
}

// ============================================================================
// Session state
// ============================================================================

#[derive(Debug, Clone)]
struct FaultEvent {
    generation: u64,
    camera_id: String,
    run: u32,
    error: String,
}

struct CameraSlot {
    camera: CameraConfig,
    pipeline_name: String,
    run: u32,
    recovery: CameraRecoveryState,
}

struct ActiveSession {
    match_id: String,
    start_time: DateTime<Utc>,
    started_at: Instant,
    process_after: bool,
    cameras: BTreeMap<String, CameraSlot>,
    degraded: BTreeMap<String, String>,
}

impl ActiveSession {
    fn state_file(&self) -> SessionStateFile {
        SessionStateFile::active(&self.match_id, self.start_time, self.process_after)
    }
}

struct SessionState {
    status: RecordingStatus,
    session: Option<ActiveSession>,
    /// Bumped on every start, stop and shutdown; stale faults and recoveries
    /// compare against it
    generation: u64,
    overload: OverloadGuard,
    stale_session: Option<StaleSession>,
}

struct Shared {
    config: Config,
    backend: Arc<dyn PipelineBackend>,
    builder: Arc<dyn DescriptionBuilder>,
    prober: Arc<dyn SegmentProber>,
    cpu: Arc<dyn CpuSampler>,
    store: SessionStore,
    session: Mutex<SessionState>,
    health: Mutex<HealthMonitor>,
    postprocess: PostProcessQueue,
    fault_tx: Sender<FaultEvent>,
}

/// Runs one pipeline per configured camera as a single recording session.
///
/// Camera faults reported by the pipeline bus are recovered with bounded
/// retries on worker threads; a camera that cannot be recovered is marked
/// degraded and the session continues on the others.
pub struct RecordingOrchestrator {
    shared: Arc<Shared>,
}

impl RecordingOrchestrator {
    /// Build the orchestrator and reconcile any session left in the state file.
    pub fn new(config: Config, collaborators: Collaborators) -> Self {
        let (fault_tx, fault_rx) = unbounded();
        let store = SessionStore::new(&config.session_state_path());

        let shared = Arc::new(Shared {
            backend: collaborators.backend,
            builder: collaborators.builder,
            prober: collaborators.prober,
            cpu: collaborators.cpu,
            store,
            session: Mutex::new(SessionState {
                status: RecordingStatus::Idle,
                session: None,
                generation: 0,
                overload: OverloadGuard::new(&config.overload_guard),
                stale_session: None,
            }),
            health: Mutex::new(HealthMonitor::new(config.health.clone())),
            postprocess: PostProcessQueue::spawn(collaborators.post_processor),
            fault_tx,
            config,
        });

        spawn_fault_dispatcher(Arc::downgrade(&shared), fault_rx);
        shared.reconcile();

        Self { shared }
    }

    pub fn start(&self, match_id: &str, force: bool, process_after_recording: bool) -> StartResult {
        self.shared.start(match_id, force, process_after_recording)
    }

    pub fn stop(&self, force: bool) -> StopResult {
        self.shared.stop(force)
    }

    pub fn status(&self) -> RecordingStatusReport {
        self.shared.status()
    }

    pub fn check_health(&self) -> HealthReport {
        self.shared.check_health()
    }

    /// Report a fault for a camera in the active session, as the pipeline
    /// bus would. False if the camera is not part of an active session.
    pub fn report_camera_error(&self, camera_id: &str, error: &str) -> bool {
        let state = self.shared.session.lock();
        if state.status != RecordingStatus::Recording {
            return false;
        }
        let Some(slot) = state
            .session
            .as_ref()
            .and_then(|s| s.cameras.get(camera_id))
        else {
            return false;
        };
        self.shared
            .fault_tx
            .send(FaultEvent {
                generation: state.generation,
                camera_id: camera_id.to_string(),
                run: slot.run,
                error: error.to_string(),
            })
            .is_ok()
    }

    pub fn is_recording(&self) -> bool {
        self.shared.session.lock().status == RecordingStatus::Recording
    }

    /// Post-processing jobs queued or running
    pub fn pending_post_processing(&self) -> usize {
        self.shared.postprocess.pending()
    }
}

impl Drop for RecordingOrchestrator {
    fn drop(&mut self) {
        // Pipelines stay in the backend for a later instance to adopt;
        // only in-flight recoveries are cancelled.
        self.shared.session.lock().generation += 1;
    }
}

fn spawn_fault_dispatcher(shared: Weak<Shared>, faults: Receiver<FaultEvent>) {
    std::thread::Builder::new()
        .name("matchcam-faults".into())
        .spawn(move || {
            loop {
                match faults.recv_timeout(FAULT_POLL_INTERVAL) {
                    Ok(event) => {
                        let Some(shared) = shared.upgrade() else { break };
                        shared.handle_fault(event);
                    }
                    Err(RecvTimeoutError::Timeout) => {
                        if shared.strong_count() == 0 {
                            break;
                        }
                    }
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            log::debug!("Fault dispatcher exited");
        })
        .expect("Failed to spawn fault dispatcher thread");
}

impl Shared {
    fn policy(&self) -> &config::RecordingPolicy {
        &self.config.recording
    }

    fn persist(&self, state: &SessionState) {
        let result = match &state.session {
            Some(session) if state.status != RecordingStatus::Idle => {
                self.store.save(&session.state_file())
            }
            _ => self.store.clear(),
        };
        if let Err(e) = result {
            log::error!(
                "Failed to persist session state to {}: {}",
                self.store.path().display(),
                e
            );
        }
    }

    fn callbacks(&self, camera_id: &str, run: u32, generation: u64) -> PipelineCallbacks {
        let error_tx = self.fault_tx.clone();
        let error_camera = camera_id.to_string();
        let eos_tx = self.fault_tx.clone();
        let eos_camera = camera_id.to_string();

        PipelineCallbacks {
            on_error: Some(Arc::new(move |_name: &str, message: &str| {
                let _ = error_tx.send(FaultEvent {
                    generation,
                    camera_id: error_camera.clone(),
                    run,
                    error: message.to_string(),
                });
            })),
            // EOS while recording means the source ended on its own
            on_eos: Some(Arc::new(move |_name: &str| {
                let _ = eos_tx.send(FaultEvent {
                    generation,
                    camera_id: eos_camera.clone(),
                    run,
                    error: "unexpected end of stream".to_string(),
                });
            })),
        }
    }

    /// Build, register and start one camera's pipeline for `run`.
    fn launch_camera(
        &self,
        match_id: &str,
        camera: &CameraConfig,
        run: u32,
        generation: u64,
    ) -> Result<String> {
        let name = pipeline_name(&camera.id);
        if self.backend.status(&name).is_some() {
            log::warn!("Removing leftover pipeline {} before launch", name);
            self.backend.remove(&name);
        }

        let dir = segments::camera_dir(&self.config.storage_path, match_id, &camera.id);
        std::fs::create_dir_all(&dir)?;

        let request = PipelineRequest {
            camera,
            quality: self.config.quality_preset,
            output_pattern: segments::segment_pattern(&dir, run),
            segment_duration: Duration::from_secs(self.policy().segment_duration_secs.max(1)),
        };
        let description = self.builder.build(&request)?;
        let metadata = PipelineMetadata {
            camera_id: camera.id.clone(),
            match_id: Some(match_id.to_string()),
        };

        if !self.backend.create(
            &name,
            &description,
            self.callbacks(&camera.id, run, generation),
            metadata,
        ) {
            return Err(Error::PipelineCreate {
                name,
                reason: "pipeline rejected by the runtime".into(),
            });
        }

        if !self.backend.start(&name) {
            let reason = self
                .backend
                .status(&name)
                .and_then(|s| s.error_message)
                .unwrap_or_else(|| "pipeline did not reach running".into());
            self.backend.remove(&name);
            return Err(Error::PipelineStart { name, reason });
        }

        log::info!("Camera {} recording (run {}) as {}", camera.id, run, name);
        Ok(name)
    }

    fn start(&self, match_id: &str, force: bool, process_after: bool) -> StartResult {
        if !config::is_safe_component(match_id) {
            return StartResult::failed(format!("invalid match id '{}'", match_id));
        }
        if self.config.cameras.is_empty() {
            return StartResult::failed("no cameras configured");
        }

        let mut state = self.session.lock();
        match state.status {
            RecordingStatus::Stopping => {
                return StartResult::failed("stop in progress");
            }
            RecordingStatus::Recording if !force => {
                let current = state
                    .session
                    .as_ref()
                    .map(|s| s.match_id.clone())
                    .unwrap_or_default();
                return StartResult::failed(format!("already recording match {}", current));
            }
            RecordingStatus::Recording => {
                if let Some(previous) = state.session.take() {
                    log::warn!(
                        "Force start: tearing down session {} for {}",
                        previous.match_id,
                        match_id
                    );
                    for slot in previous.cameras.values() {
                        self.backend.remove(&slot.pipeline_name);
                    }
                }
            }
            RecordingStatus::Idle => {}
        }

        state.generation += 1;
        let generation = state.generation;
        state.status = RecordingStatus::Idle;
        state.overload.reset();
        state.stale_session = None;
        self.health.lock().reset();

        log::info!(
            "Starting recording {} on {} camera(s)",
            match_id,
            self.config.cameras.len()
        );

        let now = Instant::now();
        let mut slots = BTreeMap::new();
        let mut failed = BTreeMap::new();
        for camera in &self.config.cameras {
            let dir = segments::camera_dir(&self.config.storage_path, match_id, &camera.id);
            let run = segments::highest_run(&dir) + 1;
            match self.launch_camera(match_id, camera, run, generation) {
                Ok(name) => {
                    slots.insert(
                        camera.id.clone(),
                        CameraSlot {
                            camera: camera.clone(),
                            pipeline_name: name,
                            run,
                            recovery: CameraRecoveryState::started(now),
                        },
                    );
                }
                Err(e) => {
                    log::error!("Camera {} failed to start: {}", camera.id, e);
                    failed.insert(camera.id.clone(), e.to_string());
                }
            }
        }

        if !failed.is_empty() && (self.policy().require_all_cameras || slots.is_empty()) {
            for slot in slots.values() {
                self.backend.remove(&slot.pipeline_name);
            }
            self.persist(&state);
            let failed_ids: Vec<&str> = failed.keys().map(String::as_str).collect();
            log::error!(
                "Recording {} not started, rolled back: cameras {} failed",
                match_id,
                failed_ids.join(", ")
            );
            return StartResult {
                success: false,
                message: format!("failed to start cameras: {}", failed_ids.join(", ")),
                match_id: Some(match_id.to_string()),
                cameras_started: Vec::new(),
                cameras_failed: failed,
            };
        }

        // Lenient policy: failed cameras sit out the session as degraded
        for (camera_id, error) in &failed {
            if let Some(camera) = self.config.cameras.iter().find(|c| &c.id == camera_id) {
                let mut recovery = CameraRecoveryState::default();
                recovery.on_recovery_failed(error);
                slots.insert(
                    camera_id.clone(),
                    CameraSlot {
                        camera: camera.clone(),
                        pipeline_name: pipeline_name(camera_id),
                        run: 0,
                        recovery,
                    },
                );
            }
        }

        let cameras_started: Vec<String> = slots
            .keys()
            .filter(|id| !failed.contains_key(*id))
            .cloned()
            .collect();

        state.session = Some(ActiveSession {
            match_id: match_id.to_string(),
            start_time: Utc::now(),
            started_at: now,
            process_after,
            cameras: slots,
            degraded: failed.clone(),
        });
        state.status = RecordingStatus::Recording;
        self.persist(&state);

        let message = if failed.is_empty() {
            format!("recording {} started on {} camera(s)", match_id, cameras_started.len())
        } else {
            format!(
                "recording {} started on {} camera(s), {} failed",
                match_id,
                cameras_started.len(),
                failed.len()
            )
        };
        log::info!("{}", message);

        StartResult {
            success: true,
            message,
            match_id: Some(match_id.to_string()),
            cameras_started,
            cameras_failed: failed,
        }
    }

    fn handle_fault(self: &Arc<Self>, event: FaultEvent) {
        let mut state = self.session.lock();
        if state.generation != event.generation || state.status != RecordingStatus::Recording {
            log::debug!(
                "Ignoring fault on camera {} from an earlier session: {}",
                event.camera_id,
                event.error
            );
            return;
        }

        let max_attempts = self.policy().max_recovery_attempts;
        let Some(session) = state.session.as_mut() else {
            return;
        };
        let Some(slot) = session.cameras.get_mut(&event.camera_id) else {
            log::warn!("Fault reported for unknown camera {}", event.camera_id);
            return;
        };
        if slot.run != event.run {
            log::debug!(
                "Ignoring fault from replaced pipeline run {} of camera {}",
                event.run,
                event.camera_id
            );
            return;
        }

        match slot
            .recovery
            .on_fault(&event.error, self.policy(), Instant::now())
        {
            FaultDecision::AlreadyRecovering => {
                log::info!(
                    "Camera {} already recovering, ignoring: {}",
                    event.camera_id,
                    event.error
                );
                return;
            }
            FaultDecision::AlreadyFailed => {
                log::debug!("Camera {} is degraded, ignoring: {}", event.camera_id, event.error);
                return;
            }
            FaultDecision::Retry { attempt, delay } => {
                let fault = Error::PipelineFault {
                    name: slot.pipeline_name.clone(),
                    reason: event.error.clone(),
                };
                log::warn!(
                    "Camera {}: {} (recovery {}/{} in {:.1}s)",
                    event.camera_id,
                    fault,
                    attempt,
                    max_attempts,
                    delay.as_secs_f64()
                );
                if let Err(e) =
                    self.spawn_recovery(event.generation, event.camera_id.clone(), attempt, delay)
                {
                    let reason = format!("could not spawn recovery: {}", e);
                    log::error!("Camera {}: {}", event.camera_id, reason);
                    slot.recovery.on_recovery_failed(&reason);
                    self.backend.remove(&slot.pipeline_name);
                    session.degraded.insert(event.camera_id.clone(), reason);
                }
            }
            FaultDecision::GiveUp => {
                log::error!(
                    "Camera {} degraded after {} recovery attempt(s): {}",
                    event.camera_id,
                    slot.recovery.attempts,
                    event.error
                );
                self.backend.remove(&slot.pipeline_name);
                session
                    .degraded
                    .insert(event.camera_id.clone(), event.error.clone());
            }
        }

        self.persist(&state);
    }

    fn spawn_recovery(
        self: &Arc<Self>,
        generation: u64,
        camera_id: String,
        attempt: u32,
        delay: Duration,
    ) -> std::io::Result<()> {
        let shared = Arc::clone(self);
        std::thread::Builder::new()
            .name(format!("matchcam-recover-{}", camera_id))
            .spawn(move || {
                if !delay.is_zero() {
                    std::thread::sleep(delay);
                }
                shared.recover_camera(generation, &camera_id, attempt);
            })
            .map(|_| ())
    }

    fn recover_camera(&self, generation: u64, camera_id: &str, attempt: u32) {
        let mut state = self.session.lock();
        if state.generation != generation || state.status != RecordingStatus::Recording {
            log::info!("Recovery of camera {} abandoned: session ended", camera_id);
            return;
        }
        let Some(session) = state.session.as_mut() else {
            return;
        };
        let match_id = session.match_id.clone();
        let Some(slot) = session.cameras.get_mut(camera_id) else {
            return;
        };
        if !slot.recovery.recovering {
            return;
        }

        log::info!("Rebuilding camera {} (attempt {})", camera_id, attempt);
        self.backend.remove(&slot.pipeline_name);

        // A fresh run keeps the rebuilt muxer from overwriting earlier segments
        let run = slot.run + 1;
        slot.run = run;
        match self.launch_camera(&match_id, &slot.camera, run, generation) {
            Ok(name) => {
                slot.pipeline_name = name;
                slot.recovery.on_recovered(Instant::now());
                session.degraded.remove(camera_id);
                log::info!("Camera {} recovered on attempt {}", camera_id, attempt);
            }
            Err(e) => {
                let reason = e.to_string();
                log::error!(
                    "Camera {} degraded: rebuild attempt {} failed: {}",
                    camera_id,
                    attempt,
                    reason
                );
                slot.recovery.on_recovery_failed(&reason);
                session.degraded.insert(camera_id.to_string(), reason);
            }
        }

        self.persist(&state);
    }

    fn stop(&self, force: bool) -> StopResult {
        let (match_id, start_time, duration, process_after, slots, degraded) = {
            let mut state = self.session.lock();
            match state.status {
                RecordingStatus::Idle => return StopResult::not_recording(),
                RecordingStatus::Stopping => {
                    return StopResult::rejected(false, "stop already in progress")
                }
                RecordingStatus::Recording => {}
            }
            let Some(session) = state.session.as_ref() else {
                state.status = RecordingStatus::Idle;
                return StopResult::not_recording();
            };

            let elapsed = session.started_at.elapsed();
            let protection = Duration::from_secs(self.policy().protection_secs);
            if !force && elapsed < protection {
                log::warn!(
                    "Stop rejected: recording {} is only {:.1}s old",
                    session.match_id,
                    elapsed.as_secs_f64()
                );
                return StopResult::rejected(
                    false,
                    format!(
                        "recording started {:.0}s ago; stopping within the first {}s requires force",
                        elapsed.as_secs_f64(),
                        protection.as_secs()
                    ),
                );
            }

            let slots: Vec<(String, String, PathBuf)> = session
                .cameras
                .iter()
                .map(|(id, slot)| {
                    (
                        id.clone(),
                        slot.pipeline_name.clone(),
                        segments::camera_dir(&self.config.storage_path, &session.match_id, id),
                    )
                })
                .collect();
            let snapshot = (
                session.match_id.clone(),
                session.start_time,
                elapsed,
                session.process_after,
                slots,
                session.degraded.clone(),
            );

            state.status = RecordingStatus::Stopping;
            state.generation += 1;
            snapshot
        };

        log::info!(
            "Stopping recording {} after {:.1}s{}",
            match_id,
            duration.as_secs_f64(),
            if force { " (forced)" } else { "" }
        );

        let eos_timeout = Duration::from_secs(self.policy().stop_eos_timeout_secs);
        let backend = &self.backend;
        let mut cameras: BTreeMap<String, CameraStopReport> = std::thread::scope(|scope| {
            let handles: Vec<_> = slots
                .iter()
                .map(|(camera_id, name, _)| {
                    let degraded_reason = degraded.get(camera_id).cloned();
                    let handle = scope.spawn(move || {
                        if degraded_reason.is_some() {
                            backend.remove(name);
                            return (StopDetails::default(), false);
                        }
                        let mut details = backend.stop_with_details(name, true, eos_timeout);
                        backend.remove(name);
                        let finalized = details.success
                            && details.eos_received
                            && !details.timed_out
                            && details.error.is_none();
                        if details.timed_out && details.error.is_none() {
                            details.error = Some(Error::EosTimeout(name.clone()).to_string());
                        }
                        (details, finalized)
                    });
                    (camera_id.clone(), degraded.get(camera_id).cloned(), handle)
                })
                .collect();

            handles
                .into_iter()
                .map(|(camera_id, degraded_reason, handle)| {
                    let (stop, finalized) = handle.join().unwrap_or_else(|_| {
                        (
                            StopDetails {
                                error: Some("stop worker panicked".into()),
                                ..StopDetails::default()
                            },
                            false,
                        )
                    });
                    (
                        camera_id,
                        CameraStopReport {
                            finalized,
                            stop,
                            degraded_reason,
                            latest_segment: None,
                        },
                    )
                })
                .collect()
        });

        // Post-stop integrity of each active camera's newest segment
        let mut integrity_results = BTreeMap::new();
        for (camera_id, _, dir) in &slots {
            if degraded.contains_key(camera_id) {
                continue;
            }
            let latest = segments::latest_segment(dir);
            let integrity = match &latest {
                Some(segment) => SegmentIntegrity::probe(self.prober.as_ref(), &segment.path),
                None => SegmentIntegrity::unchecked(None, "no segment found"),
            };
            if let Some(report) = cameras.get_mut(camera_id) {
                report.latest_segment = latest.map(|s| s.path);
            }
            integrity_results.insert(camera_id.clone(), integrity);
        }
        let integrity = IntegritySummary::from_cameras(integrity_results);

        let active: Vec<&CameraStopReport> = cameras
            .values()
            .filter(|c| c.degraded_reason.is_none())
            .collect();
        let transport_success = active.iter().all(|c| c.stop.success);
        let graceful_stop = active.iter().all(|c| c.finalized);
        let not_finalized: Vec<String> = cameras
            .iter()
            .filter(|(_, c)| c.degraded_reason.is_none() && !c.finalized)
            .map(|(id, _)| id.clone())
            .collect();
        let integrity_failed = integrity.failed_cameras();
        let unverified = integrity.unverified_cameras();

        let success = !active.is_empty() && graceful_stop && integrity_failed.is_empty();
        let mut message = if active.is_empty() {
            format!("recording {} stopped with no active cameras", match_id)
        } else if !integrity_failed.is_empty() {
            format!(
                "recording {} stopped but integrity check failed for cameras: {}",
                match_id,
                integrity_failed.join(", ")
            )
        } else if !not_finalized.is_empty() {
            format!(
                "recording {} stopped but cameras were not finalized: {}",
                match_id,
                not_finalized.join(", ")
            )
        } else {
            format!("recording {} stopped", match_id)
        };
        if !unverified.is_empty() {
            message.push_str(&format!(" (unverified: {})", unverified.join(", ")));
        }
        if !degraded.is_empty() {
            let ids: Vec<&str> = degraded.keys().map(String::as_str).collect();
            message.push_str(&format!(" (degraded: {})", ids.join(", ")));
        }

        // Cleared unconditionally once a stop has been attempted
        {
            let mut state = self.session.lock();
            state.session = None;
            state.status = RecordingStatus::Idle;
            state.overload.reset();
            self.persist(&state);
            self.health.lock().reset();
        }

        if success {
            log::info!("{}", message);
        } else {
            log::warn!("{}", message);
        }

        let mut post_processing_queued = false;
        if process_after {
            post_processing_queued = self.postprocess.enqueue(PostProcessJob {
                match_id: match_id.clone(),
                match_dir: segments::match_dir(&self.config.storage_path, &match_id),
                camera_ids: slots.iter().map(|(id, _, _)| id.clone()).collect(),
                started_at: Some(start_time),
                stopped_at: Utc::now(),
            });
        }

        for report in cameras.values_mut() {
            if report.degraded_reason.is_some() {
                report.stop.error.get_or_insert_with(|| "camera degraded".into());
            }
        }

        StopResult {
            success,
            message,
            transport_success,
            graceful_stop,
            match_id: Some(match_id),
            duration_secs: Some(duration.as_secs_f64()),
            cameras,
            integrity,
            degraded_cameras: degraded,
            post_processing_queued,
        }
    }

    fn status(&self) -> RecordingStatusReport {
        let state = self.session.lock();
        let overload_guard = state.overload.snapshot();
        let mut report = RecordingStatusReport {
            recording: state.status == RecordingStatus::Recording,
            status: state.status,
            match_id: None,
            start_time: None,
            duration_secs: None,
            process_after_recording: false,
            cameras: BTreeMap::new(),
            degraded: overload_guard.active,
            degraded_cameras: BTreeMap::new(),
            recovery_state: BTreeMap::new(),
            overload_guard,
            stale_session: state.stale_session.clone(),
        };

        let Some(session) = &state.session else {
            return report;
        };

        report.match_id = Some(session.match_id.clone());
        report.start_time = Some(session.start_time);
        report.duration_secs = Some(session.started_at.elapsed().as_secs_f64());
        report.process_after_recording = session.process_after;
        report.degraded |= !session.degraded.is_empty();
        report.degraded_cameras = session.degraded.clone();

        for (camera_id, slot) in &session.cameras {
            let pipeline = self.backend.status(&slot.pipeline_name);
            let camera_state = if session.degraded.contains_key(camera_id) {
                "degraded".to_string()
            } else if slot.recovery.recovering {
                "recovering".to_string()
            } else {
                pipeline
                    .as_ref()
                    .map(|p| p.state.as_str().to_string())
                    .unwrap_or_else(|| "missing".to_string())
            };
            report.cameras.insert(
                camera_id.clone(),
                CameraStatus {
                    pipeline_name: slot.pipeline_name.clone(),
                    state: camera_state,
                    run: slot.run,
                    start_time: pipeline.as_ref().and_then(|p| p.start_time),
                    error: slot
                        .recovery
                        .last_error
                        .clone()
                        .or_else(|| pipeline.and_then(|p| p.error_message)),
                },
            );
            report
                .recovery_state
                .insert(camera_id.clone(), slot.recovery.clone());
        }

        report
    }

    fn check_health(&self) -> HealthReport {
        let (checks, elapsed, generation) = {
            let state = self.session.lock();
            match (&state.status, &state.session) {
                (RecordingStatus::Recording, Some(session)) => {
                    let checks: Vec<CameraCheck> = session
                        .cameras
                        .iter()
                        .map(|(camera_id, slot)| CameraCheck {
                            camera_id: camera_id.clone(),
                            pipeline: self.backend.status(&slot.pipeline_name),
                            camera_dir: segments::camera_dir(
                                &self.config.storage_path,
                                &session.match_id,
                                camera_id,
                            ),
                            degraded_reason: session.degraded.get(camera_id).cloned(),
                            recovering: slot.recovery.recovering,
                        })
                        .collect();
                    (checks, session.started_at.elapsed(), state.generation)
                }
                (RecordingStatus::Stopping, _) => {
                    let mut report = HealthReport::not_recording();
                    report.message = "stop in progress".into();
                    return report;
                }
                _ => return HealthReport::not_recording(),
            }
        };

        let cameras = {
            let mut health = self.health.lock();
            checks
                .iter()
                .map(|check| {
                    (
                        check.camera_id.clone(),
                        health.check_camera(check, elapsed, self.prober.as_ref()),
                    )
                })
                .collect()
        };

        let mut report = HealthReport::from_cameras(cameras);
        let cpu = self.cpu.sample();
        report.cpu_percent = cpu;

        // A permanently degraded camera is its own fault, not system pressure
        let active_healthy = report
            .cameras
            .values()
            .filter(|c| !c.degraded)
            .all(|c| c.healthy);

        let mut state = self.session.lock();
        if state.generation == generation {
            state.overload.observe(cpu, active_healthy);
            let snapshot = state.overload.snapshot();
            if snapshot.active {
                let overload = Error::Overload(format!(
                    "CPU {:.0}% over {:.0}% while cameras are unhealthy",
                    snapshot.last_cpu_percent.unwrap_or_default(),
                    snapshot.threshold_percent
                ));
                report
                    .issues
                    .push(format!("overload guard active: {}", overload));
                report.message = format!("{}; overload guard active", report.message);
            }
            report.overload_guard = Some(snapshot);
        }

        if !report.healthy {
            log::warn!("Health check: {} ({})", report.message, report.issues.join("; "));
        } else {
            log::debug!("Health check: {}", report.message);
        }
        report
    }

    /// Adopt a persisted session whose pipelines are still registered, or
    /// discard it and remember it as stale.
    fn reconcile(&self) {
        let Some(persisted) = self.store.load() else {
            return;
        };
        if !persisted.recording {
            return;
        }

        let match_id = persisted.match_id.clone();
        let start_time = persisted.start_datetime();
        let mut state = self.session.lock();

        let mut slots = BTreeMap::new();
        let mut lost = BTreeMap::new();
        if let Some(match_id) = &match_id {
            for camera in &self.config.cameras {
                let name = pipeline_name(&camera.id);
                let adopted = self
                    .backend
                    .status(&name)
                    .is_some_and(|s| s.metadata.match_id.as_deref() == Some(match_id.as_str()));
                if adopted {
                    let dir = segments::camera_dir(&self.config.storage_path, match_id, &camera.id);
                    slots.insert(
                        camera.id.clone(),
                        CameraSlot {
                            camera: camera.clone(),
                            pipeline_name: name,
                            run: segments::highest_run(&dir).max(1),
                            recovery: CameraRecoveryState::started(Instant::now()),
                        },
                    );
                } else {
                    lost.insert(camera.id.clone(), "pipeline lost before reconciliation".to_string());
                }
            }
        }

        match (match_id, slots.is_empty()) {
            (Some(match_id), false) => {
                let start_time = start_time.unwrap_or_else(Utc::now);
                let elapsed = (Utc::now() - start_time).to_std().unwrap_or_default();
                let started_at = Instant::now().checked_sub(elapsed).unwrap_or_else(Instant::now);

                for (camera_id, reason) in &lost {
                    if let Some(camera) = self.config.cameras.iter().find(|c| &c.id == camera_id) {
                        let mut recovery = CameraRecoveryState::default();
                        recovery.on_recovery_failed(reason);
                        slots.insert(
                            camera_id.clone(),
                            CameraSlot {
                                camera: camera.clone(),
                                pipeline_name: pipeline_name(camera_id),
                                run: 0,
                                recovery,
                            },
                        );
                    }
                }

                log::info!(
                    "Adopted running session {} ({} camera(s) still registered)",
                    match_id,
                    slots.len() - lost.len()
                );
                state.generation += 1;
                state.session = Some(ActiveSession {
                    match_id,
                    start_time,
                    started_at,
                    process_after: persisted.process_after_recording,
                    cameras: slots,
                    degraded: lost,
                });
                state.status = RecordingStatus::Recording;
            }
            (match_id, _) => {
                log::warn!(
                    "Discarding stale session {} from {}: its pipelines no longer exist",
                    match_id.as_deref().unwrap_or("(unnamed)"),
                    start_time
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_else(|| "unknown time".into())
                );
                state.stale_session = Some(StaleSession {
                    match_id,
                    start_time,
                    detected_at: Utc::now(),
                });
                state.session = None;
                state.status = RecordingStatus::Idle;
            }
        }

        self.persist(&state);
    }
}
