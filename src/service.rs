// Capture service: the upward API over the camera lock and the orchestrator
//
// Recording holds the camera lock in `recording` mode for the whole session.
// A start that fails gives the lock back; a stop gives it back once the
// session has been cleared.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::recording::{
    Collaborators, HealthReport, RecordingOrchestrator, RecordingStatus, RecordingStatusReport,
    StartResult, StopResult,
};
use crate::resource_lock::{LockMode, LockState, ResourceLock};

/// Lock holder name used for recording sessions
pub const RECORDING_HOLDER: &str = "recording";

#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    #[serde(flatten)]
    pub recording: RecordingStatusReport,
    pub camera_lock: LockState,
}

pub struct CaptureService {
    lock: Arc<ResourceLock>,
    orchestrator: RecordingOrchestrator,
    acquire_timeout: Duration,
}

impl CaptureService {
    pub fn new(config: Config, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;
        let lock = Arc::new(ResourceLock::from_config(&config)?);
        Ok(Self::with_lock(config, collaborators, lock))
    }

    /// Compose around an existing lock, e.g. one shared with preview.
    pub fn with_lock(config: Config, collaborators: Collaborators, lock: Arc<ResourceLock>) -> Self {
        let acquire_timeout = config.lock.acquire_timeout();
        let orchestrator = RecordingOrchestrator::new(config, collaborators);

        // An adopted session keeps its claim on the cameras
        if orchestrator.is_recording()
            && !lock.acquire(LockMode::Recording, RECORDING_HOLDER, false, acquire_timeout)
        {
            log::error!("Adopted recording session but the camera lock is held elsewhere");
        }

        Self {
            lock,
            orchestrator,
            acquire_timeout,
        }
    }

    pub fn start_recording(&self, match_id: &str, force: bool, process_after: bool) -> StartResult {
        if !self
            .lock
            .acquire(LockMode::Recording, RECORDING_HOLDER, force, self.acquire_timeout)
        {
            let state = self.lock.current_state();
            let error = Error::ResourceContention {
                mode: state.mode.to_string(),
                holder: state.holder.unwrap_or_else(|| "unknown".into()),
            };
            log::warn!("Recording {} not started: {}", match_id, error);
            return StartResult {
                success: false,
                message: error.to_string(),
                match_id: Some(match_id.to_string()),
                cameras_started: Vec::new(),
                cameras_failed: BTreeMap::new(),
            };
        }

        let result = self.orchestrator.start(match_id, force, process_after);
        if !result.success && self.orchestrator.status().status == RecordingStatus::Idle {
            self.release_lock();
        }
        result
    }

    pub fn stop_recording(&self, force: bool) -> StopResult {
        let result = self.orchestrator.stop(force);
        if self.orchestrator.status().status == RecordingStatus::Idle {
            self.release_lock();
        }
        result
    }

    fn release_lock(&self) {
        let held = self
            .lock
            .held_by_this_process()
            .is_some_and(|(_, holder)| holder == RECORDING_HOLDER);
        if held {
            self.lock.release(RECORDING_HOLDER);
        }
    }

    pub fn status(&self) -> ServiceStatus {
        ServiceStatus {
            recording: self.orchestrator.status(),
            camera_lock: self.lock.current_state(),
        }
    }

    pub fn check_health(&self) -> HealthReport {
        self.orchestrator.check_health()
    }

    pub fn orchestrator(&self) -> &RecordingOrchestrator {
        &self.orchestrator
    }

    pub fn lock(&self) -> &Arc<ResourceLock> {
        &self.lock
    }
}
