// Shared fakes for the integration tests
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use matchcam::config::{CameraConfig, Config};
use matchcam::error::{Error, Result};
use matchcam::pipeline::{
    DescriptionBuilder, PipelineBackend, PipelineCallbacks, PipelineMetadata, PipelineRequest,
    PipelineState, PipelineStatus, StopDetails,
};
use matchcam::recording::{Collaborators, CpuSampler, ProbeMetadata, SegmentProber};

// ============================================================================
// Pipeline backend
// ============================================================================

struct FakePipeline {
    description: String,
    callbacks: PipelineCallbacks,
    metadata: PipelineMetadata,
    state: PipelineState,
    error: Option<String>,
}

/// In-memory pipeline registry.
///
/// `start` writes the first segment file named by the description (the
/// [`PatternBuilder`] puts the output pattern there), so stop-time probing
/// has something to look at.
#[derive(Default)]
pub struct FakeBackend {
    pipelines: Mutex<HashMap<String, FakePipeline>>,
    fail_create: Mutex<HashSet<String>>,
    fail_start: Mutex<HashSet<String>>,
    creates: Mutex<HashMap<String, usize>>,
    starts: Mutex<HashMap<String, usize>>,
    no_eos: Mutex<bool>,
    stop_delay: Mutex<Duration>,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_create(&self, name: &str) {
        self.fail_create.lock().insert(name.to_string());
    }

    pub fn fail_start(&self, name: &str) {
        self.fail_start.lock().insert(name.to_string());
    }

    pub fn clear_failures(&self) {
        self.fail_create.lock().clear();
        self.fail_start.lock().clear();
    }

    /// Stops time out instead of receiving EOS
    pub fn withhold_eos(&self, withhold: bool) {
        *self.no_eos.lock() = withhold;
    }

    pub fn set_stop_delay(&self, delay: Duration) {
        *self.stop_delay.lock() = delay;
    }

    pub fn create_count(&self, name: &str) -> usize {
        self.creates.lock().get(name).copied().unwrap_or(0)
    }

    pub fn start_count(&self, name: &str) -> usize {
        self.starts.lock().get(name).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.pipelines.lock().len()
    }

    pub fn description(&self, name: &str) -> Option<String> {
        self.pipelines.lock().get(name).map(|p| p.description.clone())
    }

    /// Deliver a bus error from another thread, as the event loop would
    pub fn fire_error(&self, name: &str, message: &str) -> bool {
        let on_error = {
            let mut pipelines = self.pipelines.lock();
            let Some(pipeline) = pipelines.get_mut(name) else {
                return false;
            };
            pipeline.state = PipelineState::Error;
            pipeline.error = Some(message.to_string());
            pipeline.callbacks.on_error.clone()
        };
        let Some(on_error) = on_error else {
            return false;
        };

        let name = name.to_string();
        let message = message.to_string();
        std::thread::spawn(move || on_error(name.as_str(), message.as_str()))
            .join()
            .is_ok()
    }
}

impl PipelineBackend for FakeBackend {
    fn create(
        &self,
        name: &str,
        description: &str,
        callbacks: PipelineCallbacks,
        metadata: PipelineMetadata,
    ) -> bool {
        *self.creates.lock().entry(name.to_string()).or_default() += 1;
        if self.fail_create.lock().contains(name) {
            return false;
        }
        let mut pipelines = self.pipelines.lock();
        if pipelines.contains_key(name) {
            return false;
        }
        pipelines.insert(
            name.to_string(),
            FakePipeline {
                description: description.to_string(),
                callbacks,
                metadata,
                state: PipelineState::Idle,
                error: None,
            },
        );
        true
    }

    fn start(&self, name: &str) -> bool {
        *self.starts.lock().entry(name.to_string()).or_default() += 1;
        let fail = self.fail_start.lock().contains(name);
        let mut pipelines = self.pipelines.lock();
        let Some(pipeline) = pipelines.get_mut(name) else {
            return false;
        };
        if fail {
            pipeline.state = PipelineState::Error;
            pipeline.error = Some("injected start failure".into());
            return false;
        }
        pipeline.state = PipelineState::Running;

        let first_segment = PathBuf::from(pipeline.description.replace("%05d", "00000"));
        if let Some(parent) = first_segment.parent() {
            if parent.is_dir() {
                let _ = std::fs::write(&first_segment, b"fake segment");
            }
        }
        true
    }

    fn stop_with_details(&self, name: &str, wait_for_eos: bool, _timeout: Duration) -> StopDetails {
        let delay = *self.stop_delay.lock();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }

        let withhold = *self.no_eos.lock();
        let mut pipelines = self.pipelines.lock();
        let Some(pipeline) = pipelines.get_mut(name) else {
            return StopDetails::noop();
        };
        if pipeline.state == PipelineState::Idle {
            return StopDetails::noop();
        }
        pipeline.state = PipelineState::Idle;
        StopDetails {
            success: true,
            eos_received: wait_for_eos && !withhold,
            timed_out: wait_for_eos && withhold,
            error: None,
        }
    }

    fn remove(&self, name: &str) -> bool {
        self.pipelines.lock().remove(name).is_some()
    }

    fn status(&self, name: &str) -> Option<PipelineStatus> {
        let pipelines = self.pipelines.lock();
        let pipeline = pipelines.get(name)?;
        Some(PipelineStatus {
            state: pipeline.state,
            start_time: None,
            error_message: pipeline.error.clone(),
            metadata: pipeline.metadata.clone(),
        })
    }

    fn names(&self) -> Vec<String> {
        self.pipelines.lock().keys().cloned().collect()
    }
}

// ============================================================================
// Builder, prober, CPU
// ============================================================================

/// Uses the segment output pattern as the whole description
pub struct PatternBuilder;

impl DescriptionBuilder for PatternBuilder {
    fn build(&self, request: &PipelineRequest<'_>) -> Result<String> {
        Ok(request.output_pattern.to_string_lossy().into_owned())
    }
}

/// Reports every file as a valid h264 segment unless its path contains one
/// of the failing fragments.
#[derive(Default)]
pub struct FakeProber {
    failing: Mutex<Vec<String>>,
    unavailable: Mutex<bool>,
    probes: Mutex<usize>,
}

impl FakeProber {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_paths_containing(&self, fragment: &str) {
        self.failing.lock().push(fragment.to_string());
    }

    /// Behave like a machine without ffprobe installed
    pub fn set_unavailable(&self, unavailable: bool) {
        *self.unavailable.lock() = unavailable;
    }

    pub fn probe_count(&self) -> usize {
        *self.probes.lock()
    }
}

impl SegmentProber for FakeProber {
    fn probe(&self, path: &Path) -> Result<ProbeMetadata> {
        *self.probes.lock() += 1;
        if *self.unavailable.lock() {
            return Err(Error::ProberUnavailable("ffprobe not installed".into()));
        }
        let display = path.display().to_string();
        if self.failing.lock().iter().any(|f| display.contains(f.as_str())) {
            return Err(Error::Integrity {
                path: display,
                reason: "moov atom not found".into(),
            });
        }
        Ok(ProbeMetadata {
            codec_name: "h264".into(),
            avg_frame_rate: Some(30.0),
            duration_secs: Some(1.0),
            size_bytes: std::fs::metadata(path).ok().map(|m| m.len()),
            bit_rate: Some(8_000_000),
        })
    }
}

pub struct FixedCpu(pub Mutex<Option<f32>>);

impl FixedCpu {
    pub fn new(percent: f32) -> Arc<Self> {
        Arc::new(Self(Mutex::new(Some(percent))))
    }

    pub fn set(&self, percent: f32) {
        *self.0.lock() = Some(percent);
    }
}

impl CpuSampler for FixedCpu {
    fn sample(&self) -> Option<f32> {
        *self.0.lock()
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Two test cameras, no protection window, instant recovery
pub fn test_config(root: &Path) -> Config {
    let mut config = Config::default();
    config.storage_path = root.join("recordings");
    config.state_dir = root.join("state");
    config.cameras = vec![CameraConfig::new("0", "test"), CameraConfig::new("1", "test")];
    config.recording.protection_secs = 0;
    config.recording.recovery_backoff_secs = 0.0;
    config.recording.max_recovery_attempts = 2;
    config.recording.stop_eos_timeout_secs = 1;
    config
}

pub fn collaborators(backend: &Arc<FakeBackend>, prober: &Arc<FakeProber>) -> Collaborators {
    Collaborators::new(backend.clone(), Arc::new(PatternBuilder), prober.clone())
        .with_cpu_sampler(FixedCpu::new(10.0))
}

/// Poll `condition` every 10ms until it holds or `timeout` passes
pub fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}
