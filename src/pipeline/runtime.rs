// GStreamer pipeline registry and lifecycle
//
// Lock order: registry lock -> per-pipeline entry lock. The bus thread only
// ever takes entry locks, and callers never hold the registry lock while
// waiting on a pipeline.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use gstreamer as gst;
use gstreamer::glib;
use gstreamer::prelude::*;
use parking_lot::{Condvar, Mutex};

use super::event_loop::BusEventLoop;
use super::{
    PipelineBackend, PipelineCallbacks, PipelineMetadata, PipelineState, PipelineStatus,
    StopDetails,
};
use crate::error::{Error, Result};

/// How long a stopping caller sleeps between EOS checks
const EOS_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Mutable per-pipeline state shared with the bus watch
struct EntryState {
    state: PipelineState,
    start_time: Option<DateTime<Utc>>,
    last_error: Option<String>,
    /// Bumped on every bus error so a stop can tell new errors from old ones
    error_count: u64,
    eos_received: bool,
}

struct EntryShared {
    state: Mutex<EntryState>,
    changed: Condvar,
}

impl EntryShared {
    fn new() -> Self {
        Self {
            state: Mutex::new(EntryState {
                state: PipelineState::Idle,
                start_time: None,
                last_error: None,
                error_count: 0,
                eos_received: false,
            }),
            changed: Condvar::new(),
        }
    }
}

struct PipelineEntry {
    pipeline: gst::Pipeline,
    shared: Arc<EntryShared>,
    metadata: PipelineMetadata,
    /// Dropping the guard removes the bus watch
    _watch: gst::bus::BusWatchGuard,
}

/// Thread-safe lifecycle manager for named GStreamer pipelines.
///
/// Owns the bus event-loop thread for its whole lifetime. All registry
/// mutation goes through one lock; bus messages update per-pipeline state
/// and are forwarded to the callbacks given at `create`.
pub struct PipelineRuntime {
    pipelines: Mutex<HashMap<String, PipelineEntry>>,
    event_loop: Arc<BusEventLoop>,
}

impl PipelineRuntime {
    pub fn new() -> Result<Self> {
        crate::gstreamer_init::init_gstreamer()
            .map_err(|e| Error::Configuration(format!("GStreamer unavailable: {}", e)))?;

        Ok(Self {
            pipelines: Mutex::new(HashMap::new()),
            event_loop: BusEventLoop::shared(),
        })
    }

    pub fn is_event_loop_running(&self) -> bool {
        self.event_loop.is_running()
    }

    fn lookup(&self, name: &str) -> Option<(gst::Pipeline, Arc<EntryShared>)> {
        self.pipelines
            .lock()
            .get(name)
            .map(|entry| (entry.pipeline.clone(), entry.shared.clone()))
    }

    fn build_pipeline(name: &str, description: &str) -> Result<gst::Pipeline> {
        let element = gst::parse::launch(description)?;

        match element.dynamic_cast::<gst::Pipeline>() {
            Ok(pipeline) => Ok(pipeline),
            Err(element) => {
                // A single-element description parses to the bare element
                let pipeline = gst::Pipeline::builder().name(name).build();
                pipeline.add(&element).map_err(|e| Error::PipelineCreate {
                    name: name.to_string(),
                    reason: e.to_string(),
                })?;
                Ok(pipeline)
            }
        }
    }

    fn add_bus_watch(
        name: &str,
        pipeline: &gst::Pipeline,
        shared: Arc<EntryShared>,
        callbacks: PipelineCallbacks,
    ) -> Result<gst::bus::BusWatchGuard> {
        let bus = pipeline.bus().ok_or_else(|| Error::PipelineCreate {
            name: name.to_string(),
            reason: "pipeline has no bus".into(),
        })?;

        let watch_name = name.to_string();
        bus.add_watch(move |_bus, msg| {
            use gst::MessageView;

            match msg.view() {
                MessageView::Eos(..) => {
                    shared.state.lock().eos_received = true;
                    shared.changed.notify_all();
                    log::debug!("[{}] EOS received", watch_name);
                    if let Some(on_eos) = &callbacks.on_eos {
                        on_eos(&watch_name);
                    }
                }
                MessageView::Error(err) => {
                    let src = err.src().map(|s| s.name().to_string()).unwrap_or_default();
                    let message = format!("{}: {}", src, err.error());
                    log::error!(
                        "[{}] Bus error from '{}': {} (debug: {:?})",
                        watch_name,
                        src,
                        err.error(),
                        err.debug()
                    );
                    {
                        let mut state = shared.state.lock();
                        state.state = PipelineState::Error;
                        state.last_error = Some(message.clone());
                        state.error_count += 1;
                    }
                    shared.changed.notify_all();
                    if let Some(on_error) = &callbacks.on_error {
                        on_error(&watch_name, &message);
                    }
                }
                MessageView::Warning(warn) => {
                    let src = warn.src().map(|s| s.name().to_string()).unwrap_or_default();
                    log::warn!("[{}] Bus warning from '{}': {}", watch_name, src, warn.error());
                }
                _ => {}
            }

            glib::ControlFlow::Continue
        })
        .map_err(|e| Error::PipelineCreate {
            name: name.to_string(),
            reason: format!("failed to add bus watch: {}", e),
        })
    }
}

impl PipelineBackend for PipelineRuntime {
    fn create(
        &self,
        name: &str,
        description: &str,
        callbacks: PipelineCallbacks,
        metadata: PipelineMetadata,
    ) -> bool {
        let mut pipelines = self.pipelines.lock();
        if pipelines.contains_key(name) {
            log::warn!("Pipeline {} already exists", name);
            return false;
        }

        let pipeline = match Self::build_pipeline(name, description) {
            Ok(pipeline) => pipeline,
            Err(e) => {
                log::error!("Failed to parse pipeline {}: {}", name, e);
                return false;
            }
        };

        let shared = Arc::new(EntryShared::new());
        let watch = match Self::add_bus_watch(name, &pipeline, shared.clone(), callbacks) {
            Ok(watch) => watch,
            Err(e) => {
                log::error!("{}", e);
                return false;
            }
        };

        pipelines.insert(
            name.to_string(),
            PipelineEntry {
                pipeline,
                shared,
                metadata,
                _watch: watch,
            },
        );
        log::info!("Created pipeline {}", name);
        true
    }

    fn start(&self, name: &str) -> bool {
        let Some((pipeline, shared)) = self.lookup(name) else {
            log::warn!("Cannot start unknown pipeline {}", name);
            return false;
        };

        {
            let mut state = shared.state.lock();
            if state.state == PipelineState::Running {
                return true;
            }
            state.state = PipelineState::Starting;
            state.eos_received = false;
        }

        match pipeline.set_state(gst::State::Playing) {
            Ok(result) => {
                let mut state = shared.state.lock();
                // A bus error may already have landed between the two locks
                if state.state == PipelineState::Starting {
                    state.state = PipelineState::Running;
                    state.start_time = Some(Utc::now());
                }
                let running = state.state == PipelineState::Running;
                drop(state);
                log::info!("Started pipeline {} ({:?})", name, result);
                running
            }
            Err(e) => {
                let message = format!("state change to PLAYING failed: {}", e);
                log::error!("Failed to start pipeline {}: {}", name, message);
                let _ = pipeline.set_state(gst::State::Null);
                let mut state = shared.state.lock();
                state.state = PipelineState::Error;
                state.last_error = Some(message);
                state.error_count += 1;
                false
            }
        }
    }

    fn stop_with_details(&self, name: &str, wait_for_eos: bool, timeout: Duration) -> StopDetails {
        let Some((pipeline, shared)) = self.lookup(name) else {
            return StopDetails::noop();
        };

        let mut details = StopDetails::default();
        let errors_before;
        let errored;
        {
            let mut state = shared.state.lock();
            if state.state == PipelineState::Idle {
                return StopDetails::noop();
            }
            errored = state.state == PipelineState::Error;
            if errored {
                details.error = state.last_error.clone();
            }
            state.state = PipelineState::Stopping;
            state.eos_received = false;
            errors_before = state.error_count;
        }

        if wait_for_eos && !errored {
            if !pipeline.send_event(gst::event::Eos::new()) {
                details.error = Some("failed to send EOS".into());
                log::warn!("Pipeline {} did not accept EOS", name);
            } else {
                let deadline = Instant::now() + timeout;
                let mut state = shared.state.lock();
                loop {
                    if state.eos_received {
                        details.eos_received = true;
                        break;
                    }
                    if state.error_count > errors_before {
                        details.error = state.last_error.clone();
                        break;
                    }
                    let now = Instant::now();
                    if now >= deadline {
                        details.timed_out = true;
                        break;
                    }
                    let wait = (deadline - now).min(EOS_POLL_INTERVAL);
                    shared.changed.wait_for(&mut state, wait);
                }
            }
        }

        if details.timed_out {
            log::warn!(
                "Pipeline {} did not reach EOS within {:.1}s, forcing stop",
                name,
                timeout.as_secs_f64()
            );
        }

        match pipeline.set_state(gst::State::Null) {
            Ok(_) => details.success = true,
            Err(e) => {
                details.success = false;
                details
                    .error
                    .get_or_insert_with(|| format!("state change to NULL failed: {}", e));
            }
        }

        {
            let mut state = shared.state.lock();
            state.state = if details.success {
                PipelineState::Idle
            } else {
                PipelineState::Error
            };
            state.start_time = None;
        }

        log::info!(
            "Stopped pipeline {} (eos: {}, timed out: {}, error: {:?})",
            name,
            details.eos_received,
            details.timed_out,
            details.error
        );
        details
    }

    fn remove(&self, name: &str) -> bool {
        let Some(entry) = self.pipelines.lock().remove(name) else {
            return false;
        };

        if let Err(e) = entry.pipeline.set_state(gst::State::Null) {
            log::warn!("Error stopping pipeline {} during removal: {}", name, e);
        }
        entry.shared.state.lock().state = PipelineState::Idle;
        entry.shared.changed.notify_all();

        log::info!("Removed pipeline {}", name);
        true
    }

    fn status(&self, name: &str) -> Option<PipelineStatus> {
        let pipelines = self.pipelines.lock();
        let entry = pipelines.get(name)?;
        let state = entry.shared.state.lock();
        Some(PipelineStatus {
            state: state.state,
            start_time: state.start_time,
            error_message: state.last_error.clone(),
            metadata: entry.metadata.clone(),
        })
    }

    fn names(&self) -> Vec<String> {
        self.pipelines.lock().keys().cloned().collect()
    }
}

impl Drop for PipelineRuntime {
    fn drop(&mut self) {
        for (name, entry) in self.pipelines.lock().drain() {
            if let Err(e) = entry.pipeline.set_state(gst::State::Null) {
                log::warn!("Error stopping pipeline {}: {}", name, e);
            }
        }
    }
}
