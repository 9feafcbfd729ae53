// Native capture/encode pipeline management

pub mod builder;
pub mod event_loop;
pub mod runtime;

pub use builder::{DescriptionBuilder, GstDescriptionBuilder, PipelineRequest};
pub use runtime::PipelineRuntime;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of one named pipeline
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PipelineState {
    Idle,
    Starting,
    Running,
    Stopping,
    Error,
}

impl PipelineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineState::Idle => "idle",
            PipelineState::Starting => "starting",
            PipelineState::Running => "running",
            PipelineState::Stopping => "stopping",
            PipelineState::Error => "error",
        }
    }
}

/// Caller-supplied tags carried with a pipeline
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PipelineMetadata {
    pub camera_id: String,
    pub match_id: Option<String>,
}

/// Snapshot returned by [`PipelineBackend::status`]
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStatus {
    pub state: PipelineState,
    pub start_time: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub metadata: PipelineMetadata,
}

/// Outcome of a stop request
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct StopDetails {
    /// The pipeline reached the NULL state (or there was nothing to stop)
    pub success: bool,
    pub eos_received: bool,
    pub timed_out: bool,
    pub error: Option<String>,
}

impl StopDetails {
    pub fn noop() -> Self {
        Self {
            success: true,
            ..Self::default()
        }
    }
}

/// Called with the pipeline name when EOS reaches the bus
pub type EosCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Called with the pipeline name and a readable error message
pub type ErrorCallback = Arc<dyn Fn(&str, &str) + Send + Sync>;

/// Bus callbacks registered at creation.
///
/// They run on the bus event-loop thread and must return quickly; hand any
/// real work to another thread.
#[derive(Clone, Default)]
pub struct PipelineCallbacks {
    pub on_eos: Option<EosCallback>,
    pub on_error: Option<ErrorCallback>,
}

/// Registry/lifecycle operations the recording orchestrator needs.
///
/// [`PipelineRuntime`] is the GStreamer implementation. Every method is
/// fail-soft: engine failures come back as return values, never panics.
pub trait PipelineBackend: Send + Sync {
    /// Register a pipeline. False if `name` exists or the description is invalid.
    fn create(
        &self,
        name: &str,
        description: &str,
        callbacks: PipelineCallbacks,
        metadata: PipelineMetadata,
    ) -> bool;

    /// Set the pipeline playing. True if it is (or already was) running.
    fn start(&self, name: &str) -> bool;

    /// Stop the pipeline, optionally draining it with EOS first.
    /// Unknown or idle names are a successful no-op.
    fn stop_with_details(&self, name: &str, wait_for_eos: bool, timeout: Duration) -> StopDetails;

    /// Hard-stop if needed and drop the pipeline. False if `name` was unknown.
    fn remove(&self, name: &str) -> bool;

    fn status(&self, name: &str) -> Option<PipelineStatus>;

    fn names(&self) -> Vec<String>;
}
