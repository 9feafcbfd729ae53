// Error taxonomy for pipeline orchestration and camera resource locking

use gstreamer as gst;

/// Errors raised inside the capture core.
///
/// Most public operations are fail-soft and fold these into structured
/// result values; the enum exists so the failure class survives until it
/// is reported.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Camera resource is held by {holder} ({mode})")]
    ResourceContention { mode: String, holder: String },

    #[error("Failed to create pipeline {name}: {reason}")]
    PipelineCreate { name: String, reason: String },

    #[error("Failed to start pipeline {name}: {reason}")]
    PipelineStart { name: String, reason: String },

    #[error("Pipeline {name} fault: {reason}")]
    PipelineFault { name: String, reason: String },

    #[error("Timed out waiting for EOS on {0}")]
    EosTimeout(String),

    #[error("Integrity check failed for {path}: {reason}")]
    Integrity { path: String, reason: String },

    /// The prober itself could not run, so nothing is known about the file
    #[error("Segment prober unavailable: {0}")]
    ProberUnavailable(String),

    #[error("System overload: {0}")]
    Overload(String),

    #[error("GStreamer error: {0}")]
    Gst(#[from] gst::glib::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config parse error: {0}")]
    TomlDe(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
