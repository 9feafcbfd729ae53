// Recording modules

pub mod health;
pub mod integrity;
pub mod orchestrator;
pub mod overload;
pub mod recovery;
pub mod segments;

pub use health::{CameraDiagnostics, HealthReport};
pub use integrity::{
    prober_from_config, DiscovererProber, FfprobeProber, ProbeMetadata, SegmentIntegrity,
    SegmentProber,
};
pub use orchestrator::{
    Collaborators, RecordingOrchestrator, RecordingStatusReport, StartResult, StopResult,
};
pub use overload::{CpuSampler, SysinfoCpuSampler};
pub use recovery::CameraRecoveryState;

use serde::{Deserialize, Serialize};

/// Session-level recording state
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RecordingStatus {
    /// Ready to record
    Idle,
    /// Currently recording
    Recording,
    /// Finalizing pipelines and verifying segments
    Stopping,
}

impl RecordingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordingStatus::Idle => "idle",
            RecordingStatus::Recording => "recording",
            RecordingStatus::Stopping => "stopping",
        }
    }
}
