// Configuration management for Matchcam

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Root directory for match recordings
    pub storage_path: PathBuf,

    /// Directory holding the lock and session state files
    pub state_dir: PathBuf,

    /// Encoder quality for every camera
    #[serde(default)]
    pub quality_preset: QualityPreset,

    /// Cameras recorded as one session, in start order
    pub cameras: Vec<CameraConfig>,

    #[serde(default)]
    pub recording: RecordingPolicy,

    #[serde(default)]
    pub health: HealthConfig,

    #[serde(default)]
    pub overload_guard: OverloadGuardConfig,

    #[serde(default)]
    pub lock: LockConfig,
}

/// One fixed camera
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CameraConfig {
    /// Stable identifier ("0", "1", ...) used in pipeline and directory names
    pub id: String,

    /// Capture device path, or "test" for a synthetic source
    pub device: String,

    #[serde(default = "default_width")]
    pub width: u32,

    #[serde(default = "default_height")]
    pub height: u32,

    #[serde(default = "default_fps")]
    pub fps: u32,

    /// Clockwise rotation in degrees: 0, 90, 180 or 270
    #[serde(default)]
    pub rotation: u16,

    #[serde(default)]
    pub crop: Option<Crop>,
}

/// Pixels removed from each edge before encoding
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Crop {
    #[serde(default)]
    pub left: u32,
    #[serde(default)]
    pub right: u32,
    #[serde(default)]
    pub top: u32,
    #[serde(default)]
    pub bottom: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum QualityPreset {
    Low,
    #[default]
    Medium,
    High,
}

/// Session and recovery policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingPolicy {
    /// Roll back the whole start if any camera fails to start
    pub require_all_cameras: bool,

    /// Recovery attempts per camera before it is marked degraded
    pub max_recovery_attempts: u32,

    /// Base backoff; attempt N waits `backoff * N`
    pub recovery_backoff_secs: f64,

    pub recovery_backoff_cap_secs: f64,

    /// Fault-free running time after which the attempt counter resets
    pub recovery_reset_secs: u64,

    /// Non-forced stops are rejected this early in a session
    pub protection_secs: u64,

    pub stop_eos_timeout_secs: u64,

    /// Muxer rotation interval
    pub segment_duration_secs: u64,
}

impl Default for RecordingPolicy {
    fn default() -> Self {
        Self {
            require_all_cameras: true,
            max_recovery_attempts: 3,
            recovery_backoff_secs: 2.0,
            recovery_backoff_cap_secs: 30.0,
            recovery_reset_secs: 120,
            protection_secs: 10,
            stop_eos_timeout_secs: 15,
            segment_duration_secs: 600,
        }
    }
}

impl RecordingPolicy {
    /// Delay before recovery attempt `attempt` (1-based)
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let secs = (self.recovery_backoff_secs * attempt as f64)
            .min(self.recovery_backoff_cap_secs)
            .max(0.0);
        // Non-finite values are rejected by validate(); never panic here
        Duration::try_from_secs_f64(secs).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProberKind {
    #[default]
    Ffprobe,
    Discoverer,
}

/// Health monitoring thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Newest segment older than this is reported stale
    pub stale_segment_secs: u64,

    /// Segments smaller than this are not probed while recording
    pub probe_min_bytes: u64,

    /// Segment size must be unchanged this long before it is probed
    pub probe_min_stable_secs: u64,

    pub probe_cache_ttl_secs: u64,

    pub probe_timeout_secs: u64,

    pub prober: ProberKind,

    pub ffprobe_path: PathBuf,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            stale_segment_secs: 30,
            probe_min_bytes: 1024 * 1024,
            probe_min_stable_secs: 5,
            probe_cache_ttl_secs: 60,
            probe_timeout_secs: 10,
            prober: ProberKind::default(),
            ffprobe_path: PathBuf::from("ffprobe"),
        }
    }
}

/// System-wide CPU pressure detection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OverloadGuardConfig {
    pub enabled: bool,
    pub cpu_threshold_percent: f32,
    /// Consecutive hot + unhealthy samples before the guard trips
    pub unhealthy_samples: u32,
}

impl Default for OverloadGuardConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cpu_threshold_percent: 90.0,
            unhealthy_samples: 3,
        }
    }
}

/// Camera resource lock settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Persisted lock state older than this is cleared at startup if the
    /// kernel lock is free
    pub stale_after_secs: u64,
    pub acquire_timeout_secs: f64,
}

impl LockConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.acquire_timeout_secs.max(0.0)).unwrap_or_default()
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            stale_after_secs: 300,
            acquire_timeout_secs: 5.0,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_path: get_default_storage_path(),
            state_dir: get_default_state_dir(),
            quality_preset: QualityPreset::default(),
            cameras: vec![
                CameraConfig::new("0", "/dev/video0"),
                CameraConfig::new("1", "/dev/video2"),
            ],
            recording: RecordingPolicy::default(),
            health: HealthConfig::default(),
            overload_guard: OverloadGuardConfig::default(),
            lock: LockConfig::default(),
        }
    }
}

impl CameraConfig {
    pub fn new(id: &str, device: &str) -> Self {
        Self {
            id: id.to_string(),
            device: device.to_string(),
            width: default_width(),
            height: default_height(),
            fps: default_fps(),
            rotation: 0,
            crop: None,
        }
    }
}

impl Config {
    /// Load config from disk or return default
    pub fn load_or_default(path: &Path) -> Self {
        if path.exists() {
            match Self::load(path) {
                Ok(config) => return config,
                Err(e) => {
                    log::warn!("Failed to load config {}: {}", path.display(), e);
                }
            }
        }

        Self::default()
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Save config to disk
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;

        Ok(())
    }

    /// Reject configurations the orchestrator cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.cameras.is_empty() {
            return Err(Error::Configuration("no cameras configured".into()));
        }

        let mut seen = HashSet::new();
        for camera in &self.cameras {
            if camera.id.is_empty() || !is_safe_component(&camera.id) {
                return Err(Error::Configuration(format!(
                    "invalid camera id '{}'",
                    camera.id
                )));
            }
            if !seen.insert(camera.id.as_str()) {
                return Err(Error::Configuration(format!(
                    "duplicate camera id '{}'",
                    camera.id
                )));
            }
            if !matches!(camera.rotation, 0 | 90 | 180 | 270) {
                return Err(Error::Configuration(format!(
                    "camera {}: rotation must be 0, 90, 180 or 270 (got {})",
                    camera.id, camera.rotation
                )));
            }
        }

        let durations = [
            ("recording.recovery_backoff_secs", self.recording.recovery_backoff_secs),
            ("recording.recovery_backoff_cap_secs", self.recording.recovery_backoff_cap_secs),
            ("lock.acquire_timeout_secs", self.lock.acquire_timeout_secs),
        ];
        for (key, secs) in durations {
            if !secs.is_finite() || secs < 0.0 {
                return Err(Error::Configuration(format!(
                    "{} must be a finite, non-negative number of seconds (got {})",
                    key, secs
                )));
            }
        }

        if self.recording.stop_eos_timeout_secs == 0 {
            return Err(Error::Configuration(
                "recording.stop_eos_timeout_secs must be positive".into(),
            ));
        }

        Ok(())
    }

    pub fn lock_file_path(&self) -> PathBuf {
        self.state_dir.join("camera.lock")
    }

    pub fn lock_state_path(&self) -> PathBuf {
        self.state_dir.join("camera_lock.json")
    }

    pub fn session_state_path(&self) -> PathBuf {
        self.state_dir.join("recording_state.json")
    }
}

/// True if `name` can be used as a single path component
pub fn is_safe_component(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// Get the default storage path for recordings
fn get_default_storage_path() -> PathBuf {
    dirs::video_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join("Videos")))
        .unwrap_or_else(|| PathBuf::from("."))
        .join("matchcam")
}

fn get_default_state_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("matchcam")
}

/// Get the default config file path
pub fn get_default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("matchcam")
        .join("config.toml")
}

fn default_width() -> u32 {
    1920
}

fn default_height() -> u32 {
    1080
}

fn default_fps() -> u32 {
    30
}
