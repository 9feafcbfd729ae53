// Persisted recording-session state (survives service restarts)

use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::fsutil;

/// On-disk form of `recording_state.json`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionStateFile {
    pub recording: bool,
    pub match_id: Option<String>,
    /// Unix epoch seconds
    pub start_time: Option<f64>,
    #[serde(default)]
    pub process_after_recording: bool,
    /// Unix epoch seconds of the last write
    pub timestamp: f64,
}

impl SessionStateFile {
    pub fn idle() -> Self {
        Self {
            recording: false,
            match_id: None,
            start_time: None,
            process_after_recording: false,
            timestamp: epoch_secs(Utc::now()),
        }
    }

    pub fn active(match_id: &str, start_time: DateTime<Utc>, process_after_recording: bool) -> Self {
        Self {
            recording: true,
            match_id: Some(match_id.to_string()),
            start_time: Some(epoch_secs(start_time)),
            process_after_recording,
            timestamp: epoch_secs(Utc::now()),
        }
    }

    pub fn start_datetime(&self) -> Option<DateTime<Utc>> {
        let secs = self.start_time?;
        let whole = secs.floor();
        let nanos = ((secs - whole) * 1_000_000_000.0) as u32;
        Utc.timestamp_opt(whole as i64, nanos).single()
    }
}

pub fn epoch_secs(time: DateTime<Utc>) -> f64 {
    time.timestamp_millis() as f64 / 1000.0
}

/// Reads and atomically rewrites the session state file
#[derive(Debug, Clone)]
pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn save(&self, state: &SessionStateFile) -> Result<()> {
        fsutil::write_json_atomic(&self.path, state)
    }

    /// Missing or unreadable files load as `None`
    pub fn load(&self) -> Option<SessionStateFile> {
        match fsutil::read_json(&self.path) {
            Ok(state) => state,
            Err(e) => {
                log::warn!("Ignoring unreadable session state {}: {}", self.path.display(), e);
                None
            }
        }
    }

    pub fn clear(&self) -> Result<()> {
        self.save(&SessionStateFile::idle())
    }
}
