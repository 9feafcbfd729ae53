// Per-camera health diagnostics
//
// Health checks only observe. Faults are repaired by the error-driven
// recovery path, never from here.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::integrity::{IntegrityCache, SegmentIntegrity, SegmentProber};
use super::overload::OverloadSnapshot;
use super::segments::{self, SegmentFile, SegmentId};
use crate::config::HealthConfig;
use crate::pipeline::{PipelineState, PipelineStatus};

/// Inputs for checking one camera, snapshotted from the session
#[derive(Debug, Clone)]
pub struct CameraCheck {
    pub camera_id: String,
    pub pipeline: Option<PipelineStatus>,
    pub camera_dir: PathBuf,
    pub degraded_reason: Option<String>,
    pub recovering: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CameraDiagnostics {
    pub healthy: bool,
    pub pipeline_present: bool,
    pub pipeline_state: Option<PipelineState>,
    pub pipeline_error: Option<String>,
    pub degraded: bool,
    pub recovering: bool,
    pub latest_segment: Option<String>,
    pub segment: Option<SegmentId>,
    pub segment_size_bytes: Option<u64>,
    pub segment_age_secs: Option<f64>,
    pub growing: Option<bool>,
    pub integrity: Option<SegmentIntegrity>,
    pub issues: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub healthy: bool,
    pub message: String,
    pub issues: Vec<String>,
    pub cameras: BTreeMap<String, CameraDiagnostics>,
    pub cpu_percent: Option<f32>,
    pub overload_guard: Option<OverloadSnapshot>,
    pub checked_at: DateTime<Utc>,
}

impl HealthReport {
    pub fn not_recording() -> Self {
        Self {
            healthy: true,
            message: "not recording".into(),
            issues: Vec::new(),
            cameras: BTreeMap::new(),
            cpu_percent: None,
            overload_guard: None,
            checked_at: Utc::now(),
        }
    }

    pub fn from_cameras(cameras: BTreeMap<String, CameraDiagnostics>) -> Self {
        let issues: Vec<String> = cameras
            .iter()
            .flat_map(|(id, diag)| diag.issues.iter().map(move |issue| format!("cam{}: {}", id, issue)))
            .collect();
        let healthy = issues.is_empty();
        let message = if healthy {
            format!("all {} cameras healthy", cameras.len())
        } else {
            let unhealthy = cameras.values().filter(|d| !d.healthy).count();
            format!("{} of {} cameras unhealthy", unhealthy, cameras.len())
        };
        Self {
            healthy,
            message,
            issues,
            cameras,
            cpu_percent: None,
            overload_guard: None,
            checked_at: Utc::now(),
        }
    }
}

/// Observation of the newest segment against what was seen before
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentObservation {
    /// Highest id previously seen, when the newest one is lower
    pub regressed_from: Option<SegmentId>,
    pub growing: bool,
}

/// Remembers the newest segment seen for one camera
#[derive(Debug, Default)]
pub struct SegmentTracker {
    highest: Option<SegmentId>,
    last_path: Option<PathBuf>,
    last_size: Option<u64>,
}

impl SegmentTracker {
    pub fn observe(&mut self, segment: &SegmentFile) -> SegmentObservation {
        let regressed_from = match self.highest {
            Some(highest) if segment.id < highest => Some(highest),
            _ => {
                self.highest = Some(segment.id);
                None
            }
        };

        let same_file = self.last_path.as_deref() == Some(segment.path.as_path());
        let growing = !same_file || self.last_size.is_some_and(|size| segment.size_bytes > size);

        self.last_path = Some(segment.path.clone());
        self.last_size = Some(segment.size_bytes);

        SegmentObservation {
            regressed_from,
            growing,
        }
    }

    pub fn highest(&self) -> Option<SegmentId> {
        self.highest
    }
}

fn age_of(modified: SystemTime) -> Duration {
    SystemTime::now()
        .duration_since(modified)
        .unwrap_or(Duration::ZERO)
}

/// Segment trackers and probe cache for the active session
pub struct HealthMonitor {
    config: HealthConfig,
    trackers: HashMap<String, SegmentTracker>,
    cache: IntegrityCache,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig) -> Self {
        let ttl = Duration::from_secs(config.probe_cache_ttl_secs);
        Self {
            config,
            trackers: HashMap::new(),
            cache: IntegrityCache::new(ttl),
        }
    }

    pub fn reset(&mut self) {
        self.trackers.clear();
        self.cache.clear();
    }

    pub fn check_camera(
        &mut self,
        check: &CameraCheck,
        session_elapsed: Duration,
        prober: &dyn SegmentProber,
    ) -> CameraDiagnostics {
        let mut issues = Vec::new();
        let stale_after = Duration::from_secs(self.config.stale_segment_secs);

        if let Some(reason) = &check.degraded_reason {
            issues.push(format!("degraded: {}", reason));
        } else if check.recovering {
            issues.push("recovery in progress".to_string());
        } else {
            match &check.pipeline {
                None => issues.push("pipeline missing".to_string()),
                Some(status) if status.state != PipelineState::Running => {
                    let mut issue = format!("pipeline {}", status.state.as_str());
                    if let Some(error) = &status.error_message {
                        issue.push_str(&format!(": {}", error));
                    }
                    issues.push(issue);
                }
                Some(_) => {}
            }
        }

        let all_segments = segments::list_segments(&check.camera_dir);
        let mut diag = CameraDiagnostics {
            healthy: false,
            pipeline_present: check.pipeline.is_some(),
            pipeline_state: check.pipeline.as_ref().map(|p| p.state),
            pipeline_error: check.pipeline.as_ref().and_then(|p| p.error_message.clone()),
            degraded: check.degraded_reason.is_some(),
            recovering: check.recovering,
            latest_segment: None,
            segment: None,
            segment_size_bytes: None,
            segment_age_secs: None,
            growing: None,
            integrity: None,
            issues: Vec::new(),
        };

        match segments::newest(&all_segments) {
            None => {
                if session_elapsed >= stale_after && check.degraded_reason.is_none() {
                    issues.push(format!(
                        "no segments written after {}s",
                        session_elapsed.as_secs()
                    ));
                }
            }
            Some(latest) => {
                let tracker = self.trackers.entry(check.camera_id.clone()).or_default();
                let observation = tracker.observe(latest);
                let age = age_of(latest.modified);

                if let Some(previous) = observation.regressed_from {
                    log::warn!(
                        "Camera {} segment index regressed from {} to {}",
                        check.camera_id,
                        previous,
                        latest.id
                    );
                    issues.push(format!(
                        "segment index regressed from {} to {}",
                        previous, latest.id
                    ));
                }
                if age > stale_after && check.degraded_reason.is_none() {
                    issues.push(format!(
                        "latest segment not updated for {}s",
                        age.as_secs()
                    ));
                }

                diag.latest_segment = latest
                    .path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned());
                diag.segment = Some(latest.id);
                diag.segment_size_bytes = Some(latest.size_bytes);
                diag.segment_age_secs = Some(age.as_secs_f64());
                diag.growing = Some(observation.growing);
            }
        }

        if let Some(integrity) = self.probe_stable_segment(&all_segments, prober) {
            if integrity.ok == Some(false) {
                issues.push(format!(
                    "integrity check failed: {}",
                    integrity.error.as_deref().unwrap_or("unknown error")
                ));
            }
            diag.integrity = Some(integrity);
        }

        diag.healthy = issues.is_empty();
        diag.issues = issues;
        diag
    }

    /// Probe the newest segment that is big enough and has not changed for
    /// the minimum age, using the cache when the file is unchanged.
    fn probe_stable_segment(
        &mut self,
        all_segments: &[SegmentFile],
        prober: &dyn SegmentProber,
    ) -> Option<SegmentIntegrity> {
        let min_stable = Duration::from_secs(self.config.probe_min_stable_secs);
        let candidate = all_segments
            .iter()
            .filter(|s| {
                s.size_bytes >= self.config.probe_min_bytes && age_of(s.modified) >= min_stable
            })
            .max_by_key(|s| (s.modified, s.id))?;

        if let Some(cached) = self
            .cache
            .get(&candidate.path, candidate.modified, candidate.size_bytes)
        {
            return Some(cached);
        }

        let result = SegmentIntegrity::probe(prober, &candidate.path);
        self.cache.insert(
            &candidate.path,
            candidate.modified,
            candidate.size_bytes,
            result.clone(),
        );
        Some(result)
    }
}
