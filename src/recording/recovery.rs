// Per-camera fault recovery bookkeeping

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::RecordingPolicy;

/// What to do with a freshly reported camera fault
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultDecision {
    /// A recovery for this camera is already in flight
    AlreadyRecovering,
    /// The camera is degraded for the rest of the session
    AlreadyFailed,
    /// Rebuild after `delay`; `attempt` is 1-based
    Retry { attempt: u32, delay: Duration },
    /// Attempts exhausted: mark permanently failed
    GiveUp,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CameraRecoveryState {
    pub attempts: u32,
    pub recovering: bool,
    pub last_error: Option<String>,
    pub last_recovery_ts: Option<DateTime<Utc>>,
    pub failed_permanently: bool,
    /// Last time the camera was (re)started cleanly
    #[serde(skip)]
    healthy_since: Option<Instant>,
}

impl CameraRecoveryState {
    pub fn started(now: Instant) -> Self {
        Self {
            healthy_since: Some(now),
            ..Self::default()
        }
    }

    /// Record a fault and decide on a response.
    ///
    /// Attempts are forgiven once the camera has run fault-free for the
    /// policy's reset window.
    pub fn on_fault(&mut self, error: &str, policy: &RecordingPolicy, now: Instant) -> FaultDecision {
        if self.failed_permanently {
            return FaultDecision::AlreadyFailed;
        }
        if self.recovering {
            return FaultDecision::AlreadyRecovering;
        }

        let window = Duration::from_secs(policy.recovery_reset_secs);
        if self.attempts > 0
            && self
                .healthy_since
                .is_some_and(|since| now.saturating_duration_since(since) >= window)
        {
            log::debug!("Fault-free for {}s, forgiving {} attempt(s)", window.as_secs(), self.attempts);
            self.attempts = 0;
        }

        self.last_error = Some(error.to_string());
        self.healthy_since = None;

        if self.attempts >= policy.max_recovery_attempts {
            self.failed_permanently = true;
            return FaultDecision::GiveUp;
        }

        self.attempts += 1;
        self.recovering = true;
        FaultDecision::Retry {
            attempt: self.attempts,
            delay: policy.backoff_for(self.attempts),
        }
    }

    pub fn on_recovered(&mut self, now: Instant) {
        self.recovering = false;
        self.last_error = None;
        self.last_recovery_ts = Some(Utc::now());
        self.healthy_since = Some(now);
    }

    pub fn on_recovery_failed(&mut self, error: &str) {
        self.recovering = false;
        self.failed_permanently = true;
        self.last_error = Some(error.to_string());
        self.last_recovery_ts = Some(Utc::now());
    }
}
