// CPU overload guard
//
// Trips after N consecutive samples above the threshold that coincide with
// unhealthy camera checks. Any healthy sample clears it.

use parking_lot::Mutex;
use serde::Serialize;
use sysinfo::System;

use crate::config::OverloadGuardConfig;

/// Source of whole-system CPU usage in percent
pub trait CpuSampler: Send + Sync {
    fn sample(&self) -> Option<f32>;
}

/// Reads global CPU usage through sysinfo. The first sample after
/// construction is primed, so it may read low.
pub struct SysinfoCpuSampler {
    system: Mutex<System>,
}

impl SysinfoCpuSampler {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu_usage();
        Self {
            system: Mutex::new(system),
        }
    }
}

impl Default for SysinfoCpuSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuSampler for SysinfoCpuSampler {
    fn sample(&self) -> Option<f32> {
        let mut system = self.system.lock();
        system.refresh_cpu_usage();
        let usage = system.global_cpu_usage();
        usage.is_finite().then_some(usage)
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct OverloadSnapshot {
    pub enabled: bool,
    pub active: bool,
    pub consecutive_unhealthy: u32,
    pub last_cpu_percent: Option<f32>,
    pub threshold_percent: f32,
}

#[derive(Debug, Clone)]
pub struct OverloadGuard {
    enabled: bool,
    threshold_percent: f32,
    required: u32,
    streak: u32,
    active: bool,
    last_cpu: Option<f32>,
}

impl OverloadGuard {
    pub fn new(config: &OverloadGuardConfig) -> Self {
        Self {
            enabled: config.enabled,
            threshold_percent: config.cpu_threshold_percent,
            required: config.unhealthy_samples.max(1),
            streak: 0,
            active: false,
            last_cpu: None,
        }
    }

    /// Feed one health-check sample. Returns true when this sample tripped
    /// the guard.
    pub fn observe(&mut self, cpu_percent: Option<f32>, healthy: bool) -> bool {
        self.last_cpu = cpu_percent;
        if !self.enabled {
            return false;
        }

        let overloaded = cpu_percent.is_some_and(|cpu| cpu >= self.threshold_percent);
        if healthy || !overloaded {
            if self.active {
                log::info!("Overload guard cleared");
            }
            self.streak = 0;
            self.active = false;
            return false;
        }

        self.streak += 1;
        if !self.active && self.streak >= self.required {
            self.active = true;
            log::warn!(
                "Overload guard tripped: CPU {:.0}% for {} unhealthy checks",
                cpu_percent.unwrap_or_default(),
                self.streak
            );
            return true;
        }
        false
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn reset(&mut self) {
        self.streak = 0;
        self.active = false;
        self.last_cpu = None;
    }

    pub fn snapshot(&self) -> OverloadSnapshot {
        OverloadSnapshot {
            enabled: self.enabled,
            active: self.active,
            consecutive_unhealthy: self.streak,
            last_cpu_percent: self.last_cpu,
            threshold_percent: self.threshold_percent,
        }
    }
}
