//! System-wide camera resource lock
//!
//! Only one mode (preview, recording or calibration) may drive the camera
//! hardware at a time. Correctness comes from an exclusive advisory lock on
//! `camera.lock`, which the kernel drops when the holding process dies. The
//! owner is mirrored into `camera_lock.json` (written atomically) so other
//! processes can see who holds the cameras without taking the lock.
//!
//! A crashed holder leaves the JSON record behind, so [`ResourceLock::open`]
//! sweeps records whose kernel lock is free and whose PID is gone or whose
//! age exceeds the staleness threshold.

use std::fs::{File, OpenOptions, TryLockError};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sysinfo::{Pid, ProcessesToUpdate, System};

use crate::config::Config;
use crate::error::Result;
use crate::fsutil;

const INITIAL_BACKOFF: Duration = Duration::from_millis(25);
const MAX_BACKOFF: Duration = Duration::from_millis(500);
const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LockMode {
    Idle,
    Preview,
    Recording,
    Calibration,
}

impl std::fmt::Display for LockMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LockMode::Idle => "idle",
            LockMode::Preview => "preview",
            LockMode::Recording => "recording",
            LockMode::Calibration => "calibration",
        };
        f.write_str(name)
    }
}

/// Persisted lock owner, as found in `camera_lock.json`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LockState {
    pub mode: LockMode,
    pub holder: Option<String>,
    pub lock_time: Option<DateTime<Utc>>,
    pub pid: u32,
}

impl LockState {
    pub fn idle() -> Self {
        Self {
            mode: LockMode::Idle,
            holder: None,
            lock_time: None,
            pid: std::process::id(),
        }
    }

    pub fn is_idle(&self) -> bool {
        self.mode == LockMode::Idle
    }

    fn age(&self) -> Option<Duration> {
        let lock_time = self.lock_time?;
        (Utc::now() - lock_time).to_std().ok()
    }
}

/// What this process currently holds
struct Held {
    file: File,
    mode: LockMode,
    holder: String,
}

pub struct ResourceLock {
    lock_path: PathBuf,
    state_path: PathBuf,
    stale_after: Duration,
    held: Mutex<Option<Held>>,
}

impl ResourceLock {
    /// Open the lock files and clear any stale record left by a dead holder.
    pub fn open(lock_path: &Path, state_path: &Path, stale_after: Duration) -> Result<Self> {
        for path in [lock_path, state_path] {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let lock = Self {
            lock_path: lock_path.to_path_buf(),
            state_path: state_path.to_path_buf(),
            stale_after,
            held: Mutex::new(None),
        };
        lock.sweep_stale()?;
        Ok(lock)
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::open(
            &config.lock_file_path(),
            &config.lock_state_path(),
            Duration::from_secs(config.lock.stale_after_secs),
        )
    }

    /// Try to take the camera hardware for `mode` on behalf of `holder`.
    ///
    /// Re-acquiring with the same mode and holder is a no-op success. A
    /// different in-process holder is only displaced with `force`. Contention
    /// with another process is retried with backoff until `timeout`.
    pub fn acquire(&self, mode: LockMode, holder: &str, force: bool, timeout: Duration) -> bool {
        if mode == LockMode::Idle {
            log::warn!("Refusing to acquire camera lock in idle mode");
            return false;
        }

        let deadline = Instant::now() + timeout;
        let mut backoff = INITIAL_BACKOFF;
        loop {
            // Re-checked on every attempt; another thread may have taken it
            let mut held = self.held.lock();

            if let Some(current) = held.as_mut() {
                if current.mode == mode && current.holder == holder {
                    log::debug!("Camera lock already held by {} ({})", holder, mode);
                    return true;
                }
                if !force {
                    log::info!(
                        "Camera lock request from {} ({}) rejected: held by {} ({})",
                        holder,
                        mode,
                        current.holder,
                        current.mode
                    );
                    return false;
                }

                log::warn!(
                    "Forcing camera lock from {} ({}) to {} ({})",
                    current.holder,
                    current.mode,
                    holder,
                    mode
                );
                current.mode = mode;
                current.holder = holder.to_string();
                if let Err(e) = self.write_state(mode, Some(holder)) {
                    log::error!("Failed to persist camera lock state: {}", e);
                }
                return true;
            }

            match self.try_kernel_lock() {
                Ok(Some(file)) => return self.take_ownership(&mut *held, file, mode, holder),
                Ok(None) => {}
                Err(e) => {
                    log::error!("Camera lock file {} unusable: {}", self.lock_path.display(), e);
                    return false;
                }
            }
            drop(held);

            let now = Instant::now();
            if now >= deadline {
                let state = self.current_state();
                log::info!(
                    "Camera lock request from {} ({}) timed out: held by {} ({}) in pid {}",
                    holder,
                    mode,
                    state.holder.as_deref().unwrap_or("unknown"),
                    state.mode,
                    state.pid
                );
                return false;
            }
            std::thread::sleep(backoff.min(deadline - now));
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    fn take_ownership(
        &self,
        held: &mut Option<Held>,
        file: File,
        mode: LockMode,
        holder: &str,
    ) -> bool {
        // Holding the kernel lock means whoever wrote a non-idle record is gone
        let previous = self.current_state();
        if !previous.is_idle() {
            log::warn!(
                "Clearing stale camera lock record: {} ({}) from pid {}",
                previous.holder.as_deref().unwrap_or("unknown"),
                previous.mode,
                previous.pid
            );
        }

        if let Err(e) = self.write_state(mode, Some(holder)) {
            log::error!("Failed to persist camera lock state: {}", e);
            let _ = file.unlock();
            return false;
        }

        log::info!("Camera lock acquired by {} ({})", holder, mode);
        *held = Some(Held {
            file,
            mode,
            holder: holder.to_string(),
        });
        true
    }

    /// Release the lock. Only the recorded holder may release; the state
    /// always returns to idle.
    pub fn release(&self, holder: &str) -> bool {
        let mut held = self.held.lock();

        let current = held.as_ref().map(|h| (h.holder.clone(), h.mode));
        match current {
            Some((current_holder, current_mode)) if current_holder != holder => {
                log::warn!(
                    "Camera lock release by {} rejected: held by {} ({})",
                    holder,
                    current_holder,
                    current_mode
                );
                false
            }
            Some(_) => {
                if let Err(e) = self.write_state(LockMode::Idle, None) {
                    log::error!("Failed to persist camera lock state: {}", e);
                }
                if let Some(current) = held.take() {
                    let _ = current.file.unlock();
                }
                log::info!("Camera lock released by {}", holder);
                true
            }
            None => {
                let state = self.current_state();
                if state.is_idle() {
                    return true;
                }
                // Left behind by an earlier instance in this process
                if state.holder.as_deref() == Some(holder) && state.pid == std::process::id() {
                    if let Err(e) = self.write_state(LockMode::Idle, None) {
                        log::error!("Failed to persist camera lock state: {}", e);
                        return false;
                    }
                    log::info!("Cleared leftover camera lock record for {}", holder);
                    return true;
                }
                log::warn!(
                    "Camera lock release by {} rejected: held by {} ({}) in pid {}",
                    holder,
                    state.holder.as_deref().unwrap_or("unknown"),
                    state.mode,
                    state.pid
                );
                false
            }
        }
    }

    /// Read-only: true if the cameras are free or already held for `mode`.
    pub fn check_lock(&self, mode: LockMode) -> bool {
        let state = self.current_state();
        state.is_idle() || state.mode == mode
    }

    /// Poll the persisted state until it reads idle or `timeout` passes.
    pub fn wait_for_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.current_state().is_idle() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            std::thread::sleep(IDLE_POLL_INTERVAL.min(deadline - now));
        }
    }

    /// Current persisted owner. Unreadable state reads as idle.
    pub fn current_state(&self) -> LockState {
        match fsutil::read_json::<LockState>(&self.state_path) {
            Ok(Some(state)) => state,
            Ok(None) => LockState::idle(),
            Err(e) => {
                log::warn!(
                    "Unreadable camera lock state {}: {}",
                    self.state_path.display(),
                    e
                );
                LockState::idle()
            }
        }
    }

    /// The mode and holder held by this process, if any
    pub fn held_by_this_process(&self) -> Option<(LockMode, String)> {
        self.held
            .lock()
            .as_ref()
            .map(|h| (h.mode, h.holder.clone()))
    }

    fn try_kernel_lock(&self) -> std::io::Result<Option<File>> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&self.lock_path)?;

        match file.try_lock() {
            Ok(()) => Ok(Some(file)),
            Err(TryLockError::WouldBlock) => Ok(None),
            Err(TryLockError::Error(e)) => Err(e),
        }
    }

    fn write_state(&self, mode: LockMode, holder: Option<&str>) -> Result<()> {
        let state = if mode == LockMode::Idle {
            LockState::idle()
        } else {
            LockState {
                mode,
                holder: holder.map(str::to_string),
                lock_time: Some(Utc::now()),
                pid: std::process::id(),
            }
        };
        fsutil::write_json_atomic(&self.state_path, &state)
    }

    fn sweep_stale(&self) -> Result<()> {
        let state = self.current_state();
        if state.is_idle() {
            return Ok(());
        }

        // A live holder always owns the kernel lock
        match self.try_kernel_lock() {
            Ok(Some(file)) => {
                let _ = file.unlock();
            }
            Ok(None) => return Ok(()),
            Err(e) => {
                log::warn!("Cannot probe camera lock file: {}", e);
                return Ok(());
            }
        }

        let reason = if !process_alive(state.pid) {
            Some(format!("holder pid {} is not running", state.pid))
        } else {
            match state.age() {
                Some(age) if age > self.stale_after => {
                    Some(format!("record is {}s old", age.as_secs()))
                }
                None => Some("record has no lock time".to_string()),
                _ => None,
            }
        };

        if let Some(reason) = reason {
            log::warn!(
                "Clearing stale camera lock held by {} ({}): {}",
                state.holder.as_deref().unwrap_or("unknown"),
                state.mode,
                reason
            );
            self.write_state(LockMode::Idle, None)?;
        }
        Ok(())
    }
}

impl Drop for ResourceLock {
    fn drop(&mut self) {
        if let Some(held) = self.held.lock().take() {
            log::info!("Releasing camera lock held by {} on shutdown", held.holder);
            if let Err(e) = self.write_state(LockMode::Idle, None) {
                log::error!("Failed to persist camera lock state: {}", e);
            }
            let _ = held.file.unlock();
        }
    }
}

/// True if a process with this PID exists
pub fn process_alive(pid: u32) -> bool {
    if pid == std::process::id() {
        return true;
    }
    let pid = Pid::from_u32(pid);
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    sys.process(pid).is_some()
}
