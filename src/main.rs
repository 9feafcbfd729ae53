//! Matchcam command line
//!
//! Composition root: builds the GStreamer pipeline runtime, the description
//! builder and the segment prober, and drives a recording session through
//! the capture service.
//!
//! Usage:
//!   matchcam record --match-id <id> [--duration <secs>] [--force] [--process]
//!   matchcam status
//!   matchcam release-lock --holder <name>
//!   matchcam config

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use crossbeam_channel::RecvTimeoutError;

use matchcam::config::{self, Config};
use matchcam::pipeline::{GstDescriptionBuilder, PipelineRuntime};
use matchcam::recording::{prober_from_config, Collaborators, SegmentProber};
use matchcam::resource_lock::ResourceLock;
use matchcam::service::CaptureService;
use matchcam::session::SessionStore;

/// Multi-camera match recorder
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// Config file (defaults to the user config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Debug logging
    #[arg(long, global = true, default_value_t = false)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Record a match until the duration elapses or Enter is pressed
    Record {
        #[arg(long)]
        match_id: String,
        /// Stop automatically after this many seconds
        #[arg(long)]
        duration: Option<u64>,
        /// Take over the cameras and bypass the stop protection window
        #[arg(long, default_value_t = false)]
        force: bool,
        /// Queue post-processing once the recording stops
        #[arg(long, default_value_t = false)]
        process: bool,
        /// Seconds between health checks
        #[arg(long, default_value_t = 10)]
        health_interval: u64,
    },
    /// Print the persisted camera lock and session state
    Status,
    /// Clear a lock record whose holder no longer owns the kernel lock
    ReleaseLock {
        #[arg(long)]
        holder: String,
    },
    /// Print the effective configuration
    Config,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();

    let config_path = cli.config.unwrap_or_else(config::get_default_config_path);
    let config = Config::load_or_default(&config_path);
    log::debug!("Using config {}", config_path.display());

    match cli.command {
        Command::Record {
            match_id,
            duration,
            force,
            process,
            health_interval,
        } => record(
            config,
            &match_id,
            duration.map(Duration::from_secs),
            force,
            process,
            Duration::from_secs(health_interval.max(1)),
        ),
        Command::Status => status(&config),
        Command::ReleaseLock { holder } => release_lock(&config, &holder),
        Command::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn record(
    config: Config,
    match_id: &str,
    duration: Option<Duration>,
    force: bool,
    process: bool,
    health_interval: Duration,
) -> anyhow::Result<()> {
    let runtime = Arc::new(PipelineRuntime::new().context("pipeline runtime unavailable")?);
    let prober: Arc<dyn SegmentProber> = Arc::from(prober_from_config(&config.health));
    let collaborators = Collaborators::new(runtime, Arc::new(GstDescriptionBuilder::new()), prober);
    let service = CaptureService::new(config, collaborators)?;

    let started = service.start_recording(match_id, force, process);
    println!("{}", serde_json::to_string_pretty(&started)?);
    if !started.success {
        bail!("{}", started.message);
    }

    // Enter on stdin stops the recording early
    let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
    std::thread::Builder::new()
        .name("matchcam-stdin".into())
        .spawn(move || {
            let mut line = String::new();
            // EOF drops the sender instead of stopping
            if matches!(std::io::stdin().read_line(&mut line), Ok(n) if n > 0) {
                let _ = stop_tx.send(());
            }
        })
        .context("failed to spawn stdin reader")?;

    let deadline = duration.map(|d| Instant::now() + d);
    loop {
        let wait = match deadline {
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                health_interval.min(deadline - now)
            }
            None => health_interval,
        };

        match stop_rx.recv_timeout(wait) {
            Ok(()) => break,
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                if deadline.is_none() {
                    log::warn!("stdin closed and no --duration given, stopping");
                    break;
                }
                std::thread::sleep(wait);
            }
        }

        let health = service.check_health();
        log::info!("Health: {}", health.message);
    }

    let stopped = service.stop_recording(true);
    println!("{}", serde_json::to_string_pretty(&stopped)?);

    // Let a queued manifest job finish before the process exits
    while service.orchestrator().pending_post_processing() > 0 {
        std::thread::sleep(Duration::from_millis(100));
    }

    if !stopped.success {
        bail!("{}", stopped.message);
    }
    Ok(())
}

fn status(config: &Config) -> anyhow::Result<()> {
    let lock = ResourceLock::from_config(config)?;
    let session = SessionStore::new(&config.session_state_path()).load();

    let report = serde_json::json!({
        "camera_lock": lock.current_state(),
        "session": session,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn release_lock(config: &Config, holder: &str) -> anyhow::Result<()> {
    let lock = ResourceLock::from_config(config)?;
    let state = lock.current_state();

    if state.is_idle() {
        println!("Camera lock is already idle");
        return Ok(());
    }
    if state.holder.as_deref() != Some(holder) {
        bail!(
            "camera lock is held by {} ({}), not {}",
            state.holder.as_deref().unwrap_or("unknown"),
            state.mode,
            holder
        );
    }

    // Only succeeds when the recorded owner no longer holds the kernel lock
    let timeout = config.lock.acquire_timeout();
    if !lock.acquire(state.mode, holder, false, timeout) || !lock.release(holder) {
        bail!("camera lock is still held by pid {}", state.pid);
    }
    println!("Released camera lock held by {}", holder);
    Ok(())
}
