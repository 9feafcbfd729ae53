// Segment integrity probing
//
// The prober is an external collaborator: given a finished (or growing)
// segment it reports codec, frame rate, duration, size and bitrate, or an
// error. Results are cached per (path, mtime, size) so the health loop does
// not re-probe an unchanged file.

use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant, SystemTime};

use gstreamer as gst;
use gstreamer_pbutils as gst_pbutils;
use gstreamer_pbutils::prelude::DiscovererStreamInfoExt;
use serde::{Deserialize, Serialize};

use crate::config::{HealthConfig, ProberKind};
use crate::error::{Error, Result};

/// Metadata reported by a prober
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ProbeMetadata {
    pub codec_name: String,
    pub avg_frame_rate: Option<f64>,
    pub duration_secs: Option<f64>,
    pub size_bytes: Option<u64>,
    pub bit_rate: Option<u64>,
}

pub trait SegmentProber: Send + Sync {
    fn probe(&self, path: &Path) -> Result<ProbeMetadata>;
}

/// Verdict for one segment
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct SegmentIntegrity {
    pub path: Option<PathBuf>,
    /// A probe actually ran
    pub checked: bool,
    /// `None` when unchecked
    pub ok: Option<bool>,
    pub error: Option<String>,
    pub metadata: Option<ProbeMetadata>,
}

impl SegmentIntegrity {
    pub fn unchecked(path: Option<&Path>, reason: &str) -> Self {
        Self {
            path: path.map(Path::to_path_buf),
            checked: false,
            ok: None,
            error: Some(reason.to_string()),
            metadata: None,
        }
    }

    /// Run `prober` on `path` and judge the result
    pub fn probe(prober: &dyn SegmentProber, path: &Path) -> Self {
        match prober.probe(path) {
            Ok(metadata) => {
                let problem = if metadata.codec_name.is_empty() {
                    Some("no video stream".to_string())
                } else {
                    match metadata.duration_secs {
                        Some(d) if d > 0.0 => None,
                        Some(_) => Some("zero duration".to_string()),
                        None => Some("no duration (file not finalized?)".to_string()),
                    }
                };
                Self {
                    path: Some(path.to_path_buf()),
                    checked: true,
                    ok: Some(problem.is_none()),
                    error: problem,
                    metadata: Some(metadata),
                }
            }
            Err(Error::ProberUnavailable(reason)) => {
                log::warn!("Could not probe {}: {}", path.display(), reason);
                Self::unchecked(Some(path), &reason)
            }
            Err(e) => Self {
                path: Some(path.to_path_buf()),
                checked: true,
                ok: Some(false),
                error: Some(e.to_string()),
                metadata: None,
            },
        }
    }
}

/// Create the prober selected in the health config
pub fn prober_from_config(config: &HealthConfig) -> Box<dyn SegmentProber> {
    let timeout = Duration::from_secs(config.probe_timeout_secs.max(1));
    match config.prober {
        ProberKind::Ffprobe => Box::new(FfprobeProber::new(config.ffprobe_path.clone(), timeout)),
        ProberKind::Discoverer => Box::new(DiscovererProber::new(timeout)),
    }
}

// ============================================================================
// ffprobe subprocess
// ============================================================================

#[derive(Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    streams: Vec<FfprobeStream>,
    format: Option<FfprobeFormat>,
}

#[derive(Deserialize)]
struct FfprobeStream {
    codec_name: Option<String>,
    avg_frame_rate: Option<String>,
}

#[derive(Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
    size: Option<String>,
    bit_rate: Option<String>,
}

/// "30000/1001" -> 29.97; "0/0" -> None
fn parse_frame_rate(rate: &str) -> Option<f64> {
    let (num, den) = rate.split_once('/')?;
    let num: f64 = num.parse().ok()?;
    let den: f64 = den.parse().ok()?;
    if den == 0.0 {
        return None;
    }
    Some(num / den)
}

fn parse_ffprobe_json(stdout: &str) -> Result<ProbeMetadata> {
    let output: FfprobeOutput = serde_json::from_str(stdout)?;
    let stream = output.streams.into_iter().next();
    let format = output.format;

    Ok(ProbeMetadata {
        codec_name: stream
            .as_ref()
            .and_then(|s| s.codec_name.clone())
            .unwrap_or_default(),
        avg_frame_rate: stream
            .as_ref()
            .and_then(|s| s.avg_frame_rate.as_deref())
            .and_then(parse_frame_rate),
        duration_secs: format
            .as_ref()
            .and_then(|f| f.duration.as_deref())
            .and_then(|d| d.parse().ok()),
        size_bytes: format
            .as_ref()
            .and_then(|f| f.size.as_deref())
            .and_then(|s| s.parse().ok()),
        bit_rate: format
            .as_ref()
            .and_then(|f| f.bit_rate.as_deref())
            .and_then(|b| b.parse().ok()),
    })
}

/// Runs `ffprobe` with a hard timeout; the child is killed when it expires.
pub struct FfprobeProber {
    binary: PathBuf,
    timeout: Duration,
}

impl FfprobeProber {
    pub fn new(binary: PathBuf, timeout: Duration) -> Self {
        Self { binary, timeout }
    }
}

impl SegmentProber for FfprobeProber {
    fn probe(&self, path: &Path) -> Result<ProbeMetadata> {
        let integrity_error = |reason: String| Error::Integrity {
            path: path.display().to_string(),
            reason,
        };

        let mut child = Command::new(&self.binary)
            .args([
                "-v",
                "error",
                "-select_streams",
                "v:0",
                "-show_entries",
                "stream=codec_name,avg_frame_rate:format=duration,size,bit_rate",
                "-of",
                "json",
            ])
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                Error::ProberUnavailable(format!("failed to run {}: {}", self.binary.display(), e))
            })?;

        // Drain pipes on helper threads so a chatty child cannot block on a full pipe
        let stdout_reader = child.stdout.take().map(|mut out| {
            std::thread::spawn(move || {
                let mut buf = String::new();
                let _ = out.read_to_string(&mut buf);
                buf
            })
        });
        let stderr_reader = child.stderr.take().map(|mut err| {
            std::thread::spawn(move || {
                let mut buf = String::new();
                let _ = err.read_to_string(&mut buf);
                buf
            })
        });

        let deadline = Instant::now() + self.timeout;
        let status = loop {
            match child.try_wait()? {
                Some(status) => break status,
                None if Instant::now() >= deadline => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(integrity_error(format!(
                        "probe timed out after {:.1}s",
                        self.timeout.as_secs_f64()
                    )));
                }
                None => std::thread::sleep(Duration::from_millis(20)),
            }
        };

        let stdout = stdout_reader
            .and_then(|h| h.join().ok())
            .unwrap_or_default();
        let stderr = stderr_reader
            .and_then(|h| h.join().ok())
            .unwrap_or_default();

        if !status.success() {
            let detail = stderr.lines().next().unwrap_or("no output").trim().to_string();
            return Err(integrity_error(format!("ffprobe exited with {}: {}", status, detail)));
        }

        parse_ffprobe_json(&stdout)
            .map_err(|e| integrity_error(format!("unparsable ffprobe output: {}", e)))
    }
}

// ============================================================================
// GStreamer Discoverer
// ============================================================================

/// Probes with GStreamer's pbutils Discoverer, bounded by its own timeout.
pub struct DiscovererProber {
    timeout: Duration,
}

impl DiscovererProber {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl SegmentProber for DiscovererProber {
    fn probe(&self, path: &Path) -> Result<ProbeMetadata> {
        crate::gstreamer_init::init_gstreamer()
            .map_err(|e| Error::ProberUnavailable(format!("GStreamer unavailable: {}", e)))?;

        let discoverer = gst_pbutils::Discoverer::new(gst::ClockTime::from_nseconds(
            self.timeout.as_nanos() as u64,
        ))
        .map_err(|e| Error::ProberUnavailable(format!("no Discoverer: {}", e)))?;
        let uri = gst::glib::filename_to_uri(path, None)?;
        let info = discoverer.discover_uri(&uri)?;

        let mut metadata = ProbeMetadata {
            duration_secs: info
                .duration()
                .map(|d| d.nseconds() as f64 / 1_000_000_000.0),
            size_bytes: std::fs::metadata(path).ok().map(|m| m.len()),
            ..ProbeMetadata::default()
        };

        if let Some(video) = info.video_streams().first() {
            if let Some(caps) = video.caps() {
                if let Some(structure) = caps.structure(0) {
                    metadata.codec_name = structure
                        .name()
                        .as_str()
                        .replace("video/x-", "")
                        .replace("video/", "");
                }
            }
            let framerate = video.framerate();
            if framerate.denom() != 0 {
                metadata.avg_frame_rate =
                    Some(framerate.numer() as f64 / framerate.denom() as f64);
            }
            let bitrate = video.bitrate();
            if bitrate > 0 {
                metadata.bit_rate = Some(bitrate as u64);
            }
        }

        Ok(metadata)
    }
}

// ============================================================================
// Result cache
// ============================================================================

struct CacheEntry {
    modified: SystemTime,
    size: u64,
    probed_at: Instant,
    result: SegmentIntegrity,
}

/// Short-lived cache keyed by (path, mtime, size)
pub struct IntegrityCache {
    entries: HashMap<PathBuf, CacheEntry>,
    ttl: Duration,
}

impl IntegrityCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            ttl,
        }
    }

    pub fn get(&self, path: &Path, modified: SystemTime, size: u64) -> Option<SegmentIntegrity> {
        let entry = self.entries.get(path)?;
        if entry.modified == modified && entry.size == size && entry.probed_at.elapsed() < self.ttl
        {
            Some(entry.result.clone())
        } else {
            None
        }
    }

    pub fn insert(&mut self, path: &Path, modified: SystemTime, size: u64, result: SegmentIntegrity) {
        let ttl = self.ttl;
        self.entries.retain(|_, e| e.probed_at.elapsed() < ttl);
        self.entries.insert(
            path.to_path_buf(),
            CacheEntry {
                modified,
                size,
                probed_at: Instant::now(),
                result,
            },
        );
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
