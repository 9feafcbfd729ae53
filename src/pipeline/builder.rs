//! Pipeline description builder
//!
//! Turns a camera configuration and quality preset into a `gst-launch`
//! style description string. The runtime treats the string as opaque; the
//! orchestrator only ever sees it through [`DescriptionBuilder`], so tests can
//! substitute a builder that never touches GStreamer.
//!
//! Graph shape:
//!
//! ```text
//! source ! caps ! [videocrop] ! [videoflip] ! videoconvert ! x264enc ! h264parse
//!        ! splitmuxsink (matroskamux, rotates every segment_duration)
//! ```

use std::path::PathBuf;
use std::time::Duration;

use crate::config::{CameraConfig, QualityPreset};
use crate::error::{Error, Result};

/// Everything needed to describe one camera's recording pipeline
#[derive(Debug, Clone)]
pub struct PipelineRequest<'a> {
    pub camera: &'a CameraConfig,
    pub quality: QualityPreset,
    /// printf-style segment location, e.g. `.../segment_r01_%05d.mkv`
    pub output_pattern: PathBuf,
    pub segment_duration: Duration,
}

pub trait DescriptionBuilder: Send + Sync {
    fn build(&self, request: &PipelineRequest<'_>) -> Result<String>;
}

/// Encoder parameters for a quality preset
struct EncoderSettings {
    bitrate_kbps: u32,
    speed_preset: &'static str,
    key_int_max: u32,
}

fn encoder_settings(quality: QualityPreset, fps: u32) -> EncoderSettings {
    // Keyframe every two seconds so segments split cleanly
    let key_int_max = fps.max(1) * 2;
    match quality {
        QualityPreset::Low => EncoderSettings {
            bitrate_kbps: 4_000,
            speed_preset: "ultrafast",
            key_int_max,
        },
        QualityPreset::Medium => EncoderSettings {
            bitrate_kbps: 8_000,
            speed_preset: "superfast",
            key_int_max,
        },
        QualityPreset::High => EncoderSettings {
            bitrate_kbps: 14_000,
            speed_preset: "veryfast",
            key_int_max,
        },
    }
}

/// `videoflip` method for a clockwise rotation
fn flip_method(rotation: u16) -> Option<&'static str> {
    match rotation {
        90 => Some("clockwise"),
        180 => Some("rotate-180"),
        270 => Some("counterclockwise"),
        _ => None,
    }
}

/// Builds descriptions for `v4l2src` cameras (or `videotestsrc` when the
/// device is `"test"`).
#[derive(Debug, Clone, Default)]
pub struct GstDescriptionBuilder;

impl GstDescriptionBuilder {
    pub fn new() -> Self {
        Self
    }

    fn source(camera: &CameraConfig) -> String {
        if camera.device == "test" {
            "videotestsrc is-live=true pattern=ball".to_string()
        } else {
            format!("v4l2src device=\"{}\" do-timestamp=true", camera.device)
        }
    }
}

impl DescriptionBuilder for GstDescriptionBuilder {
    fn build(&self, request: &PipelineRequest<'_>) -> Result<String> {
        let camera = request.camera;
        if camera.width == 0 || camera.height == 0 || camera.fps == 0 {
            return Err(Error::Configuration(format!(
                "camera {}: width, height and fps must be positive",
                camera.id
            )));
        }

        let location = request
            .output_pattern
            .to_str()
            .ok_or_else(|| {
                Error::Configuration(format!(
                    "camera {}: output path is not valid UTF-8",
                    camera.id
                ))
            })?
            .replace('\\', "/");

        let encoder = encoder_settings(request.quality, camera.fps);
        let mut parts = vec![
            Self::source(camera),
            format!(
                "video/x-raw,width={},height={},framerate={}/1",
                camera.width, camera.height, camera.fps
            ),
            "queue max-size-buffers=8 leaky=downstream".to_string(),
        ];

        if let Some(crop) = camera.crop {
            parts.push(format!(
                "videocrop left={} right={} top={} bottom={}",
                crop.left, crop.right, crop.top, crop.bottom
            ));
        }
        if let Some(method) = flip_method(camera.rotation) {
            parts.push(format!("videoflip method={}", method));
        }

        parts.push("videoconvert".to_string());
        parts.push(format!(
            "x264enc bitrate={} speed-preset={} tune=zerolatency key-int-max={}",
            encoder.bitrate_kbps, encoder.speed_preset, encoder.key_int_max
        ));
        parts.push("h264parse".to_string());
        parts.push(format!(
            "splitmuxsink name=mux muxer-factory=matroskamux location=\"{}\" max-size-time={}",
            location,
            request.segment_duration.as_nanos()
        ));

        Ok(parts.join(" ! "))
    }
}
