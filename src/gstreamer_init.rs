//! GStreamer initialization
//!
//! The pipeline runtime, the description builder's element checks and the
//! Discoverer-based prober all need `gst::init()` to have run. Calling it
//! through here logs the outcome once per process.

use std::sync::OnceLock;

static GSTREAMER_INIT: OnceLock<Result<(), String>> = OnceLock::new();

/// Initialize GStreamer once, returning the (cached) outcome.
pub fn init_gstreamer() -> Result<(), String> {
    GSTREAMER_INIT
        .get_or_init(|| match gstreamer::init() {
            Ok(_) => {
                log::info!("GStreamer initialized successfully");
                log_gstreamer_version();
                Ok(())
            }
            Err(e) => {
                log::error!("Failed to initialize GStreamer: {}", e);
                log::error!("Camera pipelines will not be available");
                Err(e.to_string())
            }
        })
        .clone()
}

fn log_gstreamer_version() {
    let (major, minor, micro, nano) = gstreamer::version();
    let nano_str = match nano {
        0 => String::new(),
        1 => " (CVS)".to_string(),
        2 => " (prerelease)".to_string(),
        _ => format!(" (nano: {})", nano),
    };
    log::info!("GStreamer version: {}.{}.{}{}", major, minor, micro, nano_str);
}

/// Check if GStreamer is available and properly configured
pub fn is_gstreamer_available() -> bool {
    init_gstreamer().is_ok()
}

/// Check whether every named element factory is installed.
/// Returns the names that are missing.
pub fn missing_elements(names: &[&str]) -> Vec<String> {
    if init_gstreamer().is_err() {
        return names.iter().map(|n| n.to_string()).collect();
    }
    names
        .iter()
        .filter(|name| gstreamer::ElementFactory::find(name).is_none())
        .map(|n| n.to_string())
        .collect()
}
