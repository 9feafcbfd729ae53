// Matchcam - multi-camera match recorder
// Library entry point

pub mod config;
pub mod error;
pub mod fsutil;
pub mod gstreamer_init;
pub mod pipeline;
pub mod postprocess;
pub mod recording;
pub mod resource_lock;
pub mod service;
pub mod session;

pub use error::{Error, Result};
