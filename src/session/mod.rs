// Session state persistence and per-match manifests

pub mod metadata;
pub mod state;

pub use metadata::*;
pub use state::*;
