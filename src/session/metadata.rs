// Per-match manifest written after recording

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::recording::segments;

/// Complete match recording manifest (`manifest.json` in the match folder)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionManifest {
    pub match_id: String,

    /// When the manifest was written
    pub created_at: DateTime<Utc>,

    /// Path to the match folder
    pub path: PathBuf,

    pub cameras: Vec<CameraSegments>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraSegments {
    pub camera_id: String,
    pub segments: Vec<SegmentFileInfo>,
    pub total_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentFileInfo {
    pub filename: String,
    pub run: u32,
    pub index: u32,
    pub size_bytes: u64,
}

impl SessionManifest {
    /// Scan the match folder for each camera's segments
    pub fn scan(match_dir: &Path, match_id: &str, camera_ids: &[String]) -> Self {
        let cameras = camera_ids
            .iter()
            .map(|camera_id| {
                let dir = segments::camera_dir_in(match_dir, camera_id);
                let segments: Vec<SegmentFileInfo> = segments::list_segments(&dir)
                    .into_iter()
                    .map(|segment| SegmentFileInfo {
                        filename: segment
                            .path
                            .file_name()
                            .map(|n| n.to_string_lossy().into_owned())
                            .unwrap_or_default(),
                        run: segment.id.run,
                        index: segment.id.index,
                        size_bytes: segment.size_bytes,
                    })
                    .collect();
                let total_bytes = segments.iter().map(|s| s.size_bytes).sum();
                CameraSegments {
                    camera_id: camera_id.clone(),
                    segments,
                    total_bytes,
                }
            })
            .collect();

        Self {
            match_id: match_id.to_string(),
            created_at: Utc::now(),
            path: match_dir.to_path_buf(),
            cameras,
        }
    }

    pub fn segment_count(&self) -> usize {
        self.cameras.iter().map(|c| c.segments.len()).sum()
    }
}
