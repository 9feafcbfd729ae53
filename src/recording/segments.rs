// Segment file naming and discovery
//
// Layout: {storage}/{match_id}/cam{camera_id}/segment_r{run:02}_{index:05}.mkv
// `run` increases every time a camera's pipeline is rebuilt, so a rebuilt
// muxer never overwrites earlier segments and its index may restart at 0.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::Serialize;

pub const SEGMENT_EXTENSION: &str = "mkv";
const SEGMENT_PREFIX: &str = "segment_r";

/// Position of a segment within a camera's recording; ordered by run, then index
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct SegmentId {
    pub run: u32,
    pub index: u32,
}

impl std::fmt::Display for SegmentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "r{:02}#{:05}", self.run, self.index)
    }
}

#[derive(Debug, Clone)]
pub struct SegmentFile {
    pub path: PathBuf,
    pub id: SegmentId,
    pub size_bytes: u64,
    pub modified: SystemTime,
}

pub fn match_dir(storage: &Path, match_id: &str) -> PathBuf {
    storage.join(match_id)
}

pub fn camera_dir_in(match_dir: &Path, camera_id: &str) -> PathBuf {
    match_dir.join(format!("cam{}", camera_id))
}

pub fn camera_dir(storage: &Path, match_id: &str, camera_id: &str) -> PathBuf {
    camera_dir_in(&match_dir(storage, match_id), camera_id)
}

/// printf-style location handed to the muxer for one run
pub fn segment_pattern(camera_dir: &Path, run: u32) -> PathBuf {
    camera_dir.join(format!("{}{:02}_%05d.{}", SEGMENT_PREFIX, run, SEGMENT_EXTENSION))
}

pub fn segment_file_name(id: SegmentId) -> String {
    format!("{}{:02}_{:05}.{}", SEGMENT_PREFIX, id.run, id.index, SEGMENT_EXTENSION)
}

pub fn parse_segment_name(name: &str) -> Option<SegmentId> {
    let stem = name
        .strip_prefix(SEGMENT_PREFIX)?
        .strip_suffix(SEGMENT_EXTENSION)?
        .strip_suffix('.')?;
    let (run, index) = stem.split_once('_')?;
    Some(SegmentId {
        run: run.parse().ok()?,
        index: index.parse().ok()?,
    })
}

/// All segments in a camera directory, oldest first. Missing dir -> empty.
pub fn list_segments(camera_dir: &Path) -> Vec<SegmentFile> {
    let Ok(entries) = std::fs::read_dir(camera_dir) else {
        return Vec::new();
    };

    let mut segments: Vec<SegmentFile> = entries
        .flatten()
        .filter_map(|entry| {
            let name = entry.file_name();
            let id = parse_segment_name(name.to_str()?)?;
            let meta = entry.metadata().ok()?;
            if !meta.is_file() {
                return None;
            }
            Some(SegmentFile {
                path: entry.path(),
                id,
                size_bytes: meta.len(),
                modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            })
        })
        .collect();

    segments.sort_by_key(|s| s.id);
    segments
}

/// The segment written most recently. A muxer that restarts its counter
/// overwrites a low index, so recency is judged by mtime, then id.
pub fn newest(segments: &[SegmentFile]) -> Option<&SegmentFile> {
    segments.iter().max_by_key(|s| (s.modified, s.id))
}

pub fn latest_segment(camera_dir: &Path) -> Option<SegmentFile> {
    newest(&list_segments(camera_dir)).cloned()
}

/// Highest run number present, so a restarted service keeps counting up
pub fn highest_run(camera_dir: &Path) -> u32 {
    list_segments(camera_dir)
        .iter()
        .map(|s| s.id.run)
        .max()
        .unwrap_or(0)
}
