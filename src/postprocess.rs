//! Asynchronous post-processing of finished recordings
//!
//! Jobs are queued after a session's state has been cleared and run one at a
//! time on a dedicated worker thread. A failing job is logged and dropped; it
//! never reaches back into the recording session.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use chrono::{DateTime, Utc};
use crossbeam_channel::{unbounded, Sender};
use serde::Serialize;

use crate::fsutil;
use crate::session::SessionManifest;

pub const MANIFEST_FILE_NAME: &str = "manifest.json";

/// A finished session waiting for post-processing
#[derive(Debug, Clone, Serialize)]
pub struct PostProcessJob {
    pub match_id: String,
    pub match_dir: PathBuf,
    pub camera_ids: Vec<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: DateTime<Utc>,
}

pub trait PostProcessor: Send + Sync {
    fn process(&self, job: &PostProcessJob) -> anyhow::Result<()>;
}

/// Default handler: writes `manifest.json` listing each camera's segments
#[derive(Debug, Default)]
pub struct ManifestWriter;

impl PostProcessor for ManifestWriter {
    fn process(&self, job: &PostProcessJob) -> anyhow::Result<()> {
        let manifest = SessionManifest::scan(&job.match_dir, &job.match_id, &job.camera_ids);
        let path = job.match_dir.join(MANIFEST_FILE_NAME);
        fsutil::write_json_atomic(&path, &manifest)?;
        log::info!(
            "Wrote manifest for {} ({} segments) to {}",
            job.match_id,
            manifest.segment_count(),
            path.display()
        );
        Ok(())
    }
}

enum QueueMessage {
    Job(PostProcessJob),
    Shutdown,
}

/// Single-worker FIFO of post-processing jobs
pub struct PostProcessQueue {
    sender: Sender<QueueMessage>,
    pending: Arc<AtomicUsize>,
    worker: Option<JoinHandle<()>>,
}

impl PostProcessQueue {
    pub fn spawn(processor: Arc<dyn PostProcessor>) -> Self {
        let (sender, receiver) = unbounded::<QueueMessage>();
        let pending = Arc::new(AtomicUsize::new(0));
        let worker_pending = pending.clone();

        let worker = std::thread::Builder::new()
            .name("matchcam-postprocess".into())
            .spawn(move || {
                while let Ok(QueueMessage::Job(job)) = receiver.recv() {
                    log::info!("Post-processing {}", job.match_id);
                    if let Err(e) = processor.process(&job) {
                        log::error!("Post-processing {} failed: {:#}", job.match_id, e);
                    }
                    worker_pending.fetch_sub(1, Ordering::SeqCst);
                }
                log::debug!("Post-processing worker exited");
            })
            .expect("Failed to spawn post-processing thread");

        Self {
            sender,
            pending,
            worker: Some(worker),
        }
    }

    /// Queue a job. False if the worker is gone.
    pub fn enqueue(&self, job: PostProcessJob) -> bool {
        self.pending.fetch_add(1, Ordering::SeqCst);
        match self.sender.send(QueueMessage::Job(job)) {
            Ok(()) => true,
            Err(e) => {
                self.pending.fetch_sub(1, Ordering::SeqCst);
                if let QueueMessage::Job(job) = e.into_inner() {
                    log::error!("Post-processing worker gone, dropping {}", job.match_id);
                }
                false
            }
        }
    }

    /// Jobs queued or running
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }
}

impl Drop for PostProcessQueue {
    fn drop(&mut self) {
        let _ = self.sender.send(QueueMessage::Shutdown);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("Post-processing worker panicked");
            }
        }
    }
}
