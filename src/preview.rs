//! Preview generation jobs.
//!
//! Jobs are handed to a single background worker and processed one at a time;
//! whoever submits a job never waits for it. When a preview has been written
//! the worker announces it through the [`Broadcaster`].

use crate::broadcaster::Broadcaster;
use crate::models::PushMessage;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Name of the per-session video preview, directly inside the storage directory.
pub const VIDEO_PREVIEW_NAME: &str = "thumbnail.jpg";
/// Per-session directory holding one preview per image file.
pub const PREVIEW_DIR: &str = "thumbnails";

/// Location of an image's preview, relative to the session directory.
pub fn image_preview_path(file_path: &str) -> String {
    format!("{PREVIEW_DIR}/{}.jpg", file_path.replace('/', "_"))
}

#[derive(Debug, Error)]
pub enum PreviewError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("preview tool exited with {status}: {stderr}")]
    Tool { status: String, stderr: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreviewKind {
    Video,
    Image,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreviewJob {
    pub kind: PreviewKind,
    pub source: PathBuf,
    pub output: PathBuf,
    /// Path of the preview relative to the download root, sent to observers.
    pub announce: String,
}

#[async_trait]
pub trait PreviewGenerator: Send + Sync {
    async fn generate(&self, job: &PreviewJob) -> Result<(), PreviewError>;
}

/// Runs `ffmpeg` to grab a single scaled frame.
#[derive(Debug, Clone)]
pub struct FfmpegGenerator {
    pub program: String,
    /// Seek offset for video frames, e.g. `00:00:30`.
    pub seek: String,
    pub width: u32,
}

impl Default for FfmpegGenerator {
    fn default() -> Self {
        Self {
            program: "ffmpeg".into(),
            seek: "00:00:30".into(),
            width: 320,
        }
    }
}

impl FfmpegGenerator {
    fn args(&self, job: &PreviewJob) -> Vec<String> {
        let mut args = vec!["-y".to_string(), "-loglevel".into(), "error".into()];
        if job.kind == PreviewKind::Video {
            args.extend(["-ss".into(), self.seek.clone()]);
        }
        args.extend([
            "-i".into(),
            job.source.to_string_lossy().into_owned(),
            "-frames:v".into(),
            "1".into(),
            "-vf".into(),
            format!("scale={}:-2", self.width),
            "-q:v".into(),
            "2".into(),
            job.output.to_string_lossy().into_owned(),
        ]);
        args
    }
}

#[async_trait]
impl PreviewGenerator for FfmpegGenerator {
    async fn generate(&self, job: &PreviewJob) -> Result<(), PreviewError> {
        if let Some(parent) = job.output.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let output = Command::new(&self.program)
            .args(self.args(job))
            .kill_on_drop(true)
            .output()
            .await?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        let tail: String = stderr.lines().rev().take(3).collect::<Vec<_>>().join(" | ");
        Err(PreviewError::Tool {
            status: output.status.to_string(),
            stderr: tail,
        })
    }
}

/// Handle for submitting jobs to the preview worker.
#[derive(Clone)]
pub struct PreviewQueue {
    jobs: mpsc::UnboundedSender<PreviewJob>,
}

impl PreviewQueue {
    /// Spawns the worker and returns the submitting side.
    pub fn start(generator: Arc<dyn PreviewGenerator>, broadcaster: Arc<Broadcaster>) -> Self {
        let (jobs, mut rx) = mpsc::unbounded_channel::<PreviewJob>();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                debug!(source = %job.source.display(), "generating preview");
                match generator.generate(&job).await {
                    Ok(()) => {
                        info!(preview = %job.announce, "preview generated");
                        broadcaster.push(&PushMessage::FileUpdated { path: job.announce });
                    }
                    Err(e) => {
                        warn!(source = %job.source.display(), error = %e, "preview generation failed");
                    }
                }
            }
            debug!("preview worker stopped");
        });
        Self { jobs }
    }

    pub fn submit(&self, job: PreviewJob) {
        if let Err(e) = self.jobs.send(job) {
            warn!(source = %e.0.source.display(), "preview worker is gone, job dropped");
        }
    }
}
