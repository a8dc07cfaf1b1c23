//! The in-memory session registry.

use crate::engine::{EngineError, SwarmEngine, TransferEvent, TransferHandle, TransferSource};
use crate::models::{FileInfo, FileSummary, Session, SessionSnapshot, SessionState, Snapshot};
use crate::preview::{self, PreviewJob, PreviewKind, PreviewQueue};
use crate::selection::{is_image, is_video, pick_primary_file};
use crate::streaming::StreamSource;
use chrono::Utc;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("invalid source: {0}")]
    InvalidSource(String),
    #[error("{0}")]
    NotFound(String),
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl RegistryError {
    fn unknown(id: &str) -> Self {
        Self::NotFound(format!("session {id} not found"))
    }
}

struct SessionEntry {
    record: Mutex<Session>,
    transfer: Arc<dyn TransferHandle>,
}

/// Owner of every session record.
///
/// The map is guarded as a whole and each record by its own lock; every state
/// transition of a record happens while holding that record's lock.
pub struct SessionRegistry {
    engine: Arc<dyn SwarmEngine>,
    download_root: PathBuf,
    sessions: Mutex<HashMap<String, Arc<SessionEntry>>>,
    previews: PreviewQueue,
    // Last storage directory stamp handed out, in millis.
    last_stamp: AtomicI64,
}

impl SessionRegistry {
    pub fn new(engine: Arc<dyn SwarmEngine>, download_root: PathBuf, previews: PreviewQueue) -> Self {
        Self {
            engine,
            download_root,
            sessions: Mutex::new(HashMap::new()),
            previews,
            last_stamp: AtomicI64::new(0),
        }
    }

    pub fn download_root(&self) -> &Path {
        &self.download_root
    }

    /// Starts a transfer and returns its provisional record.
    ///
    /// An uploaded descriptor takes precedence over a magnet reference. When
    /// the engine reports a transfer that is already registered, the existing
    /// record is returned and nothing new is started.
    pub async fn create(
        self: &Arc<Self>,
        magnet: Option<String>,
        descriptor: Option<Vec<u8>>,
    ) -> Result<Session, RegistryError> {
        let source = TransferSource::from_parts(magnet, descriptor).ok_or_else(|| {
            RegistryError::InvalidSource("a magnet reference or a descriptor is required".into())
        })?;

        let storage_path = self.allocate_storage().await?;
        let transfer = match self.engine.begin(source, &storage_path).await {
            Ok(transfer) => transfer,
            Err(e) => {
                discard_storage(&storage_path).await;
                return Err(match e {
                    EngineError::InvalidSource(msg) => RegistryError::InvalidSource(msg),
                    other => RegistryError::Engine(other),
                });
            }
        };
        let id = transfer.handle.id().to_string();

        let mut sessions = self.sessions.lock().await;
        if let Some(existing) = sessions.get(&id).cloned() {
            drop(sessions);
            info!(session = %id, "transfer already registered, keeping the existing session");
            transfer.handle.destroy().await;
            discard_storage(&storage_path).await;
            let record = existing.record.lock().await.clone();
            return Ok(record);
        }

        let mut session = Session::new(
            id.clone(),
            transfer.handle.name().unwrap_or_else(|| id.clone()),
            storage_path.clone(),
        );
        session.tracker = transfer.handle.tracker();
        sessions.insert(
            id.clone(),
            Arc::new(SessionEntry {
                record: Mutex::new(session.clone()),
                transfer: transfer.handle,
            }),
        );
        drop(sessions);

        info!(session = %id, path = %storage_path.display(), "session created");
        tokio::spawn(self.clone().drive(id, transfer.events));
        Ok(session)
    }

    /// Picks a storage directory name that was never handed out before.
    async fn allocate_storage(&self) -> Result<PathBuf, RegistryError> {
        tokio::fs::create_dir_all(&self.download_root).await?;
        loop {
            let now = Utc::now().timestamp_millis();
            let previous = self
                .last_stamp
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |prev| {
                    Some(now.max(prev + 1))
                })
                .unwrap_or(now);
            let stamp = now.max(previous + 1);
            let path = self.download_root.join(stamp.to_string());
            match tokio::fs::create_dir(&path).await {
                Ok(()) => return Ok(path),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Applies engine events to the session until the transfer goes away.
    async fn drive(self: Arc<Self>, id: String, mut events: mpsc::UnboundedReceiver<TransferEvent>) {
        while let Some(event) = events.recv().await {
            let result = match event {
                TransferEvent::MetadataReady { name, files } => {
                    self.on_metadata_ready(&id, name, files).await.map(|_| ())
                }
                TransferEvent::Complete => self.on_transfer_complete(&id).await,
                TransferEvent::Failed(reason) => {
                    warn!(session = %id, %reason, "transfer reported a failure");
                    Ok(())
                }
            };
            if let Err(e) = result {
                warn!(session = %id, error = %e, "dropping engine event");
                if matches!(e, RegistryError::NotFound(_)) {
                    break;
                }
            }
        }
    }

    async fn entry(&self, id: &str) -> Result<Arc<SessionEntry>, RegistryError> {
        self.sessions
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| RegistryError::unknown(id))
    }

    /// `Pending → MetadataKnown`: records the file list and picks the primary file.
    ///
    /// Calling it again overwrites the list and recomputes the primary index.
    pub async fn on_metadata_ready(
        &self,
        id: &str,
        name: String,
        files: Vec<FileInfo>,
    ) -> Result<usize, RegistryError> {
        let entry = self.entry(id).await?;
        let mut record = entry.record.lock().await;
        if record.state == SessionState::Removed {
            return Err(RegistryError::unknown(id));
        }
        if !name.is_empty() {
            record.display_name = name;
        }
        record.primary_file_index = pick_primary_file(&files);
        record.files = files;
        if record.state == SessionState::Pending {
            record.state = SessionState::MetadataKnown;
        }
        info!(
            session = %id,
            files = record.files.len(),
            primary = record.primary_file_index,
            "metadata ready"
        );
        Ok(record.primary_file_index)
    }

    /// `→ Completed`: queues previews for the primary video and every image.
    pub async fn on_transfer_complete(&self, id: &str) -> Result<(), RegistryError> {
        let entry = self.entry(id).await?;
        let jobs = {
            let mut record = entry.record.lock().await;
            if record.state == SessionState::Removed {
                return Err(RegistryError::unknown(id));
            }
            record.state = SessionState::Completed;
            preview_jobs(&record, &self.download_root)
        };
        info!(session = %id, previews = jobs.len(), "transfer complete");
        for job in jobs {
            self.previews.submit(job);
        }
        Ok(())
    }

    /// Sets the primary file. Indices outside the file list become 0.
    pub async fn select(&self, id: &str, index: usize) -> Result<usize, RegistryError> {
        let entry = self.entry(id).await?;
        let mut record = entry.record.lock().await;
        if record.state == SessionState::Removed {
            return Err(RegistryError::unknown(id));
        }
        record.primary_file_index = record.clamp_index(index);
        Ok(record.primary_file_index)
    }

    /// Stops the transfer, deletes its storage and forgets the session.
    pub async fn remove(&self, id: &str) -> Result<(), RegistryError> {
        let entry = self
            .sessions
            .lock()
            .await
            .remove(id)
            .ok_or_else(|| RegistryError::unknown(id))?;

        let storage_path = {
            let mut record = entry.record.lock().await;
            record.state = SessionState::Removed;
            record.storage_path.clone()
        };
        entry.transfer.destroy().await;
        discard_storage(&storage_path).await;
        info!(session = %id, "session removed");
        Ok(())
    }

    /// Removes every session whose storage directory is `path`.
    pub async fn remove_by_storage_path(&self, path: &Path) -> Vec<String> {
        let mut matching = Vec::new();
        for (id, entry) in self.entries().await {
            if entry.record.lock().await.owns_path(path) {
                matching.push(id);
            }
        }
        for id in &matching {
            if let Err(e) = self.remove(id).await {
                warn!(session = %id, error = %e, "failed to remove session of deleted path");
            }
        }
        matching
    }

    /// Drops sessions whose storage directory was deleted behind our back.
    pub async fn prune_vanished(&self) {
        for (id, entry) in self.entries().await {
            let storage_path = entry.record.lock().await.storage_path.clone();
            if let Ok(false) = tokio::fs::try_exists(&storage_path).await {
                info!(session = %id, "storage vanished, removing session");
                let _ = self.remove(&id).await;
            }
        }
    }

    async fn entries(&self) -> Vec<(String, Arc<SessionEntry>)> {
        self.sessions
            .lock()
            .await
            .iter()
            .map(|(id, entry)| (id.clone(), entry.clone()))
            .collect()
    }

    /// A copy of the session record.
    pub async fn session(&self, id: &str) -> Result<Session, RegistryError> {
        let entry = self.entry(id).await?;
        let record = entry.record.lock().await.clone();
        Ok(record)
    }

    pub async fn get(&self, id: &str) -> Result<SessionSnapshot, RegistryError> {
        let entry = self.entry(id).await?;
        Ok(snapshot_of(&entry).await)
    }

    /// Every session, oldest first, with live counters from the engine.
    pub async fn list(&self) -> Snapshot {
        let entries = self.entries().await;
        let mut snapshot = Vec::with_capacity(entries.len());
        for (_, entry) in entries {
            snapshot.push(snapshot_of(&entry).await);
        }
        snapshot.sort_by(|a, b| a.added.cmp(&b.added).then_with(|| a.id.cmp(&b.id)));
        snapshot
    }

    /// Resolves the file to stream: `index` if given, else the primary file.
    pub async fn open_stream(
        &self,
        id: &str,
        index: Option<usize>,
    ) -> Result<StreamSource, RegistryError> {
        let entry = self.entry(id).await?;
        let record = entry.record.lock().await;
        let file = match index {
            Some(index) => record.files.get(index),
            None => record.primary_file(),
        }
        .cloned()
        .ok_or_else(|| RegistryError::NotFound(format!("session {id} has no such file yet")))?;
        Ok(StreamSource::Transfer {
            handle: entry.transfer.clone(),
            file,
        })
    }

    pub async fn thumbnail_path(&self, id: &str) -> Result<PathBuf, RegistryError> {
        let entry = self.entry(id).await?;
        let record = entry.record.lock().await;
        Ok(record.storage_path.join(preview::VIDEO_PREVIEW_NAME))
    }
}

async fn snapshot_of(entry: &SessionEntry) -> SessionSnapshot {
    let record = entry.record.lock().await.clone();
    let progress = entry.transfer.progress();
    let has_thumbnail = tokio::fs::try_exists(record.storage_path.join(preview::VIDEO_PREVIEW_NAME))
        .await
        .unwrap_or(false);
    SessionSnapshot {
        thumbnail: has_thumbnail.then(|| format!("/sessions/{}/thumbnail", record.id)),
        progress: if record.state == SessionState::Completed {
            1.0
        } else {
            progress.fraction()
        },
        downloaded: progress.downloaded,
        total: progress.total,
        download_speed: progress.download_speed,
        upload_speed: progress.upload_speed,
        num_peers: progress.peers,
        added: record.created_at.timestamp_millis(),
        files: record.files.iter().map(FileSummary::from).collect(),
        selected_index: record.primary_file_index,
        name: record.display_name,
        state: record.state,
        tracker: record.tracker,
        id: record.id,
    }
}

fn preview_jobs(record: &Session, download_root: &Path) -> Vec<PreviewJob> {
    let announce_base = record
        .storage_path
        .strip_prefix(download_root)
        .map(|p| p.to_string_lossy().replace('\\', "/"))
        .unwrap_or_default();
    let announce = |relative: &str| {
        if announce_base.is_empty() {
            relative.to_string()
        } else {
            format!("{announce_base}/{relative}")
        }
    };

    let mut jobs = Vec::new();
    if let Some(primary) = record.primary_file().filter(|f| is_video(&f.name)) {
        jobs.push(PreviewJob {
            kind: PreviewKind::Video,
            source: record.file_path(primary),
            output: record.storage_path.join(preview::VIDEO_PREVIEW_NAME),
            announce: announce(preview::VIDEO_PREVIEW_NAME),
        });
    }
    for file in record.files.iter().filter(|f| is_image(&f.name)) {
        let relative = preview::image_preview_path(&file.path);
        jobs.push(PreviewJob {
            kind: PreviewKind::Image,
            source: record.file_path(file),
            output: relative
                .split('/')
                .fold(record.storage_path.clone(), |acc, part| acc.join(part)),
            announce: announce(&relative),
        });
    }
    jobs
}

async fn discard_storage(path: &Path) {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "failed to delete storage"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completion_previews_primary_video_and_images() {
        let root = Path::new("/downloads");
        let mut session = Session::new("id".into(), "Show".into(), root.join("1700000000000"));
        session.files = vec![
            FileInfo::new(0, "Show/cover.jpg", 10),
            FileInfo::new(1, "Show/episode.mkv", 900),
            FileInfo::new(2, "Show/notes.txt", 1),
        ];
        session.primary_file_index = 1;

        let jobs = preview_jobs(&session, root);
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].kind, PreviewKind::Video);
        assert_eq!(jobs[0].source, root.join("1700000000000/Show/episode.mkv"));
        assert_eq!(jobs[0].announce, "1700000000000/thumbnail.jpg");
        assert_eq!(jobs[1].kind, PreviewKind::Image);
        assert_eq!(
            jobs[1].output,
            root.join("1700000000000/thumbnails/Show_cover.jpg.jpg")
        );
        assert_eq!(jobs[1].announce, "1700000000000/thumbnails/Show_cover.jpg.jpg");
    }

    #[test]
    fn non_video_primary_gets_no_video_preview() {
        let root = Path::new("/downloads");
        let mut session = Session::new("id".into(), "Docs".into(), root.join("1"));
        session.files = vec![FileInfo::new(0, "Docs/book.pdf", 10)];
        assert!(preview_jobs(&session, root).is_empty());
    }
}
