//! Session records and the shapes pushed to clients.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// One file inside a transfer, as reported by the engine once metadata is known.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub index: usize,
    /// Base name of the file, used for display and extension checks.
    pub name: String,
    /// Path relative to the session's storage directory, `/`-separated.
    pub path: String,
    pub length: u64,
}

impl FileInfo {
    pub fn new(index: usize, path: impl Into<String>, length: u64) -> Self {
        let path = path.into();
        let name = path.rsplit('/').next().unwrap_or(&path).to_string();
        Self {
            index,
            name,
            path,
            length,
        }
    }
}

/// The lifecycle of a session.
///
/// Each transition is applied by exactly one registry method; `Removed` is terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
    Pending,
    MetadataKnown,
    Completed,
    Removed,
}

/// The registry's record of a single transfer.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub display_name: String,
    pub state: SessionState,
    pub primary_file_index: usize,
    pub storage_path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub files: Vec<FileInfo>,
    pub tracker: Option<String>,
}

impl Session {
    pub fn new(id: String, display_name: String, storage_path: PathBuf) -> Self {
        Self {
            id,
            display_name,
            state: SessionState::Pending,
            primary_file_index: 0,
            storage_path,
            created_at: Utc::now(),
            files: Vec::new(),
            tracker: None,
        }
    }

    /// Coerces `index` into the file list, falling back to 0.
    pub fn clamp_index(&self, index: usize) -> usize {
        if index < self.files.len() {
            index
        } else {
            0
        }
    }

    /// The primary file, or the first file if the primary index is stale.
    pub fn primary_file(&self) -> Option<&FileInfo> {
        self.files
            .get(self.primary_file_index)
            .or_else(|| self.files.first())
    }

    /// Absolute on-disk location of a file of this session.
    pub fn file_path(&self, file: &FileInfo) -> PathBuf {
        file.path
            .split('/')
            .fold(self.storage_path.clone(), |acc, part| acc.join(part))
    }

    pub fn owns_path(&self, path: &Path) -> bool {
        self.storage_path == path
    }
}

/// Compact file description carried in snapshots.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileSummary {
    pub index: usize,
    pub name: String,
    pub length: u64,
}

impl From<&FileInfo> for FileSummary {
    fn from(file: &FileInfo) -> Self {
        Self {
            index: file.index,
            name: file.name.clone(),
            length: file.length,
        }
    }
}

/// Read-only projection of one session at a point in time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub id: String,
    pub name: String,
    pub state: SessionState,
    pub progress: f64,
    pub downloaded: u64,
    pub total: u64,
    pub download_speed: u64,
    pub upload_speed: u64,
    pub num_peers: usize,
    pub tracker: Option<String>,
    /// Creation time in milliseconds since the epoch.
    pub added: i64,
    pub files: Vec<FileSummary>,
    pub selected_index: usize,
    pub thumbnail: Option<String>,
}

/// Point-in-time summary of every session.
pub type Snapshot = Vec<SessionSnapshot>;

/// Frames delivered over the push channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PushMessage {
    Progress { sessions: Snapshot },
    FileUpdated { path: String },
}
