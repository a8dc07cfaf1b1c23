//! Listing of the download tree.
//!
//! Nothing is cached: every call walks the disk again. Entries are keyed by
//! their `/`-separated path relative to the download root and come back
//! sorted by that path.

use crate::preview::{image_preview_path, PREVIEW_DIR, VIDEO_PREVIEW_NAME};
use crate::selection::is_image;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileEntry {
    /// Path relative to the download root.
    pub name: String,
    pub size: u64,
    #[serde(rename = "type")]
    pub media_type: String,
    pub thumbnail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum IgnoreRule {
    Suffix(String),
    /// Bare words and `.ext` patterns: the extension, or the whole name.
    ExtensionOrName { extension: String, name: String },
    Name(String),
}

impl IgnoreRule {
    fn parse(pattern: &str) -> Option<Self> {
        let pattern = pattern.trim().to_lowercase();
        if pattern.is_empty() {
            return None;
        }
        if let Some(suffix) = pattern.strip_prefix('*') {
            return Some(Self::Suffix(suffix.to_string()));
        }
        let word = pattern.strip_prefix('.').unwrap_or(&pattern);
        if !word.is_empty() && word.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Some(Self::ExtensionOrName {
                extension: word.to_string(),
                name: pattern.clone(),
            });
        }
        Some(Self::Name(pattern))
    }

    fn matches(&self, name: &str) -> bool {
        match self {
            Self::Suffix(suffix) => name.ends_with(suffix.as_str()),
            Self::ExtensionOrName { extension, name: exact } => {
                name == exact.as_str()
                    || Path::new(name)
                        .extension()
                        .is_some_and(|ext| ext.to_string_lossy() == *extension)
            }
            Self::Name(exact) => name == exact.as_str(),
        }
    }
}

pub struct Indexer {
    root: PathBuf,
    ignore: Vec<IgnoreRule>,
}

impl Indexer {
    pub fn new<I, S>(root: PathBuf, ignore: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            root,
            ignore: ignore
                .into_iter()
                .filter_map(|p| IgnoreRule::parse(p.as_ref()))
                .collect(),
        }
    }

    fn is_ignored(&self, name: &str) -> bool {
        let name = name.to_lowercase();
        self.ignore.iter().any(|rule| rule.matches(&name))
    }

    /// Every file below the root, minus ignored entries and preview artifacts.
    pub async fn list(&self) -> Result<Vec<FileEntry>, IndexError> {
        let mut entries = Vec::new();
        let mut previews = PreviewCache::default();
        let mut pending: Vec<(PathBuf, Vec<String>)> = vec![(self.root.clone(), Vec::new())];

        while let Some((dir, parents)) = pending.pop() {
            let mut reader = match tokio::fs::read_dir(&dir).await {
                Ok(reader) => reader,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(item) = reader.next_entry().await? {
                let name = item.file_name().to_string_lossy().into_owned();
                if self.is_ignored(&name) || is_preview_artifact(&parents, &name) {
                    continue;
                }
                let Ok(file_type) = item.file_type().await else {
                    continue;
                };
                let mut segments = parents.clone();
                segments.push(name);

                if file_type.is_dir() {
                    pending.push((item.path(), segments));
                } else if file_type.is_file() {
                    let Ok(metadata) = item.metadata().await else {
                        continue;
                    };
                    let thumbnail = previews.lookup(&self.root, &segments).await;
                    entries.push(FileEntry {
                        media_type: mime_guess::from_path(item.path())
                            .first_or_octet_stream()
                            .to_string(),
                        name: segments.join("/"),
                        size: metadata.len(),
                        thumbnail,
                    });
                }
            }
        }

        entries.sort_by(|a, b| a.name.cmp(&b.name));
        debug!(root = %self.root.display(), entries = entries.len(), "indexed download tree");
        Ok(entries)
    }

    /// Maps a relative path onto the download root.
    ///
    /// Only plain path segments are accepted, so the result never leaves the
    /// root. The root itself cannot be addressed.
    pub fn resolve(&self, relative: &str) -> Result<PathBuf, IndexError> {
        let mut path = self.root.clone();
        let mut depth = 0;
        for segment in relative.split('/').filter(|s| !s.is_empty()) {
            let mut components = Path::new(segment).components();
            match (components.next(), components.next()) {
                (Some(Component::Normal(part)), None) => path.push(part),
                _ => return Err(IndexError::NotFound(relative.to_string())),
            }
            depth += 1;
        }
        if depth == 0 {
            return Err(IndexError::NotFound(relative.to_string()));
        }
        Ok(path)
    }

    /// Deletes a file or a whole directory and returns its absolute path.
    pub async fn delete(&self, relative: &str) -> Result<PathBuf, IndexError> {
        let path = self.resolve(relative)?;
        let metadata = match tokio::fs::symlink_metadata(&path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(IndexError::NotFound(relative.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        let result = if metadata.is_dir() {
            tokio::fs::remove_dir_all(&path).await
        } else {
            tokio::fs::remove_file(&path).await
        };
        match result {
            Ok(()) => Ok(path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(IndexError::NotFound(relative.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// `thumbnail.jpg` and `thumbnails/` directly inside a session directory.
fn is_preview_artifact(parents: &[String], name: &str) -> bool {
    parents.len() == 1
        && (name.eq_ignore_ascii_case(VIDEO_PREVIEW_NAME) || name.eq_ignore_ascii_case(PREVIEW_DIR))
}

/// Remembers which preview files exist during one listing.
#[derive(Default)]
struct PreviewCache {
    exists: HashMap<PathBuf, bool>,
}

impl PreviewCache {
    async fn check(&mut self, path: PathBuf) -> bool {
        if let Some(known) = self.exists.get(&path) {
            return *known;
        }
        let found = tokio::fs::try_exists(&path).await.unwrap_or(false);
        self.exists.insert(path, found);
        found
    }

    /// Preview URL for the file at `segments`, if its session has one.
    async fn lookup(&mut self, root: &Path, segments: &[String]) -> Option<String> {
        let (session, inner) = segments.split_first()?;
        if inner.is_empty() {
            return None;
        }
        let session_dir = root.join(session);

        let name = inner.last()?;
        if is_image(name) {
            let relative = image_preview_path(&inner.join("/"));
            let on_disk = relative.split('/').fold(session_dir.clone(), |acc, p| acc.join(p));
            if self.check(on_disk).await {
                return Some(format!("/files/{session}/{relative}"));
            }
        }
        if self.check(session_dir.join(VIDEO_PREVIEW_NAME)).await {
            return Some(format!("/files/{session}/{VIDEO_PREVIEW_NAME}"));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn write(root: &Path, relative: &str, len: usize) {
        let path = root.join(relative);
        tokio::fs::create_dir_all(path.parent().unwrap()).await.unwrap();
        tokio::fs::write(path, vec![0u8; len]).await.unwrap();
    }

    #[test]
    fn ignore_patterns() {
        let rule = |p| IgnoreRule::parse(p).unwrap();
        assert!(rule("*.part").matches("movie.mkv.part"));
        assert!(rule(".nfo").matches("release.nfo"));
        assert!(rule("nfo").matches("release.nfo"));
        assert!(rule("nfo").matches("nfo"));
        assert!(rule("Sample.txt").matches("sample.txt"));
        assert!(!rule("sample.txt").matches("other.txt"));
        assert!(IgnoreRule::parse("  ").is_none());
    }

    #[tokio::test]
    async fn lists_sorted_entries_without_previews() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(root, "200/Show/b.mkv", 30).await;
        write(root, "200/Show/a.txt", 3).await;
        write(root, "100/movie.mp4", 10).await;
        write(root, "100/thumbnail.jpg", 1).await;
        write(root, "100/thumbnails/x.jpg", 1).await;
        write(root, "100/release.NFO", 1).await;
        write(root, "loose.bin", 2).await;

        let indexer = Indexer::new(root.to_path_buf(), ["nfo"]);
        let entries = indexer.list().await.unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(
            names,
            ["100/movie.mp4", "200/Show/a.txt", "200/Show/b.mkv", "loose.bin"]
        );
        assert_eq!(entries[0].size, 10);
        assert_eq!(entries[0].media_type, "video/mp4");
        assert_eq!(entries[0].thumbnail.as_deref(), Some("/files/100/thumbnail.jpg"));
        assert_eq!(entries[1].thumbnail, None);
        assert_eq!(entries[3].media_type, "application/octet-stream");
    }

    #[tokio::test]
    async fn images_prefer_their_own_preview() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(root, "300/Album/cover.png", 5).await;
        write(root, "300/Album/back.png", 5).await;
        write(root, "300/thumbnails/Album_cover.png.jpg", 1).await;
        write(root, "300/thumbnail.jpg", 1).await;

        let entries = Indexer::new(root.to_path_buf(), Vec::<String>::new())
            .list()
            .await
            .unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "300/Album/back.png");
        assert_eq!(entries[0].thumbnail.as_deref(), Some("/files/300/thumbnail.jpg"));
        assert_eq!(
            entries[1].thumbnail.as_deref(),
            Some("/files/300/thumbnails/Album_cover.png.jpg")
        );
    }

    #[tokio::test]
    async fn missing_root_lists_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let indexer = Indexer::new(dir.path().join("absent"), Vec::<String>::new());
        assert!(indexer.list().await.unwrap().is_empty());
    }

    #[test]
    fn resolve_stays_below_root() {
        let indexer = Indexer::new(PathBuf::from("/data"), Vec::<String>::new());
        assert_eq!(indexer.resolve("100/a.mkv").unwrap(), PathBuf::from("/data/100/a.mkv"));
        assert_eq!(indexer.resolve("100/").unwrap(), PathBuf::from("/data/100"));
        assert!(indexer.resolve("../etc/passwd").is_err());
        assert!(indexer.resolve("100/./a").is_err());
        assert!(indexer.resolve("").is_err());
    }

    #[tokio::test]
    async fn delete_removes_files_and_directories() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(root, "100/thumbnails/x.jpg", 1).await;
        write(root, "200/a.mkv", 1).await;
        let indexer = Indexer::new(root.to_path_buf(), Vec::<String>::new());

        assert_eq!(indexer.delete("200/a.mkv").await.unwrap(), root.join("200/a.mkv"));
        assert_eq!(indexer.delete("100").await.unwrap(), root.join("100"));
        assert!(!root.join("100").exists());
        assert!(matches!(indexer.delete("100").await, Err(IndexError::NotFound(_))));
    }
}
