#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use swarmstream::engine::{
    ByteStream, EngineError, SwarmEngine, Transfer, TransferEvent, TransferHandle,
    TransferProgress, TransferSource,
};
use swarmstream::models::FileInfo;
use swarmstream::preview::{PreviewError, PreviewGenerator, PreviewJob};
use swarmstream::prelude::*;
use swarmstream::streaming::ByteRange;
use tempfile::TempDir;
use tokio::sync::mpsc;

pub const TOKEN: &str = "test-token";
pub const USERNAME: &str = "admin";
pub const PASSWORD: &str = "secret";

/// Transfer whose files live in memory and whose events are sent by the test.
pub struct FakeHandle {
    id: String,
    files: Mutex<Vec<FileInfo>>,
    data: Mutex<HashMap<usize, Bytes>>,
    pub destroyed: AtomicBool,
}

#[async_trait]
impl TransferHandle for FakeHandle {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> Option<String> {
        None
    }

    fn tracker(&self) -> Option<String> {
        Some("udp://tracker.example:1337".into())
    }

    fn progress(&self) -> TransferProgress {
        let total = self.files.lock().unwrap().iter().map(|f| f.length).sum();
        TransferProgress {
            downloaded: total / 2,
            total,
            download_speed: 1024,
            upload_speed: 0,
            peers: 3,
        }
    }

    fn files(&self) -> Vec<FileInfo> {
        self.files.lock().unwrap().clone()
    }

    async fn open_read(&self, index: usize, range: ByteRange) -> Result<ByteStream, EngineError> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(EngineError::Destroyed);
        }
        let data = self
            .data
            .lock()
            .unwrap()
            .get(&index)
            .cloned()
            .ok_or(EngineError::FileNotFound(index))?;
        let slice = data.slice(range.start as usize..=range.end as usize);
        let chunks: Vec<std::io::Result<Bytes>> = slice
            .chunks(64)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        Ok(futures_util::stream::iter(chunks).boxed())
    }

    async fn destroy(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
    }
}

/// Engine that hands out [`FakeHandle`]s keyed by the magnet's hash.
#[derive(Default)]
pub struct FakeEngine {
    transfers: Mutex<HashMap<String, (Arc<FakeHandle>, mpsc::UnboundedSender<TransferEvent>)>>,
    pub begun: Mutex<Vec<String>>,
}

impl FakeEngine {
    pub fn handle(&self, id: &str) -> Arc<FakeHandle> {
        self.transfers.lock().unwrap()[id].0.clone()
    }

    fn send(&self, id: &str, event: TransferEvent) {
        let _ = self.transfers.lock().unwrap()[id].1.send(event);
    }

    /// Publishes the file list; each file's content is `length` patterned bytes.
    pub fn metadata(&self, id: &str, name: &str, files: &[(&str, usize)]) {
        let handle = self.handle(id);
        let mut infos = Vec::new();
        let mut data = HashMap::new();
        for (index, (path, length)) in files.iter().enumerate() {
            infos.push(FileInfo::new(index, *path, *length as u64));
            data.insert(index, Bytes::from(pattern(*length)));
        }
        *handle.files.lock().unwrap() = infos.clone();
        *handle.data.lock().unwrap() = data;
        self.send(
            id,
            TransferEvent::MetadataReady {
                name: name.to_string(),
                files: infos,
            },
        );
    }

    pub fn complete(&self, id: &str) {
        self.send(id, TransferEvent::Complete);
    }
}

#[async_trait]
impl SwarmEngine for FakeEngine {
    async fn begin(&self, source: TransferSource, _save_path: &Path) -> Result<Transfer, EngineError> {
        let id = match source {
            TransferSource::Magnet(link) => {
                if !link.starts_with("magnet:?") {
                    return Err(EngineError::InvalidSource(format!("not a magnet link: {link}")));
                }
                link.rsplit(':').next().unwrap_or_default().to_lowercase()
            }
            TransferSource::Descriptor(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        };
        let (tx, events) = mpsc::unbounded_channel();
        let handle = Arc::new(FakeHandle {
            id: id.clone(),
            files: Mutex::new(Vec::new()),
            data: Mutex::new(HashMap::new()),
            destroyed: AtomicBool::new(false),
        });
        self.begun.lock().unwrap().push(id.clone());
        self.transfers
            .lock()
            .unwrap()
            .entry(id)
            .or_insert_with(|| (handle.clone(), tx));
        Ok(Transfer { handle, events })
    }
}

/// Records jobs and writes a tiny file where the preview belongs.
#[derive(Default)]
pub struct RecordingGenerator {
    pub jobs: Mutex<Vec<PreviewJob>>,
}

#[async_trait]
impl PreviewGenerator for RecordingGenerator {
    async fn generate(&self, job: &PreviewJob) -> Result<(), PreviewError> {
        if let Some(parent) = job.output.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&job.output, b"jpeg").await?;
        self.jobs.lock().unwrap().push(job.clone());
        Ok(())
    }
}

pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

pub fn magnet(hash: &str) -> Option<String> {
    Some(format!("magnet:?xt=urn:btih:{hash}"))
}

pub struct Harness {
    pub dir: TempDir,
    pub engine: Arc<FakeEngine>,
    pub generator: Arc<RecordingGenerator>,
    pub broadcaster: Arc<Broadcaster>,
    pub registry: Arc<SessionRegistry>,
}

impl Harness {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(FakeEngine::default());
        let generator = Arc::new(RecordingGenerator::default());
        let broadcaster = Arc::new(Broadcaster::new());
        let previews = PreviewQueue::start(generator.clone(), broadcaster.clone());
        let registry = Arc::new(SessionRegistry::new(
            engine.clone(),
            dir.path().join("downloads"),
            previews,
        ));
        Self {
            dir,
            engine,
            generator,
            broadcaster,
            registry,
        }
    }

    pub fn root(&self) -> &Path {
        self.registry.download_root()
    }

    pub async fn wait_for_state(&self, id: &str, state: SessionState) {
        let registry = self.registry.clone();
        let id = id.to_string();
        eventually(move || {
            let registry = registry.clone();
            let id = id.clone();
            async move {
                registry
                    .session(&id)
                    .await
                    .map(|s| s.state == state)
                    .unwrap_or(false)
            }
        })
        .await;
    }

    /// Serves the router on an ephemeral port.
    pub async fn serve(&self) -> SocketAddr {
        let state = AppState {
            registry: self.registry.clone(),
            broadcaster: self.broadcaster.clone(),
            indexer: Arc::new(Indexer::new(self.root().to_path_buf(), ["nfo"])),
            tokens: Arc::new(TokenStore::new(
                Some((USERNAME.into(), PASSWORD.into())),
                vec![TOKEN.to_string()],
            )),
        };
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, router(state)).await;
        });
        addr
    }
}

/// Polls `check` until it holds, failing the test after two seconds.
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}
