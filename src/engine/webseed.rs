//! HTTP web-seed engine.
//!
//! Retrieves transfers whose content is mirrored on plain HTTP servers: magnet
//! references carrying `ws`/`xs` parameters and descriptors carrying a
//! `url-list`. Every file is split into byte-range segments fetched in
//! parallel, and readers can stream any byte as soon as its segment reaches it.

use super::source::{self, Descriptor, MagnetLink};
use super::{
    ByteStream, EngineError, SwarmEngine, Transfer, TransferEvent, TransferHandle,
    TransferProgress, TransferSource,
};
use crate::limiter::SpeedLimiter;
use crate::models::FileInfo;
use crate::streaming::ByteRange;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use reqwest::header::{CONTENT_LENGTH, CONTENT_RANGE, RANGE};
use reqwest::{Client, StatusCode, Url};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Segments smaller than this are not split further.
const MIN_SEGMENT_BYTES: u64 = 256 * 1024;
/// Largest chunk a reader yields at once.
const READ_CHUNK: u64 = 64 * 1024;

#[derive(Debug, Clone)]
pub struct WebSeedOptions {
    /// Number of concurrent segments per file.
    pub segments: usize,
    pub retries: u32,
    pub connect_timeout: Duration,
    /// Shared download cap in bytes per second, 0 for unlimited.
    pub rate_limit: u64,
}

impl Default for WebSeedOptions {
    fn default() -> Self {
        Self {
            segments: 4,
            retries: 3,
            connect_timeout: Duration::from_secs(30),
            rate_limit: 0,
        }
    }
}

pub struct WebSeedEngine {
    client: Client,
    options: WebSeedOptions,
    limiter: SpeedLimiter,
}

impl WebSeedEngine {
    pub fn new(options: WebSeedOptions) -> Result<Self, EngineError> {
        let client = Client::builder()
            .user_agent(concat!("swarmstream/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(options.connect_timeout)
            .build()?;
        let limiter = SpeedLimiter::new(options.rate_limit);
        Ok(Self {
            client,
            options,
            limiter,
        })
    }
}

/// Where the file list of a transfer comes from.
enum Plan {
    Magnet(MagnetLink),
    Descriptor(Descriptor),
}

#[async_trait]
impl SwarmEngine for WebSeedEngine {
    async fn begin(&self, source: TransferSource, save_path: &Path) -> Result<Transfer, EngineError> {
        let (id, initial_name, tracker, plan) = match source {
            TransferSource::Magnet(uri) => {
                let link = source::parse_magnet(&uri)?;
                (
                    link.info_hash.clone(),
                    link.display_name.clone(),
                    link.trackers.first().cloned(),
                    Plan::Magnet(link),
                )
            }
            TransferSource::Descriptor(bytes) => {
                let descriptor = source::parse_descriptor(&bytes)?;
                (
                    descriptor.id.clone(),
                    Some(descriptor.name.clone()),
                    descriptor.trackers.first().cloned(),
                    Plan::Descriptor(descriptor),
                )
            }
        };

        let shared = Arc::new(Shared {
            id,
            initial_name,
            tracker,
            save_path: save_path.to_path_buf(),
            metadata: OnceLock::new(),
            failure: OnceLock::new(),
            notify: Notify::new(),
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
            active_connections: AtomicUsize::new(0),
            speed: Mutex::new(SpeedSample::new()),
        });

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let driver = Driver {
            shared: shared.clone(),
            client: self.client.clone(),
            limiter: self.limiter.clone(),
            options: self.options.clone(),
            events: events_tx,
        };
        shared.tasks.spawn(driver.run(plan));

        info!(id = %shared.id, path = %save_path.display(), "web-seed transfer started");
        Ok(Transfer {
            handle: Arc::new(WebSeedTransfer { shared }),
            events: events_rx,
        })
    }
}

/// Byte range of a file fetched by one worker; `end` is inclusive.
#[derive(Debug)]
struct Segment {
    start: u64,
    end: u64,
    /// Next byte to fetch. Everything in `start..current` is on disk.
    current: AtomicU64,
}

impl Segment {
    fn new(start: u64, end: u64) -> Self {
        Self {
            start,
            end,
            current: AtomicU64::new(start),
        }
    }

    fn fetched(&self) -> u64 {
        self.current.load(Ordering::Acquire).min(self.end + 1) - self.start
    }

    fn is_complete(&self) -> bool {
        self.current.load(Ordering::Acquire) > self.end
    }

    /// Contiguous bytes readable from `pos`, if `pos` falls in this segment.
    fn available_from(&self, pos: u64) -> Option<u64> {
        if pos < self.start || pos > self.end {
            return None;
        }
        let current = self.current.load(Ordering::Acquire).min(self.end + 1);
        Some(current.saturating_sub(pos))
    }
}

/// Splits `length` bytes into at most `count` segments.
fn plan_segments(length: u64, count: usize) -> Vec<Arc<Segment>> {
    if length == 0 {
        return Vec::new();
    }
    let by_size = length.div_ceil(MIN_SEGMENT_BYTES);
    let count = (count.max(1) as u64).min(by_size);
    let chunk = length / count;
    (0..count)
        .map(|i| {
            let start = i * chunk;
            let end = if i == count - 1 {
                length - 1
            } else {
                start + chunk - 1
            };
            Arc::new(Segment::new(start, end))
        })
        .collect()
}

struct FileState {
    info: FileInfo,
    disk_path: PathBuf,
    url: Url,
    segments: Vec<Arc<Segment>>,
}

impl FileState {
    fn available_from(&self, pos: u64) -> u64 {
        self.segments
            .iter()
            .find_map(|s| s.available_from(pos))
            .unwrap_or(0)
    }
}

struct Metadata {
    name: String,
    files: Vec<FileState>,
}

struct SpeedSample {
    at: Instant,
    downloaded: u64,
    rate: u64,
}

impl SpeedSample {
    fn new() -> Self {
        Self {
            at: Instant::now(),
            downloaded: 0,
            rate: 0,
        }
    }

    fn update(&mut self, downloaded: u64) -> u64 {
        let elapsed = self.at.elapsed();
        if elapsed >= Duration::from_secs(1) {
            let delta = downloaded.saturating_sub(self.downloaded);
            self.rate = (delta as f64 / elapsed.as_secs_f64()) as u64;
            self.at = Instant::now();
            self.downloaded = downloaded;
        }
        self.rate
    }
}

struct Shared {
    id: String,
    initial_name: Option<String>,
    tracker: Option<String>,
    save_path: PathBuf,
    metadata: OnceLock<Metadata>,
    /// Set once the transfer has given up; bytes not yet on disk never arrive.
    failure: OnceLock<String>,
    /// Woken whenever any segment makes progress, and on failure.
    notify: Notify,
    cancel: CancellationToken,
    tasks: TaskTracker,
    active_connections: AtomicUsize,
    speed: Mutex<SpeedSample>,
}

struct Driver {
    shared: Arc<Shared>,
    client: Client,
    limiter: SpeedLimiter,
    options: WebSeedOptions,
    events: mpsc::UnboundedSender<TransferEvent>,
}

impl Driver {
    async fn run(self, plan: Plan) {
        let cancel = self.shared.cancel.clone();
        let outcome = tokio::select! {
            _ = cancel.cancelled() => return,
            outcome = self.fetch_all(plan) => outcome,
        };
        match outcome {
            Ok(()) => {
                info!(id = %self.shared.id, "web-seed transfer complete");
                let _ = self.events.send(TransferEvent::Complete);
            }
            Err(EngineError::Destroyed) => {}
            Err(e) => {
                warn!(id = %self.shared.id, error = %e, "web-seed transfer failed");
                let _ = self.shared.failure.set(e.to_string());
                self.shared.notify.notify_waiters();
                let _ = self.events.send(TransferEvent::Failed(e.to_string()));
            }
        }
    }

    async fn fetch_all(&self, plan: Plan) -> Result<(), EngineError> {
        let metadata = self.resolve(plan).await?;
        let name = metadata.name.clone();
        let files = metadata.files.iter().map(|f| f.info.clone()).collect();
        for file in &metadata.files {
            allocate(&file.disk_path, file.info.length).await?;
        }
        if self.shared.metadata.set(metadata).is_err() {
            return Err(EngineError::Destroyed);
        }
        let _ = self.events.send(TransferEvent::MetadataReady { name, files });

        let metadata = self.shared.metadata.get().ok_or(EngineError::NotReady)?;
        let mut workers = Vec::new();
        for file in &metadata.files {
            for segment in &file.segments {
                let worker = SegmentWorker {
                    shared: self.shared.clone(),
                    client: self.client.clone(),
                    limiter: self.limiter.clone(),
                    url: file.url.clone(),
                    path: file.disk_path.clone(),
                    segment: segment.clone(),
                    retries: self.options.retries,
                };
                workers.push(self.shared.tasks.spawn(worker.run()));
            }
        }

        let mut first_error = None;
        for worker in workers {
            let result = match worker.await {
                Ok(result) => result,
                Err(e) => Err(EngineError::Io(std::io::Error::other(e))),
            };
            if let Err(e) = result {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn resolve(&self, plan: Plan) -> Result<Metadata, EngineError> {
        match plan {
            Plan::Descriptor(descriptor) => self.from_descriptor(descriptor),
            Plan::Magnet(link) => {
                if let Some(xs) = &link.exact_source {
                    debug!(id = %self.shared.id, url = %xs, "fetching descriptor from exact source");
                    let bytes = self.client.get(xs).send().await?.error_for_status()?.bytes().await?;
                    let mut descriptor = source::parse_descriptor(&bytes)?;
                    descriptor.web_seeds.extend(link.web_seeds.iter().cloned());
                    return self.from_descriptor(descriptor);
                }
                let seed = link.web_seeds.first().ok_or_else(|| {
                    EngineError::InvalidSource("magnet reference has no web seed".into())
                })?;
                let url = Url::parse(seed).map_err(|e| EngineError::InvalidSource(e.to_string()))?;
                let length = self.probe_length(&url).await?;
                let name = link
                    .display_name
                    .clone()
                    .or_else(|| url.path_segments().and_then(|s| s.last()).map(str::to_string))
                    .filter(|n| !n.is_empty() && !n.contains(['/', '\\']) && n != "..")
                    .unwrap_or_else(|| link.info_hash.clone());
                let file = self.file_state(0, name.clone(), length, url);
                Ok(Metadata {
                    name,
                    files: vec![file],
                })
            }
        }
    }

    fn from_descriptor(&self, descriptor: Descriptor) -> Result<Metadata, EngineError> {
        let seed = descriptor.web_seeds.first().ok_or_else(|| {
            EngineError::InvalidSource("descriptor has no url-list web seed".into())
        })?;
        let base = Url::parse(seed).map_err(|e| EngineError::InvalidSource(e.to_string()))?;
        let mut files = Vec::with_capacity(descriptor.files.len());
        for (index, file) in descriptor.files.iter().enumerate() {
            let url = file_url(&base, &file.path, descriptor.multi_file)?;
            files.push(self.file_state(index, file.path.clone(), file.length, url));
        }
        Ok(Metadata {
            name: descriptor.name,
            files,
        })
    }

    fn file_state(&self, index: usize, path: String, length: u64, url: Url) -> FileState {
        let disk_path = path
            .split('/')
            .fold(self.shared.save_path.clone(), |acc, part| acc.join(part));
        FileState {
            info: FileInfo::new(index, path, length),
            disk_path,
            url,
            segments: plan_segments(length, self.options.segments),
        }
    }

    /// Learns the size of a remote file: HEAD first, then a one-byte ranged GET.
    async fn probe_length(&self, url: &Url) -> Result<u64, EngineError> {
        if let Ok(resp) = self.client.head(url.clone()).send().await {
            let length = resp
                .headers()
                .get(CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok());
            if let (true, Some(length)) = (resp.status().is_success(), length) {
                if length > 0 {
                    return Ok(length);
                }
            }
        }

        let resp = self
            .client
            .get(url.clone())
            .header(RANGE, "bytes=0-0")
            .send()
            .await?
            .error_for_status()?;
        let total = if resp.status() == StatusCode::PARTIAL_CONTENT {
            resp.headers()
                .get(CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.rsplit_once('/'))
                .and_then(|(_, total)| total.trim().parse::<u64>().ok())
        } else {
            resp.content_length()
        };
        total.ok_or_else(|| EngineError::InvalidSource(format!("cannot determine size of {url}")))
    }
}

/// BEP-19 style URL of a descriptor file below a web seed.
fn file_url(base: &Url, path: &str, multi_file: bool) -> Result<Url, EngineError> {
    let mut url = base.clone();
    if !multi_file && !base.path().ends_with('/') {
        return Ok(url);
    }
    url.path_segments_mut()
        .map_err(|_| EngineError::InvalidSource(format!("web seed {base} cannot carry paths")))?
        .pop_if_empty()
        .extend(path.split('/'));
    Ok(url)
}

/// Creates the file and its parent directories at full length.
async fn allocate(path: &Path, length: u64) -> Result<(), EngineError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)
        .await?;
    if file.metadata().await?.len() != length {
        file.set_len(length).await?;
    }
    Ok(())
}

struct SegmentWorker {
    shared: Arc<Shared>,
    client: Client,
    limiter: SpeedLimiter,
    url: Url,
    path: PathBuf,
    segment: Arc<Segment>,
    retries: u32,
}

impl SegmentWorker {
    async fn run(self) -> Result<(), EngineError> {
        let cancel = self.shared.cancel.clone();
        let mut attempts = 0;
        loop {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(EngineError::Destroyed),
                result = self.fetch_once() => result,
            };
            match result {
                Ok(()) => return Ok(()),
                Err(e) => {
                    attempts += 1;
                    if attempts > self.retries {
                        return Err(e);
                    }
                    debug!(
                        url = %self.url,
                        start = self.segment.start,
                        attempt = attempts,
                        error = %e,
                        "segment fetch failed, retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(500 * u64::from(attempts))).await;
                }
            }
        }
    }

    async fn fetch_once(&self) -> Result<(), EngineError> {
        let pos = self.segment.current.load(Ordering::Acquire);
        if pos > self.segment.end {
            return Ok(());
        }

        self.shared.active_connections.fetch_add(1, Ordering::SeqCst);
        let result = self.stream_segment(pos).await;
        self.shared.active_connections.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn stream_segment(&self, pos: u64) -> Result<(), EngineError> {
        let resp = self
            .client
            .get(self.url.clone())
            .header(RANGE, format!("bytes={}-{}", pos, self.segment.end))
            .send()
            .await?
            .error_for_status()?;

        // A server that ignores ranges is only usable from the first byte.
        if resp.status() != StatusCode::PARTIAL_CONTENT && pos != 0 {
            return Err(EngineError::Io(std::io::Error::other(format!(
                "{} does not honour range requests",
                self.url
            ))));
        }

        let mut file = OpenOptions::new().write(true).open(&self.path).await?;
        file.seek(SeekFrom::Start(pos)).await?;

        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            let current = self.segment.current.load(Ordering::Acquire);
            let wanted = (self.segment.end + 1 - current).min(chunk.len() as u64) as usize;
            let bytes = &chunk[..wanted];

            self.limiter.take(bytes.len() as u64).await;
            file.write_all(bytes).await?;
            file.flush().await?;
            self.segment
                .current
                .fetch_add(bytes.len() as u64, Ordering::AcqRel);
            self.shared.notify.notify_waiters();

            if self.segment.is_complete() {
                return Ok(());
            }
        }

        if self.segment.is_complete() {
            Ok(())
        } else {
            Err(EngineError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "web seed closed the connection early",
            )))
        }
    }
}

pub struct WebSeedTransfer {
    shared: Arc<Shared>,
}

#[async_trait]
impl TransferHandle for WebSeedTransfer {
    fn id(&self) -> &str {
        &self.shared.id
    }

    fn name(&self) -> Option<String> {
        self.shared
            .metadata
            .get()
            .map(|m| m.name.clone())
            .or_else(|| self.shared.initial_name.clone())
    }

    fn tracker(&self) -> Option<String> {
        self.shared.tracker.clone()
    }

    fn progress(&self) -> TransferProgress {
        let (downloaded, total) = match self.shared.metadata.get() {
            Some(metadata) => metadata.files.iter().fold((0, 0), |(done, total), f| {
                let fetched: u64 = f.segments.iter().map(|s| s.fetched()).sum();
                (done + fetched, total + f.info.length)
            }),
            None => (0, 0),
        };
        let download_speed = match self.shared.speed.lock() {
            Ok(mut sample) => sample.update(downloaded),
            Err(_) => 0,
        };
        TransferProgress {
            downloaded,
            total,
            download_speed,
            upload_speed: 0,
            peers: self.shared.active_connections.load(Ordering::SeqCst),
        }
    }

    fn files(&self) -> Vec<FileInfo> {
        self.shared
            .metadata
            .get()
            .map(|m| m.files.iter().map(|f| f.info.clone()).collect())
            .unwrap_or_default()
    }

    async fn open_read(&self, index: usize, range: ByteRange) -> Result<ByteStream, EngineError> {
        if self.shared.cancel.is_cancelled() {
            return Err(EngineError::Destroyed);
        }
        let metadata = self.shared.metadata.get().ok_or(EngineError::NotReady)?;
        let file = metadata
            .files
            .get(index)
            .ok_or(EngineError::FileNotFound(index))?;
        if range.end >= file.info.length {
            return Err(EngineError::FileNotFound(index));
        }

        let reader = SegmentReader {
            shared: self.shared.clone(),
            index,
            path: file.disk_path.clone(),
            file: None,
            pos: range.start,
            end: range.end,
            done: false,
        };
        Ok(futures_util::stream::unfold(reader, |mut reader| async move {
            let item = reader.next_chunk().await?;
            Some((item, reader))
        })
        .boxed())
    }

    async fn destroy(&self) {
        self.shared.cancel.cancel();
        self.shared.tasks.close();
        self.shared.tasks.wait().await;
        info!(id = %self.shared.id, "web-seed transfer destroyed");
    }
}

/// Sequential reader over a file that waits for bytes still being fetched.
struct SegmentReader {
    shared: Arc<Shared>,
    index: usize,
    path: PathBuf,
    file: Option<File>,
    pos: u64,
    end: u64,
    done: bool,
}

impl SegmentReader {
    async fn next_chunk(&mut self) -> Option<std::io::Result<Bytes>> {
        if self.done || self.pos > self.end {
            return None;
        }
        let result = self.read_available().await;
        if result.is_err() {
            self.done = true;
        }
        Some(result)
    }

    async fn read_available(&mut self) -> std::io::Result<Bytes> {
        let shared = self.shared.clone();
        loop {
            let notified = shared.notify.notified();
            if shared.cancel.is_cancelled() {
                return Err(std::io::Error::other(EngineError::Destroyed));
            }

            let available = shared
                .metadata
                .get()
                .and_then(|m| m.files.get(self.index))
                .map(|f| f.available_from(self.pos))
                .unwrap_or(0);
            if available > 0 {
                let len = available.min(self.end + 1 - self.pos).min(READ_CHUNK) as usize;
                return self.read_at_cursor(len).await;
            }
            if let Some(reason) = shared.failure.get() {
                return Err(std::io::Error::other(EngineError::Failed(reason.clone())));
            }

            tokio::select! {
                _ = notified => {}
                _ = shared.cancel.cancelled() => {}
            }
        }
    }

    async fn read_at_cursor(&mut self, len: usize) -> std::io::Result<Bytes> {
        if self.file.is_none() {
            let mut file = File::open(&self.path).await?;
            file.seek(SeekFrom::Start(self.pos)).await?;
            self.file = Some(file);
        }
        let file = self.file.as_mut().ok_or_else(|| std::io::Error::other("reader closed"))?;
        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf).await?;
        self.pos += len as u64;
        Ok(Bytes::from(buf))
    }
}
