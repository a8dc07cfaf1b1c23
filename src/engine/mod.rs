//! Boundary to the swarm-transfer engine.
//!
//! The registry only talks to an engine through [`SwarmEngine`] and the
//! [`TransferHandle`]s it returns. Engine events travel over a channel so that
//! the registry applies them as explicit state transitions instead of running
//! callbacks inside the engine.

pub mod bencode;
pub mod source;
pub mod webseed;

use crate::models::FileInfo;
use crate::streaming::ByteRange;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

pub use source::TransferSource;
pub use webseed::{WebSeedEngine, WebSeedOptions};

/// A stream of file bytes handed to the range responder.
pub type ByteStream = BoxStream<'static, std::io::Result<Bytes>>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid source: {0}")]
    InvalidSource(String),
    #[error("transfer metadata not available yet")]
    NotReady,
    #[error("file index {0} not found in transfer")]
    FileNotFound(usize),
    #[error("transfer was destroyed")]
    Destroyed,
    #[error("transfer failed: {0}")]
    Failed(String),
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Events a running transfer reports back to its owner.
#[derive(Debug, Clone)]
pub enum TransferEvent {
    MetadataReady { name: String, files: Vec<FileInfo> },
    Complete,
    Failed(String),
}

/// Live counters sampled from a transfer.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TransferProgress {
    pub downloaded: u64,
    pub total: u64,
    pub download_speed: u64,
    pub upload_speed: u64,
    pub peers: usize,
}

impl TransferProgress {
    /// Fraction complete in `0.0..=1.0`.
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            (self.downloaded as f64 / self.total as f64).min(1.0)
        }
    }
}

/// A started transfer and the receiving end of its event channel.
pub struct Transfer {
    pub handle: Arc<dyn TransferHandle>,
    pub events: mpsc::UnboundedReceiver<TransferEvent>,
}

#[async_trait]
pub trait SwarmEngine: Send + Sync {
    /// Starts retrieving `source` into `save_path`.
    ///
    /// Returns as soon as the transfer has an identity; metadata and
    /// completion arrive later as [`TransferEvent`]s.
    async fn begin(&self, source: TransferSource, save_path: &Path) -> Result<Transfer, EngineError>;
}

#[async_trait]
pub trait TransferHandle: Send + Sync {
    /// Stable identifier derived from the content hash.
    fn id(&self) -> &str;

    /// Display name, if one is known yet.
    fn name(&self) -> Option<String>;

    /// First announce URL of the transfer.
    fn tracker(&self) -> Option<String>;

    fn progress(&self) -> TransferProgress;

    /// Files of the transfer; empty until metadata is known.
    fn files(&self) -> Vec<FileInfo>;

    /// Opens a stream over the inclusive byte range of file `index`.
    ///
    /// Bytes that have not been fetched yet are waited for. The stream fails
    /// once the transfer is destroyed.
    async fn open_read(&self, index: usize, range: ByteRange) -> Result<ByteStream, EngineError>;

    /// Stops the transfer and waits for its workers to wind down.
    async fn destroy(&self);
}
