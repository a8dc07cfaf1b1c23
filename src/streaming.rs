//! Byte-range delivery for transfer-backed and on-disk files.
//!
//! Both the session stream and the file browser go through [`respond`]; only
//! the way bytes are opened differs between a [`StreamSource::Transfer`] and a
//! [`StreamSource::Disk`] resource.

use crate::engine::{ByteStream, TransferHandle};
use crate::error::ApiError;
use crate::models::FileInfo;
use axum::body::Body;
use axum::http::{header, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};
use tokio_util::io::ReaderStream;
use tracing::debug;

/// Content type used by the session stream when the extension is unknown.
pub const DEFAULT_VIDEO_TYPE: &str = "video/mp4";
/// Content type used for on-disk files when the extension is unknown.
pub const DEFAULT_BINARY_TYPE: &str = "application/octet-stream";

const DISK_READ_BUFFER: usize = 64 * 1024;

/// Inclusive byte range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }
}

/// Interprets a `Range` header against a resource of `size` bytes.
///
/// `Ok(None)` means the whole resource is served: no header, a unit other than
/// `bytes`, several ranges, or syntax that does not parse. An `end` past the
/// resource is clamped to its last byte.
pub fn resolve_range(header: Option<&str>, size: u64) -> Result<Option<ByteRange>, ApiError> {
    let Some(spec) = header.and_then(|h| h.trim().strip_prefix("bytes=")) else {
        return Ok(None);
    };
    if spec.contains(',') {
        return Ok(None);
    }
    let Some((start, end)) = spec.split_once('-') else {
        return Ok(None);
    };
    let (start, end) = (start.trim(), end.trim());
    let unsatisfiable = ApiError::RangeUnsatisfiable { size };

    if start.is_empty() {
        let Ok(suffix) = end.parse::<u64>() else {
            return Ok(None);
        };
        if suffix == 0 || size == 0 {
            return Err(unsatisfiable);
        }
        return Ok(Some(ByteRange::new(size.saturating_sub(suffix), size - 1)));
    }

    let Ok(start) = start.parse::<u64>() else {
        return Ok(None);
    };
    let end = if end.is_empty() {
        size.saturating_sub(1)
    } else {
        match end.parse::<u64>() {
            Ok(end) => end.min(size.saturating_sub(1)),
            Err(_) => return Ok(None),
        }
    };
    if start >= size || start > end {
        return Err(unsatisfiable);
    }
    Ok(Some(ByteRange::new(start, end)))
}

/// A resource the responder can deliver.
pub enum StreamSource {
    /// A file of a running or finished transfer, read through the engine.
    Transfer {
        handle: Arc<dyn TransferHandle>,
        file: FileInfo,
    },
    /// A plain file below the download root.
    Disk { path: PathBuf },
}

impl StreamSource {
    fn label(&self) -> String {
        match self {
            Self::Transfer { handle, file } => format!("{}#{}", handle.id(), file.index),
            Self::Disk { path } => path.display().to_string(),
        }
    }

    async fn describe(&self) -> Result<(String, u64), ApiError> {
        match self {
            Self::Transfer { file, .. } => Ok((file.name.clone(), file.length)),
            Self::Disk { path } => {
                let metadata = tokio::fs::metadata(path).await?;
                if !metadata.is_file() {
                    return Err(ApiError::NotFound(format!("{} is not a file", path.display())));
                }
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                Ok((name, metadata.len()))
            }
        }
    }

    async fn open(&self, range: ByteRange) -> Result<ByteStream, ApiError> {
        match self {
            Self::Transfer { handle, file } => Ok(handle.open_read(file.index, range).await?),
            Self::Disk { path } => {
                let mut file = tokio::fs::File::open(path).await?;
                file.seek(SeekFrom::Start(range.start)).await?;
                let reader = file.take(range.len());
                Ok(ReaderStream::with_capacity(reader, DISK_READ_BUFFER).boxed())
            }
        }
    }
}

/// Builds the response for `source`, honouring an optional `Range` header.
pub async fn respond(
    source: StreamSource,
    range_header: Option<&str>,
    fallback_type: &str,
) -> Result<Response, ApiError> {
    let (name, size) = source.describe().await?;
    let content_type = mime_guess::from_path(&name)
        .first()
        .map(|m| m.to_string())
        .unwrap_or_else(|| fallback_type.to_string());

    let range = resolve_range(range_header, size)?;
    let builder = Response::builder()
        .header(header::CONTENT_TYPE, content_type)
        .header(header::ACCEPT_RANGES, "bytes");

    let (builder, span) = match range {
        Some(range) => (
            builder
                .status(StatusCode::PARTIAL_CONTENT)
                .header(
                    header::CONTENT_RANGE,
                    format!("bytes {}-{}/{}", range.start, range.end, size),
                )
                .header(header::CONTENT_LENGTH, range.len()),
            Some(range),
        ),
        None => (
            builder
                .status(StatusCode::OK)
                .header(header::CONTENT_LENGTH, size),
            (size > 0).then(|| ByteRange::new(0, size - 1)),
        ),
    };

    let body = match span {
        Some(span) => {
            let stream = source.open(span).await?;
            Body::from_stream(TrackedStream::new(stream, source.label(), span.len()))
        }
        None => Body::empty(),
    };
    builder
        .body(body)
        .map_err(|e| ApiError::Internal(e.to_string()))
}

/// Wraps a response body stream; the inner read stream is dropped as soon as
/// the client goes away or a read fails, and is never resumed after an error.
struct TrackedStream {
    inner: Option<ByteStream>,
    label: String,
    remaining: u64,
}

impl TrackedStream {
    fn new(inner: ByteStream, label: String, remaining: u64) -> Self {
        Self {
            inner: Some(inner),
            label,
            remaining,
        }
    }
}

impl Stream for TrackedStream {
    type Item = std::io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let Some(inner) = this.inner.as_mut() else {
            return Poll::Ready(None);
        };
        match inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                this.remaining = this.remaining.saturating_sub(chunk.len() as u64);
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                debug!(resource = %this.label, error = %e, "read failed mid-stream, closing response");
                this.inner = None;
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                this.inner = None;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for TrackedStream {
    fn drop(&mut self) {
        if self.inner.is_some() && self.remaining > 0 {
            debug!(
                resource = %self.label,
                unsent = self.remaining,
                "client disconnected, tearing down read stream"
            );
        }
    }
}
