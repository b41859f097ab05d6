//! Bounded-memory file transfer.
//!
//! [`FileUpload`] reads a local file lazily in fixed-size chunks and reports its
//! length up front so the request carries an exact `Content-Length`.
//! [`write_chunks`] drains a response body into a local file in blocks of the
//! same size. Neither ever holds more than one chunk in memory.

use crate::error::ClientError;
use crate::response::{BoxError, ResponseBody};
use crate::signer::RequestBody;
use bytes::{Bytes, BytesMut};
use http::{HeaderMap, StatusCode};
use http_body::Frame;
use http_body_util::{BodyExt, StreamBody};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Shared view of an upload's progress, usable after the upload was handed
/// to the client.
#[derive(Debug, Clone)]
pub struct UploadProgress {
    read: Arc<AtomicU64>,
    total: u64,
}

impl UploadProgress {
    #[must_use]
    pub fn bytes_read(&self) -> u64 {
        self.read.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn total(&self) -> u64 {
        self.total
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.bytes_read() == self.total
    }
}

/// A local file opened for one chunked, single-pass read.
///
/// The file handle is owned for the lifetime of the upload and closed when it
/// is dropped, whether the transfer finished or not. Reading again after the
/// end was reported is an error rather than an empty second pass.
pub struct FileUpload {
    file: File,
    path: PathBuf,
    chunk_size: usize,
    progress: UploadProgress,
    finished: bool,
}

impl FileUpload {
    /// Open `path` for upload in `chunk_size` chunks.
    ///
    /// # Errors
    /// Returns `ClientError::Io` if the file cannot be opened or inspected, and
    /// `ConfigError::InvalidValue` for a zero chunk size.
    pub async fn open(path: impl AsRef<Path>, chunk_size: usize) -> Result<Self, ClientError> {
        if chunk_size == 0 {
            return Err(crate::error::ConfigError::InvalidValue {
                field: "chunk_size",
                reason: "must be greater than zero".to_owned(),
            }
            .into());
        }
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).await?;
        let total = file.metadata().await?.len();

        tracing::debug!(path = %path.display(), size = total, chunk_size, "opened upload source");

        Ok(Self {
            file,
            path,
            chunk_size,
            progress: UploadProgress {
                read: Arc::new(AtomicU64::new(0)),
                total,
            },
            finished: false,
        })
    }

    /// Total size in bytes, fixed when the file was opened.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.progress.total
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.progress.total == 0
    }

    #[must_use]
    pub fn bytes_read(&self) -> u64 {
        self.progress.bytes_read()
    }

    #[must_use]
    pub fn progress(&self) -> UploadProgress {
        self.progress.clone()
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the next chunk: exactly `chunk_size` bytes except for the last one.
    ///
    /// Returns `Ok(None)` once at the end of the file.
    ///
    /// # Errors
    /// Returns `ClientError::NonReplayableBody` when called after the end was
    /// reported, and `ClientError::Io` if the file shrank or a read failed.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>, ClientError> {
        if self.finished {
            return Err(ClientError::NonReplayableBody("an exhausted file upload"));
        }

        let read = self.progress.bytes_read();
        let remaining = self.progress.total - read;
        if remaining == 0 {
            self.finished = true;
            tracing::trace!(path = %self.path.display(), bytes = read, "upload source exhausted");
            return Ok(None);
        }

        let want = usize::try_from(remaining).map_or(self.chunk_size, |r| r.min(self.chunk_size));
        let mut chunk = BytesMut::zeroed(want);
        let mut filled = 0;
        while filled < want {
            let n = self.file.read(&mut chunk[filled..]).await?;
            if n == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!(
                        "'{}' shrank during upload: expected {} bytes",
                        self.path.display(),
                        self.progress.total
                    ),
                )
                .into());
            }
            filled += n;
        }

        self.progress.read.fetch_add(want as u64, Ordering::Relaxed);
        Ok(Some(chunk.freeze()))
    }

    /// Turn the upload into a streaming request body.
    #[must_use]
    pub fn into_body(self) -> RequestBody {
        let chunks = futures_util::stream::try_unfold(self, |mut upload| async move {
            Ok::<_, ClientError>(
                upload
                    .next_chunk()
                    .await?
                    .map(|chunk| (Frame::data(chunk), upload)),
            )
        });
        StreamBody::new(chunks)
            .map_err(|e| -> BoxError { Box::new(e) })
            .boxed_unsync()
    }
}

impl fmt::Debug for FileUpload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileUpload")
            .field("path", &self.path)
            .field("len", &self.progress.total)
            .field("bytes_read", &self.progress.bytes_read())
            .field("chunk_size", &self.chunk_size)
            .finish_non_exhaustive()
    }
}

/// Outcome of [`QrsClient::download`](crate::QrsClient::download).
#[derive(Debug, Clone)]
pub struct DownloadReport {
    pub status: StatusCode,
    pub headers: HeaderMap,
    /// Bytes written to `destination`; zero when the status was not a success
    pub bytes_written: u64,
    pub destination: PathBuf,
}

/// Drain `body` into `destination` in blocks of `chunk_size` bytes.
///
/// The destination is created or truncated. Empty frames are skipped. If the
/// body fails part-way, everything received so far stays on disk and the
/// error is returned.
///
/// # Errors
/// Returns `ClientError::Io` for file errors and `ClientError::Transport` if
/// the body stream fails.
pub async fn write_chunks(
    body: ResponseBody,
    destination: &Path,
    chunk_size: usize,
) -> Result<u64, ClientError> {
    let chunk_size = chunk_size.max(1);
    let mut file = File::create(destination).await?;
    let mut pending = BytesMut::with_capacity(chunk_size);
    let mut written: u64 = 0;
    let mut body = std::pin::pin!(body);

    while let Some(frame) = body.frame().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                written += flush_pending(&mut file, &mut pending).await?;
                file.flush().await?;
                tracing::debug!(
                    destination = %destination.display(),
                    bytes = written,
                    "download interrupted, partial file kept"
                );
                return Err(ClientError::Transport(e));
            }
        };
        let Ok(data) = frame.into_data() else {
            continue;
        };
        if data.is_empty() {
            continue;
        }
        pending.extend_from_slice(&data);
        while pending.len() >= chunk_size {
            let block = pending.split_to(chunk_size);
            file.write_all(&block).await?;
            written += block.len() as u64;
        }
    }

    written += flush_pending(&mut file, &mut pending).await?;
    file.flush().await?;
    tracing::debug!(destination = %destination.display(), bytes = written, "download complete");
    Ok(written)
}

async fn flush_pending(file: &mut File, pending: &mut BytesMut) -> Result<u64, ClientError> {
    if pending.is_empty() {
        return Ok(0);
    }
    let block = pending.split();
    file.write_all(&block).await?;
    Ok(block.len() as u64)
}
