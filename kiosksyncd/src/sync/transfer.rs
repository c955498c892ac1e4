use std::{
    io,
    io::SeekFrom,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use futures_util::StreamExt;
use kiosk_core::{BackendClient, BackendError};
use md5::Context;
use reqwest::{Response, StatusCode, header::CONTENT_RANGE};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::{io::ReaderStream, sync::CancellationToken};

const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;
pub const DEFAULT_TRANSFER_CONCURRENCY: usize = 2;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("transfer cancelled")]
    Cancelled,
    #[error("transfer timed out")]
    TimedOut,
    #[error("source file is missing: {}", .0.display())]
    MissingSource(PathBuf),
    #[error("download integrity check failed: expected {expected_md5}, got {actual_md5}")]
    IntegrityMismatch {
        expected_md5: String,
        actual_md5: String,
    },
    #[error("concurrency limiter is closed")]
    ConcurrencyClosed,
}

impl TransferError {
    pub fn is_retryable(&self) -> bool {
        match self {
            TransferError::Request(_)
            | TransferError::Io(_)
            | TransferError::TimedOut
            | TransferError::IntegrityMismatch { .. } => true,
            TransferError::Backend(err) => err.is_retryable(),
            TransferError::Url(_)
            | TransferError::Cancelled
            | TransferError::MissingSource(_)
            | TransferError::ConcurrencyClosed => false,
        }
    }
}

/// Called with (bytes sent, total bytes) after each uploaded chunk.
pub type UploadProgress = Arc<dyn Fn(u64, u64) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadRequest {
    pub local_path: PathBuf,
    pub url: String,
    pub mime_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    pub url: String,
    pub dest_path: PathBuf,
}

#[derive(Debug, Clone, Copy)]
pub struct TransferConfig {
    pub download_concurrency: usize,
    pub upload_concurrency: usize,
    pub chunk_size: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            download_concurrency: DEFAULT_TRANSFER_CONCURRENCY,
            upload_concurrency: DEFAULT_TRANSFER_CONCURRENCY,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

#[derive(Clone)]
pub struct TransferWorker {
    backend: BackendClient,
    download_limit: Arc<Semaphore>,
    upload_limit: Arc<Semaphore>,
    chunk_size: usize,
}

impl TransferWorker {
    pub fn new(backend: BackendClient) -> Self {
        Self::with_config(backend, TransferConfig::default())
    }

    pub fn with_config(backend: BackendClient, config: TransferConfig) -> Self {
        Self {
            backend,
            download_limit: Arc::new(Semaphore::new(config.download_concurrency.max(1))),
            upload_limit: Arc::new(Semaphore::new(config.upload_concurrency.max(1))),
            chunk_size: config.chunk_size.max(1),
        }
    }

    /// Streams a local file to `request.url` and returns the byte count.
    ///
    /// The upload endpoint has no ranged writes, so every attempt starts at
    /// byte zero. The token is checked before each chunk leaves the file.
    pub async fn upload(
        &self,
        request: &UploadRequest,
        cancel: &CancellationToken,
        progress: UploadProgress,
    ) -> Result<u64, TransferError> {
        let _permit = acquire(&self.upload_limit, cancel).await?;
        let file = match tokio::fs::File::open(&request.local_path).await {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(TransferError::MissingSource(request.local_path.clone()));
            }
            Err(err) => return Err(err.into()),
        };
        let total = file.metadata().await?.len();
        let sent = Arc::new(AtomicU64::new(0));

        let stream = ReaderStream::with_capacity(file, self.chunk_size).map({
            let cancel = cancel.clone();
            let sent = sent.clone();
            move |chunk| {
                if cancel.is_cancelled() {
                    return Err(io::Error::new(
                        io::ErrorKind::Interrupted,
                        "upload cancelled",
                    ));
                }
                let chunk = chunk?;
                let done = sent.fetch_add(chunk.len() as u64, Ordering::SeqCst) + chunk.len() as u64;
                progress(done, total);
                Ok::<_, io::Error>(chunk)
            }
        });
        let body = reqwest::Body::wrap_stream(stream);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TransferError::Cancelled),
            result = self.backend.upload_body(&request.url, &request.mime_type, total, body) => {
                match result {
                    Ok(()) => Ok(total),
                    Err(_) if cancel.is_cancelled() => Err(TransferError::Cancelled),
                    Err(err) => Err(err.into()),
                }
            }
        }
    }

    /// Opens `<dest>.partial` and the remote stream, resuming at
    /// `resume_from` when the partial file still holds that many bytes.
    pub async fn start_download(
        &self,
        request: &DownloadRequest,
        resume_from: u64,
        cancel: &CancellationToken,
    ) -> Result<DownloadSession, TransferError> {
        let permit = acquire(&self.download_limit, cancel).await?;
        if let Some(parent) = request.dest_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let partial = partial_path(&request.dest_path);
        let on_disk = match tokio::fs::metadata(&partial).await {
            Ok(meta) => meta.len(),
            Err(err) if err.kind() == io::ErrorKind::NotFound => 0,
            Err(err) => return Err(err.into()),
        };
        let offset = resume_from.min(on_disk);

        let response = match self.open(&request.url, offset, cancel).await {
            Err(TransferError::Backend(err))
                if offset > 0 && err.status() == Some(StatusCode::RANGE_NOT_SATISFIABLE) =>
            {
                tracing::debug!(url = %request.url, offset, "range rejected, restarting download");
                self.open(&request.url, 0, cancel).await?
            }
            other => other?,
        };

        let start = if response.status() == StatusCode::PARTIAL_CONTENT {
            match content_range_start(&response) {
                Some(start) if start != offset => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("server resumed at byte {start}, expected {offset}"),
                    )
                    .into());
                }
                _ => offset,
            }
        } else {
            0
        };
        let total = response.content_length().map(|len| start + len);

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&partial)
            .await?;
        file.set_len(start).await?;
        file.seek(SeekFrom::Start(start)).await?;

        Ok(DownloadSession {
            file,
            response,
            partial,
            target: request.dest_path.clone(),
            downloaded: start,
            total,
            _permit: permit,
        })
    }

    async fn open(
        &self,
        url: &str,
        offset: u64,
        cancel: &CancellationToken,
    ) -> Result<Response, TransferError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TransferError::Cancelled),
            response = self.backend.open_download(url, offset) => Ok(response?),
        }
    }
}

/// One download attempt in progress. Bytes written are not confirmed until
/// [`DownloadSession::checkpoint`] returns.
pub struct DownloadSession {
    file: tokio::fs::File,
    response: Response,
    partial: PathBuf,
    target: PathBuf,
    downloaded: u64,
    total: Option<u64>,
    _permit: OwnedSemaphorePermit,
}

impl DownloadSession {
    /// Offset the server resumed from plus bytes written since.
    pub fn offset(&self) -> u64 {
        self.downloaded
    }

    pub fn total(&self) -> Option<u64> {
        self.total.filter(|total| *total >= self.downloaded)
    }

    /// Writes the next chunk. `Ok(None)` at end of stream.
    pub async fn next_chunk(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<Option<usize>, TransferError> {
        let chunk = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TransferError::Cancelled),
            chunk = self.response.chunk() => chunk?,
        };
        match chunk {
            Some(bytes) => {
                self.file.write_all(&bytes).await?;
                self.downloaded += bytes.len() as u64;
                Ok(Some(bytes.len()))
            }
            None => Ok(None),
        }
    }

    /// Flushes written bytes to disk and returns the confirmed offset.
    pub async fn checkpoint(&mut self) -> Result<u64, TransferError> {
        self.file.flush().await?;
        self.file.sync_data().await?;
        Ok(self.downloaded)
    }

    /// Verifies the optional MD5 and moves the partial file into place.
    pub async fn finish(mut self, expected_md5: Option<&str>) -> Result<u64, TransferError> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        drop(self.file);

        if let Some(expected_md5) = expected_md5 {
            let expected_md5 = expected_md5.to_ascii_lowercase();
            let actual_md5 = file_md5(&self.partial).await?;
            if actual_md5 != expected_md5 {
                let _ = tokio::fs::remove_file(&self.partial).await;
                return Err(TransferError::IntegrityMismatch {
                    expected_md5,
                    actual_md5,
                });
            }
        }

        tokio::fs::rename(&self.partial, &self.target).await?;
        Ok(self.downloaded)
    }
}

async fn acquire(
    limit: &Arc<Semaphore>,
    cancel: &CancellationToken,
) -> Result<OwnedSemaphorePermit, TransferError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(TransferError::Cancelled),
        permit = limit.clone().acquire_owned() => {
            permit.map_err(|_| TransferError::ConcurrencyClosed)
        }
    }
}

async fn file_md5(path: &Path) -> Result<String, TransferError> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut ctx = Context::new();
    let mut buf = vec![0u8; DEFAULT_CHUNK_SIZE];
    loop {
        let read = file.read(&mut buf).await?;
        if read == 0 {
            break;
        }
        ctx.consume(&buf[..read]);
    }
    Ok(format!("{:x}", ctx.compute()))
}

fn content_range_start(response: &Response) -> Option<u64> {
    let value = response.headers().get(CONTENT_RANGE)?.to_str().ok()?;
    let range = value.trim().strip_prefix("bytes ")?;
    let (start, _) = range.split_once('-')?;
    start.trim().parse().ok()
}

pub fn partial_path(target: &Path) -> PathBuf {
    target.with_extension(format!(
        "{}partial",
        target
            .extension()
            .map(|ext| format!("{}.", ext.to_string_lossy()))
            .unwrap_or_default()
    ))
}
