//! Registry read path.
//!
//! Manifests are small and read whole. Blobs stream from a download task
//! through an in-memory pipe, so a reader only holds one chunk at a time.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, DuplexStream};
use tokio::task::JoinHandle;

use a3s_oci_core::{Descriptor, Result};

use super::{is_manifest_like, RepositoryClient};
use crate::content::{BytesReader, Provider, ReaderAt, CHUNK_SIZE};

/// [`Provider`] over one registry repository.
pub struct RegistryFetcher {
    client: Arc<RepositoryClient>,
}

impl RegistryFetcher {
    pub(crate) fn new(client: Arc<RepositoryClient>) -> Self {
        Self { client }
    }

    pub fn repository_name(&self) -> &str {
        self.client.repository()
    }
}

#[async_trait]
impl Provider for RegistryFetcher {
    async fn reader_at(&self, desc: &Descriptor) -> Result<Box<dyn ReaderAt>> {
        if is_manifest_like(&desc.media_type) {
            let (data, _) = self.client.pull_manifest(desc.digest.as_str()).await?;
            return Ok(Box::new(BytesReader::new(Arc::new(data))));
        }

        let stream = BlobStream::open(self.client.clone(), desc.clone()).await?;
        tracing::trace!(digest = %desc.digest, repository = self.client.repository(), "Opened remote blob");
        Ok(Box::new(RemoteReader {
            client: self.client.clone(),
            desc: desc.clone(),
            stream: tokio::sync::Mutex::new(Some(stream)),
        }))
    }
}

/// A blob download feeding a pipe, positioned at `offset`.
struct BlobStream {
    body: DuplexStream,
    task: Option<JoinHandle<Result<()>>>,
    offset: u64,
    /// Bytes received but not yet handed out
    pending: Vec<u8>,
}

impl BlobStream {
    /// Start downloading from the beginning of the blob.
    ///
    /// The first chunk is read before returning so a missing blob is
    /// reported here rather than on the first read.
    async fn open(client: Arc<RepositoryClient>, desc: Descriptor) -> Result<Self> {
        let (body, sink) = tokio::io::duplex(CHUNK_SIZE);
        let task = tokio::spawn(async move { client.pull_blob(&desc, sink).await });
        let mut stream = Self {
            body,
            task: Some(task),
            offset: 0,
            pending: Vec::new(),
        };
        stream.fill().await?;
        Ok(stream)
    }

    /// Make sure `pending` holds data. Returns `false` at the end of the blob.
    async fn fill(&mut self) -> Result<bool> {
        if !self.pending.is_empty() {
            return Ok(true);
        }
        let mut buf = vec![0u8; CHUNK_SIZE];
        let n = self.body.read(&mut buf).await?;
        if n > 0 {
            buf.truncate(n);
            self.pending = buf;
            return Ok(true);
        }

        // The download task dropped its end of the pipe; report how it ended.
        if let Some(task) = self.task.take() {
            task.await.map_err(|e| {
                std::io::Error::new(std::io::ErrorKind::Other, format!("blob download task failed: {}", e))
            })??;
        }
        Ok(false)
    }

    /// Discard bytes until the stream is positioned at `offset`.
    async fn skip_to(&mut self, offset: u64) -> Result<()> {
        while self.offset < offset {
            if !self.fill().await? {
                break;
            }
            let drop = (offset - self.offset).min(self.pending.len() as u64) as usize;
            self.pending.drain(..drop);
            self.offset += drop as u64;
        }
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if !self.fill().await? {
            return Ok(0);
        }
        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        self.offset += n as u64;
        Ok(n)
    }
}

impl Drop for BlobStream {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Sequential remote reads. Reading ahead skips forward on the open
/// download; reading behind it restarts the download.
struct RemoteReader {
    client: Arc<RepositoryClient>,
    desc: Descriptor,
    stream: tokio::sync::Mutex<Option<BlobStream>>,
}

#[async_trait]
impl ReaderAt for RemoteReader {
    fn size(&self) -> u64 {
        self.desc.size
    }

    async fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        if offset >= self.desc.size || buf.is_empty() {
            return Ok(0);
        }

        let mut guard = self.stream.lock().await;
        let restart = !matches!(guard.as_ref(), Some(s) if s.offset <= offset);
        if restart {
            tracing::trace!(digest = %self.desc.digest, offset, "Restarting remote blob download");
            *guard = Some(BlobStream::open(self.client.clone(), self.desc.clone()).await?);
        }

        match guard.as_mut() {
            Some(stream) => {
                stream.skip_to(offset).await?;
                stream.read(buf).await
            }
            None => Ok(0),
        }
    }
}
