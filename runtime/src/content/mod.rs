//! Content store abstraction.
//!
//! Every storage backend (in-memory, blob index, OCI layout, remote
//! registry) implements a small set of capability traits:
//!
//! - [`Provider`]: random-access reads of a blob by descriptor
//! - [`Ingester`]: streaming writes finalized by an explicit commit
//! - optional [`ContentManager`], [`IngestManager`] and [`MountIngester`],
//!   discovered through capability queries rather than one large trait
//!
//! Composite stores ([`MultiProvider`], [`SplitStore`]) are built by
//! delegation over these traits.

pub mod blob_index;
mod memory;
mod multi;
mod split;

pub use blob_index::{BlobIndex, BlobIndexStore};
pub use memory::MemoryStore;
pub use multi::MultiProvider;
pub use split::SplitStore;

use std::io::SeekFrom;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use a3s_oci_core::{Descriptor, Digest, Digester, OciError, Result};

/// Read size used when streaming blobs.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Random-access view of a single blob.
#[async_trait]
pub trait ReaderAt: Send + Sync {
    /// Total size of the blob in bytes.
    fn size(&self) -> u64;

    /// Read into `buf` starting at `offset`. Returns 0 at end of blob.
    async fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize>;
}

/// Read side of a content store.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Open a reader for the blob `desc` identifies.
    ///
    /// Fails with [`OciError::NotFound`] when the store does not know the digest.
    async fn reader_at(&self, desc: &Descriptor) -> Result<Box<dyn ReaderAt>>;

    /// Listing/deletion capability, when the backend has one.
    fn content_manager(&self) -> Option<&dyn ContentManager> {
        None
    }
}

/// Streaming sink for one blob.
#[async_trait]
pub trait ContentWriter: Send {
    async fn write(&mut self, data: &[u8]) -> Result<()>;

    /// Finalize the write. Content becomes readable under `expected` only
    /// after a successful commit.
    async fn commit(self: Box<Self>, size: u64, expected: &Digest) -> Result<()>;
}

/// Write side of a content store.
#[async_trait]
pub trait Ingester: Send + Sync {
    /// Open a writer for `desc`. `reference` is a human readable upload name.
    ///
    /// Fails with [`OciError::AlreadyExists`] when the content is already present.
    async fn writer(&self, reference: &str, desc: &Descriptor) -> Result<Box<dyn ContentWriter>>;

    /// Cross-repository mount capability (registries only).
    fn mountable(&self) -> Option<&dyn MountIngester> {
        None
    }

    /// In-progress write tracking, when the backend has one.
    fn ingest_manager(&self) -> Option<&dyn IngestManager> {
        None
    }
}

/// Destination that can check for and server-side copy existing blobs.
#[async_trait]
pub trait MountIngester: Send + Sync {
    /// Registry host, e.g. `ghcr.io` or `localhost:5000`.
    fn host(&self) -> &str;

    /// Repository path on the host, e.g. `a3s-lab/app`.
    fn repository_name(&self) -> &str;

    async fn contains(&self, desc: &Descriptor) -> Result<bool>;

    /// Mount `desc` from `from_repository` on the same host.
    async fn mount(&self, from_repository: &str, desc: &Descriptor) -> Result<()>;
}

/// Metadata about a committed blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentInfo {
    pub digest: Digest,
    pub size: u64,
}

#[async_trait]
pub trait ContentManager: Send + Sync {
    async fn info(&self, digest: &Digest) -> Result<ContentInfo>;
    async fn list(&self) -> Result<Vec<ContentInfo>>;
    async fn delete(&self, digest: &Digest) -> Result<()>;
}

/// Progress of an uncommitted write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestStatus {
    pub reference: String,
    pub offset: u64,
    pub total: u64,
    pub expected: Digest,
    pub started_at: DateTime<Utc>,
}

#[async_trait]
pub trait IngestManager: Send + Sync {
    async fn status(&self, reference: &str) -> Result<IngestStatus>;
    async fn list_statuses(&self) -> Result<Vec<IngestStatus>>;
    async fn abort(&self, reference: &str) -> Result<()>;
}

/// A store that can be both read and written.
pub trait Store: Provider + Ingester {}

impl<T: Provider + Ingester + ?Sized> Store for T {}

#[async_trait]
impl<T: Provider + ?Sized> Provider for Arc<T> {
    async fn reader_at(&self, desc: &Descriptor) -> Result<Box<dyn ReaderAt>> {
        (**self).reader_at(desc).await
    }

    fn content_manager(&self) -> Option<&dyn ContentManager> {
        (**self).content_manager()
    }
}

#[async_trait]
impl<T: Ingester + ?Sized> Ingester for Arc<T> {
    async fn writer(&self, reference: &str, desc: &Descriptor) -> Result<Box<dyn ContentWriter>> {
        (**self).writer(reference, desc).await
    }

    fn mountable(&self) -> Option<&dyn MountIngester> {
        (**self).mountable()
    }

    fn ingest_manager(&self) -> Option<&dyn IngestManager> {
        (**self).ingest_manager()
    }
}

// ============================================================================
// Readers
// ============================================================================

/// Reader over an in-memory blob.
pub struct BytesReader {
    data: Arc<Vec<u8>>,
}

impl BytesReader {
    pub fn new(data: Arc<Vec<u8>>) -> Self {
        Self { data }
    }
}

#[async_trait]
impl ReaderAt for BytesReader {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    async fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let len = self.data.len() as u64;
        if offset >= len {
            return Ok(0);
        }
        let start = offset as usize;
        let n = buf.len().min(self.data.len() - start);
        buf[..n].copy_from_slice(&self.data[start..start + n]);
        Ok(n)
    }
}

/// Reader over a file on disk.
pub struct FileReader {
    file: tokio::sync::Mutex<tokio::fs::File>,
    size: u64,
}

impl FileReader {
    pub async fn open(path: &Path) -> Result<Self> {
        let file = tokio::fs::File::open(path).await.map_err(|e| {
            OciError::IoError(std::io::Error::new(
                e.kind(),
                format!("Failed to open {}: {}", path.display(), e),
            ))
        })?;
        let size = file.metadata().await?.len();
        Ok(Self {
            file: tokio::sync::Mutex::new(file),
            size,
        })
    }
}

#[async_trait]
impl ReaderAt for FileReader {
    fn size(&self) -> u64 {
        self.size
    }

    async fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        if offset >= self.size {
            return Ok(0);
        }
        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(offset)).await?;
        Ok(file.read(buf).await?)
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Read an entire blob and verify it hashes to the descriptor digest.
pub async fn read_blob<P: Provider + ?Sized>(provider: &P, desc: &Descriptor) -> Result<Vec<u8>> {
    let reader = provider.reader_at(desc).await?;
    let mut data = Vec::with_capacity(reader.size() as usize);
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut offset = 0u64;
    loop {
        let n = reader.read_at(&mut buf, offset).await?;
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);
        offset += n as u64;
    }

    let actual = Digest::from_bytes(&data);
    if actual != desc.digest {
        return Err(OciError::DigestMismatch {
            expected: desc.digest.to_string(),
            actual: actual.to_string(),
        });
    }
    Ok(data)
}

/// Read and decode a JSON document.
pub async fn read_json<T, P>(provider: &P, desc: &Descriptor) -> Result<T>
where
    T: DeserializeOwned,
    P: Provider + ?Sized,
{
    let data = read_blob(provider, desc).await?;
    serde_json::from_slice(&data).map_err(|e| {
        OciError::MalformedContent(format!(
            "Failed to decode {} {}: {}",
            desc.media_type, desc.digest, e
        ))
    })
}

/// Write a blob through an ingester. Content already present is success.
pub async fn write_blob<I: Ingester + ?Sized>(
    ingester: &I,
    desc: &Descriptor,
    data: &[u8],
) -> Result<()> {
    let reference = desc
        .ref_name()
        .map(String::from)
        .unwrap_or_else(|| desc.digest.to_string());

    let mut writer = match ingester.writer(&reference, desc).await {
        Ok(writer) => writer,
        Err(e) if e.is_already_exists() => return Ok(()),
        Err(e) => return Err(e),
    };

    let result = async {
        for chunk in data.chunks(CHUNK_SIZE) {
            writer.write(chunk).await?;
        }
        writer.commit(data.len() as u64, &desc.digest).await
    }
    .await;

    match result {
        Err(e) if e.is_already_exists() => Ok(()),
        other => other,
    }
}

/// Serialize `value` as JSON, write it, and return its descriptor.
pub async fn write_json<T, I>(ingester: &I, media_type: &str, value: &T) -> Result<Descriptor>
where
    T: Serialize + ?Sized,
    I: Ingester + ?Sized,
{
    let data = serde_json::to_vec(value)?;
    let desc = Descriptor::from_bytes(media_type, &data);
    write_blob(ingester, &desc, &data).await?;
    Ok(desc)
}

/// Stream a blob into `writer`, verifying the digest on the way.
///
/// Returns the number of bytes copied. Fails with
/// [`OciError::DigestMismatch`] when the bytes do not hash to `desc.digest`;
/// the writer is left uncommitted in that case.
pub(crate) async fn stream_verified(
    reader: &dyn ReaderAt,
    desc: &Descriptor,
    writer: &mut dyn ContentWriter,
) -> Result<u64> {
    let mut digester = Digester::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut offset = 0u64;
    loop {
        let n = reader.read_at(&mut buf, offset).await?;
        if n == 0 {
            break;
        }
        digester.update(&buf[..n]);
        writer.write(&buf[..n]).await?;
        offset += n as u64;
    }

    let actual = digester.finish();
    if actual != desc.digest {
        return Err(OciError::DigestMismatch {
            expected: desc.digest.to_string(),
            actual: actual.to_string(),
        });
    }
    Ok(offset)
}
