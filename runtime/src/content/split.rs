//! Store composed of an independent read side and write side.

use std::sync::Arc;

use async_trait::async_trait;

use a3s_oci_core::{Descriptor, Digest, OciError, Result};

use super::{
    ContentInfo, ContentManager, ContentWriter, IngestManager, IngestStatus, Ingester,
    MountIngester, Provider, ReaderAt,
};

/// Reads from one backend, writes to another.
///
/// Composition reads a base image from wherever it was pulled (a blob index,
/// a registry fetcher, or a [`super::MultiProvider`] of both) and writes its
/// output to a fixed location. Management calls go to whichever side
/// implements them and fail with [`OciError::Unsupported`] otherwise.
#[derive(Clone)]
pub struct SplitStore {
    provider: Arc<dyn Provider>,
    ingester: Arc<dyn Ingester>,
}

impl SplitStore {
    pub fn new(provider: Arc<dyn Provider>, ingester: Arc<dyn Ingester>) -> Self {
        Self { provider, ingester }
    }

    pub fn provider(&self) -> &Arc<dyn Provider> {
        &self.provider
    }

    pub fn ingester(&self) -> &Arc<dyn Ingester> {
        &self.ingester
    }

    fn manager(&self, op: &str) -> Result<&dyn ContentManager> {
        self.provider
            .content_manager()
            .ok_or_else(|| OciError::Unsupported(format!("{} on read side of split store", op)))
    }

    fn ingests(&self, op: &str) -> Result<&dyn IngestManager> {
        self.ingester
            .ingest_manager()
            .ok_or_else(|| OciError::Unsupported(format!("{} on write side of split store", op)))
    }
}

#[async_trait]
impl Provider for SplitStore {
    async fn reader_at(&self, desc: &Descriptor) -> Result<Box<dyn ReaderAt>> {
        self.provider.reader_at(desc).await
    }

    fn content_manager(&self) -> Option<&dyn ContentManager> {
        Some(self)
    }
}

#[async_trait]
impl Ingester for SplitStore {
    async fn writer(&self, reference: &str, desc: &Descriptor) -> Result<Box<dyn ContentWriter>> {
        self.ingester.writer(reference, desc).await
    }

    fn mountable(&self) -> Option<&dyn MountIngester> {
        self.ingester.mountable()
    }

    fn ingest_manager(&self) -> Option<&dyn IngestManager> {
        Some(self)
    }
}

#[async_trait]
impl ContentManager for SplitStore {
    async fn info(&self, digest: &Digest) -> Result<ContentInfo> {
        self.manager("info")?.info(digest).await
    }

    async fn list(&self) -> Result<Vec<ContentInfo>> {
        self.manager("list")?.list().await
    }

    async fn delete(&self, digest: &Digest) -> Result<()> {
        self.manager("delete")?.delete(digest).await
    }
}

#[async_trait]
impl IngestManager for SplitStore {
    async fn status(&self, reference: &str) -> Result<IngestStatus> {
        self.ingests("status")?.status(reference).await
    }

    async fn list_statuses(&self) -> Result<Vec<IngestStatus>> {
        self.ingests("list statuses")?.list_statuses().await
    }

    async fn abort(&self, reference: &str) -> Result<()> {
        self.ingests("abort")?.abort(reference).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::{read_blob, write_blob, BlobIndex, MemoryStore};

    #[tokio::test]
    async fn test_reads_and_writes_go_to_their_side() {
        let read_side = MemoryStore::new();
        let write_side = MemoryStore::new();
        let base = read_side.insert("text/plain", b"base".to_vec());

        let split = SplitStore::new(Arc::new(read_side.clone()), Arc::new(write_side.clone()));
        assert_eq!(read_blob(&split, &base).await.unwrap(), b"base");

        let out = Descriptor::from_bytes("text/plain", b"output");
        write_blob(&split, &out, b"output").await.unwrap();
        assert!(write_side.contains(&out.digest));
        assert!(!read_side.contains(&out.digest));
    }

    #[tokio::test]
    async fn test_management_delegates_or_reports_unsupported() {
        let read_side = MemoryStore::new();
        let desc = read_side.insert("text/plain", b"x".to_vec());

        let split = SplitStore::new(Arc::new(read_side), Arc::new(MemoryStore::new()));
        let manager = split.content_manager().unwrap();
        assert_eq!(manager.info(&desc.digest).await.unwrap().size, 1);

        // MemoryStore does not track in-progress ingests.
        let err = split.ingest_manager().unwrap().list_statuses().await.unwrap_err();
        assert!(matches!(err, OciError::Unsupported(_)));

        // A blob index has no listing capability.
        let split = SplitStore::new(Arc::new(BlobIndex::new()), Arc::new(MemoryStore::new()));
        let err = split.content_manager().unwrap().list().await.unwrap_err();
        assert!(matches!(err, OciError::Unsupported(_)));
    }
}
