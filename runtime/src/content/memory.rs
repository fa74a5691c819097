//! In-memory content store.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use a3s_oci_core::{Descriptor, Digest, Digester, OciError, Result};

use super::{BytesReader, ContentInfo, ContentManager, ContentWriter, Ingester, Provider, ReaderAt};

type Blobs = Arc<RwLock<HashMap<Digest, Arc<Vec<u8>>>>>;

/// Content store holding every blob in memory.
///
/// Commits verify size and digest. Cloning shares the underlying map.
#[derive(Clone, Default)]
pub struct MemoryStore {
    blobs: Blobs,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `data` directly and return a descriptor for it.
    pub fn insert(&self, media_type: &str, data: Vec<u8>) -> Descriptor {
        let desc = Descriptor::from_bytes(media_type, &data);
        self.blobs
            .write()
            .insert(desc.digest.clone(), Arc::new(data));
        desc
    }

    pub fn contains(&self, digest: &Digest) -> bool {
        self.blobs.read().contains_key(digest)
    }

    pub fn len(&self) -> usize {
        self.blobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.read().is_empty()
    }

    #[cfg(test)]
    pub(crate) fn insert_unchecked(&self, digest: Digest, data: Vec<u8>) {
        self.blobs.write().insert(digest, Arc::new(data));
    }
}

#[async_trait]
impl Provider for MemoryStore {
    async fn reader_at(&self, desc: &Descriptor) -> Result<Box<dyn ReaderAt>> {
        let data = self
            .blobs
            .read()
            .get(&desc.digest)
            .cloned()
            .ok_or_else(|| OciError::NotFound(desc.digest.to_string()))?;
        Ok(Box::new(BytesReader::new(data)))
    }

    fn content_manager(&self) -> Option<&dyn ContentManager> {
        Some(self)
    }
}

#[async_trait]
impl Ingester for MemoryStore {
    async fn writer(&self, _reference: &str, desc: &Descriptor) -> Result<Box<dyn ContentWriter>> {
        if self.contains(&desc.digest) {
            return Err(OciError::AlreadyExists(desc.digest.to_string()));
        }
        Ok(Box::new(MemoryWriter {
            blobs: self.blobs.clone(),
            buf: Vec::with_capacity(desc.size as usize),
            digester: Digester::new(),
        }))
    }
}

#[async_trait]
impl ContentManager for MemoryStore {
    async fn info(&self, digest: &Digest) -> Result<ContentInfo> {
        self.blobs
            .read()
            .get(digest)
            .map(|data| ContentInfo {
                digest: digest.clone(),
                size: data.len() as u64,
            })
            .ok_or_else(|| OciError::NotFound(digest.to_string()))
    }

    async fn list(&self) -> Result<Vec<ContentInfo>> {
        let mut infos: Vec<ContentInfo> = self
            .blobs
            .read()
            .iter()
            .map(|(digest, data)| ContentInfo {
                digest: digest.clone(),
                size: data.len() as u64,
            })
            .collect();
        infos.sort_by(|a, b| a.digest.cmp(&b.digest));
        Ok(infos)
    }

    async fn delete(&self, digest: &Digest) -> Result<()> {
        self.blobs
            .write()
            .remove(digest)
            .map(|_| ())
            .ok_or_else(|| OciError::NotFound(digest.to_string()))
    }
}

struct MemoryWriter {
    blobs: Blobs,
    buf: Vec<u8>,
    digester: Digester,
}

#[async_trait]
impl ContentWriter for MemoryWriter {
    async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.digester.update(data);
        self.buf.extend_from_slice(data);
        Ok(())
    }

    async fn commit(self: Box<Self>, size: u64, expected: &Digest) -> Result<()> {
        let this = *self;
        if this.digester.size() != size {
            return Err(OciError::MalformedContent(format!(
                "commit size {} does not match written size {}",
                size,
                this.digester.size()
            )));
        }
        let actual = this.digester.finish();
        if &actual != expected {
            return Err(OciError::DigestMismatch {
                expected: expected.to_string(),
                actual: actual.to_string(),
            });
        }

        let mut blobs = this.blobs.write();
        if blobs.contains_key(expected) {
            return Err(OciError::AlreadyExists(expected.to_string()));
        }
        blobs.insert(actual, Arc::new(this.buf));
        Ok(())
    }
}
