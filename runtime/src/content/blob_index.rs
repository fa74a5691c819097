//! Blob index: a persisted digest → file path mapping.
//!
//! Build steps hand each other content by path rather than by copying bytes
//! into a shared store. The index file is JSON:
//!
//! ```json
//! { "Blobs": { "sha256:0f3a...": "bazel-out/app/layer.tar.gz" } }
//! ```
//!
//! Paths are not checked when the index is loaded, so an index may name
//! outputs that are materialized later.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use a3s_oci_core::digest::SHA256;
use a3s_oci_core::{Descriptor, Digest, Digester, OciError, Result};

use super::{
    ContentInfo, ContentManager, ContentWriter, FileReader, Ingester, Provider, ReaderAt,
};

/// Digest → local path mapping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobIndex {
    #[serde(rename = "Blobs", default)]
    pub blobs: BTreeMap<Digest, PathBuf>,
}

impl BlobIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, digest: Digest, path: impl Into<PathBuf>) {
        self.blobs.insert(digest, path.into());
    }

    pub fn get(&self, digest: &Digest) -> Option<&Path> {
        self.blobs.get(digest).map(PathBuf::as_path)
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }

    /// Load an index file.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let data = std::fs::read(path).map_err(|e| {
            OciError::IoError(std::io::Error::new(
                e.kind(),
                format!("Failed to read blob index {}: {}", path.display(), e),
            ))
        })?;
        serde_json::from_slice(&data).map_err(|e| {
            OciError::MalformedContent(format!(
                "Failed to parse blob index {}: {}",
                path.display(),
                e
            ))
        })
    }

    /// Write the index atomically (temp file + rename).
    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_vec_pretty(self)?;
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, json)?;
        std::fs::rename(&tmp_path, path).map_err(|e| {
            OciError::IoError(std::io::Error::new(
                e.kind(),
                format!("Failed to write blob index {}: {}", path.display(), e),
            ))
        })
    }

    /// Add every entry of `other`; entries of `other` win on conflict.
    pub fn merge(&mut self, other: &BlobIndex) {
        for (digest, path) in &other.blobs {
            self.blobs.insert(digest.clone(), path.clone());
        }
    }

    /// Merge indexes left to right.
    pub fn merge_all<'a>(indexes: impl IntoIterator<Item = &'a BlobIndex>) -> BlobIndex {
        let mut merged = BlobIndex::new();
        for index in indexes {
            merged.merge(index);
        }
        merged
    }

    /// Clone with every path rewritten relative to `base`.
    pub fn rel(&self, base: &Path) -> Result<BlobIndex> {
        let mut blobs = BTreeMap::new();
        for (digest, path) in &self.blobs {
            blobs.insert(digest.clone(), relative_path(base, path)?);
        }
        Ok(BlobIndex { blobs })
    }

    /// Index every blob under `<layout>/blobs/sha256` of an OCI layout.
    pub fn from_layout_dir(layout: &Path) -> Result<BlobIndex> {
        let dir = layout.join("blobs").join(SHA256);
        let entries = std::fs::read_dir(&dir).map_err(|e| {
            OciError::IoError(std::io::Error::new(
                e.kind(),
                format!("Failed to read {}: {}", dir.display(), e),
            ))
        })?;

        let mut index = BlobIndex::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            match Digest::parse(&format!("{}:{}", SHA256, name)) {
                Ok(digest) => index.insert(digest, entry.path()),
                Err(_) => tracing::debug!(path = %entry.path().display(), "Skipping non-blob file"),
            }
        }
        Ok(index)
    }
}

/// Express `target` relative to `base`, adding `..` where they diverge.
fn relative_path(base: &Path, target: &Path) -> Result<PathBuf> {
    if base.is_absolute() != target.is_absolute() {
        return Err(OciError::ConfigError(format!(
            "cannot make {} relative to {}",
            target.display(),
            base.display()
        )));
    }

    fn normal(p: &Path) -> Vec<Component<'_>> {
        p.components()
            .filter(|c| !matches!(c, Component::CurDir))
            .collect()
    }
    let base_parts = normal(base);
    let target_parts = normal(target);

    let common = base_parts
        .iter()
        .zip(target_parts.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut rel = PathBuf::new();
    for _ in common..base_parts.len() {
        rel.push("..");
    }
    for part in &target_parts[common..] {
        rel.push(part.as_os_str());
    }
    if rel.as_os_str().is_empty() {
        rel.push(".");
    }
    Ok(rel)
}

#[async_trait]
impl Provider for BlobIndex {
    async fn reader_at(&self, desc: &Descriptor) -> Result<Box<dyn ReaderAt>> {
        let path = self
            .get(&desc.digest)
            .ok_or_else(|| OciError::NotFound(desc.digest.to_string()))?;
        Ok(Box::new(FileReader::open(path).await?))
    }
}

// ============================================================================
// Filesystem-backed store
// ============================================================================

/// Content store writing blobs under a directory and recording them in a
/// shared [`BlobIndex`].
///
/// Concurrent writers serialize their index inserts through a mutex.
#[derive(Clone)]
pub struct BlobIndexStore {
    root: PathBuf,
    index: Arc<Mutex<BlobIndex>>,
}

impl BlobIndexStore {
    /// Store new blobs under `root/blobs/<algorithm>/<encoded>`.
    pub fn new(root: impl Into<PathBuf>, index: BlobIndex) -> Self {
        Self {
            root: root.into(),
            index: Arc::new(Mutex::new(index)),
        }
    }

    /// Snapshot of the current index.
    pub fn index(&self) -> BlobIndex {
        self.index.lock().clone()
    }

    fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.root
            .join("blobs")
            .join(digest.algorithm())
            .join(digest.encoded())
    }
}

#[async_trait]
impl Provider for BlobIndexStore {
    async fn reader_at(&self, desc: &Descriptor) -> Result<Box<dyn ReaderAt>> {
        let path = self
            .index
            .lock()
            .get(&desc.digest)
            .map(Path::to_path_buf)
            .ok_or_else(|| OciError::NotFound(desc.digest.to_string()))?;
        Ok(Box::new(FileReader::open(&path).await?))
    }

    fn content_manager(&self) -> Option<&dyn ContentManager> {
        Some(self)
    }
}

#[async_trait]
impl Ingester for BlobIndexStore {
    async fn writer(&self, _reference: &str, desc: &Descriptor) -> Result<Box<dyn ContentWriter>> {
        if self.index.lock().get(&desc.digest).is_some() {
            return Err(OciError::AlreadyExists(desc.digest.to_string()));
        }

        let path = self.blob_path(&desc.digest);
        let dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        tokio::fs::create_dir_all(&dir).await?;
        let tmp_path = dir.join(format!(".tmp-{}", uuid::Uuid::new_v4()));
        let file = tokio::fs::File::create(&tmp_path).await?;

        Ok(Box::new(IndexedFileWriter {
            file,
            tmp_path,
            path,
            digester: Digester::new(),
            index: self.index.clone(),
            committed: false,
        }))
    }
}

#[async_trait]
impl ContentManager for BlobIndexStore {
    async fn info(&self, digest: &Digest) -> Result<ContentInfo> {
        let path = self
            .index
            .lock()
            .get(digest)
            .map(Path::to_path_buf)
            .ok_or_else(|| OciError::NotFound(digest.to_string()))?;
        let metadata = tokio::fs::metadata(&path).await?;
        Ok(ContentInfo {
            digest: digest.clone(),
            size: metadata.len(),
        })
    }

    async fn list(&self) -> Result<Vec<ContentInfo>> {
        let digests: Vec<Digest> = self.index.lock().blobs.keys().cloned().collect();
        let mut infos = Vec::with_capacity(digests.len());
        for digest in digests {
            infos.push(self.info(&digest).await?);
        }
        Ok(infos)
    }

    /// Forget the blob. Files outside this store's root are left in place.
    async fn delete(&self, digest: &Digest) -> Result<()> {
        let path = self
            .index
            .lock()
            .blobs
            .remove(digest)
            .ok_or_else(|| OciError::NotFound(digest.to_string()))?;
        if path.starts_with(&self.root) {
            tokio::fs::remove_file(&path).await?;
        }
        Ok(())
    }
}

struct IndexedFileWriter {
    file: tokio::fs::File,
    tmp_path: PathBuf,
    path: PathBuf,
    digester: Digester,
    index: Arc<Mutex<BlobIndex>>,
    committed: bool,
}

#[async_trait]
impl ContentWriter for IndexedFileWriter {
    async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.digester.update(data);
        self.file.write_all(data).await?;
        Ok(())
    }

    async fn commit(self: Box<Self>, size: u64, expected: &Digest) -> Result<()> {
        let mut this = self;
        this.file.flush().await?;
        this.file.sync_all().await?;

        let written = this.digester.size();
        let actual = std::mem::take(&mut this.digester).finish();
        if written != size || &actual != expected {
            return Err(OciError::DigestMismatch {
                expected: format!("{} ({} bytes)", expected, size),
                actual: format!("{} ({} bytes)", actual, written),
            });
        }

        tokio::fs::rename(&this.tmp_path, &this.path).await?;
        this.committed = true;
        this.index.lock().insert(actual, this.path.clone());
        Ok(())
    }
}

impl Drop for IndexedFileWriter {
    fn drop(&mut self) {
        // Abandoned writes leave no partial blob behind.
        if !self.committed {
            let _ = std::fs::remove_file(&self.tmp_path);
        }
    }
}
