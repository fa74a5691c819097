//! OCI Image Layout store.
//!
//! Reads and writes the standard on-disk layout:
//!
//! ```text
//! <root>/
//! ├── oci-layout        {"imageLayoutVersion":"1.0.0"}
//! ├── index.json        top-level image index
//! └── blobs/sha256/<hex>
//! ```
//!
//! Blobs are written to a temporary file next to their final location and
//! renamed on commit, so readers never see partial content. `index.json`
//! is only written when asked for, after the blobs it references.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use a3s_oci_core::digest::SHA256;
use a3s_oci_core::{Descriptor, Digest, Digester, OciError, Result};

use super::build::image::ImageIndex;
use crate::content::{
    ContentInfo, ContentManager, ContentWriter, FileReader, IngestManager, IngestStatus, Ingester,
    Provider, ReaderAt,
};

/// Layout marker file name.
pub const OCI_LAYOUT_FILE: &str = "oci-layout";

/// Top-level index file name.
pub const INDEX_FILE: &str = "index.json";

/// Layout version this store writes.
pub const LAYOUT_VERSION: &str = "1.0.0";

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LayoutMarker {
    image_layout_version: String,
}

/// Content store over an OCI Image Layout directory.
#[derive(Clone)]
pub struct OciLayout {
    root: PathBuf,
    /// Manifests to list in `index.json`
    references: Arc<Mutex<Vec<Descriptor>>>,
    /// In-flight writes keyed by the digest being written
    ingests: Arc<DashMap<Digest, IngestStatus>>,
}

impl OciLayout {
    /// Create (or reuse) a layout at `root`, writing the marker file.
    pub fn create(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(root.join("blobs").join(SHA256)).map_err(|e| {
            OciError::IoError(std::io::Error::new(
                e.kind(),
                format!("Failed to create OCI layout {}: {}", root.display(), e),
            ))
        })?;

        let marker = root.join(OCI_LAYOUT_FILE);
        if !marker.exists() {
            let data = serde_json::to_vec(&LayoutMarker {
                image_layout_version: LAYOUT_VERSION.to_string(),
            })?;
            std::fs::write(&marker, data)?;
        }

        Self::open(root)
    }

    /// Open an existing layout. References already in `index.json` are kept.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let marker = root.join(OCI_LAYOUT_FILE);
        let data = std::fs::read(&marker).map_err(|e| {
            OciError::NotFound(format!(
                "Not an OCI layout, missing {}: {}",
                marker.display(),
                e
            ))
        })?;
        let marker: LayoutMarker = serde_json::from_slice(&data).map_err(|e| {
            OciError::MalformedContent(format!("Invalid {} in {}: {}", OCI_LAYOUT_FILE, root.display(), e))
        })?;
        if marker.image_layout_version != LAYOUT_VERSION {
            return Err(OciError::Unsupported(format!(
                "OCI layout version {} in {}",
                marker.image_layout_version,
                root.display()
            )));
        }

        let layout = Self {
            root,
            references: Arc::new(Mutex::new(Vec::new())),
            ingests: Arc::new(DashMap::new()),
        };
        if layout.root.join(INDEX_FILE).exists() {
            let index = layout.read_index()?;
            *layout.references.lock() = index.manifests;
        }
        Ok(layout)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `blobs/<algorithm>/<encoded>` under the layout root.
    pub fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.root
            .join("blobs")
            .join(digest.algorithm())
            .join(digest.encoded())
    }

    pub fn read_index(&self) -> Result<ImageIndex> {
        let path = self.root.join(INDEX_FILE);
        let data = std::fs::read(&path).map_err(|e| {
            OciError::IoError(std::io::Error::new(
                e.kind(),
                format!("Failed to read {}: {}", path.display(), e),
            ))
        })?;
        serde_json::from_slice(&data).map_err(|e| {
            OciError::MalformedContent(format!("Failed to parse {}: {}", path.display(), e))
        })
    }

    /// Record a manifest to list in `index.json`.
    ///
    /// An entry with the same reference name (or, for unnamed entries, the
    /// same digest) is replaced.
    pub fn add_reference(&self, desc: Descriptor) {
        let mut references = self.references.lock();
        let existing = references.iter().position(|r| match (r.ref_name(), desc.ref_name()) {
            (Some(a), Some(b)) => a == b,
            (None, None) => r.digest == desc.digest,
            _ => false,
        });
        match existing {
            Some(i) => references[i] = desc,
            None => references.push(desc),
        }
    }

    pub fn references(&self) -> Vec<Descriptor> {
        self.references.lock().clone()
    }

    /// Write `index.json` from the recorded references.
    pub fn save_index(&self) -> Result<()> {
        let index = ImageIndex::new(self.references());
        self.write_index(&index)
    }

    /// Write `index` as the layout's `index.json` (temp file + rename).
    pub fn write_index(&self, index: &ImageIndex) -> Result<()> {
        let path = self.root.join(INDEX_FILE);
        let tmp_path = self.root.join(format!("{}.tmp", INDEX_FILE));
        let data = serde_json::to_vec_pretty(index)?;
        std::fs::write(&tmp_path, data)?;
        std::fs::rename(&tmp_path, &path).map_err(|e| {
            OciError::IoError(std::io::Error::new(
                e.kind(),
                format!("Failed to write {}: {}", path.display(), e),
            ))
        })?;
        tracing::debug!(path = %path.display(), manifests = index.manifests.len(), "Wrote layout index");
        Ok(())
    }
}

#[async_trait]
impl Provider for OciLayout {
    async fn reader_at(&self, desc: &Descriptor) -> Result<Box<dyn ReaderAt>> {
        let path = self.blob_path(&desc.digest);
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Err(OciError::NotFound(format!(
                "{} in {}",
                desc.digest,
                self.root.display()
            )));
        }
        Ok(Box::new(FileReader::open(&path).await?))
    }

    fn content_manager(&self) -> Option<&dyn ContentManager> {
        Some(self)
    }
}

impl OciLayout {
    /// Temporary file next to the final blob path.
    async fn create_temp(&self, path: &Path) -> Result<(tokio::fs::File, PathBuf)> {
        let dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        tokio::fs::create_dir_all(&dir).await?;
        let tmp_path = dir.join(format!(".tmp-{}", uuid::Uuid::new_v4()));
        let file = tokio::fs::File::create(&tmp_path).await?;
        Ok((file, tmp_path))
    }

    /// Digest key of the ingest named `reference` (or by its digest).
    fn ingest_key(&self, reference: &str) -> Option<Digest> {
        self.ingests
            .iter()
            .find(|s| s.value().reference == reference || s.key().as_str() == reference)
            .map(|s| s.key().clone())
    }
}

#[async_trait]
impl Ingester for OciLayout {
    async fn writer(&self, reference: &str, desc: &Descriptor) -> Result<Box<dyn ContentWriter>> {
        let path = self.blob_path(&desc.digest);
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Err(OciError::AlreadyExists(desc.digest.to_string()));
        }

        // In-flight writes are tracked per digest, so different content
        // under one reference name never collides.
        match self.ingests.entry(desc.digest.clone()) {
            Entry::Occupied(existing) => {
                return Err(OciError::Unavailable(format!(
                    "{} is being written as {}",
                    desc.digest,
                    existing.get().reference
                )))
            }
            Entry::Vacant(slot) => {
                slot.insert(IngestStatus {
                    reference: reference.to_string(),
                    offset: 0,
                    total: desc.size,
                    expected: desc.digest.clone(),
                    started_at: Utc::now(),
                });
            }
        }

        let (file, tmp_path) = match self.create_temp(&path).await {
            Ok(created) => created,
            Err(e) => {
                self.ingests.remove(&desc.digest);
                return Err(e);
            }
        };

        Ok(Box::new(LayoutWriter {
            key: desc.digest.clone(),
            file,
            tmp_path,
            path,
            digester: Digester::new(),
            ingests: self.ingests.clone(),
            done: false,
        }))
    }

    fn ingest_manager(&self) -> Option<&dyn IngestManager> {
        Some(self)
    }
}

#[async_trait]
impl ContentManager for OciLayout {
    async fn info(&self, digest: &Digest) -> Result<ContentInfo> {
        let path = self.blob_path(digest);
        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|_| OciError::NotFound(digest.to_string()))?;
        Ok(ContentInfo {
            digest: digest.clone(),
            size: metadata.len(),
        })
    }

    async fn list(&self) -> Result<Vec<ContentInfo>> {
        let mut infos = Vec::new();
        let blobs = self.root.join("blobs");
        let mut algorithms = tokio::fs::read_dir(&blobs).await?;
        while let Some(alg) = algorithms.next_entry().await? {
            if !alg.file_type().await?.is_dir() {
                continue;
            }
            let algorithm = alg.file_name().to_string_lossy().to_string();
            let mut entries = tokio::fs::read_dir(alg.path()).await?;
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name().to_string_lossy().to_string();
                let Ok(digest) = Digest::parse(&format!("{}:{}", algorithm, name)) else {
                    continue;
                };
                infos.push(ContentInfo {
                    digest,
                    size: entry.metadata().await?.len(),
                });
            }
        }
        infos.sort_by(|a, b| a.digest.cmp(&b.digest));
        Ok(infos)
    }

    async fn delete(&self, digest: &Digest) -> Result<()> {
        let path = self.blob_path(digest);
        tokio::fs::remove_file(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                OciError::NotFound(digest.to_string())
            } else {
                OciError::IoError(e)
            }
        })
    }
}

#[async_trait]
impl IngestManager for OciLayout {
    async fn status(&self, reference: &str) -> Result<IngestStatus> {
        self.ingest_key(reference)
            .and_then(|key| self.ingests.get(&key).map(|s| s.value().clone()))
            .ok_or_else(|| OciError::NotFound(format!("ingest {}", reference)))
    }

    async fn list_statuses(&self) -> Result<Vec<IngestStatus>> {
        let mut statuses: Vec<IngestStatus> =
            self.ingests.iter().map(|s| s.value().clone()).collect();
        statuses.sort_by(|a, b| a.reference.cmp(&b.reference));
        Ok(statuses)
    }

    /// Forget the ingest. The writer's temp file is removed when it is dropped.
    async fn abort(&self, reference: &str) -> Result<()> {
        self.ingest_key(reference)
            .and_then(|key| self.ingests.remove(&key))
            .map(|_| ())
            .ok_or_else(|| OciError::NotFound(format!("ingest {}", reference)))
    }
}

struct LayoutWriter {
    key: Digest,
    file: tokio::fs::File,
    tmp_path: PathBuf,
    path: PathBuf,
    digester: Digester,
    ingests: Arc<DashMap<Digest, IngestStatus>>,
    done: bool,
}

#[async_trait]
impl ContentWriter for LayoutWriter {
    async fn write(&mut self, data: &[u8]) -> Result<()> {
        if !self.ingests.contains_key(&self.key) {
            return Err(OciError::Cancelled);
        }
        self.file.write_all(data).await?;
        self.digester.update(data);
        if let Some(mut status) = self.ingests.get_mut(&self.key) {
            status.offset = self.digester.size();
        }
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
        this.done = true;
        this.ingests.remove(&this.key);
        tracing::debug!(digest = %actual, size, "Committed layout blob");
        Ok(())
    }
}

impl Drop for LayoutWriter {
    fn drop(&mut self) {
        if !self.done {
            let _ = std::fs::remove_file(&self.tmp_path);
            self.ingests.remove(&self.key);
        }
    }
}
