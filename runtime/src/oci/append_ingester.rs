//! Ingester writing a composed image to fixed output files.
//!
//! Build rules declare their outputs up front, so composition cannot write
//! into a content-addressed directory whose file names are only known
//! afterwards. This ingester accepts exactly one manifest and one config
//! and writes each to the path it was configured with.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;

use a3s_oci_core::{media_type, Descriptor, Digest, Digester, OciError, Result};

use crate::content::{ContentWriter, Ingester};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Manifest,
    Config,
}

#[derive(Default)]
struct Written {
    manifest: Option<Descriptor>,
    config: Option<Descriptor>,
    manifest_claimed: bool,
    config_claimed: bool,
}

/// Writes the manifest and config of one image to predetermined paths.
#[derive(Clone)]
pub struct AppendIngester {
    manifest_path: PathBuf,
    config_path: PathBuf,
    written: Arc<Mutex<Written>>,
}

impl AppendIngester {
    pub fn new(manifest_path: impl Into<PathBuf>, config_path: impl Into<PathBuf>) -> Self {
        Self {
            manifest_path: manifest_path.into(),
            config_path: config_path.into(),
            written: Arc::new(Mutex::new(Written::default())),
        }
    }

    pub fn manifest_path(&self) -> &Path {
        &self.manifest_path
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Descriptor of the committed manifest, if any.
    pub fn manifest(&self) -> Option<Descriptor> {
        self.written.lock().manifest.clone()
    }

    /// Descriptor of the committed config, if any.
    pub fn config(&self) -> Option<Descriptor> {
        self.written.lock().config.clone()
    }
}

#[async_trait]
impl Ingester for AppendIngester {
    async fn writer(&self, _reference: &str, desc: &Descriptor) -> Result<Box<dyn ContentWriter>> {
        let slot = if media_type::is_manifest(&desc.media_type) {
            Slot::Manifest
        } else if media_type::is_config(&desc.media_type) {
            Slot::Config
        } else {
            return Err(OciError::Unsupported(format!(
                "append output only takes a manifest and a config, got {} ({})",
                desc.media_type, desc.digest
            )));
        };

        {
            let mut written = self.written.lock();
            let claimed = match slot {
                Slot::Manifest => &mut written.manifest_claimed,
                Slot::Config => &mut written.config_claimed,
            };
            if *claimed {
                return Err(OciError::MalformedContent(format!(
                    "second {:?} written to append output ({})",
                    slot, desc.digest
                )));
            }
            *claimed = true;
        }

        let path = match slot {
            Slot::Manifest => self.manifest_path.clone(),
            Slot::Config => self.config_path.clone(),
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp_path = path.with_file_name(format!(".tmp-{}", uuid::Uuid::new_v4()));
        let file = tokio::fs::File::create(&tmp_path).await?;

        Ok(Box::new(OutputFileWriter {
            slot,
            desc: desc.clone(),
            file,
            tmp_path,
            path,
            digester: Digester::new(),
            written: self.written.clone(),
            committed: false,
        }))
    }
}

struct OutputFileWriter {
    slot: Slot,
    desc: Descriptor,
    file: tokio::fs::File,
    tmp_path: PathBuf,
    path: PathBuf,
    digester: Digester,
    written: Arc<Mutex<Written>>,
    committed: bool,
}

#[async_trait]
impl ContentWriter for OutputFileWriter {
    async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.digester.update(data);
        self.file.write_all(data).await?;
        Ok(())
    }

    async fn commit(self: Box<Self>, size: u64, expected: &Digest) -> Result<()> {
        let mut this = self;
        this.file.flush().await?;

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

        let mut state = this.written.lock();
        match this.slot {
            Slot::Manifest => state.manifest = Some(this.desc.clone()),
            Slot::Config => state.config = Some(this.desc.clone()),
        }
        tracing::debug!(path = %this.path.display(), digest = %actual, "Wrote append output");
        Ok(())
    }
}

impl Drop for OutputFileWriter {
    fn drop(&mut self) {
        if !self.committed {
            let _ = std::fs::remove_file(&self.tmp_path);
            // A failed write frees the slot for another attempt.
            let mut written = self.written.lock();
            match self.slot {
                Slot::Manifest => written.manifest_claimed = false,
                Slot::Config => written.config_claimed = false,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::write_blob;
    use tempfile::TempDir;

    fn ingester(tmp: &TempDir) -> AppendIngester {
        AppendIngester::new(
            tmp.path().join("out/manifest.json"),
            tmp.path().join("out/config.json"),
        )
    }

    #[tokio::test]
    async fn test_writes_to_fixed_paths() {
        let tmp = TempDir::new().unwrap();
        let ingester = ingester(&tmp);

        let config = Descriptor::from_bytes(media_type::oci_config(), b"{\"os\":\"linux\"}");
        let manifest = Descriptor::from_bytes(media_type::oci_manifest(), b"{\"schemaVersion\":2}");
        write_blob(&ingester, &config, b"{\"os\":\"linux\"}").await.unwrap();
        write_blob(&ingester, &manifest, b"{\"schemaVersion\":2}").await.unwrap();

        assert_eq!(
            std::fs::read(ingester.config_path()).unwrap(),
            b"{\"os\":\"linux\"}"
        );
        assert_eq!(
            std::fs::read(ingester.manifest_path()).unwrap(),
            b"{\"schemaVersion\":2}"
        );
        assert_eq!(ingester.manifest().unwrap().digest, manifest.digest);
        assert_eq!(ingester.config().unwrap().digest, config.digest);
    }

    #[tokio::test]
    async fn test_rejects_layers() {
        let tmp = TempDir::new().unwrap();
        let layer = Descriptor::from_bytes(media_type::oci_layer_gzip(), b"layer");
        let err = ingester(&tmp).writer("layer", &layer).await.err().unwrap();
        assert!(matches!(err, OciError::Unsupported(_)));
    }

    #[tokio::test]
    async fn test_second_manifest_is_malformed() {
        let tmp = TempDir::new().unwrap();
        let ingester = ingester(&tmp);
        let first = Descriptor::from_bytes(media_type::oci_manifest(), b"one");
        let second = Descriptor::from_bytes(media_type::oci_manifest(), b"two");

        write_blob(&ingester, &first, b"one").await.unwrap();
        let err = ingester.writer("second", &second).await.err().unwrap();
        assert!(matches!(err, OciError::MalformedContent(_)));
    }

    #[tokio::test]
    async fn test_failed_write_frees_slot() {
        let tmp = TempDir::new().unwrap();
        let ingester = ingester(&tmp);
        let config = Descriptor::from_bytes(media_type::oci_config(), b"{}");

        assert!(write_blob(&ingester, &config, b"[]").await.is_err());
        assert!(!ingester.config_path().exists());
        write_blob(&ingester, &config, b"{}").await.unwrap();
        assert!(ingester.config_path().exists());
    }
}
