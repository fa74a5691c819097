//! Registry write path.
//!
//! Blobs are staged to a temporary file while they are written, then
//! uploaded with a single POST + PUT once the digest is verified. Staging
//! lets a failed upload be retried without asking the caller to resend.
//! Manifests and mounts go through the distribution client.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use oci_distribution::RegistryOperation;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::{Body, StatusCode};
use tempfile::TempPath;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;

use a3s_oci_core::{Descriptor, Digest, Digester, OciError, Result, RetryPolicy};

use super::{is_manifest_like, RepositoryClient};
use crate::content::{ContentWriter, Ingester, MountIngester};
use crate::oci::retry::retry_on_failure;

/// [`Ingester`] over one registry repository.
///
/// A manifest whose descriptor carries a reference name annotation is
/// stored under the pusher's tag (when the pusher reference has one);
/// all other manifests and every blob are stored by digest.
pub struct RegistryPusher {
    client: Arc<RepositoryClient>,
    tag: Option<String>,
    retry: RetryPolicy,
    cancel: CancellationToken,
}

impl RegistryPusher {
    pub(crate) fn new(
        client: Arc<RepositoryClient>,
        tag: Option<String>,
        retry: RetryPolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            client,
            tag,
            retry,
            cancel,
        }
    }

    async fn exists(&self, desc: &Descriptor) -> Result<bool> {
        retry_on_failure(&self.retry, &self.cancel, "check existence", || {
            self.client.exists(desc)
        })
        .await
    }
}

#[async_trait]
impl Ingester for RegistryPusher {
    async fn writer(&self, reference: &str, desc: &Descriptor) -> Result<Box<dyn ContentWriter>> {
        if is_manifest_like(&desc.media_type) {
            let object = match (&self.tag, desc.ref_name()) {
                (Some(tag), Some(_)) => tag.clone(),
                _ => {
                    if self.exists(desc).await? {
                        return Err(OciError::AlreadyExists(desc.digest.to_string()));
                    }
                    desc.digest.to_string()
                }
            };
            tracing::debug!(reference, object = %object, "Pushing manifest");
            return Ok(Box::new(ManifestWriter {
                client: self.client.clone(),
                retry: self.retry.clone(),
                cancel: self.cancel.clone(),
                media_type: desc.media_type.clone(),
                object,
                data: Vec::with_capacity(desc.size as usize),
            }));
        }

        if self.exists(desc).await? {
            return Err(OciError::AlreadyExists(desc.digest.to_string()));
        }

        let temp = tempfile::NamedTempFile::new()?.into_temp_path();
        let file = tokio::fs::OpenOptions::new().write(true).open(&temp).await?;
        tracing::debug!(reference, digest = %desc.digest, "Staging blob upload");
        Ok(Box::new(BlobUploadWriter {
            client: self.client.clone(),
            retry: self.retry.clone(),
            cancel: self.cancel.clone(),
            temp,
            file,
            digester: Digester::new(),
        }))
    }

    fn mountable(&self) -> Option<&dyn MountIngester> {
        Some(self)
    }
}

#[async_trait]
impl MountIngester for RegistryPusher {
    fn host(&self) -> &str {
        self.client.registry()
    }

    fn repository_name(&self) -> &str {
        self.client.repository()
    }

    async fn contains(&self, desc: &Descriptor) -> Result<bool> {
        self.exists(desc).await
    }

    async fn mount(&self, from_repository: &str, desc: &Descriptor) -> Result<()> {
        retry_on_failure(&self.retry, &self.cancel, "mount blob", || {
            self.client.mount_blob(from_repository, &desc.digest)
        })
        .await?;
        tracing::debug!(
            digest = %desc.digest,
            from = from_repository,
            to = self.client.repository(),
            "Mounted blob"
        );
        Ok(())
    }
}

/// Monolithic upload of a staged file: POST to open a session, PUT the bytes.
///
/// The session location may point at another host (a storage backend);
/// the PUT carries registry credentials only when it stays on the registry.
async fn upload_blob(client: &RepositoryClient, path: &Path, digest: &Digest, size: u64) -> Result<()> {
    let start = client.url("blobs", "uploads/")?;
    let request = client.http.post(start.clone()).header(CONTENT_LENGTH, 0);
    let response = client.send(RegistryOperation::Push, &start, request).await?;
    if response.status() != StatusCode::ACCEPTED {
        return Err(client.status_error("start upload", response).await);
    }

    let mut location = client.location(&response)?;
    location
        .query_pairs_mut()
        .append_pair("digest", digest.as_str());

    let file = tokio::fs::File::open(path).await?;
    let request = client
        .http
        .put(location.clone())
        .header(CONTENT_TYPE, "application/octet-stream")
        .header(CONTENT_LENGTH, size)
        .body(Body::wrap_stream(ReaderStream::new(file)));
    let response = client.send(RegistryOperation::Push, &location, request).await?;
    if response.status() != StatusCode::CREATED {
        return Err(client.status_error("complete upload", response).await);
    }

    tracing::debug!(digest = %digest, size, repository = client.repository(), "Uploaded blob");
    Ok(())
}

fn verify(digester: Digester, size: u64, expected: &Digest) -> Result<()> {
    if digester.size() != size {
        return Err(OciError::MalformedContent(format!(
            "Size mismatch for {}: expected {} bytes, wrote {}",
            expected,
            size,
            digester.size()
        )));
    }
    let actual = digester.finish();
    if &actual != expected {
        return Err(OciError::DigestMismatch {
            expected: expected.to_string(),
            actual: actual.to_string(),
        });
    }
    Ok(())
}

struct BlobUploadWriter {
    client: Arc<RepositoryClient>,
    retry: RetryPolicy,
    cancel: CancellationToken,
    /// Removed when the writer is dropped
    temp: TempPath,
    file: tokio::fs::File,
    digester: Digester,
}

#[async_trait]
impl ContentWriter for BlobUploadWriter {
    async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.file.write_all(data).await?;
        self.digester.update(data);
        Ok(())
    }

    async fn commit(self: Box<Self>, size: u64, expected: &Digest) -> Result<()> {
        let BlobUploadWriter {
            client,
            retry,
            cancel,
            temp,
            mut file,
            digester,
        } = *self;
        file.flush().await?;
        drop(file);
        verify(digester, size, expected)?;

        retry_on_failure(&retry, &cancel, "push blob", || {
            upload_blob(&client, &temp, expected, size)
        })
        .await
    }
}

struct ManifestWriter {
    client: Arc<RepositoryClient>,
    retry: RetryPolicy,
    cancel: CancellationToken,
    media_type: String,
    object: String,
    data: Vec<u8>,
}

#[async_trait]
impl ContentWriter for ManifestWriter {
    async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.data.extend_from_slice(data);
        Ok(())
    }

    async fn commit(self: Box<Self>, size: u64, expected: &Digest) -> Result<()> {
        let ManifestWriter {
            client,
            retry,
            cancel,
            media_type,
            object,
            data,
        } = *self;
        let mut digester = Digester::new();
        digester.update(&data);
        verify(digester, size, expected)?;

        retry_on_failure(&retry, &cancel, "push manifest", || {
            client.push_manifest(&object, data.clone(), &media_type)
        })
        .await?;

        tracing::info!(
            repository = client.repository(),
            object = %object,
            digest = %expected,
            "Pushed manifest"
        );
        Ok(())
    }
}
