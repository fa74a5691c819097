//! Child resolution for descriptor graph traversal.

use std::collections::HashSet;

use async_trait::async_trait;

use a3s_oci_core::{media_type, Descriptor, Result};

use crate::content::{read_json, Provider};
use crate::oci::build::image::{ImageIndex, ImageManifest};

/// Resolves the descriptors a blob refers to.
///
/// Any `Fn(&Descriptor) -> Result<Vec<Descriptor>>` closure is a handler.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn children(&self, provider: &dyn Provider, desc: &Descriptor) -> Result<Vec<Descriptor>>;
}

#[async_trait]
impl<F> Handler for F
where
    F: Fn(&Descriptor) -> Result<Vec<Descriptor>> + Send + Sync,
{
    async fn children(&self, _provider: &dyn Provider, desc: &Descriptor) -> Result<Vec<Descriptor>> {
        self(desc)
    }
}

/// Image graph handler: a manifest refers to its config and layers, an
/// index to its manifests. Other blobs are leaves.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChildrenHandler;

#[async_trait]
impl Handler for ChildrenHandler {
    async fn children(&self, provider: &dyn Provider, desc: &Descriptor) -> Result<Vec<Descriptor>> {
        if media_type::is_manifest(&desc.media_type) {
            let manifest: ImageManifest = read_json(provider, desc).await?;
            let mut children = Vec::with_capacity(manifest.layers.len() + 1);
            children.push(manifest.config);
            children.extend(manifest.layers);
            Ok(children)
        } else if media_type::is_index(&desc.media_type) {
            let index: ImageIndex = read_json(provider, desc).await?;
            Ok(index.manifests)
        } else {
            Ok(Vec::new())
        }
    }
}

/// Drops children whose media type is not in the allowed set.
pub struct MediaTypeFilter<H> {
    inner: H,
    allowed: HashSet<String>,
}

impl<H: Handler> MediaTypeFilter<H> {
    pub fn new(inner: H, allowed: impl IntoIterator<Item = String>) -> Self {
        Self {
            inner,
            allowed: allowed.into_iter().collect(),
        }
    }

    /// Keep indexes, manifests and configs; skip layers.
    pub fn metadata_only(inner: H) -> Self {
        Self::new(
            inner,
            [
                media_type::oci_index(),
                media_type::oci_manifest(),
                media_type::oci_config(),
                media_type::DOCKER_MANIFEST_LIST.to_string(),
                media_type::DOCKER_MANIFEST.to_string(),
                media_type::DOCKER_CONFIG.to_string(),
            ],
        )
    }
}

#[async_trait]
impl<H: Handler> Handler for MediaTypeFilter<H> {
    async fn children(&self, provider: &dyn Provider, desc: &Descriptor) -> Result<Vec<Descriptor>> {
        let children = self.inner.children(provider, desc).await?;
        Ok(children
            .into_iter()
            .filter(|child| self.allowed.contains(&child.media_type))
            .collect())
    }
}
