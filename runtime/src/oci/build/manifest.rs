//! Manifest and index creation from existing content.

use std::collections::BTreeMap;

use a3s_oci_core::{media_type, Descriptor, OciError, Result};

use super::image::{ImageIndex, ImageManifest};
use crate::content::{write_json, Provider, Store};

/// Write an image manifest referencing `config` and `layers`.
///
/// Every referenced blob must already be readable from `store`; a manifest
/// is never written ahead of its content.
pub async fn create_manifest<S: Store + ?Sized>(
    store: &S,
    config: &Descriptor,
    layers: &[Descriptor],
    annotations: BTreeMap<String, String>,
) -> Result<Descriptor> {
    if !media_type::is_config(&config.media_type) {
        return Err(OciError::MalformedContent(format!(
            "{} ({}) is not an image config",
            config.digest, config.media_type
        )));
    }
    ensure_present(store, config, "config").await?;
    for layer in layers {
        ensure_present(store, layer, "layer").await?;
    }

    let mut manifest = ImageManifest::new(config.clone(), layers.to_vec());
    manifest.annotations = annotations;
    let desc = write_json(store, &media_type::oci_manifest(), &manifest).await?;
    tracing::debug!(manifest = %desc.digest, layers = layers.len(), "Created manifest");
    Ok(desc)
}

/// Write an image index over `manifests`.
///
/// Entries keep their platform; their reference name annotation is dropped
/// since tags belong to the index, not to its children.
pub async fn create_index<S: Store + ?Sized>(
    store: &S,
    manifests: &[Descriptor],
    annotations: BTreeMap<String, String>,
) -> Result<Descriptor> {
    let mut entries = Vec::with_capacity(manifests.len());
    for manifest in manifests {
        if !media_type::is_manifest(&manifest.media_type) && !media_type::is_index(&manifest.media_type) {
            return Err(OciError::MalformedContent(format!(
                "index entry {} has media type {}",
                manifest.digest, manifest.media_type
            )));
        }
        ensure_present(store, manifest, "manifest").await?;
        let mut entry = manifest.clone();
        entry.annotations.remove(a3s_oci_core::annotations::REF_NAME);
        entries.push(entry);
    }

    let mut index = ImageIndex::new(entries);
    index.annotations = annotations;
    let desc = write_json(store, &media_type::oci_index(), &index).await?;
    tracing::debug!(index = %desc.digest, manifests = manifests.len(), "Created index");
    Ok(desc)
}

async fn ensure_present<P: Provider + ?Sized>(provider: &P, desc: &Descriptor, what: &str) -> Result<()> {
    match provider.reader_at(desc).await {
        Ok(_) => Ok(()),
        Err(e) if e.is_not_found() => Err(OciError::MissingContent {
            what: what.to_string(),
            digest: desc.digest.to_string(),
            source: Box::new(e),
        }),
        Err(e) => Err(e.context(format!("checking {} {}", what, desc.digest))),
    }
}
