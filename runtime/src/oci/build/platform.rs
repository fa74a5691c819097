//! Platform resolution for manifests and indexes.

use futures::future::BoxFuture;
use futures::FutureExt;

use a3s_oci_core::{annotations, media_type, Descriptor, OciError, Platform, Result};

use super::image::{ImageConfig, ImageIndex, ImageManifest};
use crate::content::{read_json, Provider};

/// Platform of an image manifest, read from its config.
pub async fn resolve_platform<P: Provider + ?Sized>(
    provider: &P,
    manifest_desc: &Descriptor,
) -> Result<Platform> {
    if !media_type::is_manifest(&manifest_desc.media_type) {
        return Err(OciError::MalformedContent(format!(
            "cannot read platform of {} ({}), not an image manifest",
            manifest_desc.digest, manifest_desc.media_type
        )));
    }
    let manifest: ImageManifest = read_json(provider, manifest_desc).await?;
    let config: ImageConfig = read_json(provider, &manifest.config).await?;
    Ok(config.platform())
}

/// Select the image manifest for `platform`.
///
/// An index is searched for the first entry whose platform satisfies the
/// request (nested indexes are searched too). A manifest is returned as is
/// once its config platform has been checked. The reference name of `desc`
/// is carried onto the result.
pub async fn resolve_image_manifest<P: Provider + ?Sized>(
    provider: &P,
    desc: &Descriptor,
    platform: &Platform,
) -> Result<Descriptor> {
    let mut resolved = resolve_inner(provider, desc, platform).await?;
    if let Some(name) = desc.ref_name() {
        resolved
            .annotations
            .insert(annotations::REF_NAME.to_string(), name.to_string());
    }
    Ok(resolved)
}

fn resolve_inner<'a, P: Provider + ?Sized>(
    provider: &'a P,
    desc: &'a Descriptor,
    platform: &'a Platform,
) -> BoxFuture<'a, Result<Descriptor>> {
    async move {
        if media_type::is_manifest(&desc.media_type) {
            let actual = resolve_platform(provider, desc).await?;
            if !platform.matches(&actual) {
                return Err(OciError::PlatformMismatch {
                    expected: platform.to_string(),
                    actual: actual.to_string(),
                });
            }
            return Ok(desc.clone().with_platform(actual));
        }

        if !media_type::is_index(&desc.media_type) {
            return Err(OciError::MalformedContent(format!(
                "{} ({}) is neither an image manifest nor an index",
                desc.digest, desc.media_type
            )));
        }

        let index: ImageIndex = read_json(provider, desc).await?;
        let mut available = Vec::new();
        for entry in &index.manifests {
            if media_type::is_index(&entry.media_type) {
                match resolve_inner(provider, entry, platform).await {
                    Ok(found) => return Ok(found),
                    Err(OciError::PlatformMismatch { actual, .. }) => available.push(actual),
                    Err(e) => return Err(e),
                }
                continue;
            }
            match &entry.platform {
                Some(p) if platform.matches(p) => {
                    tracing::debug!(
                        index = %desc.digest,
                        manifest = %entry.digest,
                        platform = %p,
                        "Resolved platform manifest"
                    );
                    return Ok(entry.clone());
                }
                Some(p) => available.push(p.to_string()),
                None => {}
            }
        }

        Err(OciError::PlatformMismatch {
            expected: platform.to_string(),
            actual: if available.is_empty() {
                format!("no platform manifests in index {}", desc.digest)
            } else {
                available.join(", ")
            },
        })
    }
    .boxed()
}
