//! Publishing images to registries and OCI layouts, and pulling them back.

use std::path::Path;

use tokio_util::sync::CancellationToken;

use a3s_oci_core::{annotations, media_type, Descriptor, EngineConfig, Result};

use super::{copy_content, copy_content_from_handler, dispatch, dispatch_children};
use super::{ChildrenHandler, Handler, MediaTypeFilter};
use crate::content::{read_json, BlobIndex, Provider};
use crate::oci::build::image::ImageIndex;
use crate::oci::build::layer::describe_layer_file;
use crate::oci::layout::OciLayout;
use crate::oci::reference::ImageReference;
use crate::oci::registry::RegistryResolver;

/// Push the image graph rooted at `desc` to `target`.
///
/// Children are pushed by digest first; the root is pushed last under the
/// target's tag, if it has one. Returns the root descriptor named after
/// the target.
pub async fn push_image(
    resolver: &RegistryResolver,
    provider: &dyn Provider,
    desc: &Descriptor,
    target: &str,
    config: &EngineConfig,
    cancel: &CancellationToken,
) -> Result<Descriptor> {
    let target_ref = ImageReference::parse(target)?;
    let resolver = resolver.clone().with_cancellation(cancel.clone());

    let children_pusher = resolver.pusher(&target_ref.repository_only().full_reference())?;
    dispatch_children(
        provider,
        &children_pusher,
        &ChildrenHandler,
        desc,
        config.parallelism,
        cancel,
    )
    .await
    .map_err(|e| e.context(format!("pushing content of {} to {}", desc.digest, target_ref)))?;

    let mut root = desc.clone();
    root.annotations
        .insert(annotations::REF_NAME.to_string(), target_ref.full_reference());
    let root_pusher = resolver.pusher(&target_ref.full_reference())?;
    copy_content(provider, &root_pusher, &root)
        .await
        .map_err(|e| e.context(format!("pushing {} to {}", desc.digest, target_ref)))?;

    tracing::info!(target = %target_ref, digest = %root.digest, "Pushed image");
    Ok(root)
}

/// Push the file at `path` as a single blob to `target`'s repository.
///
/// The media type is the layer type matching the file's compression.
pub async fn push_blob(resolver: &RegistryResolver, path: &Path, target: &str) -> Result<Descriptor> {
    let desc = describe_layer_file(path)?;
    let mut index = BlobIndex::new();
    index.insert(desc.digest.clone(), path);

    let pusher = resolver.pusher(target)?;
    copy_content(&index, &pusher, &desc)
        .await
        .map_err(|e| e.context(format!("pushing {} to {}", path.display(), target)))?;

    tracing::info!(target = %target, digest = %desc.digest, size = desc.size, "Pushed blob");
    Ok(desc)
}

/// Copy the graph rooted at `desc` into an OCI layout at `out_dir`.
///
/// `index.json` is written after every blob: it is the root index itself
/// when the root is an index, otherwise a one-entry index naming the root.
pub async fn write_image_layout(provider: &dyn Provider, desc: &Descriptor, out_dir: &Path) -> Result<OciLayout> {
    let layout = OciLayout::create(out_dir)?;
    copy_content_from_handler(provider, &layout, &ChildrenHandler, desc)
        .await
        .map_err(|e| e.context(format!("writing {} to layout {}", desc.digest, out_dir.display())))?;

    if media_type::is_index(&desc.media_type) {
        let index: ImageIndex = read_json(provider, desc).await?;
        layout.write_index(&index)?;
    } else {
        layout.add_reference(desc.clone());
        layout.save_index()?;
    }

    tracing::info!(path = %out_dir.display(), digest = %desc.digest, "Wrote OCI layout");
    Ok(layout)
}

/// Pull `reference` into `layout` and record it in the layout's index.
///
/// With `shallow`, only indexes, manifests and configs are fetched.
pub async fn pull_image(
    resolver: &RegistryResolver,
    reference: &str,
    layout: &OciLayout,
    config: &EngineConfig,
    shallow: bool,
    cancel: &CancellationToken,
) -> Result<Descriptor> {
    let resolver = resolver.clone().with_cancellation(cancel.clone());
    let (name, desc) = resolver.resolve(reference).await?;
    let fetcher = resolver.fetcher(&name)?;

    let handler: Box<dyn Handler> = if shallow {
        Box::new(MediaTypeFilter::metadata_only(ChildrenHandler))
    } else {
        Box::new(ChildrenHandler)
    };
    dispatch(&fetcher, layout, handler.as_ref(), &desc, config.parallelism, cancel)
        .await
        .map_err(|e| e.context(format!("pulling {}", name)))?;

    layout.add_reference(desc.clone());
    layout.save_index()?;

    tracing::info!(reference = %name, digest = %desc.digest, shallow, "Pulled image");
    Ok(desc)
}
