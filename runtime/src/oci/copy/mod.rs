//! Copying content between stores.
//!
//! A blob is copied by streaming it from a [`Provider`] into an
//! [`Ingester`] with digest verification, or by a registry-side mount when
//! the destination supports it. Graph copies visit children before their
//! parent so a destination never holds a manifest or index whose
//! references are missing.

mod dispatch;
mod handler;
mod publish;

pub use dispatch::{dispatch, dispatch_children};
pub use handler::{ChildrenHandler, Handler, MediaTypeFilter};
pub use publish::{pull_image, push_blob, push_image, write_image_layout};

use std::collections::HashSet;

use a3s_oci_core::{annotations, Descriptor, Digest, Result};

use crate::content::{stream_verified, Ingester, MountIngester, Provider};
use crate::oci::reference::ImageReference;

/// Copy one blob from `from` to `to`.
///
/// Content already present at the destination counts as copied. When the
/// destination can mount and the blob records the repository it came from
/// on the same host, a mount is tried first; a failed mount falls back to
/// a byte copy.
pub async fn copy_content(from: &dyn Provider, to: &dyn Ingester, desc: &Descriptor) -> Result<()> {
    if let Some(mount) = to.mountable() {
        if try_skip_or_mount(mount, desc).await {
            return Ok(());
        }
    }

    let reference = desc
        .ref_name()
        .map(String::from)
        .unwrap_or_else(|| desc.digest.to_string());

    let mut writer = match to.writer(&reference, desc).await {
        Ok(writer) => writer,
        Err(e) if e.is_already_exists() => {
            tracing::debug!(digest = %desc.digest, "Content already exists");
            return Ok(());
        }
        Err(e) => return Err(e.context(format!("opening writer for {}", desc.digest))),
    };

    let reader = from
        .reader_at(desc)
        .await
        .map_err(|e| e.context(format!("reading {}", desc.digest)))?;
    let size = stream_verified(reader.as_ref(), desc, writer.as_mut())
        .await
        .map_err(|e| e.context(format!("copying {}", desc.digest)))?;

    match writer.commit(size, &desc.digest).await {
        Err(e) if !e.is_already_exists() => Err(e.context(format!("committing {}", desc.digest))),
        _ => {
            tracing::debug!(digest = %desc.digest, size, media_type = %desc.media_type, "Copied content");
            Ok(())
        }
    }
}

/// Returns true when no byte copy is needed.
///
/// A descriptor with a reference name is always written so the
/// destination records the name.
async fn try_skip_or_mount(mount: &dyn MountIngester, desc: &Descriptor) -> bool {
    if desc.ref_name().is_none() {
        match mount.contains(desc).await {
            Ok(true) => {
                tracing::debug!(digest = %desc.digest, "Destination already has content");
                return true;
            }
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(digest = %desc.digest, error = %e, "Existence check failed");
            }
        }
    }

    let Some(base) = desc.annotation(annotations::BASE_IMAGE_NAME) else {
        return false;
    };
    let source = match ImageReference::parse(base) {
        Ok(source) => source,
        Err(e) => {
            tracing::warn!(base = %base, error = %e, "Ignoring unparsable base image name");
            return false;
        }
    };
    if source.registry != mount.host() || source.repository == mount.repository_name() {
        return false;
    }

    match mount.mount(&source.repository, desc).await {
        Ok(()) => {
            tracing::debug!(
                digest = %desc.digest,
                from = %source.repository,
                to = %mount.repository_name(),
                "Mounted blob"
            );
            true
        }
        Err(e) => {
            tracing::warn!(
                digest = %desc.digest,
                from = %source.repository,
                error = %e,
                "Mount failed, copying content"
            );
            false
        }
    }
}

/// Copy `root` and everything reachable from it, children first.
pub async fn copy_content_from_handler(
    from: &dyn Provider,
    to: &dyn Ingester,
    handler: &dyn Handler,
    root: &Descriptor,
) -> Result<()> {
    let mut copied = HashSet::new();
    walk(from, to, handler, root, true, &mut copied).await
}

/// Copy everything reachable from `root`, children first, but not `root`.
pub async fn copy_children_from_handler(
    from: &dyn Provider,
    to: &dyn Ingester,
    handler: &dyn Handler,
    root: &Descriptor,
) -> Result<()> {
    let mut copied = HashSet::new();
    walk(from, to, handler, root, false, &mut copied).await
}

enum Step {
    Expand(Descriptor),
    Copy(Descriptor),
}

async fn walk(
    from: &dyn Provider,
    to: &dyn Ingester,
    handler: &dyn Handler,
    root: &Descriptor,
    include_root: bool,
    copied: &mut HashSet<Digest>,
) -> Result<()> {
    let mut stack = Vec::new();
    for child in handler.children(from, root).await?.into_iter().rev() {
        stack.push(Step::Expand(child));
    }
    if include_root {
        stack.insert(0, Step::Copy(root.clone()));
    }

    while let Some(step) = stack.pop() {
        match step {
            Step::Expand(desc) => {
                if copied.contains(&desc.digest) {
                    continue;
                }
                let children = handler.children(from, &desc).await?;
                stack.push(Step::Copy(desc));
                for child in children.into_iter().rev() {
                    stack.push(Step::Expand(child));
                }
            }
            Step::Copy(desc) => {
                if copied.insert(desc.digest.clone()) {
                    copy_content(from, to, &desc).await?;
                }
            }
        }
    }
    Ok(())
}
