//! Move an image's own layers onto a different base.

use chrono::{DateTime, Utc};

use a3s_oci_core::{annotations, Descriptor, OciError, Platform, Result};

use super::append::{
    compose, missing, read_image, select_manifest, set_provenance, AppendOptions, ComposedImage,
    NewLayer, DEFAULT_TOOL_NAME,
};
use crate::content::{read_json, Store};
use crate::oci::build::image::ImageManifest;
use crate::oci::reference::ImageReference;

/// Inputs to [`rebase_image`] besides the three images.
#[derive(Debug, Clone)]
pub struct RebaseOptions {
    pub created: DateTime<Utc>,
    /// Platform used to select manifests when an input is an index.
    pub platform: Option<Platform>,
    pub tool_name: String,
}

impl Default for RebaseOptions {
    fn default() -> Self {
        Self {
            created: DateTime::<Utc>::default(),
            platform: None,
            tool_name: DEFAULT_TOOL_NAME.to_string(),
        }
    }
}

/// Replace `old_base` under `original` with `new_base`.
///
/// The layers of `original` above `old_base` are appended to `new_base`.
/// `old_base` must be a digest-for-digest layer prefix of `original`,
/// otherwise [`OciError::BaseMismatch`] is returned and nothing is written.
/// The original's diff IDs, labels and entrypoint are carried over; the
/// resulting manifest names `new_base` as its base image.
pub async fn rebase_image<S: Store + ?Sized>(
    store: &S,
    original: &Descriptor,
    old_base: &Descriptor,
    new_base: &Descriptor,
    options: &RebaseOptions,
) -> Result<ComposedImage> {
    let platform = options.platform.as_ref();
    let original = select_manifest(store, original, platform).await?;
    let old_base = select_manifest(store, old_base, platform).await?;

    let (original_manifest, original_config) = read_image(store, &original, "original").await?;
    let old_base_manifest: ImageManifest = read_json(store, &old_base)
        .await
        .map_err(|e| missing("old base manifest".to_string(), &old_base, e))?;

    check_prefix(&original_manifest, &old_base_manifest)?;

    let prefix_len = old_base_manifest.layers.len();
    let diff_ids = &original_config.rootfs.diff_ids;
    if diff_ids.len() != original_manifest.layers.len() {
        return Err(OciError::MalformedContent(format!(
            "original config {} has {} diff IDs for {} layers",
            original_manifest.config.digest,
            diff_ids.len(),
            original_manifest.layers.len()
        )));
    }

    let original_name = original.ref_name().map(ImageReference::canonical_name);
    let suffix: Vec<NewLayer> = original_manifest.layers[prefix_len..]
        .iter()
        .zip(&diff_ids[prefix_len..])
        .map(|(layer, diff_id)| {
            let mut desc = layer.clone();
            set_provenance(&mut desc, original_name.as_deref(), &original.digest);
            NewLayer {
                desc,
                diff_id: diff_id.clone(),
            }
        })
        .collect();

    let carried = original_config.config.unwrap_or_default();
    let append_options = AppendOptions {
        labels: carried.labels,
        entrypoint: carried.entrypoint,
        created: options.created,
        platform: options.platform.clone(),
        tool_name: options.tool_name.clone(),
        ..AppendOptions::default()
    };

    let new_base_name = new_base.ref_name().map(ImageReference::canonical_name);
    let base_annotations = Some((new_base_name, new_base.digest.clone()));

    let image = compose(store, new_base, suffix, &append_options, base_annotations).await?;
    tracing::info!(
        original = %original.digest,
        old_base = %old_base.digest,
        new_base = %new_base.digest,
        manifest = %image.manifest.digest,
        "Rebased image"
    );
    Ok(image)
}

fn check_prefix(original: &ImageManifest, old_base: &ImageManifest) -> Result<()> {
    if old_base.layers.len() > original.layers.len() {
        return Err(OciError::BaseMismatch(format!(
            "old base has {} layers, image has only {}",
            old_base.layers.len(),
            original.layers.len()
        )));
    }
    for (i, (base_layer, layer)) in old_base.layers.iter().zip(&original.layers).enumerate() {
        if base_layer.digest != layer.digest {
            return Err(OciError::BaseMismatch(format!(
                "layer {} differs: old base has {}, image has {}",
                i, base_layer.digest, layer.digest
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::{write_json, MemoryStore, Provider};
    use crate::oci::build::image::{ContainerConfig, ImageConfig, RootFs};
    use a3s_oci_core::{media_type, Digest};

    async fn image(
        store: &MemoryStore,
        layers: &[&str],
        container: Option<ContainerConfig>,
        name: Option<&str>,
    ) -> Descriptor {
        let descs: Vec<Descriptor> = layers
            .iter()
            .map(|data| store.insert(&media_type::oci_layer(), data.as_bytes().to_vec()))
            .collect();
        let config = ImageConfig {
            os: "linux".to_string(),
            architecture: "amd64".to_string(),
            config: container,
            rootfs: RootFs {
                fs_type: "layers".to_string(),
                diff_ids: descs.iter().map(|d| d.digest.clone()).collect(),
            },
            ..ImageConfig::default()
        };
        let config_desc = write_json(store, &media_type::oci_config(), &config).await.unwrap();
        let manifest = ImageManifest::new(config_desc, descs);
        let desc = write_json(store, &media_type::oci_manifest(), &manifest).await.unwrap();
        match name {
            Some(name) => desc.with_annotation(annotations::REF_NAME, name),
            None => desc,
        }
    }

    fn digests(manifest: &ImageManifest) -> Vec<Digest> {
        manifest.layers.iter().map(|l| l.digest.clone()).collect()
    }

    #[tokio::test]
    async fn test_rebase_keeps_suffix() {
        let store = MemoryStore::new();
        let old_base = image(&store, &["os v1"], None, Some("docker.io/library/debian:11")).await;
        let new_base = image(&store, &["os v2", "os v2 patch"], None, Some("docker.io/library/debian:12")).await;
        let original = image(
            &store,
            &["os v1", "app", "assets"],
            Some(ContainerConfig {
                entrypoint: Some(vec!["/app".to_string()]),
                labels: [("team".to_string(), "web".to_string())].into_iter().collect(),
                ..ContainerConfig::default()
            }),
            Some("ghcr.io/org/app:1.0"),
        )
        .await;

        let image = rebase_image(&store, &original, &old_base, &new_base, &RebaseOptions::default())
            .await
            .unwrap();
        let (manifest, config) = read_image(&store, &image.manifest, "result").await.unwrap();

        assert_eq!(
            digests(&manifest),
            vec![
                Digest::from_bytes(b"os v2"),
                Digest::from_bytes(b"os v2 patch"),
                Digest::from_bytes(b"app"),
                Digest::from_bytes(b"assets"),
            ]
        );
        assert_eq!(config.rootfs.diff_ids, digests(&manifest));

        for layer in &manifest.layers[2..] {
            assert_eq!(layer.annotation(annotations::BASE_IMAGE_NAME), Some("ghcr.io/org/app"));
            assert_eq!(
                layer.annotation(annotations::BASE_IMAGE_DIGEST),
                Some(original.digest.as_str())
            );
        }
        assert_eq!(
            manifest.layers[0].annotation(annotations::BASE_IMAGE_NAME),
            Some("docker.io/library/debian")
        );

        assert_eq!(
            manifest.annotations.get(annotations::BASE_IMAGE_NAME).map(String::as_str),
            Some("docker.io/library/debian")
        );
        assert_eq!(
            manifest.annotations.get(annotations::BASE_IMAGE_DIGEST).map(String::as_str),
            Some(new_base.digest.as_str())
        );

        let container = config.config.unwrap();
        assert_eq!(container.entrypoint, Some(vec!["/app".to_string()]));
        assert_eq!(container.labels.get("team").map(String::as_str), Some("web"));
    }

    #[tokio::test]
    async fn test_rebase_base_mismatch_writes_nothing() {
        let store = MemoryStore::new();
        let old_base = image(&store, &["other os"], None, None).await;
        let new_base = image(&store, &["os v2"], None, None).await;
        let original = image(&store, &["os v1", "app"], None, None).await;
        let before = store.len();

        let err = rebase_image(&store, &original, &old_base, &new_base, &RebaseOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, OciError::BaseMismatch(_)));
        assert_eq!(store.len(), before);
    }

    #[tokio::test]
    async fn test_rebase_old_base_longer_than_image() {
        let store = MemoryStore::new();
        let old_base = image(&store, &["a", "b", "c"], None, None).await;
        let new_base = image(&store, &["x"], None, None).await;
        let original = image(&store, &["a", "b"], None, None).await;

        let err = rebase_image(&store, &original, &old_base, &new_base, &RebaseOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, OciError::BaseMismatch(_)));
    }

    #[tokio::test]
    async fn test_rebase_missing_new_base() {
        let store = MemoryStore::new();
        let old_base = image(&store, &["os v1"], None, None).await;
        let original = image(&store, &["os v1", "app"], None, None).await;
        let new_base = Descriptor::from_bytes(media_type::oci_manifest(), b"not stored");

        let err = rebase_image(&store, &original, &old_base, &new_base, &RebaseOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, OciError::MissingContent { .. }));
        assert!(store.reader_at(&new_base).await.is_err());
    }
}
