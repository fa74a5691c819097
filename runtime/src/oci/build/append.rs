//! Append layers to a base image.
//!
//! Produces a new manifest and config from a base image and a list of
//! layer descriptors without unpacking anything. The base layers, their
//! diff IDs and history are kept; the new layers are added on top.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use a3s_oci_core::{annotations, media_type, Descriptor, Digest, OciError, Platform, Result};

use super::diff_id::compute_diff_id;
use super::image::{format_timestamp, History, ImageConfig, ImageManifest, SCHEMA_VERSION};
use super::platform::resolve_image_manifest;
use crate::content::{read_json, write_json, Provider, Store};
use crate::oci::reference::ImageReference;

/// Default author and history comment of composed images.
pub const DEFAULT_TOOL_NAME: &str = "a3s-oci";

/// Inputs to [`append_layers`] besides the base and the layers.
#[derive(Debug, Clone)]
pub struct AppendOptions {
    /// Manifest annotations; replace the base manifest's annotations.
    pub annotations: BTreeMap<String, String>,
    /// Labels merged into the base labels. An empty value removes the label.
    pub labels: BTreeMap<String, String>,
    /// `KEY=value` entries; replace base entries with the same key.
    pub env: Vec<String>,
    /// Replaces the base entrypoint when set.
    pub entrypoint: Option<Vec<String>>,
    /// Replaces the base command when set.
    pub cmd: Option<Vec<String>>,
    /// Creation time recorded in the config, history and annotations.
    pub created: DateTime<Utc>,
    /// Target platform. Selects from an index base and must match the
    /// base config; fills the config when the base has none.
    pub platform: Option<Platform>,
    /// Author and history comment.
    pub tool_name: String,
}

impl Default for AppendOptions {
    fn default() -> Self {
        Self {
            annotations: BTreeMap::new(),
            labels: BTreeMap::new(),
            env: Vec::new(),
            entrypoint: None,
            cmd: None,
            created: DateTime::<Utc>::default(),
            platform: None,
            tool_name: DEFAULT_TOOL_NAME.to_string(),
        }
    }
}

/// Manifest and config written by a composition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposedImage {
    pub manifest: Descriptor,
    pub config: Descriptor,
}

/// Append `layers` on top of the image `base`.
///
/// Reads the base manifest and config through `store`, computes the diff
/// ID of every new layer, and writes the new config and manifest through
/// `store`. Base layers are tagged with the base image's name and digest
/// when the base descriptor carries a reference name and the layer has no
/// provenance yet.
pub async fn append_layers<S: Store + ?Sized>(
    store: &S,
    base: &Descriptor,
    layers: &[Descriptor],
    options: &AppendOptions,
) -> Result<ComposedImage> {
    let mut new_layers = Vec::with_capacity(layers.len());
    for layer in layers {
        let diff_id = compute_diff_id(store, layer)
            .await
            .map_err(|e| e.context(format!("appending layer {}", layer.digest)))?;
        new_layers.push(NewLayer {
            desc: layer.clone(),
            diff_id,
        });
    }

    compose(store, base, new_layers, options, None).await
}

/// A layer to add, with its diff ID already known.
pub(crate) struct NewLayer {
    pub desc: Descriptor,
    pub diff_id: Digest,
}

/// Shared core of append and rebase.
///
/// `base_annotations`, when set, overrides the base-image annotations of
/// the resulting manifest.
pub(crate) async fn compose<S: Store + ?Sized>(
    store: &S,
    base: &Descriptor,
    new_layers: Vec<NewLayer>,
    options: &AppendOptions,
    base_annotations: Option<(Option<String>, Digest)>,
) -> Result<ComposedImage> {
    let base = select_manifest(store, base, options.platform.as_ref()).await?;
    let (base_manifest, mut config) = read_image(store, &base, "base").await?;

    if config.rootfs.diff_ids.len() != base_manifest.layers.len() {
        return Err(OciError::MalformedContent(format!(
            "base config {} has {} diff IDs for {} layers",
            base_manifest.config.digest,
            config.rootfs.diff_ids.len(),
            base_manifest.layers.len()
        )));
    }

    if let Some(requested) = options.platform.as_ref() {
        let actual = config.platform();
        if actual.is_empty() {
            config.os = requested.os.clone();
            config.architecture = requested.architecture.clone();
            config.variant = requested.variant.clone();
        } else if !requested.matches(&actual) {
            return Err(OciError::PlatformMismatch {
                expected: requested.to_string(),
                actual: actual.to_string(),
            });
        }
    }

    let created = format_timestamp(&options.created);

    // Base layers: provenance from the base reference, first writer wins.
    let provenance = base
        .ref_name()
        .map(|name| (ImageReference::canonical_name(name), base.digest.clone()));
    let mut layers: Vec<Descriptor> = base_manifest
        .layers
        .iter()
        .map(|layer| {
            let mut layer = normalize_layer(layer.clone());
            if let Some((name, digest)) = provenance.as_ref() {
                set_provenance(&mut layer, Some(name.as_str()), digest);
            }
            layer
        })
        .collect();

    for layer in new_layers {
        let created_by = layer
            .desc
            .annotation(annotations::ARTIFACT_DESCRIPTION)
            .map(String::from);
        config.history.push(History {
            created: Some(created.clone()),
            created_by,
            comment: Some(options.tool_name.clone()),
            ..History::default()
        });
        config.rootfs.diff_ids.push(layer.diff_id);
        layers.push(normalize_layer(layer.desc));
    }

    config.created = Some(created.clone());
    config.author = Some(options.tool_name.clone());
    apply_container_options(&mut config, options);

    let config_desc = write_json(store, &media_type::oci_config(), &config)
        .await
        .map_err(|e| e.context("writing image config"))?;

    let mut manifest_annotations = options.annotations.clone();
    manifest_annotations.insert(annotations::CREATED.to_string(), created);
    if let Some((name, digest)) = base_annotations {
        match name {
            Some(name) => manifest_annotations.insert(annotations::BASE_IMAGE_NAME.to_string(), name),
            None => manifest_annotations.remove(annotations::BASE_IMAGE_NAME),
        };
        manifest_annotations.insert(annotations::BASE_IMAGE_DIGEST.to_string(), digest.to_string());
    }

    let manifest = ImageManifest {
        schema_version: SCHEMA_VERSION,
        media_type: Some(media_type::oci_manifest()),
        artifact_type: None,
        config: config_desc.clone(),
        layers,
        subject: None,
        annotations: manifest_annotations,
        extra: base_manifest.extra.clone(),
    };
    let mut manifest_desc = write_json(store, &media_type::oci_manifest(), &manifest)
        .await
        .map_err(|e| e.context("writing image manifest"))?;

    let platform = config.platform();
    if !platform.is_empty() {
        manifest_desc.platform = Some(platform);
    }

    tracing::info!(
        base = %base.digest,
        manifest = %manifest_desc.digest,
        config = %config_desc.digest,
        layers = manifest.layers.len(),
        "Composed image"
    );

    Ok(ComposedImage {
        manifest: manifest_desc,
        config: config_desc,
    })
}

/// Resolve `desc` to an image manifest, selecting from an index by platform.
pub(crate) async fn select_manifest<P: Provider + ?Sized>(
    provider: &P,
    desc: &Descriptor,
    platform: Option<&Platform>,
) -> Result<Descriptor> {
    if !media_type::is_index(&desc.media_type) {
        return Ok(desc.clone());
    }
    match platform {
        Some(platform) => resolve_image_manifest(provider, desc, platform).await,
        None => Err(OciError::MalformedContent(format!(
            "{} is an image index; a platform is required to select a manifest",
            desc.digest
        ))),
    }
}

/// Read an image manifest and its config, reporting absent content as
/// [`OciError::MissingContent`].
pub(crate) async fn read_image<P: Provider + ?Sized>(
    provider: &P,
    desc: &Descriptor,
    role: &str,
) -> Result<(ImageManifest, ImageConfig)> {
    let manifest: ImageManifest = read_json(provider, desc)
        .await
        .map_err(|e| missing(format!("{} manifest", role), desc, e))?;
    let config: ImageConfig = read_json(provider, &manifest.config)
        .await
        .map_err(|e| missing(format!("{} config", role), &manifest.config, e))?;
    Ok((manifest, config))
}

pub(crate) fn missing(what: String, desc: &Descriptor, e: OciError) -> OciError {
    if e.is_not_found() {
        OciError::MissingContent {
            what,
            digest: desc.digest.to_string(),
            source: Box::new(e),
        }
    } else {
        e.context(format!("reading {} {}", what, desc.digest))
    }
}

/// Record where a layer came from. Each annotation keeps the value it
/// already has; missing ones are filled in.
pub(crate) fn set_provenance(layer: &mut Descriptor, name: Option<&str>, digest: &Digest) {
    if let Some(name) = name {
        layer
            .annotations
            .entry(annotations::BASE_IMAGE_NAME.to_string())
            .or_insert_with(|| name.to_string());
    }
    layer
        .annotations
        .entry(annotations::BASE_IMAGE_DIGEST.to_string())
        .or_insert_with(|| digest.to_string());
}

fn normalize_layer(mut layer: Descriptor) -> Descriptor {
    layer.media_type = media_type::docker_to_oci(&layer.media_type);
    layer
}

fn apply_container_options(config: &mut ImageConfig, options: &AppendOptions) {
    let container = config.container_config_mut();

    for (key, value) in &options.labels {
        if value.is_empty() {
            container.labels.remove(key);
        } else {
            container.labels.insert(key.clone(), value.clone());
        }
    }

    for entry in &options.env {
        let key = entry.split('=').next().unwrap_or(entry);
        match container
            .env
            .iter_mut()
            .find(|existing| existing.split('=').next() == Some(key))
        {
            Some(existing) => *existing = entry.clone(),
            None => container.env.push(entry.clone()),
        }
    }

    if let Some(entrypoint) = options.entrypoint.as_ref() {
        container.entrypoint = Some(entrypoint.clone());
    }
    if let Some(cmd) = options.cmd.as_ref() {
        container.cmd = Some(cmd.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::{read_blob, MemoryStore};
    use crate::oci::build::image::{ContainerConfig, RootFs};
    use std::io::Write;

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    /// Base image with two uncompressed layers.
    async fn base_image(store: &MemoryStore) -> Descriptor {
        let l1 = store.insert(media_type::DOCKER_LAYER, b"layer one".to_vec());
        let l2 = store.insert(&media_type::oci_layer(), b"layer two".to_vec());
        let config = ImageConfig {
            os: "linux".to_string(),
            architecture: "amd64".to_string(),
            config: Some(ContainerConfig {
                env: vec!["PATH=/usr/bin".to_string(), "LANG=C".to_string()],
                entrypoint: Some(vec!["/bin/sh".to_string()]),
                labels: [
                    ("maintainer".to_string(), "base".to_string()),
                    ("stale".to_string(), "yes".to_string()),
                ]
                .into_iter()
                .collect(),
                ..ContainerConfig::default()
            }),
            rootfs: RootFs {
                fs_type: "layers".to_string(),
                diff_ids: vec![l1.digest.clone(), l2.digest.clone()],
            },
            history: vec![History {
                created_by: Some("base build".to_string()),
                ..History::default()
            }],
            ..ImageConfig::default()
        };
        let config_desc = write_json(store, media_type::DOCKER_CONFIG, &config).await.unwrap();
        let mut manifest = ImageManifest::new(config_desc, vec![l1, l2]);
        manifest.media_type = Some(media_type::DOCKER_MANIFEST.to_string());
        manifest
            .annotations
            .insert("base.only".to_string(), "x".to_string());
        write_json(store, media_type::DOCKER_MANIFEST, &manifest)
            .await
            .unwrap()
            .with_annotation(annotations::REF_NAME, "docker.io/library/debian:12")
    }

    async fn read_result(store: &MemoryStore, image: &ComposedImage) -> (ImageManifest, ImageConfig) {
        read_image(store, &image.manifest, "result").await.unwrap()
    }

    #[tokio::test]
    async fn test_append_gzip_layer() {
        let store = MemoryStore::new();
        let base = base_image(&store).await;
        let l3 = store
            .insert(&media_type::oci_layer_gzip(), gzip(b"layer three"))
            .with_annotation(annotations::ARTIFACT_DESCRIPTION, "deb: curl");

        let options = AppendOptions {
            annotations: [("team".to_string(), "infra".to_string())].into_iter().collect(),
            ..AppendOptions::default()
        };
        let image = append_layers(&store, &base, &[l3.clone()], &options).await.unwrap();
        let (manifest, config) = read_result(&store, &image).await;

        assert_eq!(manifest.layers.len(), 3);
        assert_eq!(manifest.layers[2].digest, l3.digest);
        assert_eq!(
            config.rootfs.diff_ids,
            vec![
                Digest::from_bytes(b"layer one"),
                Digest::from_bytes(b"layer two"),
                Digest::from_bytes(b"layer three"),
            ]
        );
        assert_eq!(config.history.len(), 2);
        assert_eq!(config.history[1].created_by.as_deref(), Some("deb: curl"));
        assert_eq!(config.history[1].comment.as_deref(), Some(DEFAULT_TOOL_NAME));
        assert_eq!(config.created.as_deref(), Some("1970-01-01T00:00:00Z"));
        assert_eq!(config.author.as_deref(), Some(DEFAULT_TOOL_NAME));

        assert_eq!(manifest.media_type, Some(media_type::oci_manifest()));
        assert_eq!(manifest.config.media_type, media_type::oci_config());
        assert!(manifest.layers.iter().all(|l| !l.media_type.contains("docker")));
        assert_eq!(manifest.annotations.get("team").map(String::as_str), Some("infra"));
        assert!(manifest.annotations.contains_key(annotations::CREATED));
        assert!(!manifest.annotations.contains_key("base.only"));

        assert_eq!(image.manifest.platform, Some(Platform::new("linux", "amd64")));
        assert_eq!(read_blob(&store, &image.config).await.unwrap().len() as u64, image.config.size);
    }

    #[tokio::test]
    async fn test_base_layers_get_provenance() {
        let store = MemoryStore::new();
        let base = base_image(&store).await;
        let l3 = store.insert(&media_type::oci_layer(), b"three".to_vec());

        let image = append_layers(&store, &base, &[l3], &AppendOptions::default())
            .await
            .unwrap();
        let (manifest, _) = read_result(&store, &image).await;

        for layer in &manifest.layers[..2] {
            assert_eq!(
                layer.annotation(annotations::BASE_IMAGE_NAME),
                Some("docker.io/library/debian")
            );
            assert_eq!(
                layer.annotation(annotations::BASE_IMAGE_DIGEST),
                Some(base.digest.as_str())
            );
        }
        assert!(manifest.layers[2].annotation(annotations::BASE_IMAGE_NAME).is_none());
    }

    #[tokio::test]
    async fn test_provenance_first_writer_wins() {
        let store = MemoryStore::new();
        let base = base_image(&store).await;
        let l3 = store.insert(&media_type::oci_layer(), b"three".to_vec());
        let first = append_layers(&store, &base, &[l3], &AppendOptions::default())
            .await
            .unwrap();

        // Append again on top of the first result under a different name.
        let intermediate = first
            .manifest
            .clone()
            .with_annotation(annotations::REF_NAME, "ghcr.io/org/intermediate:1");
        let l4 = store.insert(&media_type::oci_layer(), b"four".to_vec());
        let second = append_layers(&store, &intermediate, &[l4], &AppendOptions::default())
            .await
            .unwrap();
        let (manifest, _) = read_result(&store, &second).await;

        assert_eq!(
            manifest.layers[0].annotation(annotations::BASE_IMAGE_NAME),
            Some("docker.io/library/debian")
        );
        assert_eq!(
            manifest.layers[2].annotation(annotations::BASE_IMAGE_NAME),
            Some("ghcr.io/org/intermediate")
        );
        assert_eq!(
            manifest.layers[2].annotation(annotations::BASE_IMAGE_DIGEST),
            Some(first.manifest.digest.as_str())
        );
    }

    #[tokio::test]
    async fn test_labels_env_entrypoint() {
        let store = MemoryStore::new();
        let base = base_image(&store).await;
        let options = AppendOptions {
            labels: [
                ("version".to_string(), "1.2".to_string()),
                ("stale".to_string(), String::new()),
            ]
            .into_iter()
            .collect(),
            env: vec!["PATH=/opt/bin:/usr/bin".to_string(), "MODE=prod".to_string()],
            entrypoint: Some(vec!["/app".to_string()]),
            ..AppendOptions::default()
        };
        let image = append_layers(&store, &base, &[], &options).await.unwrap();
        let (manifest, config) = read_result(&store, &image).await;
        let container = config.config.unwrap();

        assert_eq!(manifest.layers.len(), 2);
        assert_eq!(container.labels.get("maintainer").map(String::as_str), Some("base"));
        assert_eq!(container.labels.get("version").map(String::as_str), Some("1.2"));
        assert!(!container.labels.contains_key("stale"));
        assert_eq!(
            container.env,
            vec!["PATH=/opt/bin:/usr/bin", "LANG=C", "MODE=prod"]
        );
        assert_eq!(container.entrypoint, Some(vec!["/app".to_string()]));
    }

    #[tokio::test]
    async fn test_entrypoint_kept_when_unset() {
        let store = MemoryStore::new();
        let base = base_image(&store).await;
        let image = append_layers(&store, &base, &[], &AppendOptions::default())
            .await
            .unwrap();
        let (_, config) = read_result(&store, &image).await;
        assert_eq!(
            config.config.unwrap().entrypoint,
            Some(vec!["/bin/sh".to_string()])
        );
    }

    #[tokio::test]
    async fn test_missing_base_manifest() {
        let store = MemoryStore::new();
        let base = Descriptor::from_bytes(media_type::oci_manifest(), b"gone");
        let err = append_layers(&store, &base, &[], &AppendOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, OciError::MissingContent { .. }));
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_missing_new_layer_fails() {
        let store = MemoryStore::new();
        let base = base_image(&store).await;
        let ghost = Descriptor::from_bytes(media_type::oci_layer_gzip(), b"ghost");
        let err = append_layers(&store, &base, &[ghost.clone()], &AppendOptions::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains(ghost.digest.as_str()));
    }

    #[tokio::test]
    async fn test_platform_mismatch() {
        let store = MemoryStore::new();
        let base = base_image(&store).await;
        let options = AppendOptions {
            platform: Some(Platform::new("linux", "arm64")),
            ..AppendOptions::default()
        };
        let err = append_layers(&store, &base, &[], &options).await.unwrap_err();
        assert!(matches!(err, OciError::PlatformMismatch { .. }));
    }

    #[test]
    fn test_set_provenance_keeps_existing() {
        let digest = Digest::from_bytes(b"base");
        let mut layer = Descriptor::from_bytes(media_type::oci_layer(), b"l")
            .with_annotation(annotations::BASE_IMAGE_DIGEST, "sha256:older");
        set_provenance(&mut layer, Some("docker.io/library/debian"), &digest);
        assert_eq!(layer.annotation(annotations::BASE_IMAGE_DIGEST), Some("sha256:older"));
        assert_eq!(
            layer.annotation(annotations::BASE_IMAGE_NAME),
            Some("docker.io/library/debian")
        );
    }

    #[test]
    fn test_set_provenance_fills_each_missing_key() {
        let digest = Digest::from_bytes(b"base");
        let mut layer = Descriptor::from_bytes(media_type::oci_layer(), b"l")
            .with_annotation(annotations::BASE_IMAGE_NAME, "ghcr.io/org/older");
        set_provenance(&mut layer, Some("docker.io/library/debian"), &digest);
        assert_eq!(layer.annotation(annotations::BASE_IMAGE_NAME), Some("ghcr.io/org/older"));
        assert_eq!(
            layer.annotation(annotations::BASE_IMAGE_DIGEST),
            Some(digest.as_str())
        );

        let mut unnamed = Descriptor::from_bytes(media_type::oci_layer(), b"u");
        set_provenance(&mut unnamed, None, &digest);
        assert!(unnamed.annotation(annotations::BASE_IMAGE_NAME).is_none());
        assert_eq!(unnamed.annotation(annotations::BASE_IMAGE_DIGEST), Some(digest.as_str()));
    }
}
