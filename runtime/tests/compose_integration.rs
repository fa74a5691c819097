//! Integration test: compose images from layer files and publish them.
//!
//! Exercises the path a build pipeline takes between steps:
//!
//! 1. Pack directories into layer tarballs and describe them
//! 2. Assemble a base image in a blob-index store
//! 3. Append a layer, writing the manifest and config to fixed paths
//! 4. Hand the result to the next step as a descriptor file
//! 5. Rebase onto a newer base and publish to an OCI layout
//!
//! ```bash
//! cargo test -p a3s-oci-runtime --test compose_integration
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use a3s_oci_core::{annotations, media_type, Compression, Descriptor, Digest};
use a3s_oci_runtime::content::{
    read_json, write_blob, write_json, BlobIndex, BlobIndexStore, MultiProvider, Provider, SplitStore,
};
use a3s_oci_runtime::oci::build::{
    append_layers, create_layer_from_dir, create_manifest, rebase_image, AppendOptions, ContainerConfig, ImageConfig,
    ImageManifest, RebaseOptions, RootFs,
};
use a3s_oci_runtime::oci::copy::write_image_layout;
use a3s_oci_runtime::oci::{AppendIngester, OciLayout};
use tempfile::TempDir;

/// Pack a directory holding `files` into a layer under `out`.
fn layer(out: &Path, name: &str, files: &[(&str, &str)], compression: Compression) -> Descriptor {
    let src = out.join(format!("{}-src", name));
    std::fs::create_dir_all(&src).unwrap();
    for (file, content) in files {
        std::fs::write(src.join(file), content).unwrap();
    }
    create_layer_from_dir(&src, Path::new(""), &out.join(name), compression).unwrap()
}

/// Uncompressed bytes of a layer file.
fn raw_layer(path: &Path, compression: Compression) -> Vec<u8> {
    let data = std::fs::read(path).unwrap();
    match compression {
        Compression::None => data,
        Compression::Gzip => {
            let mut out = Vec::new();
            std::io::Read::read_to_end(&mut flate2::read::GzDecoder::new(&data[..]), &mut out).unwrap();
            out
        }
        Compression::Zstd => zstd::decode_all(&data[..]).unwrap(),
    }
}

/// Base image in `store` built from gzip layer files.
async fn base_image(store: &BlobIndexStore, dir: &Path, name: &str, releases: &[&str]) -> Descriptor {
    let mut index = BlobIndex::new();
    let mut layers = Vec::new();
    let mut diff_ids = Vec::new();
    for (i, release) in releases.iter().enumerate() {
        let file = format!("{}-{}.tar.gz", name, i);
        let desc = layer(dir, &file, &[("os-release", *release)], Compression::Gzip);
        diff_ids.push(Digest::from_bytes(&raw_layer(&dir.join(&file), Compression::Gzip)));
        index.insert(desc.digest.clone(), dir.join(&file));
        layers.push(desc);
    }
    // Layer files are copied into the store so it serves every blob.
    for desc in &layers {
        let data = std::fs::read(index.get(&desc.digest).unwrap()).unwrap();
        write_blob(store, desc, &data).await.unwrap();
    }

    let config = ImageConfig {
        os: "linux".to_string(),
        architecture: "amd64".to_string(),
        config: Some(ContainerConfig {
            env: vec!["PATH=/usr/bin".to_string()],
            ..ContainerConfig::default()
        }),
        rootfs: RootFs {
            fs_type: "layers".to_string(),
            diff_ids,
        },
        ..ImageConfig::default()
    };
    let config_desc = write_json(store, &media_type::oci_config(), &config).await.unwrap();
    create_manifest(store, &config_desc, &layers, BTreeMap::new())
        .await
        .unwrap()
        .with_annotation(annotations::REF_NAME, format!("ghcr.io/a3s-lab/{}:latest", name))
}

#[tokio::test]
async fn test_append_then_rebase_then_publish() {
    let work = TempDir::new().unwrap();
    let store = BlobIndexStore::new(work.path().join("store"), BlobIndex::new());

    // Base image with two layers.
    let base = base_image(&store, work.path(), "base", &["v1", "v1.1"]).await;

    // Application layer, zstd compressed, described by its own annotation.
    let app = layer(work.path(), "app.tar.zst", &[("app.py", "print('hi')")], Compression::Zstd)
        .with_annotation(annotations::ARTIFACT_DESCRIPTION, "python: app.py");
    let mut app_index = BlobIndex::new();
    app_index.insert(app.digest.clone(), work.path().join("app.tar.zst"));

    // Step 3: append, with manifest and config written to fixed paths.
    let outputs = work.path().join("out");
    std::fs::create_dir_all(&outputs).unwrap();
    let ingester = Arc::new(AppendIngester::new(outputs.join("manifest.json"), outputs.join("config.json")));
    let provider = MultiProvider::new(vec![
        Arc::new(store.clone()) as Arc<dyn Provider>,
        Arc::new(app_index.clone()),
    ]);
    let split = SplitStore::new(Arc::new(provider), ingester.clone());

    let options = AppendOptions {
        labels: [("org.opencontainers.image.title".to_string(), "app".to_string())]
            .into_iter()
            .collect(),
        entrypoint: Some(vec!["python".to_string(), "/app.py".to_string()]),
        ..AppendOptions::default()
    };
    let appended = append_layers(&split, &base, &[app.clone()], &options).await.unwrap();
    assert_eq!(ingester.manifest().map(|d| d.digest), Some(appended.manifest.digest.clone()));
    assert_eq!(ingester.config().map(|d| d.digest), Some(appended.config.digest.clone()));

    // Step 4: the descriptor file is what the next step receives.
    let handle = outputs.join("image.descriptor.json");
    appended.manifest.write_to_file(&handle).unwrap();
    let appended_desc = Descriptor::read_from_file(&handle)
        .unwrap()
        .with_annotation(annotations::REF_NAME, "ghcr.io/a3s-lab/app:1.0");

    let mut outputs_index = app_index.clone();
    outputs_index.insert(appended.manifest.digest.clone(), outputs.join("manifest.json"));
    outputs_index.insert(appended.config.digest.clone(), outputs.join("config.json"));

    let manifest: ImageManifest = read_json(&outputs_index, &appended.manifest).await.unwrap();
    let config: ImageConfig = read_json(&outputs_index, &appended.config).await.unwrap();
    assert_eq!(manifest.layers.len(), 3);
    assert_eq!(config.rootfs.diff_ids.len(), 3);
    assert_eq!(
        config.rootfs.diff_ids[2],
        Digest::from_bytes(&raw_layer(&work.path().join("app.tar.zst"), Compression::Zstd))
    );
    assert_eq!(config.history.last().and_then(|h| h.created_by.as_deref()), Some("python: app.py"));
    assert_eq!(
        manifest.layers[0].annotation(annotations::BASE_IMAGE_NAME),
        Some("ghcr.io/a3s-lab/base")
    );

    // Step 5: move the app layer onto a newer base.
    let new_base = base_image(&store, work.path(), "base-next", &["v2", "v2.1", "v2.2"]).await;
    let all = MultiProvider::new(vec![
        Arc::new(store.clone()) as Arc<dyn Provider>,
        Arc::new(outputs_index.clone()),
    ]);
    let rebase_store = SplitStore::new(Arc::new(all), Arc::new(store.clone()));

    let rebased = rebase_image(&rebase_store, &appended_desc, &base, &new_base, &RebaseOptions::default())
        .await
        .unwrap();
    let rebased_manifest: ImageManifest = read_json(&rebase_store, &rebased.manifest).await.unwrap();
    let rebased_config: ImageConfig = read_json(&rebase_store, &rebased.config).await.unwrap();
    let new_base_manifest: ImageManifest = read_json(&rebase_store, &new_base).await.unwrap();

    let expected: Vec<Digest> = new_base_manifest
        .layers
        .iter()
        .chain(std::iter::once(&app))
        .map(|l| l.digest.clone())
        .collect();
    let actual: Vec<Digest> = rebased_manifest.layers.iter().map(|l| l.digest.clone()).collect();
    assert_eq!(actual, expected);
    assert_eq!(rebased_config.rootfs.diff_ids[3], config.rootfs.diff_ids[2]);
    assert_eq!(
        rebased_config.config.as_ref().and_then(|c| c.entrypoint.clone()),
        Some(vec!["python".to_string(), "/app.py".to_string()])
    );
    assert_eq!(
        rebased_manifest.layers[3].annotation(annotations::BASE_IMAGE_NAME),
        Some("ghcr.io/a3s-lab/app")
    );
    assert_eq!(
        rebased_manifest
            .annotations
            .get(annotations::BASE_IMAGE_DIGEST)
            .map(String::as_str),
        Some(new_base.digest.as_str())
    );

    // Publish the rebased image to a layout and read it back.
    let layout_dir = work.path().join("layout");
    write_image_layout(&rebase_store, &rebased.manifest, &layout_dir)
        .await
        .unwrap();

    let layout = OciLayout::open(&layout_dir).unwrap();
    let index = layout.read_index().unwrap();
    assert_eq!(index.manifests.len(), 1);
    assert_eq!(index.manifests[0].digest, rebased.manifest.digest);

    let published: ImageManifest = read_json(&layout, &index.manifests[0]).await.unwrap();
    assert_eq!(published, rebased_manifest);
    let blobs = BlobIndex::from_layout_dir(&layout_dir).unwrap();
    assert_eq!(blobs.len(), published.layers.len() + 2);
}

#[tokio::test]
async fn test_rebase_with_wrong_old_base_leaves_store_untouched() {
    let work = TempDir::new().unwrap();
    let store = BlobIndexStore::new(work.path().join("store"), BlobIndex::new());

    let base = base_image(&store, work.path(), "base", &["v1"]).await;
    let unrelated = base_image(&store, work.path(), "other", &["other"]).await;
    let new_base = base_image(&store, work.path(), "next", &["v2"]).await;

    let app = layer(work.path(), "app.tar", &[("app.sh", "echo hi")], Compression::None);
    let data = std::fs::read(work.path().join("app.tar")).unwrap();
    write_blob(&store, &app, &data).await.unwrap();
    let image = append_layers(&store, &base, &[app], &AppendOptions::default())
        .await
        .unwrap();

    let before = store.index().len();
    let err = rebase_image(&store, &image.manifest, &unrelated, &new_base, &RebaseOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, a3s_oci_core::OciError::BaseMismatch(_)));
    assert_eq!(store.index().len(), before);
}
