//! Layer blobs: description by content and tarball creation.
//!
//! Layers arrive from other build steps as opaque files. Their media type
//! is decided by sniffing the compression magic bytes rather than trusting
//! file extensions.

use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};

use a3s_oci_core::{Compression, Descriptor, Digest, Digester, OciError, Result};

/// Bytes needed to recognize every supported compression format.
const MAGIC_LEN: usize = 4;

/// Describe a layer file: media type from its magic bytes, digest and size
/// from its content.
pub fn describe_layer_file(path: &Path) -> Result<Descriptor> {
    let mut file = std::fs::File::open(path).map_err(|e| {
        OciError::IoError(std::io::Error::new(
            e.kind(),
            format!("Failed to open layer {}: {}", path.display(), e),
        ))
    })?;

    let mut digester = Digester::new();
    let mut header = Vec::with_capacity(MAGIC_LEN);
    let mut buf = vec![0u8; crate::content::CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        if header.len() < MAGIC_LEN {
            let take = (MAGIC_LEN - header.len()).min(n);
            header.extend_from_slice(&buf[..take]);
        }
        digester.update(&buf[..n]);
    }

    let compression = Compression::from_magic(&header);
    let size = digester.size();
    let digest = digester.finish();
    tracing::debug!(
        path = %path.display(),
        digest = %digest,
        compression = ?compression,
        "Described layer file"
    );
    Ok(Descriptor::new(compression.layer_media_type(), digest, size))
}

/// Pack `src_dir` into a layer tarball at `output_path`.
///
/// Entries are stored under `target_prefix` inside the archive; a leading
/// `/` is dropped since archive paths are relative. Headers carry no
/// ownership or timestamps, so the same tree always yields the same
/// digest. Returns the layer descriptor.
pub fn create_layer_from_dir(
    src_dir: &Path,
    target_prefix: &Path,
    output_path: &Path,
    compression: Compression,
) -> Result<Descriptor> {
    let target_prefix = archive_prefix(target_prefix)?;
    let target_prefix = target_prefix.as_path();
    let file = std::fs::File::create(output_path).map_err(|e| {
        OciError::IoError(std::io::Error::new(
            e.kind(),
            format!("Failed to create layer file {}: {}", output_path.display(), e),
        ))
    })?;

    match compression {
        Compression::None => {
            let mut builder = tar::Builder::new(file);
            builder.mode(tar::HeaderMode::Deterministic);
            add_dir_to_tar(&mut builder, src_dir, src_dir, target_prefix)?;
            builder.into_inner()?.flush()?;
        }
        Compression::Gzip => {
            let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
            let mut builder = tar::Builder::new(encoder);
            builder.mode(tar::HeaderMode::Deterministic);
            add_dir_to_tar(&mut builder, src_dir, src_dir, target_prefix)?;
            builder.into_inner()?.finish()?;
        }
        Compression::Zstd => {
            let encoder = zstd::stream::write::Encoder::new(file, 0)?;
            let mut builder = tar::Builder::new(encoder);
            builder.mode(tar::HeaderMode::Deterministic);
            add_dir_to_tar(&mut builder, src_dir, src_dir, target_prefix)?;
            builder.into_inner()?.finish()?;
        }
    }

    describe_layer_file(output_path)
}

/// Relative form of an archive prefix. `..` is rejected.
fn archive_prefix(prefix: &Path) -> Result<PathBuf> {
    let mut relative = PathBuf::new();
    for component in prefix.components() {
        match component {
            Component::Normal(part) => relative.push(part),
            Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
            Component::ParentDir => {
                return Err(OciError::ConfigError(format!(
                    "Layer prefix {} escapes the archive root",
                    prefix.display()
                )))
            }
        }
    }
    Ok(relative)
}

/// Recursively add a directory's contents to a tar builder, in sorted order.
fn add_dir_to_tar<W: Write>(
    builder: &mut tar::Builder<W>,
    root: &Path,
    current: &Path,
    target_prefix: &Path,
) -> Result<()> {
    let mut entries = std::fs::read_dir(current)
        .map_err(|e| {
            OciError::IoError(std::io::Error::new(
                e.kind(),
                format!("Failed to read directory {}: {}", current.display(), e),
            ))
        })?
        .collect::<std::io::Result<Vec<_>>>()?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let path = entry.path();
        let relative = path.strip_prefix(root).map_err(|e| {
            OciError::MalformedContent(format!("Failed to strip prefix of {}: {}", path.display(), e))
        })?;
        let tar_path = target_prefix.join(relative);

        if path.is_dir() {
            builder.append_dir(&tar_path, &path)?;
            add_dir_to_tar(builder, root, &path, target_prefix)?;
        } else {
            builder.append_path_with_name(&path, &tar_path)?;
        }
    }

    Ok(())
}

/// SHA-256 digest of a file, streamed.
pub fn sha256_file(path: &Path) -> Result<Digest> {
    let mut file = std::fs::File::open(path).map_err(|e| {
        OciError::IoError(std::io::Error::new(
            e.kind(),
            format!("Failed to read file for hashing {}: {}", path.display(), e),
        ))
    })?;
    let mut digester = Digester::new();
    std::io::copy(&mut file, &mut digester)?;
    Ok(digester.finish())
}
