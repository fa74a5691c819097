//! Media types and their classification.
//!
//! OCI media types come from `oci-spec`; Docker schema 2 equivalents are kept
//! here so content pulled from Docker-era registries can be recognised and
//! normalized to the OCI form.

use oci_spec::image::MediaType;

pub const DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const DOCKER_MANIFEST_LIST: &str = "application/vnd.docker.distribution.manifest.list.v2+json";
pub const DOCKER_CONFIG: &str = "application/vnd.docker.container.image.v1+json";
pub const DOCKER_LAYER: &str = "application/vnd.docker.image.rootfs.diff.tar";
pub const DOCKER_LAYER_GZIP: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";
pub const DOCKER_LAYER_ZSTD: &str = "application/vnd.docker.image.rootfs.diff.tar.zstd";
pub const DOCKER_FOREIGN_LAYER_GZIP: &str =
    "application/vnd.docker.image.rootfs.foreign.diff.tar.gzip";
pub const OCI_NONDISTRIBUTABLE_LAYER_GZIP: &str =
    "application/vnd.oci.image.layer.nondistributable.v1.tar+gzip";

/// Canonical OCI image manifest media type.
pub fn oci_manifest() -> String {
    MediaType::ImageManifest.to_string()
}

/// Canonical OCI image index media type.
pub fn oci_index() -> String {
    MediaType::ImageIndex.to_string()
}

/// Canonical OCI image config media type.
pub fn oci_config() -> String {
    MediaType::ImageConfig.to_string()
}

pub fn oci_layer() -> String {
    MediaType::ImageLayer.to_string()
}

pub fn oci_layer_gzip() -> String {
    MediaType::ImageLayerGzip.to_string()
}

pub fn oci_layer_zstd() -> String {
    MediaType::ImageLayerZstd.to_string()
}

pub fn is_manifest(media_type: &str) -> bool {
    media_type == DOCKER_MANIFEST || MediaType::from(media_type) == MediaType::ImageManifest
}

pub fn is_index(media_type: &str) -> bool {
    media_type == DOCKER_MANIFEST_LIST || MediaType::from(media_type) == MediaType::ImageIndex
}

pub fn is_config(media_type: &str) -> bool {
    media_type == DOCKER_CONFIG || MediaType::from(media_type) == MediaType::ImageConfig
}

/// Layer blob compression, as declared by a media type or sniffed from bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
    Zstd,
}

impl Compression {
    /// Classify a layer media type by its compression suffix.
    pub fn from_media_type(media_type: &str) -> Self {
        if media_type.ends_with("+gzip") || media_type.ends_with(".gzip") {
            Compression::Gzip
        } else if media_type.ends_with("+zstd") || media_type.ends_with(".zstd") {
            Compression::Zstd
        } else {
            Compression::None
        }
    }

    /// Detect compression from the leading magic bytes of a blob.
    pub fn from_magic(header: &[u8]) -> Self {
        const GZIP: [u8; 2] = [0x1f, 0x8b];
        const ZSTD: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];
        if header.starts_with(&GZIP) {
            Compression::Gzip
        } else if header.starts_with(&ZSTD) {
            Compression::Zstd
        } else {
            Compression::None
        }
    }

    /// OCI layer media type for a tarball with this compression.
    pub fn layer_media_type(&self) -> String {
        match self {
            Compression::None => oci_layer(),
            Compression::Gzip => oci_layer_gzip(),
            Compression::Zstd => oci_layer_zstd(),
        }
    }
}

/// Map a Docker schema 2 media type to its OCI equivalent.
///
/// Media types without a Docker counterpart are returned unchanged.
pub fn docker_to_oci(media_type: &str) -> String {
    match media_type {
        DOCKER_MANIFEST => oci_manifest(),
        DOCKER_MANIFEST_LIST => oci_index(),
        DOCKER_CONFIG => oci_config(),
        DOCKER_LAYER => oci_layer(),
        DOCKER_LAYER_GZIP => oci_layer_gzip(),
        DOCKER_LAYER_ZSTD => oci_layer_zstd(),
        DOCKER_FOREIGN_LAYER_GZIP => OCI_NONDISTRIBUTABLE_LAYER_GZIP.to_string(),
        other => other.to_string(),
    }
}

/// Accept header values for manifest lookups.
pub fn manifest_accept_types() -> Vec<String> {
    vec![
        oci_manifest(),
        oci_index(),
        DOCKER_MANIFEST.to_string(),
        DOCKER_MANIFEST_LIST.to_string(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_strings() {
        assert_eq!(oci_manifest(), "application/vnd.oci.image.manifest.v1+json");
        assert_eq!(oci_index(), "application/vnd.oci.image.index.v1+json");
        assert_eq!(oci_config(), "application/vnd.oci.image.config.v1+json");
        assert_eq!(oci_layer_gzip(), "application/vnd.oci.image.layer.v1.tar+gzip");
    }

    #[test]
    fn test_classification() {
        assert!(is_manifest(&oci_manifest()));
        assert!(is_manifest(DOCKER_MANIFEST));
        assert!(is_index(DOCKER_MANIFEST_LIST));
        assert!(!is_index(&oci_manifest()));
        assert!(is_config(DOCKER_CONFIG));
    }

    #[test]
    fn test_compression_from_media_type() {
        assert_eq!(Compression::from_media_type(&oci_layer_gzip()), Compression::Gzip);
        assert_eq!(Compression::from_media_type(DOCKER_LAYER_GZIP), Compression::Gzip);
        assert_eq!(Compression::from_media_type(&oci_layer_zstd()), Compression::Zstd);
        assert_eq!(Compression::from_media_type(&oci_layer()), Compression::None);
    }

    #[test]
    fn test_compression_from_magic() {
        assert_eq!(Compression::from_magic(&[0x1f, 0x8b, 0x08]), Compression::Gzip);
        assert_eq!(Compression::from_magic(&[0x28, 0xb5, 0x2f, 0xfd, 0]), Compression::Zstd);
        assert_eq!(Compression::from_magic(b"ustar"), Compression::None);
        assert_eq!(Compression::from_magic(&[]), Compression::None);
    }

    #[test]
    fn test_docker_to_oci() {
        assert_eq!(docker_to_oci(DOCKER_LAYER_GZIP), oci_layer_gzip());
        assert_eq!(docker_to_oci(DOCKER_MANIFEST), oci_manifest());
        assert_eq!(docker_to_oci(DOCKER_CONFIG), oci_config());
        assert_eq!(
            docker_to_oci(DOCKER_FOREIGN_LAYER_GZIP),
            OCI_NONDISTRIBUTABLE_LAYER_GZIP
        );
        assert_eq!(docker_to_oci("text/plain"), "text/plain");
    }
}
