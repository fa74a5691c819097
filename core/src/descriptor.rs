//! Content descriptors.
//!
//! A descriptor is the handle for any piece of content: its digest, size,
//! media type and optional annotations and platform. Descriptors are also
//! written to small JSON files to hand a single artifact between build steps.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::annotations;
use crate::digest::Digest;
use crate::error::{OciError, Result};

/// Target platform of an image manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    pub architecture: String,
    pub os: String,
    #[serde(rename = "os.version", default, skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

impl Platform {
    pub fn new(os: impl Into<String>, architecture: impl Into<String>) -> Self {
        Self {
            architecture: architecture.into(),
            os: os.into(),
            os_version: None,
            variant: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.os.is_empty() && self.architecture.is_empty()
    }

    /// Whether `other` satisfies this platform as a request.
    ///
    /// OS and architecture must be equal; the variant only has to match when
    /// this platform names one.
    pub fn matches(&self, other: &Platform) -> bool {
        if self.os != other.os || self.architecture != other.architecture {
            return false;
        }
        match &self.variant {
            Some(variant) if !variant.is_empty() => other.variant.as_deref() == Some(variant),
            _ => true,
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.os, self.architecture)?;
        if let Some(variant) = self.variant.as_deref().filter(|v| !v.is_empty()) {
            write!(f, "/{}", variant)?;
        }
        Ok(())
    }
}

/// Content descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub digest: Digest,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub urls: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
}

impl Descriptor {
    pub fn new(media_type: impl Into<String>, digest: Digest, size: u64) -> Self {
        Self {
            media_type: media_type.into(),
            digest,
            size,
            urls: None,
            annotations: BTreeMap::new(),
            platform: None,
        }
    }

    /// Describe an in-memory blob.
    pub fn from_bytes(media_type: impl Into<String>, data: &[u8]) -> Self {
        Self::new(media_type, Digest::from_bytes(data), data.len() as u64)
    }

    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = Some(platform);
        self
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }

    /// Reference name annotation, if any.
    pub fn ref_name(&self) -> Option<&str> {
        self.annotation(annotations::REF_NAME)
            .filter(|name| !name.is_empty())
    }

    /// Whether both descriptors identify the same bytes.
    pub fn same_content(&self, other: &Descriptor) -> bool {
        self.digest == other.digest
    }

    /// Read a descriptor written by [`Descriptor::write_to_file`].
    pub fn read_from_file(path: &Path) -> Result<Self> {
        let data = std::fs::read(path).map_err(|e| {
            OciError::IoError(std::io::Error::new(
                e.kind(),
                format!("Failed to read descriptor {}: {}", path.display(), e),
            ))
        })?;
        serde_json::from_slice(&data).map_err(|e| {
            OciError::MalformedContent(format!(
                "Failed to parse descriptor {}: {}",
                path.display(),
                e
            ))
        })
    }

    /// Write this descriptor as JSON, creating parent directories.
    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_vec(self)?;
        std::fs::write(path, json).map_err(|e| {
            OciError::IoError(std::io::Error::new(
                e.kind(),
                format!("Failed to write descriptor {}: {}", path.display(), e),
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_serialize_omits_empty_fields() {
        let desc = Descriptor::from_bytes("application/octet-stream", b"abc");
        let json = serde_json::to_value(&desc).unwrap();
        assert_eq!(json["mediaType"], "application/octet-stream");
        assert_eq!(json["size"], 3);
        assert!(json.get("annotations").is_none());
        assert!(json.get("platform").is_none());
    }

    #[test]
    fn test_deserialize_oci_json() {
        let json = r#"{
            "mediaType": "application/vnd.oci.image.manifest.v1+json",
            "digest": "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855",
            "size": 0,
            "annotations": {"org.opencontainers.image.ref.name": "docker.io/library/alpine:3.19"},
            "platform": {"architecture": "arm64", "os": "linux", "variant": "v8"}
        }"#;
        let desc: Descriptor = serde_json::from_str(json).unwrap();
        assert_eq!(desc.ref_name(), Some("docker.io/library/alpine:3.19"));
        let platform = desc.platform.unwrap();
        assert_eq!(platform.to_string(), "linux/arm64/v8");
    }

    #[test]
    fn test_platform_matches() {
        let request = Platform::new("linux", "amd64");
        assert!(request.matches(&Platform::new("linux", "amd64")));
        assert!(!request.matches(&Platform::new("linux", "arm64")));

        let mut arm_v7 = Platform::new("linux", "arm");
        arm_v7.variant = Some("v7".to_string());
        let mut arm_v6 = Platform::new("linux", "arm");
        arm_v6.variant = Some("v6".to_string());
        assert!(!arm_v7.matches(&arm_v6));
        assert!(Platform::new("linux", "arm").matches(&arm_v6));
    }

    #[test]
    fn test_descriptor_file_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("out/base.desc.json");
        let desc = Descriptor::from_bytes("application/vnd.oci.image.index.v1+json", b"{}")
            .with_annotation(annotations::REF_NAME, "ghcr.io/a3s/base:1");
        desc.write_to_file(&path).unwrap();
        assert_eq!(Descriptor::read_from_file(&path).unwrap(), desc);
    }

    #[test]
    fn test_read_malformed_descriptor() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("bad.json");
        std::fs::write(&path, "not json").unwrap();
        let err = Descriptor::read_from_file(&path).unwrap_err();
        assert!(matches!(err, OciError::MalformedContent(_)));
    }
}
