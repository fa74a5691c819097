//! OCI image reference parsing.
//!
//! Parses image references like `ghcr.io/a3s-lab/app:v0.4.0` into structured
//! components, and derives the canonical repository name recorded in
//! base-image provenance annotations.

use a3s_oci_core::{Digest, OciError, Result};

/// Default registry when none is specified.
pub const DEFAULT_REGISTRY: &str = "docker.io";

/// Host serving the registry API for [`DEFAULT_REGISTRY`].
const DOCKER_HUB_API_HOST: &str = "registry-1.docker.io";

/// Default tag when neither tag nor digest is given.
const DEFAULT_TAG: &str = "latest";

/// Parsed OCI image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    /// Registry hostname, with port if any (e.g., "ghcr.io", "localhost:5000")
    pub registry: String,
    /// Repository path (e.g., "library/nginx", "a3s-lab/app")
    pub repository: String,
    /// Tag (e.g., "v0.4.0")
    pub tag: Option<String>,
    /// Manifest digest
    pub digest: Option<Digest>,
}

impl ImageReference {
    /// Parse an image reference string.
    ///
    /// Supports formats:
    /// - `nginx` → docker.io/library/nginx
    /// - `nginx:1.25` → docker.io/library/nginx:1.25
    /// - `myuser/myimage` → docker.io/myuser/myimage
    /// - `localhost:5000/app:dev` → localhost:5000/app:dev
    /// - `ghcr.io/org/image:tag@sha256:abc...` → tag and digest
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(OciError::MalformedContent(
                "Empty image reference".to_string(),
            ));
        }

        let (name_tag, digest) = match reference.split_once('@') {
            Some((name_tag, digest)) => (name_tag, Some(Digest::parse(digest).map_err(|e| {
                OciError::MalformedContent(format!(
                    "Invalid digest in reference '{}': {}",
                    reference, e
                ))
            })?)),
            None => (reference, None),
        };

        // A tag can only follow the last path component; an earlier colon is a port.
        let last_component_start = name_tag.rfind('/').map(|p| p + 1).unwrap_or(0);
        let (name, tag) = match name_tag[last_component_start..].rfind(':') {
            Some(colon) => {
                let split = last_component_start + colon;
                (&name_tag[..split], Some(name_tag[split + 1..].to_string()))
            }
            None => (name_tag, None),
        };

        if let Some(ref tag) = tag {
            if !is_valid_tag(tag) {
                return Err(OciError::MalformedContent(format!(
                    "Invalid tag '{}' in reference '{}'",
                    tag, reference
                )));
            }
        }

        let (registry, repository) = Self::split_registry_repository(name)?;
        if !repository.split('/').all(is_valid_path_component) {
            return Err(OciError::MalformedContent(format!(
                "Invalid repository '{}' in reference '{}'",
                repository, reference
            )));
        }

        Ok(ImageReference {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// Split a name into registry and repository components.
    fn split_registry_repository(name: &str) -> Result<(String, String)> {
        // The first component is a registry when it looks like a hostname.
        if let Some((first, rest)) = name.split_once('/') {
            if first.contains('.') || first.contains(':') || first == "localhost" {
                if rest.is_empty() {
                    return Err(OciError::MalformedContent(format!(
                        "Empty repository in reference '{}'",
                        name
                    )));
                }
                let registry = if first == "index.docker.io" {
                    DEFAULT_REGISTRY.to_string()
                } else {
                    first.to_string()
                };
                let repository = if registry == DEFAULT_REGISTRY && !rest.contains('/') {
                    format!("library/{}", rest)
                } else {
                    rest.to_string()
                };
                return Ok((registry, repository));
            }
        }

        let repository = if name.contains('/') {
            name.to_string()
        } else {
            // Single name like "nginx" → "library/nginx" for Docker Hub
            format!("library/{}", name)
        };

        Ok((DEFAULT_REGISTRY.to_string(), repository))
    }

    /// Canonical repository name, `registry/repository`, without tag or digest.
    pub fn name(&self) -> String {
        format!("{}/{}", self.registry, self.repository)
    }

    /// Canonical `registry/repository` of a reference string.
    ///
    /// Strings that do not parse are returned unchanged.
    pub fn canonical_name(reference: &str) -> String {
        match Self::parse(reference) {
            Ok(r) => r.name(),
            Err(_) => reference.trim().to_string(),
        }
    }

    /// Tag or digest to look up; `latest` when neither is set.
    pub fn object(&self) -> String {
        match (&self.digest, &self.tag) {
            (Some(digest), _) => digest.to_string(),
            (None, Some(tag)) => tag.clone(),
            (None, None) => DEFAULT_TAG.to_string(),
        }
    }

    /// Host serving the distribution API for this registry.
    pub fn api_host(&self) -> &str {
        if self.registry == DEFAULT_REGISTRY {
            DOCKER_HUB_API_HOST
        } else {
            &self.registry
        }
    }

    /// Same repository with tag and digest removed.
    pub fn repository_only(&self) -> Self {
        Self {
            registry: self.registry.clone(),
            repository: self.repository.clone(),
            tag: None,
            digest: None,
        }
    }

    /// Same repository with the given tag and no digest.
    pub fn with_tag(&self, tag: impl Into<String>) -> Self {
        Self {
            registry: self.registry.clone(),
            repository: self.repository.clone(),
            tag: Some(tag.into()),
            digest: None,
        }
    }

    /// Get the full reference string.
    pub fn full_reference(&self) -> String {
        let mut s = self.name();
        if let Some(ref tag) = self.tag {
            s.push(':');
            s.push_str(tag);
        }
        if let Some(ref digest) = self.digest {
            s.push('@');
            s.push_str(digest.as_str());
        }
        s
    }
}

fn is_valid_tag(tag: &str) -> bool {
    let mut chars = tag.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphanumeric() || c == '_' => {}
        _ => return false,
    }
    tag.len() <= 128 && chars.all(|c| c.is_ascii_alphanumeric() || "_.-".contains(c))
}

fn is_valid_path_component(component: &str) -> bool {
    !component.is_empty()
        && component
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "._-".contains(c))
        && component.starts_with(|c: char| c.is_ascii_alphanumeric())
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.full_reference())
    }
}

impl std::str::FromStr for ImageReference {
    type Err = OciError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
