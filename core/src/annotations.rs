//! Well-known annotation keys.

/// Human readable reference of an image, e.g. `docker.io/library/alpine:3.19`.
pub const REF_NAME: &str = "org.opencontainers.image.ref.name";

/// RFC 3339 creation time of an image.
pub const CREATED: &str = "org.opencontainers.image.created";

/// Canonical repository name of the base image a layer or image came from.
pub const BASE_IMAGE_NAME: &str = "org.opencontainers.image.base.name";

/// Manifest digest of the base image a layer or image came from.
pub const BASE_IMAGE_DIGEST: &str = "org.opencontainers.image.base.digest";

/// Free-form description of how a layer artifact was produced.
pub const ARTIFACT_DESCRIPTION: &str = "org.opencontainers.artifact.description";
