//! A3S OCI Core - Foundational Types
//!
//! Descriptors, digests, media types, well-known annotations, the error
//! taxonomy and engine configuration shared by every content backend.

pub mod annotations;
pub mod config;
pub mod descriptor;
pub mod digest;
pub mod error;
pub mod log;
pub mod media_type;

// Re-export commonly used types
pub use config::{EngineConfig, RegistryConfig, RetryPolicy};
pub use descriptor::{Descriptor, Platform};
pub use digest::{Digest, Digester};
pub use error::{OciError, Result, ResultExt};
pub use media_type::Compression;

/// A3S OCI version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
