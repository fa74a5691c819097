//! A3S OCI Runtime - content-addressable image composition and transfer.
//!
//! Content stores (in-memory, blob index, OCI layout, registry) share the
//! [`content::Provider`] and [`content::Ingester`] traits. Images are
//! composed from existing blobs in [`oci::build`] and moved between
//! stores by [`oci::copy`].

#![allow(clippy::result_large_err)]

pub mod content;
pub mod oci;

pub use content::{BlobIndex, BlobIndexStore, MemoryStore, MultiProvider, Provider, Ingester, SplitStore, Store};
pub use oci::build::{append_layers, rebase_image, AppendOptions, ComposedImage, RebaseOptions};
pub use oci::copy::{copy_content, pull_image, push_blob, push_image, write_image_layout};
pub use oci::{ImageReference, OciLayout, RegistryResolver};

/// A3S OCI version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
