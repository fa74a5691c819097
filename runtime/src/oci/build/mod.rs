//! Image composition.
//!
//! Builds new images out of existing content without unpacking layers:
//! appending layers to a base, moving an image onto a new base, and
//! writing manifests and indexes over blobs already in a store.

pub mod append;
pub mod diff_id;
pub mod image;
pub mod layer;
pub mod manifest;
pub mod platform;
pub mod rebase;

pub use append::{append_layers, AppendOptions, ComposedImage, DEFAULT_TOOL_NAME};
pub use diff_id::compute_diff_id;
pub use image::{ContainerConfig, History, ImageConfig, ImageIndex, ImageManifest, RootFs};
pub use layer::{create_layer_from_dir, describe_layer_file, sha256_file};
pub use manifest::{create_index, create_manifest};
pub use platform::{resolve_image_manifest, resolve_platform};
pub use rebase::{rebase_image, RebaseOptions};
