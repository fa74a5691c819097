//! OCI image support.
//!
//! ```text
//!   registry ──fetch──▶ ┌──────────────┐ ──append/rebase──▶ new manifest + config
//!   layout   ─────────▶ │ content store │
//!   blob index ───────▶ └──────────────┘ ──copy (children first)──▶ registry / layout
//! ```
//!
//! - [`layout`]: OCI Image Layout directories
//! - [`registry`]: distribution API client (resolve, fetch, push, mount)
//! - [`build`]: composition of manifests and configs
//! - [`copy`]: graph copies between stores

pub mod append_ingester;
pub mod build;
pub mod copy;
pub mod credentials;
pub mod layout;
pub mod reference;
pub mod registry;
pub mod retry;

pub use append_ingester::AppendIngester;
pub use credentials::{Credential, CredentialProvider, CredentialStore};
pub use layout::OciLayout;
pub use reference::ImageReference;
pub use registry::{RegistryFetcher, RegistryPusher, RegistryResolver};
pub use retry::retry_on_failure;
