//! Distribution API v2 adapter for the fetch and push capabilities.

pub mod auth;
pub mod client;
pub mod session;

pub use client::{RegistryClient, RegistryFetcher, RegistryPusher};
pub use session::{BlobUpload, ManifestUpload};
