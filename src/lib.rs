pub mod config;
pub mod content;
pub mod digest;
pub mod error;
pub mod event;
pub mod media_type;
pub mod metrics;
pub mod models;
pub mod reference;
pub mod registry;
pub mod remote;
pub mod resolvable;
pub mod resolver;
pub mod store;
pub mod transfer;
pub mod upload;
pub mod walker;

// Re-export the main engine types for convenience
pub use content::{ContentStore, PushStore, WriteRequest};
pub use digest::OciDigest;
pub use error::{Result, TransferError};
pub use media_type::{MediaKind, MediaType};
pub use models::{Descriptor, ImageIndex, ImageManifest, Platform};
pub use reference::ImageReference;
pub use resolvable::{Artifact, RemoteImage, RemoteIndex, Resolvable};
pub use resolver::Resolver;
pub use store::OciStore;
pub use transfer::BlobTransferEngine;
pub use upload::{SessionState, UploadSession, UploadStatus};
pub use walker::TreeWalker;
