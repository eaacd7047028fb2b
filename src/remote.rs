//! Capabilities the engine consumes from a source or destination registry.
//!
//! Transport, authentication and retries live behind these traits; the
//! engine only ever asks for manifests, blob streams and upload sessions.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncRead;

use crate::digest::OciDigest;
use crate::error::Result;
use crate::media_type::MediaType;
use crate::models::Descriptor;
use crate::reference::ImageReference;
use crate::upload::UploadSession;

pub type BlobReader = Box<dyn AsyncRead + Send + Unpin>;

/// Names the repository a blob was read from so a destination on the same
/// registry can mount it instead of receiving the bytes again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountHint {
    pub origin: ImageReference,
}

/// Read access to one repository.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Fetches the manifest at `reference` (a tag or digest), offering
    /// `accept` in order. The returned descriptor carries whatever content
    /// type the source declared, which may be empty.
    async fn fetch_manifest(
        &self,
        reference: &str,
        accept: &[MediaType],
    ) -> Result<(Bytes, Descriptor)>;

    async fn fetch_blob(&self, digest: &OciDigest) -> Result<BlobReader>;
}

/// Write access to one repository.
#[async_trait]
pub trait Pusher: Send + Sync {
    /// Opens an upload session for `descriptor`.
    async fn push(&self, descriptor: &Descriptor) -> Result<Box<dyn UploadSession>>;

    /// Opens an upload that publishes `descriptor` as a manifest whatever
    /// its media type.
    async fn push_manifest(&self, descriptor: &Descriptor) -> Result<Box<dyn UploadSession>> {
        self.push(descriptor).await
    }

    async fn exists(&self, _descriptor: &Descriptor) -> Result<bool> {
        Ok(false)
    }

    /// Attempts a cross-repository mount. `Ok(false)` means the caller must
    /// upload the content itself.
    async fn mount(&self, _descriptor: &Descriptor, _hint: &MountHint) -> Result<bool> {
        Ok(false)
    }
}

/// Hands out repository-scoped capabilities for parsed references.
#[async_trait]
pub trait Remote: Send + Sync {
    async fn fetcher(&self, reference: &ImageReference) -> Result<Arc<dyn Fetcher>>;

    async fn pusher(&self, reference: &ImageReference) -> Result<Arc<dyn Pusher>>;
}
