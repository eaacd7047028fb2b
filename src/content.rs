//! Destination side of a transfer.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::Descriptor;
use crate::remote::{MountHint, Pusher};
use crate::upload::UploadSession;

/// A single blob the engine wants written.
#[derive(Debug, Clone)]
pub struct WriteRequest {
    pub descriptor: Descriptor,
    /// Where the content came from, for stores that can mount.
    pub mount_from: Option<MountHint>,
    /// The content is a manifest even though its media type is not one we know.
    pub manifest: bool,
}

impl WriteRequest {
    pub fn new(descriptor: Descriptor) -> Self {
        Self {
            descriptor,
            mount_from: None,
            manifest: false,
        }
    }

    pub fn as_manifest(mut self) -> Self {
        self.manifest = true;
        self
    }

    pub fn with_mount(mut self, hint: Option<MountHint>) -> Self {
        self.mount_from = hint;
        self
    }
}

/// A content-addressable store accepting concurrent writers keyed by digest.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Whether the store already holds `descriptor`'s content.
    async fn exists(&self, _descriptor: &Descriptor) -> Result<bool> {
        Ok(false)
    }

    /// Tries to satisfy `request` without receiving the bytes.
    async fn mount(&self, _request: &WriteRequest) -> Result<bool> {
        Ok(false)
    }

    /// Opens a session the engine streams the blob into. The store verifies
    /// the digest when the session is committed.
    async fn writer(&self, request: &WriteRequest) -> Result<Box<dyn UploadSession>>;
}

/// Uses a registry push capability as a transfer destination.
pub struct PushStore {
    pusher: Arc<dyn Pusher>,
}

impl PushStore {
    pub fn new(pusher: Arc<dyn Pusher>) -> Self {
        Self { pusher }
    }
}

#[async_trait]
impl ContentStore for PushStore {
    async fn exists(&self, descriptor: &Descriptor) -> Result<bool> {
        self.pusher.exists(descriptor).await
    }

    async fn mount(&self, request: &WriteRequest) -> Result<bool> {
        match &request.mount_from {
            Some(hint) => self.pusher.mount(&request.descriptor, hint).await,
            None => Ok(false),
        }
    }

    async fn writer(&self, request: &WriteRequest) -> Result<Box<dyn UploadSession>> {
        if request.manifest {
            self.pusher.push_manifest(&request.descriptor).await
        } else {
            self.pusher.push(&request.descriptor).await
        }
    }
}
