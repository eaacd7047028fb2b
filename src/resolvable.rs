//! Classification of a resolved descriptor into an image or an index.

use std::io::Cursor;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::OnceCell;
use tracing::debug;

use crate::digest::OciDigest;
use crate::error::{Result, TransferError};
use crate::event::{Event, SharedSink};
use crate::media_type::{MediaKind, MediaType};
use crate::models::{Descriptor, ImageIndex, ImageManifest, Platform};
use crate::reference::ImageReference;
use crate::remote::{BlobReader, Fetcher, MountHint};

/// Everything needed to read more content from the repository a
/// descriptor was resolved in.
#[derive(Clone)]
pub(crate) struct Source {
    pub(crate) reference: ImageReference,
    pub(crate) fetcher: Arc<dyn Fetcher>,
    pub(crate) platform: Platform,
    pub(crate) sink: SharedSink,
}

impl Source {
    fn warn_media_type(&self, operation: &'static str, descriptor: &Descriptor) {
        self.sink.emit(Event::UnexpectedMediaType {
            operation,
            digest: descriptor.digest.clone(),
            media_type: descriptor.media_type.clone(),
        });
    }

    /// Fetches a manifest by digest and checks it against its descriptor.
    async fn fetch_manifest(&self, descriptor: &Descriptor) -> Result<Bytes> {
        let mut accept = MediaType::manifest_accept_list();
        if descriptor.media_type.kind() == MediaKind::Unrecognized {
            accept.push(descriptor.media_type.clone());
        }
        let (raw, _) = self
            .fetcher
            .fetch_manifest(&descriptor.digest.to_string(), &accept)
            .await?;
        verify_content(descriptor, &raw)?;
        Ok(raw)
    }
}

pub(crate) fn verify_content(descriptor: &Descriptor, raw: &[u8]) -> Result<()> {
    let actual = OciDigest::sha256(raw);
    if actual != descriptor.digest {
        return Err(TransferError::DigestMismatch {
            expected: descriptor.digest.clone(),
            actual,
        });
    }
    if raw.len() as u64 != descriptor.size {
        return Err(TransferError::SizeMismatch {
            expected: descriptor.size,
            actual: raw.len() as u64,
        });
    }
    Ok(())
}

type ManifestCell = Arc<OnceCell<Bytes>>;

/// A descriptor plus the repository it came from, not yet committed to
/// being an image or an index.
#[derive(Clone)]
pub struct Resolvable {
    source: Source,
    descriptor: Descriptor,
    raw: ManifestCell,
}

/// The outcome of classifying a [`Resolvable`].
#[derive(Clone)]
pub enum Artifact {
    Image(RemoteImage),
    Index(RemoteIndex),
}

impl Artifact {
    pub fn descriptor(&self) -> &Descriptor {
        match self {
            Artifact::Image(image) => image.descriptor(),
            Artifact::Index(index) => index.descriptor(),
        }
    }

    pub async fn raw_manifest(&self) -> Result<Bytes> {
        match self {
            Artifact::Image(image) => image.raw_manifest().await,
            Artifact::Index(index) => index.raw_manifest().await,
        }
    }
}

impl Resolvable {
    pub(crate) fn new(source: Source, descriptor: Descriptor, raw: Option<Bytes>) -> Self {
        Self {
            source,
            descriptor,
            raw: Arc::new(OnceCell::new_with(raw)),
        }
    }

    /// Builds a resolvable around an already known descriptor.
    pub fn from_parts(
        reference: ImageReference,
        descriptor: Descriptor,
        fetcher: Arc<dyn Fetcher>,
        platform: Platform,
        sink: SharedSink,
    ) -> Self {
        let source = Source {
            reference,
            fetcher,
            platform,
            sink,
        };
        Self::new(source, descriptor, None)
    }

    pub fn descriptor(&self) -> &Descriptor {
        &self.descriptor
    }

    pub fn reference(&self) -> &ImageReference {
        &self.source.reference
    }

    fn remote_index(&self) -> RemoteIndex {
        RemoteIndex {
            source: self.source.clone(),
            descriptor: self.descriptor.clone(),
            raw: Arc::clone(&self.raw),
        }
    }

    fn remote_image(&self) -> RemoteImage {
        RemoteImage {
            source: self.source.clone(),
            descriptor: self.descriptor.clone(),
            raw: Arc::clone(&self.raw),
            mount: Some(MountHint {
                origin: self.source.reference.clone(),
            }),
        }
    }

    /// Views the descriptor as an index.
    ///
    /// Some registries (static ones in particular) do not set content types
    /// correctly, so an unrecognized type is reported and accepted.
    pub fn as_collection(&self) -> Result<RemoteIndex> {
        let media_type = &self.descriptor.media_type;
        match media_type.kind() {
            MediaKind::Legacy => {
                return Err(TransferError::UnsupportedLegacySchema(media_type.clone()));
            }
            MediaKind::SingleArtifact => {
                return Err(TransferError::MediaTypeMismatch {
                    expected: "an index; use as_single_artifact() instead",
                    actual: media_type.clone(),
                });
            }
            MediaKind::Collection => {}
            MediaKind::Unrecognized => self.source.warn_media_type("as_collection", &self.descriptor),
        }
        Ok(self.remote_index())
    }

    /// Views the descriptor as a single image. An index is narrowed to the
    /// child matching the requested platform.
    pub async fn as_single_artifact(&self) -> Result<RemoteImage> {
        let media_type = &self.descriptor.media_type;
        match media_type.kind() {
            MediaKind::Legacy => {
                return Err(TransferError::UnsupportedLegacySchema(media_type.clone()));
            }
            MediaKind::Collection => {
                let platform = self.source.platform.clone();
                return self.remote_index().image_by_platform(&platform).await;
            }
            MediaKind::SingleArtifact => {}
            MediaKind::Unrecognized => {
                self.source.warn_media_type("as_single_artifact", &self.descriptor)
            }
        }
        Ok(self.remote_image())
    }

    /// Classifies the descriptor once.
    ///
    /// An unrecognized media type is settled by the manifest body: anything
    /// that parses as an index is walked as one, anything that parses as an
    /// image manifest is copied as one.
    pub async fn resolve(&self) -> Result<Artifact> {
        let media_type = &self.descriptor.media_type;
        match media_type.kind() {
            MediaKind::Legacy => Err(TransferError::UnsupportedLegacySchema(media_type.clone())),
            MediaKind::SingleArtifact => Ok(Artifact::Image(self.remote_image())),
            MediaKind::Collection => Ok(Artifact::Index(self.remote_index())),
            MediaKind::Unrecognized => {
                self.source.warn_media_type("resolve", &self.descriptor);
                let index = self.remote_index();
                let raw = index.raw_manifest().await?;
                if serde_json::from_slice::<ImageIndex>(&raw).is_ok() {
                    debug!(digest = %self.descriptor.digest, "Treating unlabelled manifest as an index");
                    return Ok(Artifact::Index(index));
                }
                if serde_json::from_slice::<ImageManifest>(&raw).is_ok() {
                    debug!(digest = %self.descriptor.digest, "Treating unlabelled manifest as an image");
                    return Ok(Artifact::Image(self.remote_image()));
                }
                Err(TransferError::NeitherArtifactNorCollection(
                    self.descriptor.digest.clone(),
                ))
            }
        }
    }
}

/// An image manifest in a remote repository, read lazily.
#[derive(Clone)]
pub struct RemoteImage {
    source: Source,
    descriptor: Descriptor,
    raw: ManifestCell,
    mount: Option<MountHint>,
}

impl RemoteImage {
    pub fn descriptor(&self) -> &Descriptor {
        &self.descriptor
    }

    /// Origin of this image's blobs, for cross-repository mounts.
    pub fn mount_hint(&self) -> Option<&MountHint> {
        self.mount.as_ref()
    }

    pub async fn raw_manifest(&self) -> Result<Bytes> {
        let raw = self
            .raw
            .get_or_try_init(|| self.source.fetch_manifest(&self.descriptor))
            .await?;
        Ok(raw.clone())
    }

    pub async fn manifest(&self) -> Result<ImageManifest> {
        let raw = self.raw_manifest().await?;
        Ok(serde_json::from_slice(&raw)?)
    }

    pub async fn layers(&self) -> Result<Vec<Descriptor>> {
        Ok(self.manifest().await?.layers)
    }

    /// Streams a blob this image references.
    pub async fn open_blob(&self, descriptor: &Descriptor) -> Result<BlobReader> {
        self.source.fetcher.fetch_blob(&descriptor.digest).await
    }

    pub(crate) fn open_manifest(raw: Bytes) -> BlobReader {
        Box::new(Cursor::new(raw))
    }
}

/// An index manifest in a remote repository, read lazily.
#[derive(Clone)]
pub struct RemoteIndex {
    source: Source,
    descriptor: Descriptor,
    raw: ManifestCell,
}

impl RemoteIndex {
    pub fn descriptor(&self) -> &Descriptor {
        &self.descriptor
    }

    pub async fn raw_manifest(&self) -> Result<Bytes> {
        let raw = self
            .raw
            .get_or_try_init(|| self.source.fetch_manifest(&self.descriptor))
            .await?;
        Ok(raw.clone())
    }

    pub async fn index_manifest(&self) -> Result<ImageIndex> {
        let raw = self.raw_manifest().await?;
        Ok(serde_json::from_slice(&raw)?)
    }

    /// The child image described by `child`.
    pub fn image(&self, child: &Descriptor) -> RemoteImage {
        RemoteImage {
            source: self.source.clone(),
            descriptor: child.clone(),
            raw: Arc::new(OnceCell::new()),
            mount: Some(MountHint {
                origin: self.source.reference.clone(),
            }),
        }
    }

    /// The nested index described by `child`.
    pub fn index(&self, child: &Descriptor) -> RemoteIndex {
        RemoteIndex {
            source: self.source.clone(),
            descriptor: child.clone(),
            raw: Arc::new(OnceCell::new()),
        }
    }

    /// Raw bytes of a child manifest of any kind, checked against `child`.
    pub async fn child_manifest(&self, child: &Descriptor) -> Result<Bytes> {
        self.source.fetch_manifest(child).await
    }

    /// Picks the first image child built for `platform`.
    pub async fn image_by_platform(&self, platform: &Platform) -> Result<RemoteImage> {
        let index = self.index_manifest().await?;
        index
            .manifests
            .iter()
            .filter(|child| {
                matches!(
                    child.media_type.kind(),
                    MediaKind::SingleArtifact | MediaKind::Unrecognized
                )
            })
            .find(|child| {
                child
                    .platform
                    .as_ref()
                    .is_some_and(|candidate| platform.satisfied_by(candidate))
            })
            .map(|child| self.image(child))
            .ok_or_else(|| TransferError::NoMatchingPlatform(platform.to_string()))
    }
}
