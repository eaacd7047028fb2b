use std::str::FromStr;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, instrument};

use crate::error::{Result, TransferError};
use crate::event::{Event, SharedSink, TracingSink};
use crate::media_type::{MediaKind, MediaType};
use crate::models::{Descriptor, Platform, sniff_media_type};
use crate::reference::ImageReference;
use crate::remote::{Fetcher, Pusher, Remote};
use crate::resolvable::{Resolvable, Source, verify_content};

/// Turns reference strings into root descriptors using a pluggable remote.
#[derive(Clone)]
pub struct Resolver {
    remote: Arc<dyn Remote>,
    accept: Vec<MediaType>,
    platform: Platform,
    sink: SharedSink,
}

struct Resolution {
    reference: ImageReference,
    fetcher: Arc<dyn Fetcher>,
    descriptor: Descriptor,
    raw: Bytes,
}

impl Resolver {
    pub fn new(remote: Arc<dyn Remote>) -> Self {
        Self {
            remote,
            accept: MediaType::manifest_accept_list(),
            platform: Platform::host(),
            sink: Arc::new(TracingSink),
        }
    }

    /// Platform used when an index has to be narrowed to one image.
    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    pub fn with_sink(mut self, sink: SharedSink) -> Self {
        self.sink = sink;
        self
    }

    /// The media types offered on every manifest request, in order.
    pub fn accept_list(&self) -> &[MediaType] {
        &self.accept
    }

    /// Resolves `reference` to its canonical name and root descriptor.
    pub async fn resolve(&self, reference: &str) -> Result<(String, Descriptor)> {
        let resolution = self.resolve_parsed(reference).await?;
        Ok((resolution.reference.canonical(), resolution.descriptor))
    }

    /// Resolves `reference` and wraps the result for classification.
    pub async fn get(&self, reference: &str) -> Result<Resolvable> {
        let resolution = self.resolve_parsed(reference).await?;
        let source = Source {
            reference: resolution.reference,
            fetcher: resolution.fetcher,
            platform: self.platform.clone(),
            sink: Arc::clone(&self.sink),
        };
        Ok(Resolvable::new(
            source,
            resolution.descriptor,
            Some(resolution.raw),
        ))
    }

    pub async fn fetcher(&self, reference: &str) -> Result<Arc<dyn Fetcher>> {
        let parsed = ImageReference::from_str(reference)?;
        self.remote.fetcher(&parsed).await
    }

    pub async fn pusher(&self, reference: &str) -> Result<Arc<dyn Pusher>> {
        let parsed = ImageReference::from_str(reference)?;
        self.remote.pusher(&parsed).await
    }

    #[instrument(name = "resolve", skip(self))]
    async fn resolve_parsed(&self, reference: &str) -> Result<Resolution> {
        let parsed = ImageReference::from_str(reference)?;
        let fetcher = self.remote.fetcher(&parsed).await?;
        let (raw, mut descriptor) = fetcher
            .fetch_manifest(&parsed.identifier(), &self.accept)
            .await?;

        // Registries that omit or mangle Content-Type still describe the
        // manifest in its own body.
        if descriptor.media_type.kind() == MediaKind::Unrecognized {
            self.sink.emit(Event::MissingContentType {
                reference: parsed.to_string(),
            });
            if let Some(sniffed) = sniff_media_type(&raw) {
                if sniffed.kind() != MediaKind::Unrecognized {
                    debug!(declared = %descriptor.media_type, %sniffed, "Using media type from manifest body");
                    descriptor.media_type = sniffed;
                }
            }
        }

        if descriptor.media_type.kind() == MediaKind::Legacy {
            return Err(TransferError::UnsupportedLegacySchema(
                descriptor.media_type,
            ));
        }

        if let Some(pinned) = &parsed.digest {
            if pinned != &descriptor.digest {
                return Err(TransferError::DigestMismatch {
                    expected: pinned.clone(),
                    actual: descriptor.digest,
                });
            }
        }
        verify_content(&descriptor, &raw)?;

        debug!(digest = %descriptor.digest, media_type = %descriptor.media_type, "Resolved");
        Ok(Resolution {
            reference: parsed,
            fetcher,
            descriptor,
            raw,
        })
    }
}
