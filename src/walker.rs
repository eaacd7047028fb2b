//! Recursive transfer of index trees.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tracing::{debug, info, instrument};

use crate::content::{ContentStore, WriteRequest};
use crate::digest::OciDigest;
use crate::error::{Result, TransferError};
use crate::event::{Event, SharedSink, TracingSink};
use crate::media_type::MediaKind;
use crate::resolvable::{Artifact, RemoteImage, RemoteIndex, Resolvable};
use crate::transfer::BlobTransferEngine;

type WalkFuture<'a> = Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

#[derive(Clone)]
pub struct TreeWalker {
    engine: BlobTransferEngine,
    sink: SharedSink,
}

impl Default for TreeWalker {
    fn default() -> Self {
        Self::new(BlobTransferEngine::default(), Arc::new(TracingSink))
    }
}

impl TreeWalker {
    pub fn new(engine: BlobTransferEngine, sink: SharedSink) -> Self {
        Self { engine, sink }
    }

    /// Copies everything `resolvable` points at into `store`.
    #[instrument(name = "transfer", skip_all, fields(reference = %resolvable.reference(), digest = %resolvable.descriptor().digest))]
    pub async fn transfer(
        &self,
        resolvable: &Resolvable,
        store: &Arc<dyn ContentStore>,
    ) -> Result<()> {
        let artifact = resolvable.resolve().await?;
        self.transfer_artifact(artifact, store).await
    }

    /// Copies an already classified artifact into `store`.
    pub async fn transfer_artifact(
        &self,
        artifact: Artifact,
        store: &Arc<dyn ContentStore>,
    ) -> Result<()> {
        match artifact {
            Artifact::Index(index) => {
                let mut chain = Vec::new();
                self.walk_index(index, store, &mut chain).await
            }
            Artifact::Image(image) => {
                let descriptor = image.descriptor().clone();
                self.engine
                    .transfer_single_artifact(&image, &descriptor, store)
                    .await
            }
        }
    }

    /// Walks children in declared order, one at a time, stopping at the
    /// first failure. The index manifest is written after its children.
    ///
    /// `chain` holds the digests of the indexes currently being walked; a
    /// child that reappears in it would recurse forever.
    fn walk_index<'a>(
        &'a self,
        index: RemoteIndex,
        store: &'a Arc<dyn ContentStore>,
        chain: &'a mut Vec<OciDigest>,
    ) -> WalkFuture<'a> {
        Box::pin(async move {
            let digest = index.descriptor().digest.clone();
            if chain.contains(&digest) {
                return Err(TransferError::Structural(format!(
                    "index {} references itself",
                    digest
                )));
            }

            let manifest = index.index_manifest().await?;
            info!(%digest, children = manifest.manifests.len(), "Walking index");

            chain.push(digest.clone());
            for child in &manifest.manifests {
                if chain.contains(&child.digest) {
                    return Err(TransferError::Structural(format!(
                        "index {} lists ancestor {} as a child",
                        digest, child.digest
                    )));
                }
                match child.media_type.kind() {
                    MediaKind::Collection => {
                        self.walk_index(index.index(child), store, chain).await?;
                    }
                    MediaKind::SingleArtifact => {
                        self.engine
                            .transfer_single_artifact(&index.image(child), child, store)
                            .await?;
                    }
                    MediaKind::Legacy => {
                        return Err(TransferError::UnsupportedLegacySchema(
                            child.media_type.clone(),
                        ));
                    }
                    MediaKind::Unrecognized => {
                        self.sink.emit(Event::OpaqueChild {
                            parent: digest.clone(),
                            child: child.digest.clone(),
                        });
                        if !store.exists(child).await? {
                            let raw = index.child_manifest(child).await?;
                            let request = WriteRequest::new(child.clone()).as_manifest();
                            self.engine
                                .write_blob(RemoteImage::open_manifest(raw), &request, store)
                                .await?;
                        }
                    }
                }
            }
            chain.pop();

            if store.exists(index.descriptor()).await? {
                debug!(%digest, "Index already present");
                return Ok(());
            }
            let raw = index.raw_manifest().await?;
            let request = WriteRequest::new(index.descriptor().clone());
            self.engine
                .write_blob(RemoteImage::open_manifest(raw), &request, store)
                .await
        })
    }
}
