//! Moves the blobs of a single image into a content store.

use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::task::JoinSet;
use tracing::{Instrument, debug, info, instrument, warn};

use crate::content::{ContentStore, WriteRequest};
use crate::error::{Result, TransferError};
use crate::metrics::TransferMetrics;
use crate::models::Descriptor;
use crate::remote::BlobReader;
use crate::resolvable::RemoteImage;
use crate::upload::UploadSession;

const COPY_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Clone)]
pub struct BlobTransferEngine {
    metrics: Arc<TransferMetrics>,
}

impl Default for BlobTransferEngine {
    fn default() -> Self {
        Self::new(TransferMetrics::global())
    }
}

impl BlobTransferEngine {
    pub fn new(metrics: TransferMetrics) -> Self {
        Self {
            metrics: Arc::new(metrics),
        }
    }

    /// Copies every layer, then the config, then the manifest.
    ///
    /// Layers go in parallel. The config and the manifest are only written
    /// once all layers are committed, so the store never holds a manifest
    /// whose references are missing.
    #[instrument(name = "transfer_image", skip_all, fields(digest = %descriptor.digest))]
    pub async fn transfer_single_artifact(
        &self,
        image: &RemoteImage,
        descriptor: &Descriptor,
        store: &Arc<dyn ContentStore>,
    ) -> Result<()> {
        let manifest = image.manifest().await?;
        info!(layers = manifest.layers.len(), "Transferring image");

        let mut layers = JoinSet::new();
        for layer in manifest.layers {
            let engine = self.clone();
            let image = image.clone();
            let store = Arc::clone(store);
            layers.spawn(
                async move { engine.copy_blob(&image, layer, &store).await }.in_current_span(),
            );
        }
        while let Some(joined) = layers.join_next().await {
            if let Err(err) = joined.map_err(TransferError::from).and_then(|outcome| outcome) {
                warn!(error = %err, "Layer transfer failed, cancelling remaining layers");
                layers.abort_all();
                while layers.join_next().await.is_some() {}
                return Err(err);
            }
        }

        self.copy_blob(image, manifest.config, store).await?;

        if store.exists(descriptor).await? {
            debug!("Manifest already present");
            self.metrics.blobs_skipped.add(1, &[]);
            return Ok(());
        }
        let raw = image.raw_manifest().await?;
        let request = WriteRequest::new(descriptor.clone());
        self.write_blob(RemoteImage::open_manifest(raw), &request, store)
            .await
    }

    /// Copies one blob referenced by `image`, unless the store can skip it.
    async fn copy_blob(
        &self,
        image: &RemoteImage,
        descriptor: Descriptor,
        store: &Arc<dyn ContentStore>,
    ) -> Result<()> {
        if store.exists(&descriptor).await? {
            debug!(digest = %descriptor.digest, "Blob already present");
            self.metrics.blobs_skipped.add(1, &[]);
            return Ok(());
        }

        let request = WriteRequest::new(descriptor).with_mount(image.mount_hint().cloned());
        if store.mount(&request).await? {
            debug!(digest = %request.descriptor.digest, "Blob mounted from origin repository");
            self.metrics.blobs_skipped.add(1, &[]);
            return Ok(());
        }

        let reader = image.open_blob(&request.descriptor).await?;
        self.write_blob(reader, &request, store).await
    }

    /// Streams `reader` into a fresh store session and commits it under the
    /// expected digest if, and only if, exactly the declared size arrived.
    pub async fn write_blob(
        &self,
        reader: BlobReader,
        request: &WriteRequest,
        store: &Arc<dyn ContentStore>,
    ) -> Result<()> {
        let descriptor = &request.descriptor;
        let mut session = store.writer(request).await?;

        let copied = match copy_into(reader, session.as_mut(), descriptor.size).await {
            Ok(copied) => copied,
            Err(err) => {
                abandon(session.as_mut()).await;
                return Err(err);
            }
        };

        if copied != descriptor.size {
            abandon(session.as_mut()).await;
            return Err(TransferError::SizeMismatch {
                expected: descriptor.size,
                actual: copied,
            });
        }

        session.commit(descriptor.size, &descriptor.digest).await?;
        debug!(digest = %descriptor.digest, size = descriptor.size, "Blob committed");
        self.metrics.blobs_written.add(1, &[]);
        self.metrics
            .blob_size_histogram
            .record(descriptor.size as f64, &[]);
        Ok(())
    }
}

/// Copies until EOF or until more than `limit` bytes have been seen.
async fn copy_into(
    mut reader: BlobReader,
    session: &mut dyn UploadSession,
    limit: u64,
) -> Result<u64> {
    let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
    let mut copied = 0u64;
    loop {
        let n = reader.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        session.write(&buffer[..n]).await?;
        copied += n as u64;
        if copied > limit {
            break;
        }
    }
    Ok(copied)
}

async fn abandon(session: &mut dyn UploadSession) {
    if let Err(err) = session.abort().await {
        warn!(error = %err, "Failed to abort upload session");
    }
}
