#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::io::Cursor;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::time::sleep;

use imgferry::remote::{BlobReader, Fetcher, Pusher, Remote};
use imgferry::{
    ContentStore, Descriptor, ImageIndex, ImageManifest, ImageReference, MediaType, OciDigest,
    OciStore, Platform, Result, SessionState, TransferError, UploadSession, UploadStatus,
    WriteRequest,
};

pub const REPO: &str = "registry.test/demo";

/// How a blob fetch misbehaves.
#[derive(Clone, Copy)]
enum Fault {
    Fail(Duration),
    Slow(Duration),
}

#[derive(Default)]
struct State {
    manifests: HashMap<String, (MediaType, Bytes)>,
    blobs: HashMap<OciDigest, Bytes>,
    faults: HashMap<OciDigest, Fault>,
    untyped: HashSet<String>,
    accepts: Vec<Vec<MediaType>>,
}

/// An in-memory registry serving one flat namespace of manifests and blobs.
#[derive(Default)]
pub struct FakeRegistry {
    state: Arc<Mutex<State>>,
}

/// An image stored in a [`FakeRegistry`].
pub struct TestImage {
    pub descriptor: Descriptor,
    pub config: Descriptor,
    pub layers: Vec<Descriptor>,
}

impl TestImage {
    /// Every digest the image consists of.
    pub fn digests(&self) -> Vec<OciDigest> {
        self.layers
            .iter()
            .chain([&self.config, &self.descriptor])
            .map(|d| d.digest.clone())
            .collect()
    }
}

impl FakeRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_blob(&self, media_type: MediaType, data: &[u8]) -> Descriptor {
        let descriptor = Descriptor::for_content(media_type, data);
        self.state
            .lock()
            .unwrap()
            .blobs
            .insert(descriptor.digest.clone(), Bytes::copy_from_slice(data));
        descriptor
    }

    /// Replaces the bytes served for `digest` without touching its descriptor.
    pub fn tamper_blob(&self, digest: &OciDigest, data: &[u8]) {
        self.state
            .lock()
            .unwrap()
            .blobs
            .insert(digest.clone(), Bytes::copy_from_slice(data));
    }

    /// Makes fetches of `digest` fail after `delay`.
    pub fn fail_blob(&self, digest: &OciDigest, delay: Duration) {
        self.state
            .lock()
            .unwrap()
            .faults
            .insert(digest.clone(), Fault::Fail(delay));
    }

    /// Makes fetches of `digest` succeed only after `delay`.
    pub fn slow_blob(&self, digest: &OciDigest, delay: Duration) {
        self.state
            .lock()
            .unwrap()
            .faults
            .insert(digest.clone(), Fault::Slow(delay));
    }

    /// Serves the manifest at `key` without a content type.
    pub fn serve_untyped(&self, key: &str) {
        self.state.lock().unwrap().untyped.insert(key.to_string());
    }

    /// Stores `raw` under `key` only, whatever its digest.
    pub fn insert_raw(&self, key: &str, media_type: MediaType, raw: &[u8]) {
        self.state
            .lock()
            .unwrap()
            .manifests
            .insert(key.to_string(), (media_type, Bytes::copy_from_slice(raw)));
    }

    pub fn add_manifest(&self, tag: Option<&str>, media_type: MediaType, raw: &[u8]) -> Descriptor {
        let descriptor = Descriptor::for_content(media_type.clone(), raw);
        self.insert_raw(&descriptor.digest.to_string(), media_type.clone(), raw);
        if let Some(tag) = tag {
            self.insert_raw(tag, media_type, raw);
        }
        descriptor
    }

    pub fn add_image_with(
        &self,
        tag: Option<&str>,
        config: Descriptor,
        layers: Vec<Descriptor>,
    ) -> TestImage {
        let manifest = ImageManifest {
            schema_version: 2,
            media_type: MediaType::OciManifestSchema1,
            config: config.clone(),
            layers: layers.clone(),
        };
        let raw = serde_json::to_vec(&manifest).unwrap();
        let descriptor = self.add_manifest(tag, MediaType::OciManifestSchema1, &raw);
        TestImage {
            descriptor,
            config,
            layers,
        }
    }

    /// Adds an image named `name` with `layers` distinct layers.
    pub fn add_image(&self, tag: Option<&str>, name: &str, layers: usize) -> TestImage {
        let config = self.add_blob(
            MediaType::OciConfigJson,
            format!(r#"{{"name":"{name}"}}"#).as_bytes(),
        );
        let layers = (0..layers)
            .map(|i| {
                self.add_blob(
                    MediaType::OciLayer,
                    format!("{name}-layer-{i}").as_bytes(),
                )
            })
            .collect();
        self.add_image_with(tag, config, layers)
    }

    pub fn add_index(&self, tag: Option<&str>, children: Vec<Descriptor>) -> Descriptor {
        let index = ImageIndex {
            schema_version: 2,
            media_type: MediaType::OciImageIndex,
            manifests: children,
        };
        let raw = serde_json::to_vec(&index).unwrap();
        self.add_manifest(tag, MediaType::OciImageIndex, &raw)
    }

    /// Accept lists seen by manifest requests, in request order.
    pub fn accepts(&self) -> Vec<Vec<MediaType>> {
        self.state.lock().unwrap().accepts.clone()
    }

    fn repository(&self) -> Arc<FakeRepository> {
        Arc::new(FakeRepository {
            state: Arc::clone(&self.state),
        })
    }
}

pub fn with_platform(mut descriptor: Descriptor, os: &str, architecture: &str) -> Descriptor {
    descriptor.platform = Some(Platform::new(os, architecture));
    descriptor
}

struct FakeRepository {
    state: Arc<Mutex<State>>,
}

#[async_trait]
impl Fetcher for FakeRepository {
    async fn fetch_manifest(
        &self,
        reference: &str,
        accept: &[MediaType],
    ) -> Result<(Bytes, Descriptor)> {
        let mut state = self.state.lock().unwrap();
        state.accepts.push(accept.to_vec());
        let (media_type, raw) = state
            .manifests
            .get(reference)
            .cloned()
            .ok_or_else(|| TransferError::Transport(format!("manifest {reference} not found")))?;
        let media_type = if state.untyped.contains(reference) {
            MediaType::default()
        } else {
            media_type
        };
        let descriptor = Descriptor::for_content(media_type, &raw);
        Ok((raw, descriptor))
    }

    async fn fetch_blob(&self, digest: &OciDigest) -> Result<BlobReader> {
        let (fault, data) = {
            let state = self.state.lock().unwrap();
            (state.faults.get(digest).copied(), state.blobs.get(digest).cloned())
        };
        match fault {
            Some(Fault::Fail(delay)) => {
                sleep(delay).await;
                return Err(TransferError::Transport(format!("blob {digest} unavailable")));
            }
            Some(Fault::Slow(delay)) => sleep(delay).await,
            None => {}
        }
        let data =
            data.ok_or_else(|| TransferError::Transport(format!("blob {digest} not found")))?;
        Ok(Box::new(Cursor::new(data)))
    }
}

#[async_trait]
impl Pusher for FakeRepository {
    async fn push(&self, _descriptor: &Descriptor) -> Result<Box<dyn UploadSession>> {
        Err(TransferError::Transport("fake registry is read-only".to_string()))
    }
}

#[async_trait]
impl Remote for FakeRegistry {
    async fn fetcher(&self, _reference: &ImageReference) -> Result<Arc<dyn Fetcher>> {
        Ok(self.repository())
    }

    async fn pusher(&self, _reference: &ImageReference) -> Result<Arc<dyn Pusher>> {
        Ok(self.repository())
    }
}

/// An in-memory [`OciStore`] that records the order blobs were committed in.
pub struct RecordingStore {
    pub inner: OciStore,
    committed: Arc<Mutex<Vec<OciDigest>>>,
}

impl RecordingStore {
    pub async fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: OciStore::memory().await.unwrap(),
            committed: Arc::default(),
        })
    }

    pub fn committed(&self) -> Vec<OciDigest> {
        self.committed.lock().unwrap().clone()
    }

    pub fn position(&self, digest: &OciDigest) -> usize {
        self.committed()
            .iter()
            .position(|d| d == digest)
            .unwrap_or_else(|| panic!("{digest} was never committed"))
    }
}

#[async_trait]
impl ContentStore for RecordingStore {
    async fn exists(&self, descriptor: &Descriptor) -> Result<bool> {
        self.inner.exists(descriptor).await
    }

    async fn writer(&self, request: &WriteRequest) -> Result<Box<dyn UploadSession>> {
        Ok(Box::new(RecordingSession {
            inner: self.inner.writer(request).await?,
            committed: Arc::clone(&self.committed),
        }))
    }
}

struct RecordingSession {
    inner: Box<dyn UploadSession>,
    committed: Arc<Mutex<Vec<OciDigest>>>,
}

#[async_trait]
impl UploadSession for RecordingSession {
    async fn write(&mut self, data: &[u8]) -> Result<usize> {
        self.inner.write(data).await
    }

    async fn truncate(&mut self, offset: u64) -> Result<()> {
        self.inner.truncate(offset).await
    }

    async fn commit(&mut self, size: u64, expected: &OciDigest) -> Result<()> {
        self.inner.commit(size, expected).await?;
        self.committed.lock().unwrap().push(expected.clone());
        Ok(())
    }

    async fn abort(&mut self) -> Result<()> {
        self.inner.abort().await
    }

    fn status(&self) -> Result<UploadStatus> {
        self.inner.status()
    }

    fn digest(&self) -> OciDigest {
        self.inner.digest()
    }

    fn state(&self) -> SessionState {
        self.inner.state()
    }
}
