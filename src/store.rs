use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use opendal::Operator;
use opendal::services::{Fs, Memory, S3};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::{StorageBackend, StorageConfig};
use crate::content::{ContentStore, WriteRequest};
use crate::digest::OciDigest;
use crate::error::{Result, TransferError};
use crate::media_type::MediaType;
use crate::models::Descriptor;
use crate::upload::{SessionState, UploadBuffer, UploadSession, UploadStatus};

const LAYOUT_FILE: &str = "oci-layout";
const INDEX_FILE: &str = "index.json";
const REF_NAME_ANNOTATION: &str = "org.opencontainers.image.ref.name";

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LayoutIndex {
    schema_version: i32,
    #[serde(default)]
    media_type: MediaType,
    #[serde(default)]
    manifests: Vec<Descriptor>,
}

/// An OCI image layout on top of an `opendal` operator.
///
/// Blobs live at `blobs/<algorithm>/<hex>`; in-flight uploads leave a status
/// record under `uploads/` until they are committed or aborted.
#[derive(Debug, Clone)]
pub struct OciStore {
    operator: Operator,
}

impl OciStore {
    pub async fn new(config: &StorageConfig) -> Result<Self> {
        let operator = match config.backend {
            StorageBackend::Fs => {
                let root = config
                    .fs_root
                    .clone()
                    .ok_or_else(|| TransferError::Config("Missing fs_root configuration".to_string()))?;

                let mut builder = Fs::default();
                builder.root(&root.to_string_lossy());

                Operator::new(builder)?.finish()
            }
            StorageBackend::S3 => {
                let bucket = config
                    .s3_bucket
                    .clone()
                    .ok_or_else(|| TransferError::Config("Missing s3_bucket configuration".to_string()))?;
                let region = config
                    .s3_region
                    .clone()
                    .ok_or_else(|| TransferError::Config("Missing s3_region configuration".to_string()))?;

                let mut builder = S3::default();
                builder.bucket(&bucket);
                builder.region(&region);

                if let Some(endpoint) = &config.s3_endpoint {
                    builder.endpoint(endpoint);
                }

                if let Some(access_key) = &config.s3_access_key {
                    builder.access_key_id(access_key);
                }

                if let Some(secret_key) = &config.s3_secret_key {
                    builder.secret_access_key(secret_key);
                }

                Operator::new(builder)?.finish()
            }
            StorageBackend::Memory => Operator::new(Memory::default())?.finish(),
        };

        info!(backend = %config.backend, "Opened content store");
        Self::from_operator(operator).await
    }

    /// A store that lives only as long as the process.
    pub async fn memory() -> Result<Self> {
        Self::from_operator(Operator::new(Memory::default())?.finish()).await
    }

    pub async fn from_operator(operator: Operator) -> Result<Self> {
        if !operator.is_exist(LAYOUT_FILE).await? {
            operator
                .write(LAYOUT_FILE, r#"{"imageLayoutVersion":"1.0.0"}"#.as_bytes().to_vec())
                .await?;
        }
        Ok(Self { operator })
    }

    fn blob_path(digest: &OciDigest) -> String {
        format!("blobs/{}/{}", digest.algorithm(), digest.hex())
    }

    fn status_path(uuid: &str) -> String {
        format!("uploads/{uuid}-status.json")
    }

    // Blob operations

    pub async fn blob_exists(&self, digest: &OciDigest) -> Result<bool> {
        Ok(self.operator.is_exist(&Self::blob_path(digest)).await?)
    }

    pub async fn get_blob_size(&self, digest: &OciDigest) -> Result<u64> {
        let metadata = self.operator.stat(&Self::blob_path(digest)).await?;
        Ok(metadata.content_length())
    }

    pub async fn get_blob(&self, digest: &OciDigest) -> Result<Bytes> {
        let data = self.operator.read(&Self::blob_path(digest)).await?;
        Ok(Bytes::from(data))
    }

    /// Opens an upload session for `descriptor`.
    pub async fn start_upload(&self, descriptor: &Descriptor) -> Result<StoreSession> {
        let uuid = Uuid::new_v4().to_string();
        let status = UploadStatus {
            reference: descriptor.digest.to_string(),
            location: format!("uploads/{uuid}"),
            offset: 0,
            started_at: Utc::now(),
        };
        self.operator
            .write(&Self::status_path(&uuid), serde_json::to_vec(&status)?)
            .await?;
        debug!(digest = %descriptor.digest, %uuid, "Started upload");

        Ok(StoreSession {
            operator: self.operator.clone(),
            uuid,
            status,
            buffer: UploadBuffer::new(),
        })
    }

    // Reference operations

    /// Records `descriptor` in `index.json` under `name`, replacing any
    /// previous entry with the same name.
    pub async fn tag(&self, name: &str, descriptor: &Descriptor) -> Result<()> {
        let mut index = self.read_index().await?;
        index.manifests.retain(|entry| {
            entry
                .annotations
                .as_ref()
                .and_then(|annotations| annotations.get(REF_NAME_ANNOTATION))
                .map(String::as_str)
                != Some(name)
        });

        let mut entry = descriptor.clone();
        entry
            .annotations
            .get_or_insert_with(Default::default)
            .insert(REF_NAME_ANNOTATION.to_string(), name.to_string());
        index.manifests.push(entry);

        self.operator
            .write(INDEX_FILE, serde_json::to_vec_pretty(&index)?)
            .await?;
        info!(%name, digest = %descriptor.digest, "Tagged manifest");
        Ok(())
    }

    /// Looks up the descriptor tagged `name`.
    pub async fn resolve_tag(&self, name: &str) -> Result<Option<Descriptor>> {
        let index = self.read_index().await?;
        Ok(index.manifests.into_iter().find(|entry| {
            entry
                .annotations
                .as_ref()
                .and_then(|annotations| annotations.get(REF_NAME_ANNOTATION))
                .is_some_and(|value| value == name)
        }))
    }

    async fn read_index(&self) -> Result<LayoutIndex> {
        if !self.operator.is_exist(INDEX_FILE).await? {
            return Ok(LayoutIndex {
                schema_version: 2,
                media_type: MediaType::OciImageIndex,
                manifests: Vec::new(),
            });
        }
        let data = self.operator.read(INDEX_FILE).await?;
        Ok(serde_json::from_slice(&data)?)
    }
}

#[async_trait]
impl ContentStore for OciStore {
    async fn exists(&self, descriptor: &Descriptor) -> Result<bool> {
        if !self.blob_exists(&descriptor.digest).await? {
            return Ok(false);
        }
        Ok(self.get_blob_size(&descriptor.digest).await? == descriptor.size)
    }

    async fn writer(&self, request: &WriteRequest) -> Result<Box<dyn UploadSession>> {
        Ok(Box::new(self.start_upload(&request.descriptor).await?))
    }
}

/// An upload into an [`OciStore`]. Bytes are held until commit, which
/// verifies them and publishes the blob under its digest.
#[derive(Debug)]
pub struct StoreSession {
    operator: Operator,
    uuid: String,
    status: UploadStatus,
    buffer: UploadBuffer,
}

impl StoreSession {
    async fn cleanup(&self) -> Result<()> {
        let path = OciStore::status_path(&self.uuid);
        if self.operator.is_exist(&path).await? {
            self.operator.delete(&path).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl UploadSession for StoreSession {
    async fn write(&mut self, data: &[u8]) -> Result<usize> {
        self.buffer.write(data)
    }

    async fn truncate(&mut self, offset: u64) -> Result<()> {
        self.buffer.truncate(offset)
    }

    async fn commit(&mut self, size: u64, expected: &OciDigest) -> Result<()> {
        let content = match self.buffer.verify(size, expected) {
            Ok(content) => content,
            Err(err) => {
                self.cleanup().await?;
                return Err(err);
            }
        };

        let path = OciStore::blob_path(expected);
        let stored = async {
            // A blob of the wrong length at this path is a torn earlier write.
            let intact = self.operator.is_exist(&path).await?
                && self.operator.stat(&path).await?.content_length() == size;
            if !intact {
                self.operator.write(&path, content).await?;
            }
            self.cleanup().await
        }
        .await;

        match stored {
            Ok(()) => {
                self.buffer.mark_committed();
                debug!(digest = %expected, uuid = %self.uuid, "Committed upload");
                Ok(())
            }
            Err(err) => {
                self.buffer.mark_aborted();
                Err(err)
            }
        }
    }

    async fn abort(&mut self) -> Result<()> {
        match self.buffer.state() {
            SessionState::Aborted => Ok(()),
            _ => {
                self.buffer.ensure_open("abort")?;
                self.buffer.mark_aborted();
                self.cleanup().await
            }
        }
    }

    fn status(&self) -> Result<UploadStatus> {
        self.buffer.ensure_open("query")?;
        Ok(UploadStatus {
            offset: self.buffer.offset(),
            ..self.status.clone()
        })
    }

    fn digest(&self) -> OciDigest {
        self.buffer.digest()
    }

    fn state(&self) -> SessionState {
        self.buffer.state()
    }
}
