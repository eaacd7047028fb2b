use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use reqwest::header::{self, HeaderMap};
use reqwest::{Method, StatusCode};
use tracing::{debug, warn};

use super::client::{Transport, expect_status, header_value};
use crate::digest::OciDigest;
use crate::error::{Result, TransferError};
use crate::media_type::MediaType;
use crate::models::Descriptor;
use crate::upload::{SessionState, UploadBuffer, UploadSession, UploadStatus};

/// A chunked blob upload against `/v2/<name>/blobs/uploads/`.
///
/// Written bytes are kept locally so the accumulator can be recomputed on
/// truncate, and are sent as PATCH chunks once `chunk_size` has built up.
/// Truncating below what the registry already received restarts the
/// upload at a fresh location; the retained prefix is re-sent on demand.
pub struct BlobUpload {
    transport: Transport,
    repository: String,
    location: String,
    chunk_size: usize,
    flushed: u64,
    buffer: UploadBuffer,
    status: UploadStatus,
}

impl BlobUpload {
    pub(crate) async fn initiate(
        transport: Transport,
        repository: String,
        chunk_size: usize,
    ) -> Result<Self> {
        let location = start_upload(&transport, &repository).await?;
        let status = UploadStatus {
            reference: repository.clone(),
            location: location.clone(),
            offset: 0,
            started_at: Utc::now(),
        };
        Ok(Self {
            transport,
            repository,
            location,
            chunk_size,
            flushed: 0,
            buffer: UploadBuffer::new(),
            status,
        })
    }

    async fn flush(&mut self) -> Result<()> {
        let start = self.flushed;
        let end = self.buffer.offset();
        if end == start {
            return Ok(());
        }
        let chunk = Bytes::copy_from_slice(&self.buffer.bytes()[start as usize..end as usize]);

        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, header_value("application/octet-stream")?);
        headers.insert(header::CONTENT_RANGE, header_value(&format!("{}-{}", start, end - 1))?);
        let response = self
            .transport
            .send(Method::PATCH, &self.location, headers, Some(chunk))
            .await?;
        let response = expect_status(response, &[StatusCode::ACCEPTED], "upload chunk").await?;

        self.location = self.transport.location(&response)?;
        self.flushed = end;
        debug!(repository = %self.repository, offset = end, "Uploaded chunk");
        Ok(())
    }

    async fn cancel_remote(&self) {
        let result = self
            .transport
            .send(Method::DELETE, &self.location, HeaderMap::new(), None)
            .await;
        if let Err(err) = result {
            warn!(location = %self.location, error = %err, "Failed to cancel upload");
        }
    }
}

async fn start_upload(transport: &Transport, repository: &str) -> Result<String> {
    let url = transport.url(&format!("/v2/{}/blobs/uploads/", repository));
    let response = transport.send(Method::POST, &url, HeaderMap::new(), None).await?;
    let response = expect_status(response, &[StatusCode::ACCEPTED], "start upload").await?;
    transport.location(&response)
}

#[async_trait]
impl UploadSession for BlobUpload {
    async fn write(&mut self, data: &[u8]) -> Result<usize> {
        let written = self.buffer.write(data)?;
        if self.buffer.offset() - self.flushed >= self.chunk_size as u64 {
            self.flush().await?;
        }
        Ok(written)
    }

    async fn truncate(&mut self, offset: u64) -> Result<()> {
        self.buffer.truncate(offset)?;
        if offset < self.flushed {
            self.cancel_remote().await;
            self.location = start_upload(&self.transport, &self.repository).await?;
            self.status.location = self.location.clone();
            self.flushed = 0;
            debug!(repository = %self.repository, offset, "Restarted upload after truncate");
        }
        Ok(())
    }

    async fn commit(&mut self, size: u64, expected: &OciDigest) -> Result<()> {
        let content = match self.buffer.verify(size, expected) {
            Ok(content) => content,
            Err(err) => {
                if matches!(
                    err,
                    TransferError::SizeMismatch { .. } | TransferError::DigestMismatch { .. }
                ) {
                    self.cancel_remote().await;
                }
                return Err(err);
            }
        };
        let remainder = content.slice(self.flushed as usize..);

        let mut url = reqwest::Url::parse(&self.location)
            .map_err(|e| TransferError::Transport(e.to_string()))?;
        url.query_pairs_mut()
            .append_pair("digest", &expected.to_string());

        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, header_value("application/octet-stream")?);
        let result = match self
            .transport
            .send(Method::PUT, url.as_str(), headers, Some(remainder))
            .await
        {
            Ok(response) => expect_status(response, &[StatusCode::CREATED], "complete upload")
                .await
                .map(|_| ()),
            Err(err) => Err(err),
        };

        match result {
            Ok(()) => {
                self.buffer.mark_committed();
                Ok(())
            }
            Err(err) => {
                self.buffer.mark_aborted();
                Err(err)
            }
        }
    }

    async fn abort(&mut self) -> Result<()> {
        if self.buffer.state() == SessionState::Aborted {
            return Ok(());
        }
        self.buffer.ensure_open("abort")?;
        self.buffer.mark_aborted();
        self.cancel_remote().await;
        Ok(())
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

/// Manifests are not uploaded through blob sessions; the bytes are PUT to
/// `/v2/<name>/manifests/<digest>` with their media type on commit.
pub struct ManifestUpload {
    transport: Transport,
    repository: String,
    media_type: MediaType,
    buffer: UploadBuffer,
    status: UploadStatus,
}

impl ManifestUpload {
    pub(crate) fn new(transport: Transport, repository: String, descriptor: &Descriptor) -> Self {
        let location = transport.url(&format!(
            "/v2/{}/manifests/{}",
            repository, descriptor.digest
        ));
        let status = UploadStatus {
            reference: repository.clone(),
            location,
            offset: 0,
            started_at: Utc::now(),
        };
        Self {
            transport,
            repository,
            media_type: descriptor.media_type.clone(),
            buffer: UploadBuffer::new(),
            status,
        }
    }
}

#[async_trait]
impl UploadSession for ManifestUpload {
    async fn write(&mut self, data: &[u8]) -> Result<usize> {
        self.buffer.write(data)
    }

    async fn truncate(&mut self, offset: u64) -> Result<()> {
        self.buffer.truncate(offset)
    }

    async fn commit(&mut self, size: u64, expected: &OciDigest) -> Result<()> {
        let content = self.buffer.verify(size, expected)?;
        let url = self.transport.url(&format!(
            "/v2/{}/manifests/{}",
            self.repository, expected
        ));
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, header_value(self.media_type.as_str())?);

        let result = match self
            .transport
            .send(Method::PUT, &url, headers, Some(content))
            .await
        {
            Ok(response) => expect_status(
                response,
                &[StatusCode::CREATED, StatusCode::OK],
                "register manifest",
            )
            .await
            .map(|_| ()),
            Err(err) => Err(err),
        };

        match result {
            Ok(()) => {
                self.buffer.mark_committed();
                Ok(())
            }
            Err(err) => {
                self.buffer.mark_aborted();
                Err(err)
            }
        }
    }

    async fn abort(&mut self) -> Result<()> {
        if self.buffer.state() != SessionState::Aborted {
            self.buffer.ensure_open("abort")?;
            self.buffer.mark_aborted();
        }
        Ok(())
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
