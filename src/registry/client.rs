use std::io::Cursor;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use reqwest::header::{self, HeaderMap, HeaderValue};
use reqwest::{Client as ReqwestClient, Method, RequestBuilder, Response, StatusCode};
use tracing::{debug, info, instrument, warn};

use super::auth::{TokenResponse, parse_bearer_challenge};
use super::session::{BlobUpload, ManifestUpload};
use crate::config::RegistryConfig;
use crate::digest::OciDigest;
use crate::error::{Result, TransferError};
use crate::media_type::{MediaKind, MediaType};
use crate::models::Descriptor;
use crate::reference::{DEFAULT_REGISTRY, ImageReference};
use crate::remote::{BlobReader, Fetcher, MountHint, Pusher, Remote};
use crate::upload::UploadSession;

const DOCKER_HUB_API: &str = "registry-1.docker.io";

/// Fails with the response status and body unless `response` has one of `expected`.
pub(crate) async fn expect_status(
    response: Response,
    expected: &[StatusCode],
    what: &str,
) -> Result<Response> {
    if expected.contains(&response.status()) {
        return Ok(response);
    }
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    Err(TransferError::Transport(format!(
        "Failed to {}: {} - {}",
        what, status, body
    )))
}

/// Authenticated HTTP access to one registry host.
///
/// Requests carry basic credentials until the registry issues a bearer
/// challenge; the token obtained is then reused for later requests.
#[derive(Clone)]
pub(crate) struct Transport {
    client: ReqwestClient,
    base_url: String,
    auth: Option<String>,
    token: Arc<RwLock<Option<String>>>,
}

impl Transport {
    pub(crate) fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Resolves a `Location` header against the registry base URL.
    pub(crate) fn location(&self, response: &Response) -> Result<String> {
        let location = response
            .headers()
            .get(header::LOCATION)
            .ok_or_else(|| TransferError::Transport("No location header in response".to_string()))?
            .to_str()
            .map_err(|e| TransferError::Transport(e.to_string()))?;

        if location.starts_with("http") {
            Ok(location.to_string())
        } else {
            Ok(self.url(location))
        }
    }

    fn request(
        &self,
        method: Method,
        url: &str,
        headers: &HeaderMap,
        body: Option<Bytes>,
    ) -> RequestBuilder {
        let mut request = self.client.request(method, url).headers(headers.clone());
        let token = self.token.read().ok().and_then(|token| token.clone());
        if let Some(token) = token {
            request = request.header(header::AUTHORIZATION, format!("Bearer {}", token));
        } else if let Some(auth) = &self.auth {
            request = request.header(header::AUTHORIZATION, format!("Basic {}", auth));
        }
        if let Some(body) = body {
            request = request.body(body);
        }
        request
    }

    pub(crate) async fn send(
        &self,
        method: Method,
        url: &str,
        headers: HeaderMap,
        body: Option<Bytes>,
    ) -> Result<Response> {
        let response = self
            .request(method.clone(), url, &headers, body.clone())
            .send()
            .await?;

        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let challenge = response
            .headers()
            .get(header::WWW_AUTHENTICATE)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_bearer_challenge);
        let Some(challenge) = challenge else {
            return Ok(response);
        };

        let mut token_url = reqwest::Url::parse(&challenge.realm)
            .map_err(|e| TransferError::Transport(format!("Invalid token realm: {}", e)))?;
        if let Some(service) = &challenge.service {
            token_url.query_pairs_mut().append_pair("service", service);
        }
        if let Some(scope) = &challenge.scope {
            token_url.query_pairs_mut().append_pair("scope", scope);
        }

        let mut token_request = self.client.get(token_url);
        if let Some(auth) = &self.auth {
            token_request = token_request.header(header::AUTHORIZATION, format!("Basic {}", auth));
        }
        let token_response = token_request.send().await?;
        if !token_response.status().is_success() {
            return Ok(response);
        }
        let Some(token) = token_response.json::<TokenResponse>().await?.into_token() else {
            return Ok(response);
        };
        debug!(realm = %challenge.realm, "Obtained registry token");
        if let Ok(mut slot) = self.token.write() {
            *slot = Some(token);
        }

        Ok(self.request(method, url, &headers, body).send().await?)
    }

    pub(crate) async fn get(&self, url: &str, headers: HeaderMap) -> Result<Response> {
        self.send(Method::GET, url, headers, None).await
    }
}

/// A Distribution API v2 registry as a [`Remote`].
#[derive(Clone)]
pub struct RegistryClient {
    client: ReqwestClient,
    config: RegistryConfig,
    auth: Option<String>,
}

impl RegistryClient {
    pub fn new(config: RegistryConfig) -> Self {
        let auth = match (&config.username, &config.password) {
            (Some(username), Some(password)) => {
                Some(STANDARD.encode(format!("{}:{}", username, password)))
            }
            _ => None,
        };
        Self {
            client: ReqwestClient::new(),
            config,
            auth,
        }
    }

    fn base_url(&self, reference: &ImageReference) -> String {
        let host = match reference.registry() {
            DEFAULT_REGISTRY => DOCKER_HUB_API,
            other => other,
        };
        let scheme = if self.config.plain_http.iter().any(|h| h == host) {
            "http"
        } else {
            "https"
        };
        format!("{}://{}", scheme, host)
    }

    pub(crate) fn transport(&self, reference: &ImageReference) -> Transport {
        Transport {
            client: self.client.clone(),
            base_url: self.base_url(reference),
            auth: self.auth.clone(),
            token: Arc::new(RwLock::new(None)),
        }
    }

    /// Check if the registry API is available.
    pub async fn check_api(&self, reference: &ImageReference) -> Result<bool> {
        let transport = self.transport(reference);
        let response = transport.get(&transport.url("/v2/"), HeaderMap::new()).await?;
        // A 401 means the API is there but wants credentials
        Ok(matches!(
            response.status(),
            StatusCode::OK | StatusCode::UNAUTHORIZED
        ))
    }

    /// Points `reference`'s tag at an already pushed manifest.
    #[instrument(name = "tag_manifest", skip(self, raw), fields(reference = %reference))]
    pub async fn tag(
        &self,
        reference: &ImageReference,
        descriptor: &Descriptor,
        raw: Bytes,
    ) -> Result<()> {
        let transport = self.transport(reference);
        let url = transport.url(&format!(
            "/v2/{}/manifests/{}",
            reference.repository(),
            reference.identifier()
        ));
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, header_value(descriptor.media_type.as_str())?);
        let response = transport.send(Method::PUT, &url, headers, Some(raw)).await?;
        expect_status(response, &[StatusCode::CREATED, StatusCode::OK], "tag manifest").await?;
        info!(digest = %descriptor.digest, "Tagged manifest");
        Ok(())
    }
}

pub(crate) fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value).map_err(|e| TransferError::Transport(e.to_string()))
}

#[async_trait]
impl Remote for RegistryClient {
    async fn fetcher(&self, reference: &ImageReference) -> Result<Arc<dyn Fetcher>> {
        Ok(Arc::new(RegistryFetcher {
            transport: self.transport(reference),
            repository: reference.repository(),
        }))
    }

    async fn pusher(&self, reference: &ImageReference) -> Result<Arc<dyn Pusher>> {
        Ok(Arc::new(RegistryPusher {
            transport: self.transport(reference),
            reference: reference.clone(),
            chunk_size: self.config.chunk_size.max(1),
        }))
    }
}

pub struct RegistryFetcher {
    transport: Transport,
    repository: String,
}

#[async_trait]
impl Fetcher for RegistryFetcher {
    #[instrument(name = "fetch_manifest", skip(self, accept), fields(repository = %self.repository))]
    async fn fetch_manifest(
        &self,
        reference: &str,
        accept: &[MediaType],
    ) -> Result<(Bytes, Descriptor)> {
        let url = self.transport.url(&format!(
            "/v2/{}/manifests/{}",
            self.repository, reference
        ));
        let accept = accept
            .iter()
            .map(MediaType::as_str)
            .collect::<Vec<_>>()
            .join(", ");
        let mut headers = HeaderMap::new();
        headers.insert(header::ACCEPT, header_value(&accept)?);

        let response = self.transport.get(&url, headers).await?;
        let response = expect_status(response, &[StatusCode::OK], "fetch manifest").await?;

        let media_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(MediaType::from)
            .unwrap_or_default();
        let advertised = response
            .headers()
            .get("docker-content-digest")
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let raw = response.bytes().await?;

        let descriptor = Descriptor::for_content(media_type, &raw);
        if let Some(advertised) = advertised {
            if advertised != descriptor.digest.to_string() {
                debug!(%advertised, computed = %descriptor.digest, "Registry advertised a different manifest digest");
            }
        }
        Ok((raw, descriptor))
    }

    async fn fetch_blob(&self, digest: &OciDigest) -> Result<BlobReader> {
        let url = self
            .transport
            .url(&format!("/v2/{}/blobs/{}", self.repository, digest));
        let response = self.transport.get(&url, HeaderMap::new()).await?;
        let response = expect_status(response, &[StatusCode::OK], "fetch blob").await?;
        Ok(Box::new(Cursor::new(response.bytes().await?)))
    }
}

pub struct RegistryPusher {
    transport: Transport,
    reference: ImageReference,
    chunk_size: usize,
}

#[async_trait]
impl Pusher for RegistryPusher {
    #[instrument(name = "push", skip_all, fields(digest = %descriptor.digest))]
    async fn push(&self, descriptor: &Descriptor) -> Result<Box<dyn UploadSession>> {
        let repository = self.reference.repository();
        match descriptor.media_type.kind() {
            MediaKind::SingleArtifact | MediaKind::Collection | MediaKind::Legacy => Ok(Box::new(
                ManifestUpload::new(self.transport.clone(), repository, descriptor),
            )),
            MediaKind::Unrecognized => {
                let upload =
                    BlobUpload::initiate(self.transport.clone(), repository, self.chunk_size)
                        .await?;
                Ok(Box::new(upload))
            }
        }
    }

    async fn push_manifest(&self, descriptor: &Descriptor) -> Result<Box<dyn UploadSession>> {
        Ok(Box::new(ManifestUpload::new(
            self.transport.clone(),
            self.reference.repository(),
            descriptor,
        )))
    }

    async fn exists(&self, descriptor: &Descriptor) -> Result<bool> {
        let kind = match descriptor.media_type.kind() {
            MediaKind::Unrecognized => "blobs",
            _ => "manifests",
        };
        let url = self.transport.url(&format!(
            "/v2/{}/{}/{}",
            self.reference.repository(),
            kind,
            descriptor.digest
        ));
        let response = self
            .transport
            .send(Method::HEAD, &url, HeaderMap::new(), None)
            .await?;
        Ok(response.status() == StatusCode::OK)
    }

    async fn mount(&self, descriptor: &Descriptor, hint: &MountHint) -> Result<bool> {
        let origin = &hint.origin;
        if origin.registry() != self.reference.registry()
            || origin.repository() == self.reference.repository()
        {
            return Ok(false);
        }

        let mut url = reqwest::Url::parse(&self.transport.url(&format!(
            "/v2/{}/blobs/uploads/",
            self.reference.repository()
        )))
        .map_err(|e| TransferError::Transport(e.to_string()))?;
        url.query_pairs_mut()
            .append_pair("mount", &descriptor.digest.to_string())
            .append_pair("from", &origin.repository());

        let response = self
            .transport
            .send(Method::POST, url.as_str(), HeaderMap::new(), None)
            .await?;
        match response.status() {
            StatusCode::CREATED => Ok(true),
            StatusCode::ACCEPTED => {
                // The registry opened a regular upload instead; drop it.
                let location = self.transport.location(&response)?;
                let cancelled = self
                    .transport
                    .send(Method::DELETE, &location, HeaderMap::new(), None)
                    .await;
                if let Err(err) = cancelled {
                    warn!(%location, error = %err, "Failed to cancel upload opened by mount");
                }
                Ok(false)
            }
            _ => Ok(false),
        }
    }
}
