use crate::config::{RegistryType, UpstreamConfig, DEFAULT_MANIFEST_ACCEPT_HEADER};
use crate::error::{ProxyError, Result};
use crate::registry::adapter::{AdapterFactory, BlobStream, PulledManifest, RegistryAdapter};
use crate::registry::auth::{Challenge, TokenCache};
use crate::registry::manager::Registry;
use crate::registry::manifest::{digest_of, is_digest, Descriptor, Manifest, MEDIA_TYPE_OCTET_STREAM};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use reqwest::header::{
    HeaderMap, ACCEPT, CONTENT_LENGTH, CONTENT_TYPE, LOCATION, WWW_AUTHENTICATE,
};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use std::sync::Arc;
use std::time::Duration;

const DOCKER_CONTENT_DIGEST: &str = "docker-content-digest";

/// Build the shared HTTP client for upstream registries
pub fn build_client(upstream: &UpstreamConfig, insecure: bool) -> Result<Client> {
    reqwest::Client::builder()
        .danger_accept_invalid_certs(upstream.insecure_skip_verify || insecure)
        .pool_max_idle_per_host(10)
        .pool_idle_timeout(Duration::from_secs(90))
        .timeout(Duration::from_secs(upstream.timeout_secs))
        .connect_timeout(Duration::from_secs(10))
        .build()
        .map_err(ProxyError::Http)
}

#[derive(Debug, Clone)]
enum Authorization {
    Bearer(String),
    Basic(String, String),
}

fn authorize(req: RequestBuilder, auth: &Option<Authorization>) -> RequestBuilder {
    match auth {
        Some(Authorization::Bearer(token)) => req.bearer_auth(token),
        Some(Authorization::Basic(user, pass)) => req.basic_auth(user, Some(pass)),
        None => req,
    }
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

/// Distribution API client for one upstream registry
pub struct UpstreamAdapter {
    registry: Registry,
    client: Client,
    tokens: Arc<TokenCache>,
}

impl UpstreamAdapter {
    pub fn new(registry: Registry, client: Client, tokens: Arc<TokenCache>) -> Self {
        Self {
            registry,
            client,
            tokens,
        }
    }

    /// Docker Hub keeps official images under `library/`
    pub fn upstream_repository(&self, repository: &str) -> String {
        if self.registry.registry_type == RegistryType::DockerHub && !repository.contains('/') {
            format!("library/{}", repository)
        } else {
            repository.to_string()
        }
    }

    fn url(&self, repository: &str, tail: &str) -> String {
        format!("{}/v2/{}/{}", self.registry.url, repository, tail)
    }

    fn initial_authorization(&self) -> Option<Authorization> {
        // Harbor accepts basic credentials without a challenge round-trip
        match (&self.registry.registry_type, &self.registry.credential) {
            (RegistryType::Harbor, Some(cred)) => Some(Authorization::Basic(
                cred.username.clone(),
                cred.password.clone(),
            )),
            _ => None,
        }
    }

    /// Send a request, answering one auth challenge. Returns the response and the
    /// authorization that produced it so follow-up requests can reuse it.
    async fn send<F>(&self, repository: &str, build: F) -> Result<(Response, Option<Authorization>)>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let mut auth = self.initial_authorization();
        let resp = authorize(build(&self.client), &auth).send().await?;
        if resp.status() != StatusCode::UNAUTHORIZED {
            return Ok((resp, auth));
        }

        let challenge = resp
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .and_then(Challenge::parse);
        tracing::debug!(
            registry_id = self.registry.id,
            repository = %repository,
            challenge = ?challenge,
            "Upstream requested authentication"
        );

        auth = match challenge {
            Some(challenge @ Challenge::Bearer { .. }) => self
                .tokens
                .fetch(
                    &self.client,
                    &challenge,
                    repository,
                    self.registry.credential.as_ref(),
                )
                .await
                .map(Authorization::Bearer),
            Some(Challenge::Basic) => self
                .registry
                .credential
                .as_ref()
                .map(|c| Authorization::Basic(c.username.clone(), c.password.clone())),
            None => None,
        };

        if auth.is_none() {
            return Ok((resp, None));
        }
        let resp = authorize(build(&self.client), &auth).send().await?;
        Ok((resp, auth))
    }

    fn status_error(&self, what: &str, status: StatusCode) -> ProxyError {
        if status == StatusCode::NOT_FOUND {
            ProxyError::NotFound(format!("{} not found upstream", what))
        } else {
            ProxyError::Registry(format!(
                "registry {} returned {} for {}",
                self.registry.name, status, what
            ))
        }
    }
}

#[async_trait]
impl RegistryAdapter for UpstreamAdapter {
    async fn pull_manifest(&self, repository: &str, reference: &str) -> Result<PulledManifest> {
        let repository = self.upstream_repository(repository);
        let url = self.url(&repository, &format!("manifests/{}", reference));
        tracing::debug!(url = %url, "Pulling manifest from upstream");

        let (resp, _) = self
            .send(&repository, |c| {
                c.get(&url).header(ACCEPT, DEFAULT_MANIFEST_ACCEPT_HEADER)
            })
            .await?;
        if !resp.status().is_success() {
            return Err(self.status_error(&format!("manifest {}:{}", repository, reference), resp.status()));
        }

        let content_type = header_str(resp.headers(), CONTENT_TYPE.as_str());
        let header_digest = header_str(resp.headers(), DOCKER_CONTENT_DIGEST);
        let payload = resp.bytes().await?;
        let digest = header_digest
            .filter(|d| !d.is_empty())
            .or_else(|| is_digest(reference).then(|| reference.to_string()))
            .unwrap_or_else(|| digest_of(&payload));
        let manifest = Manifest::parse(content_type.as_deref(), payload)?;

        tracing::debug!(
            repository = %repository,
            reference = %reference,
            digest = %digest,
            media_type = %manifest.media_type(),
            "Pulled manifest from upstream"
        );
        Ok(PulledManifest { manifest, digest })
    }

    async fn pull_blob(&self, repository: &str, digest: &str) -> Result<(Descriptor, BlobStream)> {
        let repository = self.upstream_repository(repository);
        let url = self.url(&repository, &format!("blobs/{}", digest));
        let (resp, _) = self.send(&repository, |c| c.get(&url)).await?;
        if !resp.status().is_success() {
            return Err(self.status_error(&format!("blob {}", digest), resp.status()));
        }

        let size = resp.content_length().unwrap_or(0);
        let media_type = header_str(resp.headers(), CONTENT_TYPE.as_str())
            .unwrap_or_else(|| MEDIA_TYPE_OCTET_STREAM.to_string());
        let actual_digest =
            header_str(resp.headers(), DOCKER_CONTENT_DIGEST).unwrap_or_else(|| digest.to_string());
        if actual_digest != digest {
            tracing::warn!(
                requested = %digest,
                reported = %actual_digest,
                "Upstream reported a different blob digest"
            );
        }

        let stream = resp
            .bytes_stream()
            .map_err(std::io::Error::other)
            .boxed();
        Ok((Descriptor::new(media_type, digest, size), stream))
    }

    async fn push_manifest(
        &self,
        repository: &str,
        tag: &str,
        media_type: &str,
        payload: Bytes,
    ) -> Result<String> {
        let repository = self.upstream_repository(repository);
        let url = self.url(&repository, &format!("manifests/{}", tag));
        let (resp, _) = self
            .send(&repository, |c| {
                c.put(&url)
                    .header(CONTENT_TYPE, media_type)
                    .body(payload.clone())
            })
            .await?;
        if !resp.status().is_success() {
            return Err(self.status_error(&format!("manifest push {}:{}", repository, tag), resp.status()));
        }
        Ok(header_str(resp.headers(), DOCKER_CONTENT_DIGEST).unwrap_or_else(|| digest_of(&payload)))
    }

    async fn push_blob(
        &self,
        repository: &str,
        digest: &str,
        size: u64,
        body: BlobStream,
    ) -> Result<()> {
        let repository = self.upstream_repository(repository);
        let blob_url = self.url(&repository, &format!("blobs/{}", digest));
        let (head, _) = self.send(&repository, |c| c.head(&blob_url)).await?;
        if head.status().is_success() {
            tracing::debug!(repository = %repository, digest = %digest, "Blob already present upstream");
            return Ok(());
        }

        let start_url = self.url(&repository, "blobs/uploads/");
        let (resp, auth) = self.send(&repository, |c| c.post(&start_url)).await?;
        if !resp.status().is_success() {
            return Err(self.status_error(&format!("blob upload {}", digest), resp.status()));
        }

        let location = header_str(resp.headers(), LOCATION.as_str()).ok_or_else(|| {
            ProxyError::Registry("blob upload response carried no Location".to_string())
        })?;
        let location = if location.starts_with("http://") || location.starts_with("https://") {
            location
        } else {
            format!("{}{}", self.registry.url, location)
        };
        let sep = if location.contains('?') { '&' } else { '?' };
        let put_url = format!("{}{}digest={}", location, sep, digest);

        let resp = authorize(self.client.put(&put_url), &auth)
            .header(CONTENT_LENGTH, size)
            .header(CONTENT_TYPE, MEDIA_TYPE_OCTET_STREAM)
            .body(reqwest::Body::wrap_stream(body))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(self.status_error(&format!("blob upload {}", digest), resp.status()));
        }
        Ok(())
    }
}

/// Builds [`UpstreamAdapter`]s, picking the TLS client from the registry flags
pub struct UpstreamAdapterFactory {
    client: Client,
    insecure_client: Client,
    tokens: Arc<TokenCache>,
}

impl UpstreamAdapterFactory {
    pub fn new(upstream: &UpstreamConfig) -> Result<Self> {
        Ok(Self {
            client: build_client(upstream, false)?,
            insecure_client: build_client(upstream, true)?,
            tokens: Arc::new(TokenCache::new()),
        })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }
}

impl AdapterFactory for UpstreamAdapterFactory {
    fn create(&self, registry: &Registry) -> Result<Arc<dyn RegistryAdapter>> {
        if registry.url.is_empty() {
            return Err(ProxyError::UpstreamUnavailable(format!(
                "registry {} has no url",
                registry.id
            )));
        }
        let client = if registry.insecure {
            self.insecure_client.clone()
        } else {
            self.client.clone()
        };
        Ok(Arc::new(UpstreamAdapter::new(
            registry.clone(),
            client,
            self.tokens.clone(),
        )))
    }
}
