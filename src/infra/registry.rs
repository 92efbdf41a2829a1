//! OCI distribution client.
//!
//! Anonymous pulls only: a `401` carrying a bearer challenge is answered
//! with an anonymous token from the advertised realm, then the request is
//! repeated once with that token.

use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use oci_spec::image::{Descriptor, ImageIndex};
use reqwest::header::{HeaderMap, ACCEPT, AUTHORIZATION, CONTENT_TYPE, WWW_AUTHENTICATE};
use reqwest::{Method, Response, StatusCode};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::domain::ImageReference;
use crate::infra::oci::{has_artifact_type, MANIFEST_ACCEPT, MEDIA_TYPE_OCI_INDEX};
use crate::infra::retry::{is_retryable_status, is_retryable_transport_error, Retry, RetryConfig};
use crate::infra::{ProviderError, Result};

const DOCKER_CONTENT_DIGEST: &str = "Docker-Content-Digest";

/// A manifest fetched from a registry
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedManifest {
    pub media_type: String,
    pub digest: String,
    pub bytes: Vec<u8>,
}

/// Registry operations the provider depends on.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Registry: Send + Sync {
    /// Resolve a reference to the digest of the manifest it points at
    async fn head_digest(&self, reference: &ImageReference) -> Result<String>;

    /// Fetch the manifest (or index) a reference points at
    async fn manifest(&self, reference: &ImageReference) -> Result<FetchedManifest>;

    /// Fetch a blob from the reference's repository, verifying its digest
    async fn blob(&self, reference: &ImageReference, digest: &str) -> Result<Vec<u8>>;

    /// Descriptors of manifests that declare `subject_digest` as their subject
    async fn referrers(
        &self,
        repository: &ImageReference,
        subject_digest: &str,
        artifact_type: Option<String>,
    ) -> Result<Vec<Descriptor>>;
}

/// HTTP implementation of [`Registry`]
#[derive(Clone)]
pub struct RegistryClient {
    http: reqwest::Client,
    retry: RetryConfig,
}

#[derive(Debug)]
enum SendError {
    Transport(reqwest::Error),
    Status(StatusCode),
}

impl std::fmt::Display for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SendError::Transport(e) => write!(f, "{e}"),
            SendError::Status(status) => write!(f, "unexpected status {status}"),
        }
    }
}

impl SendError {
    fn is_retryable(&self) -> bool {
        match self {
            SendError::Transport(e) => is_retryable_transport_error(e),
            SendError::Status(_) => true,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

/// Parsed `WWW-Authenticate: Bearer ...` challenge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BearerChallenge {
    pub realm: String,
    pub service: Option<String>,
    pub scope: Option<String>,
}

impl BearerChallenge {
    /// Parse a bearer challenge header value
    pub fn parse(header: &str) -> Option<Self> {
        let params = header
            .strip_prefix("Bearer ")
            .or_else(|| header.strip_prefix("bearer "))?;

        let mut realm = None;
        let mut service = None;
        let mut scope = None;

        // Values are quoted and may themselves contain commas (scopes do).
        let mut rest = params.trim();
        while !rest.is_empty() {
            let (key, after_key) = rest.split_once('=')?;
            let after_key = after_key.trim_start();
            let (value, remaining) = match after_key.strip_prefix('"') {
                Some(quoted) => {
                    let end = quoted.find('"')?;
                    (&quoted[..end], &quoted[end + 1..])
                }
                None => match after_key.find(',') {
                    Some(end) => (&after_key[..end], &after_key[end..]),
                    None => (after_key, ""),
                },
            };
            match key.trim() {
                "realm" => realm = Some(value.to_string()),
                "service" => service = Some(value.to_string()),
                "scope" => scope = Some(value.to_string()),
                _ => {}
            }
            rest = remaining.trim_start_matches(|c: char| c == ',' || c.is_whitespace());
        }

        Some(Self {
            realm: realm?,
            service,
            scope,
        })
    }
}

impl RegistryClient {
    pub fn new(user_agent: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(user_agent)
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| ProviderError::Internal(format!("unable to build http client: {e}")))?;
        Ok(Self {
            http,
            retry: RetryConfig::registry(),
        })
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    async fn send(
        &self,
        method: &Method,
        url: &str,
        query: &[(&str, &str)],
        accept: &[&str],
        token: Option<&str>,
    ) -> std::result::Result<Response, SendError> {
        let retry = Retry::new(self.retry.clone());
        retry
            .run(
                url,
                || {
                    let mut request = self.http.request(method.clone(), url).query(query);
                    if !accept.is_empty() {
                        request = request.header(ACCEPT, accept.join(", "));
                    }
                    if let Some(token) = token {
                        request = request.header(AUTHORIZATION, format!("Bearer {token}"));
                    }
                    async move {
                        let response = request.send().await.map_err(SendError::Transport)?;
                        if is_retryable_status(response.status()) {
                            return Err(SendError::Status(response.status()));
                        }
                        Ok(response)
                    }
                },
                SendError::is_retryable,
            )
            .await
    }

    /// Send a request, answering a bearer challenge once if the registry asks
    async fn request(
        &self,
        method: Method,
        url: &str,
        repository: &str,
        accept: &[&str],
    ) -> Result<Response> {
        self.request_with_query(method, url, &[], repository, accept)
            .await
    }

    async fn request_with_query(
        &self,
        method: Method,
        url: &str,
        query: &[(&str, &str)],
        repository: &str,
        accept: &[&str],
    ) -> Result<Response> {
        let response = self
            .send(&method, url, query, accept, None)
            .await
            .map_err(|e| ProviderError::Registry(format!("{method} {url}: {e}")))?;

        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let challenge = response
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .and_then(BearerChallenge::parse)
            .ok_or_else(|| {
                ProviderError::Registry(format!("{method} {url}: unauthorized without bearer challenge"))
            })?;

        let token = self.fetch_token(&challenge, repository).await?;
        self.send(&method, url, query, accept, Some(&token))
            .await
            .map_err(|e| ProviderError::Registry(format!("{method} {url}: {e}")))
    }

    async fn fetch_token(&self, challenge: &BearerChallenge, repository: &str) -> Result<String> {
        let scope = challenge
            .scope
            .clone()
            .unwrap_or_else(|| format!("repository:{repository}:pull"));
        let mut query = vec![("scope", scope)];
        if let Some(service) = &challenge.service {
            query.push(("service", service.clone()));
        }

        debug!(realm = %challenge.realm, repository, "Requesting anonymous registry token");

        let response = self
            .http
            .get(&challenge.realm)
            .query(&query)
            .send()
            .await?
            .error_for_status()?;
        let token: TokenResponse = response.json().await?;
        token
            .token
            .or(token.access_token)
            .ok_or_else(|| ProviderError::Registry("token response carried no token".to_string()))
    }

    fn manifest_url(reference: &ImageReference, identifier: &str) -> String {
        format!(
            "{}/{}/manifests/{}",
            reference.api_base(),
            reference.repository(),
            identifier
        )
    }
}

#[async_trait]
impl Registry for RegistryClient {
    async fn head_digest(&self, reference: &ImageReference) -> Result<String> {
        let url = Self::manifest_url(reference, reference.identifier());
        let response = self
            .request(Method::HEAD, &url, reference.repository(), MANIFEST_ACCEPT)
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ProviderError::Registry(format!(
                "HEAD {url}: unexpected status {status}"
            )));
        }

        match header_digest(response.headers()) {
            Some(digest) => Ok(digest),
            // Some registries omit the digest header on HEAD; hash the body instead.
            None => Ok(self.manifest(reference).await?.digest),
        }
    }

    async fn manifest(&self, reference: &ImageReference) -> Result<FetchedManifest> {
        let url = Self::manifest_url(reference, reference.identifier());
        let response = self
            .request(Method::GET, &url, reference.repository(), MANIFEST_ACCEPT)
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ProviderError::Registry(format!(
                "GET {url}: unexpected status {status}"
            )));
        }

        let media_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or(v).trim().to_string());
        let bytes = response.bytes().await?.to_vec();
        let digest = sha256_digest(&bytes);

        if let Some(expected) = reference.digest() {
            if expected != digest {
                return Err(ProviderError::Registry(format!(
                    "manifest digest mismatch for {reference}: got {digest}"
                )));
            }
        }

        let media_type = match media_type {
            Some(media_type) => media_type,
            None => serde_json::from_slice::<serde_json::Value>(&bytes)?
                .get("mediaType")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
        };

        Ok(FetchedManifest {
            media_type,
            digest,
            bytes,
        })
    }

    async fn blob(&self, reference: &ImageReference, digest: &str) -> Result<Vec<u8>> {
        let url = format!(
            "{}/{}/blobs/{}",
            reference.api_base(),
            reference.repository(),
            digest
        );
        let response = self
            .request(Method::GET, &url, reference.repository(), &[])
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ProviderError::Registry(format!(
                "GET {url}: unexpected status {status}"
            )));
        }

        let bytes = response.bytes().await?.to_vec();
        let actual = sha256_digest(&bytes);
        if actual != digest {
            return Err(ProviderError::Registry(format!(
                "blob digest mismatch: expected {digest}, got {actual}"
            )));
        }
        Ok(bytes)
    }

    async fn referrers(
        &self,
        repository: &ImageReference,
        subject_digest: &str,
        artifact_type: Option<String>,
    ) -> Result<Vec<Descriptor>> {
        let url = format!(
            "{}/{}/referrers/{}",
            repository.api_base(),
            repository.repository(),
            subject_digest
        );
        let query: Vec<(&str, &str)> = artifact_type
            .as_deref()
            .map(|t| vec![("artifactType", t)])
            .unwrap_or_default();

        let response = self
            .request_with_query(
                Method::GET,
                &url,
                &query,
                repository.repository(),
                &[MEDIA_TYPE_OCI_INDEX],
            )
            .await?;

        let status = response.status();
        let index: ImageIndex = if status.is_success() {
            response.json().await?
        } else if status == StatusCode::NOT_FOUND {
            // Registries without the referrers API keep an index under a
            // digest-derived tag.
            let fallback_tag = subject_digest.replace(':', "-");
            let fallback =
                ImageReference::parse(&format!("{}:{}", repository.name(), fallback_tag))?;
            match self.manifest(&fallback).await {
                Ok(manifest) => serde_json::from_slice(&manifest.bytes)?,
                Err(e) => {
                    debug!(error = %e, subject = subject_digest, "No referrers found");
                    return Ok(Vec::new());
                }
            }
        } else {
            return Err(ProviderError::Registry(format!(
                "GET {url}: unexpected status {status}"
            )));
        };

        // Registries are allowed to ignore the filter.
        Ok(index
            .manifests()
            .iter()
            .filter(|m| artifact_type.as_deref().map_or(true, |t| has_artifact_type(m, t)))
            .cloned()
            .collect())
    }
}

fn header_digest(headers: &HeaderMap) -> Option<String> {
    headers
        .get(DOCKER_CONTENT_DIGEST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// `sha256:<hex>` digest of some bytes
pub fn sha256_digest(bytes: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(bytes)))
}
