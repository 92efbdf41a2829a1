//! Where TUF metadata and targets are downloaded from.
//!
//! Two layouts are supported:
//! - plain HTTP(S) directories, one file per metadata role or target
//! - OCI repositories: metadata is a single image whose layers carry a
//!   `tuf.io/filename` annotation, targets are blobs addressed by digest

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use oci_spec::image::ImageManifest;
use reqwest::StatusCode;
use tokio::sync::OnceCell;
use tracing::debug;

use crate::domain::ImageReference;
use crate::infra::oci::{annotation, ANNOTATION_TUF_FILENAME};
use crate::infra::registry::Registry;
use crate::infra::retry::{is_retryable_status, Retry, RetryConfig};
use crate::infra::{ProviderError, Result};

/// Source of TUF repository files.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MetadataTransport: Send + Sync {
    /// Fetch a metadata file, `None` when the repository does not have it
    async fn fetch_metadata(&self, name: &str) -> Result<Option<Vec<u8>>>;

    /// Fetch a target file by its repository path and sha256 hash
    async fn fetch_target(&self, path: &str, sha256: &str) -> Result<Vec<u8>>;
}

/// Pick a transport for a metadata/targets source pair
pub fn transport_for(
    metadata_source: &str,
    targets_source: &str,
    registry: Arc<dyn Registry>,
    user_agent: &str,
) -> Result<Arc<dyn MetadataTransport>> {
    if is_http_source(metadata_source) {
        Ok(Arc::new(HttpTransport::new(
            metadata_source,
            targets_source,
            user_agent,
        )?))
    } else {
        Ok(Arc::new(OciTransport::new(
            metadata_source,
            targets_source,
            registry,
        )?))
    }
}

fn is_http_source(source: &str) -> bool {
    source.starts_with("http://") || source.starts_with("https://")
}

// ============================================================================
// HTTP
// ============================================================================

pub struct HttpTransport {
    http: reqwest::Client,
    metadata_base: String,
    targets_base: String,
    retry: RetryConfig,
}

impl HttpTransport {
    pub fn new(metadata_base: &str, targets_base: &str, user_agent: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(user_agent)
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| ProviderError::Internal(format!("unable to build http client: {e}")))?;
        Ok(Self {
            http,
            metadata_base: metadata_base.trim_end_matches('/').to_string(),
            targets_base: targets_base.trim_end_matches('/').to_string(),
            retry: RetryConfig::registry(),
        })
    }

    async fn get(&self, url: &str) -> Result<Option<Vec<u8>>> {
        let retry = Retry::new(self.retry.clone());
        let response = retry
            .run(
                url,
                || async {
                    let response = self.http.get(url).send().await?;
                    if is_retryable_status(response.status()) {
                        return Err(ProviderError::Tuf(format!(
                            "GET {url}: unexpected status {}",
                            response.status()
                        )));
                    }
                    Ok(response)
                },
                |_| true,
            )
            .await
            .map_err(|e| ProviderError::Tuf(e.to_string()))?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(Some(
                response
                    .bytes()
                    .await
                    .map_err(|e| ProviderError::Tuf(format!("GET {url}: {e}")))?
                    .to_vec(),
            )),
            status => Err(ProviderError::Tuf(format!(
                "GET {url}: unexpected status {status}"
            ))),
        }
    }
}

#[async_trait]
impl MetadataTransport for HttpTransport {
    async fn fetch_metadata(&self, name: &str) -> Result<Option<Vec<u8>>> {
        self.get(&format!("{}/{}", self.metadata_base, name)).await
    }

    async fn fetch_target(&self, path: &str, _sha256: &str) -> Result<Vec<u8>> {
        let url = format!("{}/{}", self.targets_base, path);
        self.get(&url)
            .await?
            .ok_or_else(|| ProviderError::Tuf(format!("target not found: {url}")))
    }
}

// ============================================================================
// OCI
// ============================================================================

pub struct OciTransport {
    registry: Arc<dyn Registry>,
    metadata: ImageReference,
    targets: ImageReference,
    manifest: OnceCell<ImageManifest>,
}

impl OciTransport {
    pub fn new(
        metadata_source: &str,
        targets_source: &str,
        registry: Arc<dyn Registry>,
    ) -> Result<Self> {
        let metadata = ImageReference::parse(metadata_source)
            .map_err(|e| ProviderError::InvalidConfig(format!("tuf metadata source: {e}")))?;
        let targets = ImageReference::parse(targets_source)
            .map_err(|e| ProviderError::InvalidConfig(format!("tuf targets source: {e}")))?;
        Ok(Self {
            registry,
            metadata,
            targets,
            manifest: OnceCell::new(),
        })
    }

    async fn metadata_manifest(&self) -> Result<&ImageManifest> {
        self.manifest
            .get_or_try_init(|| async {
                debug!(source = %self.metadata, "Fetching TUF metadata manifest");
                let fetched = self.registry.manifest(&self.metadata).await?;
                serde_json::from_slice::<ImageManifest>(&fetched.bytes)
                    .map_err(|e| ProviderError::Tuf(format!("invalid metadata manifest: {e}")))
            })
            .await
    }
}

#[async_trait]
impl MetadataTransport for OciTransport {
    async fn fetch_metadata(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let manifest = self.metadata_manifest().await?;
        let layer = manifest
            .layers()
            .iter()
            .find(|l| annotation(l, ANNOTATION_TUF_FILENAME) == Some(name));
        match layer {
            Some(layer) => Ok(Some(
                self.registry
                    .blob(&self.metadata, &layer.digest().to_string())
                    .await?,
            )),
            None => Ok(None),
        }
    }

    async fn fetch_target(&self, _path: &str, sha256: &str) -> Result<Vec<u8>> {
        self.registry
            .blob(&self.targets, &format!("sha256:{sha256}"))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::oci::MEDIA_TYPE_OCI_MANIFEST;
    use crate::infra::registry::{sha256_digest, FetchedManifest, MockRegistry};
    use serde_json::json;

    fn layer(filename: &str, content: &[u8]) -> serde_json::Value {
        json!({
            "mediaType": "application/vnd.tuf.metadata+json",
            "digest": sha256_digest(content),
            "size": content.len(),
            "annotations": {ANNOTATION_TUF_FILENAME: filename}
        })
    }

    #[tokio::test]
    async fn test_oci_transport_finds_layers_by_filename() {
        let timestamp = br#"{"signed":{}}"#.to_vec();
        let manifest = json!({
            "schemaVersion": 2,
            "mediaType": MEDIA_TYPE_OCI_MANIFEST,
            "config": {
                "mediaType": "application/vnd.oci.empty.v1+json",
                "digest": sha256_digest(b"{}"),
                "size": 2
            },
            "layers": [layer("timestamp.json", &timestamp)]
        });
        let manifest_bytes = serde_json::to_vec(&manifest).unwrap();
        let timestamp_digest = sha256_digest(&timestamp);

        let mut registry = MockRegistry::new();
        registry.expect_manifest().times(1).returning(move |_| {
            Ok(FetchedManifest {
                media_type: MEDIA_TYPE_OCI_MANIFEST.to_string(),
                digest: sha256_digest(&manifest_bytes),
                bytes: manifest_bytes.clone(),
            })
        });
        let expected_digest = timestamp_digest.clone();
        let blob = timestamp.clone();
        registry
            .expect_blob()
            .withf(move |reference, digest| {
                reference.repository() == "docker/tuf-metadata" && digest == expected_digest
            })
            .returning(move |_, _| Ok(blob.clone()));

        let transport = OciTransport::new(
            "docker/tuf-metadata:latest",
            "docker/tuf-targets",
            Arc::new(registry),
        )
        .unwrap();

        assert_eq!(
            transport.fetch_metadata("timestamp.json").await.unwrap(),
            Some(timestamp)
        );
        // manifest is fetched once and reused
        assert_eq!(transport.fetch_metadata("5.root.json").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_oci_transport_fetches_targets_by_hash() {
        let mut registry = MockRegistry::new();
        registry
            .expect_blob()
            .withf(|reference, digest| {
                reference.repository() == "docker/tuf-targets" && digest == sha256_digest(b"policy")
            })
            .returning(|_, _| Ok(b"policy".to_vec()));

        let transport = OciTransport::new(
            "docker/tuf-metadata:latest",
            "docker/tuf-targets",
            Arc::new(registry),
        )
        .unwrap();

        assert_eq!(
            transport
                .fetch_target("policy.yaml", sha256_digest(b"policy").trim_start_matches("sha256:"))
                .await
                .unwrap(),
            b"policy".to_vec()
        );
    }

    #[test]
    fn test_invalid_oci_source_is_config_error() {
        let result = OciTransport::new("Not A Ref", "docker/tuf-targets", Arc::new(MockRegistry::new()));
        assert!(matches!(result, Err(ProviderError::InvalidConfig(_))));
        assert!(is_http_source("https://tuf.example.com/metadata"));
        assert!(!is_http_source("docker/tuf-metadata:latest"));
    }
}
