//! Common test utilities and fixtures for integration tests

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use axum::body::Body;
use axum::extract::{Path as UrlPath, Query, State};
use axum::http::{header, HeaderMap, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use http_body_util::BodyExt;
use serde_json::json;
use sha2::{Digest, Sha256};
use tower::ServiceExt;

use attest_provider::api::router;
use attest_provider::domain::{
    AttestationStyle, Parameters, Platform, TrustRootId, VerificationResult, VerifierConfig,
};
use attest_provider::infra::{
    AttestVerifierFactory, ImageVerifier, ProviderError, Registry, RegistryClient, RetryConfig,
    VerifierFactory, USER_AGENT,
};
use attest_provider::metrics::MetricsRegistry;
use attest_provider::server::AppState;
use attest_provider::ImageReference;

pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";

/// Manifest served for every known repository
pub fn image_manifest() -> Vec<u8> {
    serde_json::to_vec(&json!({
        "schemaVersion": 2,
        "mediaType": OCI_MANIFEST,
        "config": {
            "mediaType": "application/vnd.oci.image.config.v1+json",
            "digest": format!("sha256:{}", "0".repeat(64)),
            "size": 2
        },
        "layers": []
    }))
    .unwrap()
}

pub fn sha256_digest(bytes: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(bytes)))
}

/// Digest of [`image_manifest`]
pub fn image_digest() -> String {
    sha256_digest(&image_manifest())
}

pub const INTOTO_JSON: &str = "application/vnd.in-toto+json";
pub const INTOTO_DSSE: &str = "application/vnd.in-toto+dsse";
pub const SLSA_PROVENANCE: &str = "https://slsa.dev/provenance/v1";
pub const TRUSTED_BUILDER: &str = "https://github.com/actions/runner";
const EMPTY_CONFIG: &str = "application/vnd.oci.empty.v1+json";
const COSIGN_SIGNATURE: &str = "application/vnd.dev.cosign.artifact.sig.v1+json";
const FAKE_TOKEN: &str = "fake-registry-token";

/// SLSA provenance statement for `subject_digest`, built by [`TRUSTED_BUILDER`]
pub fn provenance_statement(subject_digest: &str) -> serde_json::Value {
    json!({
        "_type": "https://in-toto.io/Statement/v1",
        "subject": [{
            "name": "app",
            "digest": {"sha256": subject_digest.trim_start_matches("sha256:")}
        }],
        "predicateType": SLSA_PROVENANCE,
        "predicate": {"runDetails": {"builder": {"id": TRUSTED_BUILDER}}}
    })
}

/// How a [`FakeRegistry`] behaves
#[derive(Debug, Clone, Copy)]
pub struct RegistryOptions {
    /// Serve `/referrers/`; otherwise answer 404 like older registries
    pub referrers_api: bool,
    /// Demand an anonymous bearer token from `/token`
    pub require_token: bool,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        Self {
            referrers_api: true,
            require_token: false,
        }
    }
}

#[derive(Default)]
struct RegistryContents {
    /// (repository, tag or digest) -> (media type, body)
    manifests: HashMap<(String, String), (String, Vec<u8>)>,
    blobs: HashMap<String, Vec<u8>>,
    /// (repository, subject digest) -> descriptors
    referrers: HashMap<(String, String), Vec<serde_json::Value>>,
    artifact_type_queries: Vec<String>,
    tokens_issued: usize,
}

struct RegistryState {
    addr: SocketAddr,
    options: RegistryOptions,
    contents: Mutex<RegistryContents>,
}

impl RegistryState {
    fn challenge(&self, repository: &str) -> Response {
        let challenge = format!(
            r#"Bearer realm="http://{}/token",service="fake-registry",scope="repository:{repository}:pull""#,
            self.addr
        );
        (
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, challenge)],
        )
            .into_response()
    }
}

fn manifest_response(media_type: &str, bytes: Vec<u8>) -> Response {
    (
        [
            (header::CONTENT_TYPE, media_type.to_string()),
            (
                header::HeaderName::from_static("docker-content-digest"),
                sha256_digest(&bytes),
            ),
        ],
        bytes,
    )
        .into_response()
}

fn index_bytes(descriptors: Vec<serde_json::Value>) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "schemaVersion": 2,
        "mediaType": OCI_INDEX,
        "manifests": descriptors
    }))
    .unwrap()
}

async fn issue_token(State(state): State<Arc<RegistryState>>) -> Response {
    state.contents.lock().unwrap().tokens_issued += 1;
    axum::Json(json!({"token": FAKE_TOKEN})).into_response()
}

async fn serve_registry(
    State(state): State<Arc<RegistryState>>,
    UrlPath(rest): UrlPath<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    let (repository, kind, reference) = match ["/manifests/", "/blobs/", "/referrers/"]
        .iter()
        .find_map(|kind| rest.split_once(*kind).map(|(repo, r)| (repo, *kind, r)))
    {
        Some(parts) => parts,
        None => return StatusCode::NOT_FOUND.into_response(),
    };

    if state.options.require_token {
        let expected = format!("Bearer {FAKE_TOKEN}");
        let authorized = headers
            .get(header::AUTHORIZATION)
            .is_some_and(|v| v.to_str().ok() == Some(expected.as_str()));
        if !authorized {
            return state.challenge(repository);
        }
    }
    if repository == "missing" {
        return StatusCode::NOT_FOUND.into_response();
    }

    let mut contents = state.contents.lock().unwrap();
    match kind {
        "/referrers/" => {
            if !state.options.referrers_api {
                return StatusCode::NOT_FOUND.into_response();
            }
            let artifact_type = query.get("artifactType").cloned();
            if let Some(requested) = &artifact_type {
                contents.artifact_type_queries.push(requested.clone());
            }
            let descriptors = contents
                .referrers
                .get(&(repository.to_string(), reference.to_string()))
                .cloned()
                .unwrap_or_default()
                .into_iter()
                .filter(|d| {
                    artifact_type
                        .as_deref()
                        .map_or(true, |t| d["artifactType"] == t)
                })
                .collect();
            ([(header::CONTENT_TYPE, OCI_INDEX)], index_bytes(descriptors)).into_response()
        }
        "/blobs/" => match contents.blobs.get(reference) {
            Some(blob) => blob.clone().into_response(),
            None => StatusCode::NOT_FOUND.into_response(),
        },
        _ => {
            let key = (repository.to_string(), reference.to_string());
            if let Some((media_type, bytes)) = contents.manifests.get(&key) {
                return manifest_response(media_type, bytes.clone());
            }
            // Plain tags and the default manifest digest resolve for any repository.
            let is_tag = !reference.starts_with("sha256");
            if is_tag || reference == image_digest() {
                manifest_response(OCI_MANIFEST, image_manifest())
            } else {
                StatusCode::NOT_FOUND.into_response()
            }
        }
    }
}

/// OCI registry on loopback.
///
/// Every repository except `missing` serves the same single-platform
/// manifest for any tag; attestations are added per test.
pub struct FakeRegistry {
    pub addr: SocketAddr,
    state: Arc<RegistryState>,
    handle: tokio::task::JoinHandle<()>,
}

impl FakeRegistry {
    pub async fn start() -> Self {
        Self::start_with(RegistryOptions::default()).await
    }

    pub async fn start_with(options: RegistryOptions) -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(RegistryState {
            addr,
            options,
            contents: Mutex::new(RegistryContents::default()),
        });
        let app = Router::new()
            .route("/token", get(issue_token))
            .route("/v2/*rest", get(serve_registry))
            .with_state(state.clone());
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self {
            addr,
            state,
            handle,
        }
    }

    /// `host:port/repository:tag` on this registry
    pub fn image(&self, repository: &str, tag: &str) -> String {
        format!("{}/{repository}:{tag}", self.addr)
    }

    /// Store a manifest under `reference` and under its own digest
    pub fn put_manifest(
        &self,
        repository: &str,
        reference: &str,
        media_type: &str,
        bytes: Vec<u8>,
    ) -> String {
        let digest = sha256_digest(&bytes);
        let mut contents = self.state.contents.lock().unwrap();
        for key in [reference.to_string(), digest.clone()] {
            contents.manifests.insert(
                (repository.to_string(), key),
                (media_type.to_string(), bytes.clone()),
            );
        }
        digest
    }

    fn put_blob(&self, bytes: Vec<u8>) -> (String, usize) {
        let digest = sha256_digest(&bytes);
        let size = bytes.len();
        self.state.contents.lock().unwrap().blobs.insert(digest.clone(), bytes);
        (digest, size)
    }

    /// Push a signed DSSE attestation manifest for `subject`, returning its
    /// digest and size
    fn push_attestation(
        &self,
        repository: &str,
        subject: &str,
        statement: &serde_json::Value,
    ) -> (String, usize) {
        let envelope = json!({
            "payloadType": INTOTO_JSON,
            "payload": base64::engine::general_purpose::STANDARD.encode(statement.to_string()),
            "signatures": [{"keyid": "builder", "sig": "c2lnbmF0dXJl"}]
        });
        let (layer_digest, layer_size) = self.put_blob(serde_json::to_vec(&envelope).unwrap());
        let (config_digest, config_size) = self.put_blob(b"{}".to_vec());
        let manifest = serde_json::to_vec(&json!({
            "schemaVersion": 2,
            "mediaType": OCI_MANIFEST,
            "artifactType": INTOTO_JSON,
            "config": {"mediaType": EMPTY_CONFIG, "digest": config_digest, "size": config_size},
            "layers": [{
                "mediaType": INTOTO_DSSE,
                "digest": layer_digest,
                "size": layer_size,
                "annotations": {"in-toto.io/predicate-type": statement["predicateType"]}
            }],
            "subject": {"mediaType": OCI_MANIFEST, "digest": subject, "size": image_manifest().len()}
        }))
        .unwrap();
        let size = manifest.len();
        let digest = self.put_manifest(repository, &sha256_digest(&manifest), OCI_MANIFEST, manifest);
        (digest, size)
    }

    /// Publish `statement` as a referrer of `subject`, next to a cosign
    /// signature whose manifest the registry does not have.
    ///
    /// Without the referrers API the index lands under the `sha256-<hex>` tag.
    pub fn attach_referrer(&self, repository: &str, subject: &str, statement: &serde_json::Value) {
        let (digest, size) = self.push_attestation(repository, subject, statement);
        let descriptors = vec![
            json!({
                "mediaType": OCI_MANIFEST,
                "digest": digest,
                "size": size,
                "artifactType": INTOTO_JSON
            }),
            json!({
                "mediaType": OCI_MANIFEST,
                "digest": sha256_digest(b"unpublished signature"),
                "size": 1,
                "artifactType": COSIGN_SIGNATURE
            }),
        ];

        if self.state.options.referrers_api {
            self.state
                .contents
                .lock()
                .unwrap()
                .referrers
                .insert((repository.to_string(), subject.to_string()), descriptors);
        } else {
            self.put_manifest(
                repository,
                &subject.replace(':', "-"),
                OCI_INDEX,
                index_bytes(descriptors),
            );
        }
    }

    /// Serve `repository:tag` as an index holding the default manifest
    /// for linux/amd64 plus an attestation manifest describing it.
    pub fn attach_to_index(&self, repository: &str, tag: &str, statement: &serde_json::Value) {
        let subject = image_digest();
        let (digest, size) = self.push_attestation(repository, &subject, statement);
        let index = index_bytes(vec![
            json!({
                "mediaType": OCI_MANIFEST,
                "digest": subject,
                "size": image_manifest().len(),
                "platform": {"os": "linux", "architecture": "amd64"}
            }),
            json!({
                "mediaType": OCI_MANIFEST,
                "digest": digest,
                "size": size,
                "platform": {"os": "unknown", "architecture": "unknown"},
                "annotations": {
                    "vnd.docker.reference.type": "attestation-manifest",
                    "vnd.docker.reference.digest": subject
                }
            }),
        ]);
        self.put_manifest(repository, tag, OCI_INDEX, index);
    }

    /// Decoded `artifactType` values received on `/referrers/`
    pub fn artifact_type_queries(&self) -> Vec<String> {
        self.state.contents.lock().unwrap().artifact_type_queries.clone()
    }

    pub fn tokens_issued(&self) -> usize {
        self.state.contents.lock().unwrap().tokens_issued
    }
}

impl Drop for FakeRegistry {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Registry client pointed at loopback, without retries
pub fn registry_client() -> Arc<dyn Registry> {
    Arc::new(
        RegistryClient::new(USER_AGENT)
            .unwrap()
            .with_retry(RetryConfig::fast().with_max_retries(0)),
    )
}

/// Local policy directory mapping `repository` to `policy_yaml`
pub fn policy_dir(repository: &str, policy_yaml: &str) -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("mapping.yaml"),
        format!(
            r#"version: v1
policies:
  - id: {repository}
    description: test policy
    files:
      - path: policy.yaml
rules:
  - pattern: "/{repository}$"
    policy-id: {repository}
"#
        ),
    )
    .unwrap();
    std::fs::write(dir.path().join("policy.yaml"), policy_yaml).unwrap();
    dir
}

pub fn verifier_config(policy_dir: Option<&Path>, storage: &Path) -> VerifierConfig {
    VerifierConfig {
        trust_root: TrustRootId::Dev,
        update_channel: String::new(),
        metadata_source: "http://127.0.0.1:9/metadata".to_string(),
        targets_source: "http://127.0.0.1:9/targets".to_string(),
        local_storage_path: storage.join("tuf"),
        policy_source_dir: policy_dir.map(Path::to_path_buf),
        policy_cache_dir: storage.join("policy"),
        attestation_style: AttestationStyle::Referrers,
        referrers_repo: None,
        parameters: Parameters::new(),
        platform: Platform::default(),
    }
}

pub fn app_state(
    config: VerifierConfig,
    factory: Arc<dyn VerifierFactory>,
    registry: Arc<dyn Registry>,
    handler_timeout: Duration,
) -> AppState {
    AppState {
        verifier_config: Arc::new(config),
        verifier_factory: factory,
        registry,
        metrics: Arc::new(MetricsRegistry::new()),
        handler_timeout,
    }
}

/// State backed by the real verifier factory with a local policy dir
pub fn attest_state(policy_dir: &Path, storage: &Path) -> AppState {
    attest_state_for(verifier_config(Some(policy_dir), storage))
}

pub fn attest_state_for(config: VerifierConfig) -> AppState {
    let registry = registry_client();
    app_state(
        config,
        Arc::new(AttestVerifierFactory::new(registry.clone())),
        registry,
        Duration::from_secs(10),
    )
}

/// Verifier that admits everything without a policy
pub struct AdmitAll;

#[async_trait]
impl ImageVerifier for AdmitAll {
    async fn verify(&self, _reference: &ImageReference) -> attest_provider::Result<VerificationResult> {
        Ok(VerificationResult::no_policy(None))
    }
}

/// Factory whose verifiers never finish in time
pub struct SlowFactory(pub Duration);

#[async_trait]
impl VerifierFactory for SlowFactory {
    async fn new_verifier(
        &self,
        _config: &VerifierConfig,
    ) -> attest_provider::Result<Arc<dyn ImageVerifier>> {
        tokio::time::sleep(self.0).await;
        Ok(Arc::new(AdmitAll))
    }
}

/// Factory that panics while building
pub struct PanicFactory;

#[async_trait]
impl VerifierFactory for PanicFactory {
    async fn new_verifier(
        &self,
        _config: &VerifierConfig,
    ) -> attest_provider::Result<Arc<dyn ImageVerifier>> {
        panic!("verifier construction exploded")
    }
}

/// Factory that always fails to bootstrap trust
pub struct UnavailableFactory;

#[async_trait]
impl VerifierFactory for UnavailableFactory {
    async fn new_verifier(
        &self,
        _config: &VerifierConfig,
    ) -> attest_provider::Result<Arc<dyn ImageVerifier>> {
        Err(ProviderError::VerifierUnavailable(
            "tuf error: unable to fetch timestamp.json".to_string(),
        ))
    }
}

/// Factory producing [`AdmitAll`] verifiers
pub struct AdmitAllFactory;

#[async_trait]
impl VerifierFactory for AdmitAllFactory {
    async fn new_verifier(
        &self,
        _config: &VerifierConfig,
    ) -> attest_provider::Result<Arc<dyn ImageVerifier>> {
        Ok(Arc::new(AdmitAll))
    }
}

/// Gatekeeper request body for `keys`
pub fn provider_request(keys: &[&str]) -> String {
    json!({
        "apiVersion": "externaldata.gatekeeper.sh/v1beta1",
        "kind": "ProviderRequest",
        "request": {"keys": keys}
    })
    .to_string()
}

/// POST `body` to `uri` and decode the JSON envelope
pub async fn post_json(state: AppState, uri: &str, body: String) -> (StatusCode, serde_json::Value) {
    let response = router(state)
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(uri)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .map(|v| v.to_str().unwrap().to_string());
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(content_type.as_deref(), Some("application/json"));
    (status, serde_json::from_slice(&bytes).unwrap())
}

/// GET `uri`, returning status and body text
pub async fn get_text(state: AppState, uri: &str) -> (StatusCode, String) {
    let response = router(state)
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, String::from_utf8(bytes.to_vec()).unwrap())
}
