//! Attestation discovery.
//!
//! Locates in-toto attestations for an image either through the registry
//! referrers API or through attestation manifests attached to the image
//! index, and decodes them into [`Attestation`]s.

use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
#[cfg(test)]
use mockall::automock;
use oci_spec::image::{ImageIndex, ImageManifest};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::domain::{AttestationStyle, ImageReference, Platform, Statement};
use crate::infra::oci::{
    annotation, attestation_manifest_for, is_index_media_type, manifest_for,
    ANNOTATION_PREDICATE_TYPE, MEDIA_TYPE_INTOTO,
};
use crate::infra::registry::Registry;
use crate::infra::{ProviderError, Result};

/// DSSE envelope signature
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeSignature {
    #[serde(default)]
    pub keyid: String,
    pub sig: String,
}

/// DSSE envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub payload_type: String,
    /// Base64-encoded payload
    pub payload: String,
    #[serde(default)]
    pub signatures: Vec<EnvelopeSignature>,
}

impl Envelope {
    /// Wrap an unsigned in-toto statement
    pub fn unsigned(payload: &[u8]) -> Self {
        Self {
            payload_type: MEDIA_TYPE_INTOTO.to_string(),
            payload: base64::engine::general_purpose::STANDARD.encode(payload),
            signatures: Vec::new(),
        }
    }

    /// Decode the payload as an in-toto statement
    pub fn statement(&self) -> Result<Statement> {
        let payload = base64::engine::general_purpose::STANDARD
            .decode(self.payload.trim())
            .map_err(|e| ProviderError::EvaluationFailed(format!("invalid envelope payload: {e}")))?;
        Ok(serde_json::from_slice(&payload)?)
    }

    pub fn is_signed(&self) -> bool {
        !self.signatures.is_empty()
    }
}

/// An attestation found for an image
#[derive(Debug, Clone, PartialEq)]
pub struct Attestation {
    pub media_type: String,
    pub envelope: Envelope,
    pub statement: Statement,
}

impl Attestation {
    pub fn predicate_type(&self) -> &str {
        &self.statement.predicate_type
    }
}

/// An image resolved to the platform manifest that attestations refer to
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedImage {
    pub reference: ImageReference,
    /// Digest of the platform-specific manifest
    pub digest: String,
    /// Digest of the manifest the reference points at (index or manifest)
    pub root_digest: String,
    pub platform: Platform,
    index: Option<ImageIndex>,
}

impl ResolvedImage {
    pub fn new(reference: ImageReference, digest: impl Into<String>, platform: Platform) -> Self {
        let digest = digest.into();
        Self {
            reference,
            root_digest: digest.clone(),
            digest,
            platform,
            index: None,
        }
    }
}

/// Finds attestations for images.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AttestationResolver: Send + Sync {
    /// Resolve the reference to its platform manifest
    async fn resolve_image(&self, reference: &ImageReference) -> Result<ResolvedImage>;

    /// Fetch every attestation published for the image
    async fn attestations(&self, image: &ResolvedImage) -> Result<Vec<Attestation>>;
}

/// [`AttestationResolver`] backed by a [`Registry`]
pub struct RegistryAttestationResolver {
    registry: Arc<dyn Registry>,
    style: AttestationStyle,
    referrers_repo: Option<ImageReference>,
    platform: Platform,
}

impl RegistryAttestationResolver {
    pub fn new(
        registry: Arc<dyn Registry>,
        style: AttestationStyle,
        referrers_repo: Option<&str>,
        platform: Platform,
    ) -> Result<Self> {
        let referrers_repo = referrers_repo
            .filter(|repo| !repo.is_empty())
            .map(|repo| {
                ImageReference::parse(repo).map_err(|e| {
                    ProviderError::InvalidConfig(format!("invalid referrers repository: {e}"))
                })
            })
            .transpose()?;
        Ok(Self {
            registry,
            style,
            referrers_repo,
            platform,
        })
    }

    async fn attached(&self, image: &ResolvedImage) -> Result<Vec<Attestation>> {
        let Some(index) = &image.index else {
            debug!(image = %image.reference, "Image is not an index; no attached attestations");
            return Ok(Vec::new());
        };
        let Some(descriptor) = attestation_manifest_for(index, &image.digest) else {
            return Ok(Vec::new());
        };
        let repo = &image.reference;
        self.from_manifest(repo, &descriptor.digest().to_string())
            .await
    }

    async fn referrers(&self, image: &ResolvedImage) -> Result<Vec<Attestation>> {
        let repo = self.referrers_repo.as_ref().unwrap_or(&image.reference);
        let referrers = self
            .registry
            .referrers(repo, &image.digest, Some(MEDIA_TYPE_INTOTO.to_string()))
            .await?;

        let mut attestations = Vec::new();
        for descriptor in &referrers {
            attestations.extend(
                self.from_manifest(repo, &descriptor.digest().to_string())
                    .await?,
            );
        }
        Ok(attestations)
    }

    /// Decode every in-toto layer of an attestation manifest
    async fn from_manifest(
        &self,
        repo: &ImageReference,
        manifest_digest: &str,
    ) -> Result<Vec<Attestation>> {
        let reference = ImageReference::parse(&repo.with_digest(manifest_digest))?;
        let fetched = self.registry.manifest(&reference).await?;
        let manifest: ImageManifest = serde_json::from_slice(&fetched.bytes)?;

        let mut attestations = Vec::new();
        for layer in manifest.layers() {
            let media_type = layer.media_type().to_string();
            if !media_type.starts_with("application/vnd.in-toto") {
                continue;
            }
            let layer_digest = layer.digest().to_string();
            let bytes = self.registry.blob(&reference, &layer_digest).await?;
            let envelope = if media_type.ends_with("+dsse") {
                serde_json::from_slice::<Envelope>(&bytes)?
            } else {
                Envelope::unsigned(&bytes)
            };
            let statement = envelope.statement()?;

            if let Some(annotated) = annotation(layer, ANNOTATION_PREDICATE_TYPE) {
                if annotated != statement.predicate_type {
                    return Err(ProviderError::EvaluationFailed(format!(
                        "predicate type mismatch in layer {layer_digest}: annotated {annotated}, statement {}",
                        statement.predicate_type
                    )));
                }
            }

            attestations.push(Attestation {
                media_type,
                envelope,
                statement,
            });
        }
        Ok(attestations)
    }
}

#[async_trait]
impl AttestationResolver for RegistryAttestationResolver {
    async fn resolve_image(&self, reference: &ImageReference) -> Result<ResolvedImage> {
        let fetched = self.registry.manifest(reference).await?;

        if !is_index_media_type(&fetched.media_type) {
            return Ok(ResolvedImage::new(
                reference.clone(),
                fetched.digest,
                self.platform.clone(),
            ));
        }

        let index: ImageIndex = serde_json::from_slice(&fetched.bytes)?;
        let digest = manifest_for(&index, &self.platform)
            .map(|descriptor| descriptor.digest().to_string())
            .ok_or_else(|| {
                ProviderError::EvaluationFailed(format!(
                    "no manifest for platform {} in {reference}",
                    self.platform
                ))
            })?;

        Ok(ResolvedImage {
            reference: reference.clone(),
            digest,
            root_digest: fetched.digest,
            platform: self.platform.clone(),
            index: Some(index),
        })
    }

    async fn attestations(&self, image: &ResolvedImage) -> Result<Vec<Attestation>> {
        let attestations = match self.style {
            AttestationStyle::Attached => self.attached(image).await?,
            AttestationStyle::Referrers => self.referrers(image).await?,
        };
        debug!(
            image = %image.reference,
            digest = %image.digest,
            style = %self.style,
            count = attestations.len(),
            "Discovered attestations"
        );
        Ok(attestations)
    }
}
