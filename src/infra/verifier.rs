//! Image verification: policy lookup, attestation discovery, evaluation
//! and VSA generation.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
#[cfg(test)]
use mockall::automock;
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::domain::{
    ImageReference, Outcome, Parameters, PolicyInput, Statement, Subject, VerificationResult,
    VerifierConfig, INTOTO_STATEMENT_TYPE, VSA_PREDICATE_TYPE,
};
use crate::infra::attestation::{
    Attestation, AttestationResolver, RegistryAttestationResolver, ResolvedImage,
};
use crate::infra::policy::{
    DeclarativeEvaluator, LocalPolicySource, PolicyBundle, PolicyEvaluator, PolicyResolver,
    PolicySource, TufPolicySource,
};
use crate::infra::registry::Registry;
use crate::infra::tuf::{embedded_root, transport_for, TufClient, TufClientOptions};
use crate::infra::{ProviderError, Result, USER_AGENT};

/// Verifies one image against the configured policy.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ImageVerifier: Send + Sync {
    async fn verify(&self, reference: &ImageReference) -> Result<VerificationResult>;
}

/// Builds ready-to-use verifiers.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait VerifierFactory: Send + Sync {
    /// Bootstrap trust and bind policy resolution for `config`
    async fn new_verifier(&self, config: &VerifierConfig) -> Result<Arc<dyn ImageVerifier>>;
}

/// [`VerifierFactory`] backed by TUF-distributed (or local) policy and
/// registry attestations
pub struct AttestVerifierFactory {
    registry: Arc<dyn Registry>,
    evaluator: Arc<dyn PolicyEvaluator>,
}

impl AttestVerifierFactory {
    pub fn new(registry: Arc<dyn Registry>) -> Self {
        Self {
            registry,
            evaluator: Arc::new(DeclarativeEvaluator::new()),
        }
    }

    pub fn with_evaluator(mut self, evaluator: Arc<dyn PolicyEvaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    async fn policy_source(&self, config: &VerifierConfig) -> Result<Box<dyn PolicySource>> {
        if let Some(dir) = &config.policy_source_dir {
            debug!(dir = %dir.display(), "Using local policy directory");
            return Ok(Box::new(LocalPolicySource::new(dir)));
        }

        let transport = transport_for(
            &config.metadata_source,
            &config.targets_source,
            self.registry.clone(),
            USER_AGENT,
        )?;
        let options = TufClientOptions::new(
            embedded_root(config.trust_root),
            config.local_storage_path.join(config.trust_root.as_str()),
        )
        .with_path_prefix(config.update_channel.as_str());

        let client = TufClient::bootstrap(options, transport)
            .await
            .map_err(|e| ProviderError::VerifierUnavailable(e.to_string()))?;
        debug!(
            root = %config.trust_root,
            channel = %config.update_channel,
            client = ?client,
            "TUF client ready"
        );

        Ok(Box::new(TufPolicySource::new(
            Arc::new(client),
            &config.policy_cache_dir,
            config.targets_source.as_str(),
        )))
    }
}

#[async_trait]
impl VerifierFactory for AttestVerifierFactory {
    async fn new_verifier(&self, config: &VerifierConfig) -> Result<Arc<dyn ImageVerifier>> {
        let policy = PolicyResolver::new(self.policy_source(config).await?);
        let attestations = RegistryAttestationResolver::new(
            self.registry.clone(),
            config.attestation_style,
            config.referrers_repo.as_deref(),
            config.platform.clone(),
        )?;
        Ok(Arc::new(AttestVerifier::new(
            policy,
            Arc::new(attestations),
            self.evaluator.clone(),
            config.parameters.clone(),
        )))
    }
}

/// Default [`ImageVerifier`]
pub struct AttestVerifier {
    policy: PolicyResolver,
    attestations: Arc<dyn AttestationResolver>,
    evaluator: Arc<dyn PolicyEvaluator>,
    parameters: Parameters,
}

impl AttestVerifier {
    pub fn new(
        policy: PolicyResolver,
        attestations: Arc<dyn AttestationResolver>,
        evaluator: Arc<dyn PolicyEvaluator>,
        parameters: Parameters,
    ) -> Self {
        Self {
            policy,
            attestations,
            evaluator,
            parameters,
        }
    }

    fn policy_input(&self, image: &ResolvedImage) -> PolicyInput {
        let reference = &image.reference;
        let normalized_name = reference.normalized_name();
        let domain = normalized_name
            .split_once('/')
            .map(|(domain, _)| domain.to_string())
            .unwrap_or_default();
        let familiar_name = reference.familiar_name();
        PolicyInput {
            digest: image.digest.clone(),
            purl: PolicyInput::purl_for(&familiar_name, reference.tag(), &image.platform),
            tag: reference.tag().map(str::to_string),
            is_canonical: reference.is_digest(),
            domain,
            normalized_name,
            familiar_name,
            platform: image.platform.to_string(),
            parameters: self.parameters.clone(),
        }
    }
}

#[async_trait]
impl ImageVerifier for AttestVerifier {
    async fn verify(&self, reference: &ImageReference) -> Result<VerificationResult> {
        let Some(policy) = self.policy.resolve(reference).await? else {
            return Ok(VerificationResult::no_policy(None));
        };

        let image = self.attestations.resolve_image(reference).await?;
        let input = self.policy_input(&image);
        let attestations = self.attestations.attestations(&image).await?;

        let evaluation = self
            .evaluator
            .evaluate(&input, &policy, &attestations)
            .await?;
        let outcome = if evaluation.allowed() {
            Outcome::Success
        } else {
            Outcome::Failure
        };

        info!(
            image = %reference,
            digest = %image.digest,
            policy = %policy.id,
            %outcome,
            violations = evaluation.violations.len(),
            "Image verified"
        );

        Ok(VerificationResult {
            outcome,
            vsa: Some(verification_summary(&input, &policy, &attestations, outcome)),
            input: Some(input),
            violations: evaluation.violations,
        })
    }
}

/// SLSA verification summary for an evaluated image
fn verification_summary(
    input: &PolicyInput,
    policy: &PolicyBundle,
    attestations: &[Attestation],
    outcome: Outcome,
) -> Statement {
    let input_attestations: Vec<serde_json::Value> = attestations
        .iter()
        .map(|a| {
            json!({
                "uri": a.predicate_type(),
                "digest": {"sha256": hex::encode(Sha256::digest(a.envelope.payload.as_bytes()))},
            })
        })
        .collect();

    Statement {
        statement_type: INTOTO_STATEMENT_TYPE.to_string(),
        subject: vec![Subject {
            name: input.purl.clone(),
            digest: BTreeMap::from([(
                "sha256".to_string(),
                input.digest.trim_start_matches("sha256:").to_string(),
            )]),
        }],
        predicate_type: VSA_PREDICATE_TYPE.to_string(),
        predicate: json!({
            "verifier": {"id": USER_AGENT},
            "timeVerified": Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            "resourceUri": input.purl,
            "policy": {
                "uri": format!("{}#{}", policy.uri, policy.id),
                "digest": {"sha256": policy.digest()},
            },
            "inputAttestations": input_attestations,
            "verificationResult": if outcome == Outcome::Success { "PASSED" } else { "FAILED" },
            "verifiedLevels": [],
        }),
    }
}
