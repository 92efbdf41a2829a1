//! Policy evaluation.
//!
//! [`DeclarativeEvaluator`] understands `policy.yaml` documents:
//!
//! ```yaml
//! required-parameters: [environment]
//! rules:
//!   - predicate-type: https://slsa.dev/provenance/v1
//!     require-signed: true
//!     builder-ids: ["https://github.com/actions/runner"]
//!   - predicate-type: https://spdx.dev/Document
//!     when-parameter: require-sbom
//! ```
//!
//! A rule with `when-parameter` is only enforced when that parameter is
//! set to `true`.

use std::collections::BTreeMap;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde::Deserialize;

use crate::domain::{PolicyInput, Violation};
use crate::infra::attestation::Attestation;
use crate::infra::policy::resolver::PolicyBundle;
use crate::infra::{ProviderError, Result};

pub const VIOLATION_MISSING_ATTESTATION: &str = "missing_attestation";
pub const VIOLATION_UNSIGNED_ATTESTATION: &str = "unsigned_attestation";
pub const VIOLATION_UNTRUSTED_BUILDER: &str = "untrusted_builder";
pub const VIOLATION_MISSING_PARAMETER: &str = "missing_parameter";

/// Outcome of evaluating one policy
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Evaluation {
    pub violations: Vec<Violation>,
}

impl Evaluation {
    pub fn allowed(&self) -> bool {
        self.violations.is_empty()
    }
}

/// Evaluates an image's attestations against a policy bundle.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PolicyEvaluator: Send + Sync {
    async fn evaluate(
        &self,
        input: &PolicyInput,
        policy: &PolicyBundle,
        attestations: &[Attestation],
    ) -> Result<Evaluation>;
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct PolicyDocument {
    #[serde(default)]
    required_parameters: Vec<String>,
    #[serde(default)]
    rules: Vec<PolicyRule>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct PolicyRule {
    predicate_type: String,
    #[serde(default)]
    require_signed: bool,
    #[serde(default)]
    builder_ids: Vec<String>,
    #[serde(default)]
    when_parameter: Option<String>,
}

/// Built-in evaluator for `policy.yaml` documents
#[derive(Debug, Clone, Default)]
pub struct DeclarativeEvaluator;

impl DeclarativeEvaluator {
    pub fn new() -> Self {
        Self
    }

    fn documents(policy: &PolicyBundle) -> Result<Vec<PolicyDocument>> {
        let mut documents = Vec::new();
        for file in &policy.files {
            if file.path.ends_with(".yaml") || file.path.ends_with(".yml") {
                let document = serde_yaml::from_slice(&file.content).map_err(|e| {
                    ProviderError::EvaluationFailed(format!(
                        "policy {}: invalid {}: {e}",
                        policy.id, file.path
                    ))
                })?;
                documents.push(document);
            }
        }
        if documents.is_empty() {
            return Err(ProviderError::EvaluationFailed(format!(
                "policy {} has no declarative policy files",
                policy.id
            )));
        }
        Ok(documents)
    }
}

#[async_trait]
impl PolicyEvaluator for DeclarativeEvaluator {
    async fn evaluate(
        &self,
        input: &PolicyInput,
        policy: &PolicyBundle,
        attestations: &[Attestation],
    ) -> Result<Evaluation> {
        let mut violations = Vec::new();

        for document in Self::documents(policy)? {
            for name in &document.required_parameters {
                if !input.parameters.contains_key(name) {
                    let mut violation = Violation::new(
                        VIOLATION_MISSING_PARAMETER,
                        format!("policy parameter {name} is not set"),
                    );
                    violation
                        .details
                        .insert("parameter".to_string(), name.clone().into());
                    violations.push(violation);
                }
            }

            for rule in &document.rules {
                if let Some(parameter) = &rule.when_parameter {
                    if input.parameters.get(parameter).map(String::as_str) != Some("true") {
                        continue;
                    }
                }
                violations.extend(check_rule(rule, &input.digest, attestations));
            }
        }

        Ok(Evaluation { violations })
    }
}

fn check_rule(rule: &PolicyRule, digest: &str, attestations: &[Attestation]) -> Option<Violation> {
    let candidates: Vec<&Attestation> = attestations
        .iter()
        .filter(|a| a.predicate_type() == rule.predicate_type)
        .filter(|a| a.statement.has_subject_digest(digest))
        .collect();

    if candidates.is_empty() {
        return Some(rule_violation(
            rule,
            VIOLATION_MISSING_ATTESTATION,
            format!("no {} attestation for {digest}", rule.predicate_type),
        ));
    }

    let candidates: Vec<&Attestation> = if rule.require_signed {
        candidates.into_iter().filter(|a| a.envelope.is_signed()).collect()
    } else {
        candidates
    };
    if candidates.is_empty() {
        return Some(rule_violation(
            rule,
            VIOLATION_UNSIGNED_ATTESTATION,
            format!("{} attestation is not signed", rule.predicate_type),
        ));
    }

    if rule.builder_ids.is_empty() {
        return None;
    }
    let trusted = candidates.iter().any(|a| {
        builder_id(&a.statement.predicate).is_some_and(|id| rule.builder_ids.iter().any(|b| b == id))
    });
    if trusted {
        return None;
    }

    let found: Vec<&str> = candidates
        .iter()
        .filter_map(|a| builder_id(&a.statement.predicate))
        .collect();
    let mut violation = rule_violation(
        rule,
        VIOLATION_UNTRUSTED_BUILDER,
        format!(
            "{} attestation built by untrusted builder {}",
            rule.predicate_type,
            if found.is_empty() {
                "(none)".to_string()
            } else {
                found.join(", ")
            }
        ),
    );
    if let Some(attestation) = candidates.first() {
        violation.attestation = serde_json::to_value(&attestation.statement).ok();
    }
    Some(violation)
}

fn rule_violation(rule: &PolicyRule, kind: &str, description: String) -> Violation {
    let mut violation = Violation::new(kind, description);
    violation.details = BTreeMap::from([(
        "predicateType".to_string(),
        serde_json::Value::from(rule.predicate_type.clone()),
    )]);
    violation
}

/// Builder id from SLSA provenance v1 or v0.2
fn builder_id(predicate: &serde_json::Value) -> Option<&str> {
    predicate
        .pointer("/runDetails/builder/id")
        .or_else(|| predicate.pointer("/builder/id"))
        .and_then(|v| v.as_str())
}
