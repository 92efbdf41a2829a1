//! Verification outcomes and the documents they carry.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{Parameters, Platform};

/// In-toto statement type URI
pub const INTOTO_STATEMENT_TYPE: &str = "https://in-toto.io/Statement/v1";

/// Predicate type of a verification summary attestation
pub const VSA_PREDICATE_TYPE: &str = "https://slsa.dev/verification_summary/v1";

/// Result of evaluating an image against policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Policy evaluated and passed
    Success,
    /// Policy evaluated and denied the image
    Failure,
    /// No policy applies to the image
    NoPolicy,
}

impl Outcome {
    /// Whether the admission controller should admit the image
    pub fn admits(&self) -> bool {
        !matches!(self, Outcome::Failure)
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Success => write!(f, "success"),
            Outcome::Failure => write!(f, "failure"),
            Outcome::NoPolicy => write!(f, "no_policy"),
        }
    }
}

/// A single policy rule violation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    #[serde(rename = "type")]
    pub violation_type: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attestation: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub details: BTreeMap<String, serde_json::Value>,
}

impl Violation {
    pub fn new(violation_type: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            violation_type: violation_type.into(),
            description: description.into(),
            attestation: None,
            details: BTreeMap::new(),
        }
    }
}

/// Facts about the image handed to the policy evaluator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyInput {
    pub digest: String,
    pub purl: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    pub is_canonical: bool,
    pub domain: String,
    pub normalized_name: String,
    pub familiar_name: String,
    pub platform: String,
    #[serde(default)]
    pub parameters: Parameters,
}

impl PolicyInput {
    /// Build a `pkg:docker` package URL for an image
    pub fn purl_for(familiar_name: &str, tag: Option<&str>, platform: &Platform) -> String {
        let version = tag.unwrap_or("latest");
        format!(
            "pkg:docker/{}@{}?platform={}",
            familiar_name,
            version,
            platform.to_string().replace('/', "%2F")
        )
    }
}

/// Subject of an in-toto statement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subject {
    pub name: String,
    pub digest: BTreeMap<String, String>,
}

/// An in-toto statement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Statement {
    #[serde(rename = "_type")]
    pub statement_type: String,
    pub subject: Vec<Subject>,
    #[serde(rename = "predicateType")]
    pub predicate_type: String,
    #[serde(default)]
    pub predicate: serde_json::Value,
}

impl Statement {
    /// Whether any subject carries the given `sha256:<hex>` digest
    pub fn has_subject_digest(&self, digest: &str) -> bool {
        let hex = digest.strip_prefix("sha256:").unwrap_or(digest);
        self.subject
            .iter()
            .any(|s| s.digest.get("sha256").map(String::as_str) == Some(hex))
    }
}

/// Full result of verifying one image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub outcome: Outcome,
    pub input: Option<PolicyInput>,
    pub vsa: Option<Statement>,
    pub violations: Vec<Violation>,
}

impl VerificationResult {
    pub fn no_policy(input: Option<PolicyInput>) -> Self {
        Self {
            outcome: Outcome::NoPolicy,
            input,
            vsa: None,
            violations: Vec::new(),
        }
    }
}
