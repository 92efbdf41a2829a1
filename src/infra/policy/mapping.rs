//! `mapping.yaml`: which policy applies to which image.
//!
//! ```yaml
//! version: v1
//! kind: policy-mapping
//! policies:
//!   - id: docker-official-images
//!     description: Docker Official Images
//!     files:
//!       - path: doi/policy.yaml
//! rules:
//!   - pattern: "^docker[.]io/library/.*$"
//!     policy-id: docker-official-images
//!   - pattern: "^mirror[.]example[.]com/library/(.*)$"
//!     rewrite: docker.io/library/$1
//! ```
//!
//! Rules are tried in order against the normalized image name. A rewrite
//! rule replaces the name and matching restarts from the first rule.

use regex::Regex;
use serde::Deserialize;

use crate::infra::{ProviderError, Result};

/// Name of the mapping file at the root of a policy source
pub const MAPPING_FILE: &str = "mapping.yaml";

const MAX_REWRITES: usize = 10;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct RawMappings {
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    policies: Vec<PolicyMapping>,
    #[serde(default)]
    rules: Vec<RawRule>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct RawRule {
    pattern: String,
    #[serde(default)]
    policy_id: Option<String>,
    #[serde(default)]
    rewrite: Option<String>,
}

/// A policy declared in the mapping file
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PolicyMapping {
    pub id: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub files: Vec<PolicyFileRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PolicyFileRef {
    pub path: String,
}

#[derive(Debug, Clone)]
enum RuleAction {
    Policy(String),
    Rewrite(String),
}

#[derive(Debug, Clone)]
struct Rule {
    pattern: Regex,
    action: RuleAction,
}

/// Parsed and validated policy mappings
#[derive(Debug, Clone)]
pub struct PolicyMappings {
    policies: Vec<PolicyMapping>,
    rules: Vec<Rule>,
}

/// Policy chosen for an image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyMatch {
    pub policy: PolicyMapping,
    /// Image name after rewrites
    pub matched_name: String,
}

impl PolicyMappings {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let raw: RawMappings = serde_yaml::from_slice(bytes)
            .map_err(|e| ProviderError::Policy(format!("invalid {MAPPING_FILE}: {e}")))?;

        if let Some(version) = &raw.version {
            if version != "v1" {
                return Err(ProviderError::Policy(format!(
                    "unsupported {MAPPING_FILE} version {version}"
                )));
            }
        }

        let mut rules = Vec::with_capacity(raw.rules.len());
        for rule in raw.rules {
            let pattern = Regex::new(&rule.pattern).map_err(|e| {
                ProviderError::Policy(format!("invalid pattern {:?}: {e}", rule.pattern))
            })?;
            let action = match (rule.policy_id, rule.rewrite) {
                (Some(id), None) => {
                    if !raw.policies.iter().any(|p| p.id == id) {
                        return Err(ProviderError::Policy(format!(
                            "rule {:?} references unknown policy {id}",
                            rule.pattern
                        )));
                    }
                    RuleAction::Policy(id)
                }
                (None, Some(rewrite)) => RuleAction::Rewrite(rewrite),
                _ => {
                    return Err(ProviderError::Policy(format!(
                        "rule {:?} needs exactly one of policy-id or rewrite",
                        rule.pattern
                    )))
                }
            };
            rules.push(Rule { pattern, action });
        }

        Ok(Self {
            policies: raw.policies,
            rules,
        })
    }

    /// Find the policy for an image name, `None` when no rule matches
    pub fn find_policy(&self, image_name: &str) -> Result<Option<PolicyMatch>> {
        let mut name = image_name.to_string();
        for _ in 0..=MAX_REWRITES {
            let Some(rule) = self.rules.iter().find(|r| r.pattern.is_match(&name)) else {
                return Ok(None);
            };
            match &rule.action {
                RuleAction::Policy(id) => {
                    let policy = self
                        .policies
                        .iter()
                        .find(|p| &p.id == id)
                        .cloned()
                        .ok_or_else(|| ProviderError::Policy(format!("unknown policy {id}")))?;
                    return Ok(Some(PolicyMatch {
                        policy,
                        matched_name: name,
                    }));
                }
                RuleAction::Rewrite(replacement) => {
                    name = rule
                        .pattern
                        .replace(&name, replacement.as_str())
                        .into_owned();
                }
            }
        }
        Err(ProviderError::Policy(format!(
            "too many rewrites for {image_name}"
        )))
    }
}
