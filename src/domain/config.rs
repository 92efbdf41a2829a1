//! Verifier configuration captured once at service start.
//!
//! A [`VerifierConfig`] is built from the command line, wrapped in an `Arc`
//! and shared read-only by every request.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::infra::ProviderError;

/// Policy parameters passed opaquely into policy evaluation
pub type Parameters = BTreeMap<String, String>;

/// Identity of the embedded TUF root the verifier bootstraps from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustRootId {
    Dev,
    Staging,
    Prod,
}

impl TrustRootId {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrustRootId::Dev => "dev",
            TrustRootId::Staging => "staging",
            TrustRootId::Prod => "prod",
        }
    }
}

impl FromStr for TrustRootId {
    type Err = ProviderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dev" => Ok(TrustRootId::Dev),
            "staging" => Ok(TrustRootId::Staging),
            "prod" => Ok(TrustRootId::Prod),
            other => Err(ProviderError::InvalidConfig(format!(
                "invalid tuf root: {other:?}, expected one of [dev, staging, prod]"
            ))),
        }
    }
}

impl fmt::Display for TrustRootId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How attestations are located relative to the image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttestationStyle {
    /// Registry-native referrers index keyed by subject digest
    Referrers,
    /// Attestation manifests attached to the image index
    Attached,
}

impl FromStr for AttestationStyle {
    type Err = ProviderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "referrers" => Ok(AttestationStyle::Referrers),
            "attached" => Ok(AttestationStyle::Attached),
            other => Err(ProviderError::InvalidConfig(format!(
                "invalid attestation style: {other:?}, expected one of [referrers, attached]"
            ))),
        }
    }
}

impl fmt::Display for AttestationStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttestationStyle::Referrers => f.write_str("referrers"),
            AttestationStyle::Attached => f.write_str("attached"),
        }
    }
}

/// Target platform used to pick a manifest out of an image index
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Platform {
    pub os: String,
    pub architecture: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

impl Platform {
    pub fn linux_amd64() -> Self {
        Self {
            os: "linux".to_string(),
            architecture: "amd64".to_string(),
            variant: None,
        }
    }
}

impl Default for Platform {
    fn default() -> Self {
        Self::linux_amd64()
    }
}

impl FromStr for Platform {
    type Err = ProviderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('/').collect();
        let invalid = || {
            ProviderError::InvalidConfig(format!(
                "invalid platform {s:?}, expected os/arch[/variant]"
            ))
        };
        if parts.iter().any(|p| p.is_empty()) {
            return Err(invalid());
        }
        match parts.as_slice() {
            [os, arch] => Ok(Self {
                os: os.to_string(),
                architecture: arch.to_string(),
                variant: None,
            }),
            [os, arch, variant] => Ok(Self {
                os: os.to_string(),
                architecture: arch.to_string(),
                variant: Some(variant.to_string()),
            }),
            _ => Err(invalid()),
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.variant {
            Some(variant) => write!(f, "{}/{}/{}", self.os, self.architecture, variant),
            None => write!(f, "{}/{}", self.os, self.architecture),
        }
    }
}

/// Immutable configuration for building verifiers.
#[derive(Debug, Clone)]
pub struct VerifierConfig {
    /// Embedded trust anchor to bootstrap from
    pub trust_root: TrustRootId,
    /// Path prefix selecting a metadata channel; empty means the default channel
    pub update_channel: String,
    /// URL or OCI repository serving TUF metadata
    pub metadata_source: String,
    /// URL or OCI repository serving TUF targets
    pub targets_source: String,
    /// Local cache for TUF metadata
    pub local_storage_path: PathBuf,
    /// Local policy directory, overrides TUF-distributed policy when set
    pub policy_source_dir: Option<PathBuf>,
    /// Where policy files fetched from TUF are stored
    pub policy_cache_dir: PathBuf,
    pub attestation_style: AttestationStyle,
    /// Repository queried for referrers instead of the image repository
    pub referrers_repo: Option<String>,
    pub parameters: Parameters,
    pub platform: Platform,
}

/// Parse a `name=value,name2=value2` list into a parameter map.
///
/// An empty string yields no parameters. Every comma-separated part must
/// contain exactly one `=`.
pub fn parse_parameters(value: &str) -> Result<Parameters, ProviderError> {
    let mut parameters = Parameters::new();
    if value.is_empty() {
        return Ok(parameters);
    }
    for part in value.split(',') {
        let kv: Vec<&str> = part.split('=').collect();
        match kv.as_slice() {
            [name, value] if !name.is_empty() => {
                parameters.insert(name.to_string(), value.to_string());
            }
            _ => {
                return Err(ProviderError::InvalidConfig(format!(
                    "invalid parameter {part:?}, expected name=value"
                )))
            }
        }
    }
    Ok(parameters)
}
