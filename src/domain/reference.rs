//! Container image references.
//!
//! Grammar comes from `oci_distribution`; on top of it Docker Hub names are
//! spelled `index.docker.io/library/...` and only `sha256` digests are
//! accepted.

use std::fmt;

use oci_distribution::Reference;

use crate::infra::ProviderError;

/// Registry name used for references without an explicit registry
pub const DEFAULT_REGISTRY: &str = "index.docker.io";

/// Host serving the Docker Hub registry API
const DOCKER_HUB_API_HOST: &str = "registry-1.docker.io";

const DEFAULT_TAG: &str = "latest";

/// A parsed image reference, with Docker Hub names normalized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    registry: String,
    repository: String,
    tag: Option<String>,
    digest: Option<String>,
}

impl ImageReference {
    /// Parse an image reference string.
    pub fn parse(input: &str) -> Result<Self, ProviderError> {
        let malformed = |reason: String| {
            ProviderError::RequestMalformed(format!("unable to parse reference {input}: {reason}"))
        };

        let parsed = Reference::try_from(input).map_err(|e| malformed(e.to_string()))?;
        if let Some(digest) = parsed.digest() {
            validate_digest(digest).map_err(malformed)?;
        }

        let registry = match parsed.registry() {
            "docker.io" | DEFAULT_REGISTRY => DEFAULT_REGISTRY,
            other => other,
        };
        let repository = if registry == DEFAULT_REGISTRY && !parsed.repository().contains('/') {
            format!("library/{}", parsed.repository())
        } else {
            parsed.repository().to_string()
        };

        Ok(Self {
            registry: registry.to_string(),
            repository,
            tag: parsed.tag().map(str::to_string),
            digest: parsed.digest().map(str::to_string),
        })
    }

    pub fn registry(&self) -> &str {
        &self.registry
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    pub fn digest(&self) -> Option<&str> {
        self.digest.as_deref()
    }

    /// Whether the reference pins a content digest
    pub fn is_digest(&self) -> bool {
        self.digest.is_some()
    }

    /// Fully qualified repository name, e.g. `index.docker.io/library/nginx`
    pub fn name(&self) -> String {
        format!("{}/{}", self.registry, self.repository)
    }

    /// Name with Docker Hub spelled `docker.io`, the form policy mappings match on
    pub fn normalized_name(&self) -> String {
        if self.registry == DEFAULT_REGISTRY {
            format!("docker.io/{}", self.repository)
        } else {
            self.name()
        }
    }

    /// Shortest name a user would type, e.g. `nginx` for Docker Hub library images
    pub fn familiar_name(&self) -> String {
        if self.registry == DEFAULT_REGISTRY {
            self.repository
                .strip_prefix("library/")
                .unwrap_or(&self.repository)
                .to_string()
        } else {
            self.name()
        }
    }

    /// The manifest reference to request: digest if present, otherwise tag
    pub fn identifier(&self) -> &str {
        self.digest
            .as_deref()
            .or(self.tag.as_deref())
            .unwrap_or(DEFAULT_TAG)
    }

    /// `name@digest` for the given digest
    pub fn with_digest(&self, digest: &str) -> String {
        format!("{}@{}", self.name(), digest)
    }

    /// Host to talk to for the registry API
    pub fn api_host(&self) -> &str {
        if self.registry == DEFAULT_REGISTRY {
            DOCKER_HUB_API_HOST
        } else {
            &self.registry
        }
    }

    /// `http` for loopback and `.local` registries, `https` otherwise
    pub fn scheme(&self) -> &'static str {
        let host = self
            .registry
            .rsplit_once(':')
            .filter(|(_, port)| port.chars().all(|c| c.is_ascii_digit()))
            .map(|(host, _)| host)
            .unwrap_or(&self.registry);
        if host == "localhost" || host == "127.0.0.1" || host == "[::1]" || host.ends_with(".local")
        {
            "http"
        } else {
            "https"
        }
    }

    /// Base URL of the registry API, e.g. `https://registry-1.docker.io/v2`
    pub fn api_base(&self) -> String {
        format!("{}://{}/v2", self.scheme(), self.api_host())
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.tag, &self.digest) {
            (_, Some(digest)) => write!(f, "{}@{}", self.name(), digest),
            (Some(tag), None) => write!(f, "{}:{}", self.name(), tag),
            (None, None) => write!(f, "{}:{}", self.name(), DEFAULT_TAG),
        }
    }
}

/// Validate a `sha256:<64 hex>` digest string.
pub fn validate_digest(digest: &str) -> Result<(), String> {
    let hex = digest
        .strip_prefix("sha256:")
        .ok_or_else(|| format!("unsupported digest algorithm in {digest:?}"))?;
    if hex.len() != 64 || !hex.chars().all(|c| matches!(c, '0'..='9' | 'a'..='f')) {
        return Err(format!("invalid sha256 digest {digest:?}"));
    }
    Ok(())
}
