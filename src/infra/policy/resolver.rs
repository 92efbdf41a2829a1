//! Locating the policy files for an image.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::domain::ImageReference;
use crate::infra::policy::mapping::{PolicyMappings, MAPPING_FILE};
use crate::infra::tuf::TufClient;
use crate::infra::{ProviderError, Result};

/// A policy file's path (relative to the policy source) and content
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyFile {
    pub path: String,
    pub content: Vec<u8>,
}

/// Everything needed to evaluate one policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyBundle {
    pub id: String,
    pub description: Option<String>,
    pub files: Vec<PolicyFile>,
    /// Where the mapping was loaded from
    pub uri: String,
    /// Image name the mapping matched, after rewrites
    pub matched_name: String,
}

impl PolicyBundle {
    /// sha256 over every file path and content, in declaration order
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        for file in &self.files {
            hasher.update(file.path.as_bytes());
            hasher.update([0u8]);
            hasher.update(Sha256::digest(&file.content));
        }
        hex::encode(hasher.finalize())
    }
}

/// Where policy files are read from.
#[async_trait]
pub trait PolicySource: Send + Sync {
    /// Read a file, `None` when the source does not have it
    async fn read(&self, path: &str) -> Result<Option<Vec<u8>>>;

    /// Human-readable location of the source
    fn uri(&self) -> String;
}

/// Policy files in a local directory
pub struct LocalPolicySource {
    dir: PathBuf,
}

impl LocalPolicySource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl PolicySource for LocalPolicySource {
    async fn read(&self, path: &str) -> Result<Option<Vec<u8>>> {
        let relative = checked_relative_path(path)?;
        match tokio::fs::read(self.dir.join(relative)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn uri(&self) -> String {
        format!("file://{}", self.dir.display())
    }
}

/// Policy files distributed as TUF targets, cached on disk
pub struct TufPolicySource {
    client: Arc<TufClient>,
    cache_dir: PathBuf,
    targets_source: String,
}

impl TufPolicySource {
    pub fn new(
        client: Arc<TufClient>,
        cache_dir: impl Into<PathBuf>,
        targets_source: impl Into<String>,
    ) -> Self {
        Self {
            client,
            cache_dir: cache_dir.into(),
            targets_source: targets_source.into(),
        }
    }
}

#[async_trait]
impl PolicySource for TufPolicySource {
    async fn read(&self, path: &str) -> Result<Option<Vec<u8>>> {
        checked_relative_path(path)?;
        if self.client.target(path).is_none() {
            return Ok(None);
        }
        self.client
            .download_target(path, &self.cache_dir)
            .await
            .map(Some)
    }

    fn uri(&self) -> String {
        self.targets_source.clone()
    }
}

/// Reject absolute paths and `..` so sources never read outside their root
fn checked_relative_path(path: &str) -> Result<&Path> {
    let relative = Path::new(path);
    if relative
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
    {
        Ok(relative)
    } else {
        Err(ProviderError::Policy(format!("invalid policy path {path:?}")))
    }
}

/// Maps images to policy bundles
pub struct PolicyResolver {
    source: Box<dyn PolicySource>,
}

impl PolicyResolver {
    pub fn new(source: Box<dyn PolicySource>) -> Self {
        Self { source }
    }

    /// The policy bundle for an image, `None` when no mapping rule matches
    pub async fn resolve(&self, image: &ImageReference) -> Result<Option<PolicyBundle>> {
        let mapping = self.source.read(MAPPING_FILE).await?.ok_or_else(|| {
            ProviderError::Policy(format!("{MAPPING_FILE} not found in {}", self.source.uri()))
        })?;
        let mappings = PolicyMappings::parse(&mapping)?;

        let name = image.normalized_name();
        let Some(found) = mappings.find_policy(&name)? else {
            debug!(image = %name, "No policy mapping matched");
            return Ok(None);
        };

        let mut files = Vec::with_capacity(found.policy.files.len());
        for file in &found.policy.files {
            let content = self.source.read(&file.path).await?.ok_or_else(|| {
                ProviderError::Policy(format!(
                    "policy {}: file {} not found in {}",
                    found.policy.id,
                    file.path,
                    self.source.uri()
                ))
            })?;
            files.push(PolicyFile {
                path: file.path.clone(),
                content,
            });
        }

        debug!(image = %name, policy = %found.policy.id, files = files.len(), "Resolved policy");
        Ok(Some(PolicyBundle {
            id: found.policy.id,
            description: found.policy.description,
            files,
            uri: self.source.uri(),
            matched_name: found.matched_name,
        }))
    }
}
