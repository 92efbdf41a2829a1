//! Command-line and environment configuration.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::domain::{parse_parameters, Parameters, VerifierConfig};
use crate::infra::ProviderError;

const DEFAULT_METADATA_SOURCE: &str = "registry-1.docker.io/docker/tuf-metadata:latest";
const DEFAULT_TARGETS_SOURCE: &str = "registry-1.docker.io/docker/tuf-targets";
const DEFAULT_TUF_OUTPUT_PATH: &str = "/tuf_temp/.docker/tuf";
const DEFAULT_POLICY_CACHE_DIR: &str = "/tuf_temp/.docker/policy";

/// Channel name that selects the unprefixed metadata channel
const PROD_CHANNEL: &str = "prod";

pub const CERT_NAME: &str = "tls.crt";
pub const KEY_NAME: &str = "tls.key";

/// Gatekeeper external data provider for image attestations
#[derive(Parser, Debug, Clone)]
#[command(name = "attest-provider")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Directory containing tls.crt and tls.key
    #[arg(long, env = "ATTEST_PROVIDER_CERT_DIR")]
    pub cert_dir: Option<PathBuf>,

    /// CA bundle used to verify client certificates, when presented
    #[arg(long, env = "ATTEST_PROVIDER_CLIENT_CA_FILE")]
    pub client_ca_file: Option<PathBuf>,

    /// Port for the server to listen on
    #[arg(long, env = "ATTEST_PROVIDER_PORT", default_value_t = 8090)]
    pub port: u16,

    /// Handler timeout in seconds
    #[arg(long, env = "ATTEST_PROVIDER_HANDLER_TIMEOUT", default_value_t = 25)]
    pub handler_timeout: u64,

    /// Embedded TUF root [dev, staging, prod]
    #[arg(long, env = "ATTEST_PROVIDER_TUF_ROOT", default_value = "prod")]
    pub tuf_root: String,

    /// Release channel [prod, testing]
    #[arg(long, env = "ATTEST_PROVIDER_TUF_CHANNEL", default_value = "")]
    pub tuf_channel: String,

    /// Source (URL or repository) for TUF metadata
    #[arg(long, env = "ATTEST_PROVIDER_TUF_METADATA_SOURCE", default_value = DEFAULT_METADATA_SOURCE)]
    pub tuf_metadata_source: String,

    /// Source (URL or repository) for TUF targets
    #[arg(long, env = "ATTEST_PROVIDER_TUF_TARGETS_SOURCE", default_value = DEFAULT_TARGETS_SOURCE)]
    pub tuf_targets_source: String,

    /// Local directory for TUF metadata
    #[arg(long, env = "ATTEST_PROVIDER_TUF_OUTPUT_PATH", default_value = DEFAULT_TUF_OUTPUT_PATH)]
    pub tuf_output_path: PathBuf,

    /// Local policy directory (overrides TUF policy)
    #[arg(long, env = "ATTEST_PROVIDER_LOCAL_POLICY_DIR")]
    pub local_policy_dir: Option<PathBuf>,

    /// Where policy downloaded from TUF is stored
    #[arg(long, env = "ATTEST_PROVIDER_POLICY_CACHE_DIR", default_value = DEFAULT_POLICY_CACHE_DIR)]
    pub policy_cache_dir: PathBuf,

    /// Attestation style [referrers, attached]
    #[arg(long, env = "ATTEST_PROVIDER_ATTESTATION_STYLE", default_value = "referrers")]
    pub attestation_style: String,

    /// Repository from which to fetch referrers for attestation lookup
    #[arg(long, env = "ATTEST_PROVIDER_REFERRERS_SOURCE")]
    pub referrers_source: Option<String>,

    /// Policy parameters as name=value[,name2=value2]; repeatable
    #[arg(long)]
    pub parameters: Vec<String>,

    /// Platform used to select images from an index, os/arch[/variant]
    #[arg(long, env = "ATTEST_PROVIDER_PLATFORM", default_value = "linux/amd64")]
    pub platform: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "ATTEST_PROVIDER_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON
    #[arg(long, env = "ATTEST_PROVIDER_LOG_JSON")]
    pub log_json: bool,
}

impl Cli {
    /// Validate the flags and build the verifier configuration.
    pub fn verifier_config(&self) -> Result<VerifierConfig, ProviderError> {
        let update_channel = if self.tuf_channel == PROD_CHANNEL {
            String::new()
        } else {
            self.tuf_channel.clone()
        };

        Ok(VerifierConfig {
            trust_root: self.tuf_root.parse()?,
            update_channel,
            metadata_source: self.tuf_metadata_source.clone(),
            targets_source: self.tuf_targets_source.clone(),
            local_storage_path: self.tuf_output_path.clone(),
            policy_source_dir: self.local_policy_dir.clone(),
            policy_cache_dir: self.policy_cache_dir.clone(),
            attestation_style: self.attestation_style.parse()?,
            referrers_repo: self
                .referrers_source
                .clone()
                .filter(|repo| !repo.is_empty()),
            parameters: self.parameters()?,
            platform: self.platform.parse()?,
        })
    }

    /// Merge every `--parameters` occurrence; later names win.
    pub fn parameters(&self) -> Result<Parameters, ProviderError> {
        let mut merged = Parameters::new();
        for value in &self.parameters {
            merged.extend(parse_parameters(value)?);
        }
        Ok(merged)
    }

    pub fn handler_timeout(&self) -> Result<Duration, ProviderError> {
        if self.handler_timeout == 0 {
            return Err(ProviderError::InvalidConfig(
                "handler timeout must be at least one second".to_string(),
            ));
        }
        Ok(Duration::from_secs(self.handler_timeout))
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], self.port))
    }

    /// Certificate and key paths, if a cert dir is configured
    pub fn tls_files(&self) -> Option<(PathBuf, PathBuf)> {
        self.cert_dir
            .as_ref()
            .map(|dir| (dir.join(CERT_NAME), dir.join(KEY_NAME)))
    }
}
