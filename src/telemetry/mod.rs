//! Logging setup for the attest provider
//!
//! Structured `tracing` output, human-readable by default or JSON for log
//! aggregation. `RUST_LOG` takes precedence over the configured level.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// How the process logs
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Reported once the subscriber is installed
    pub service_name: String,
    pub service_version: String,
    /// One JSON object per line instead of compact text
    pub json_format: bool,
    /// `EnvFilter` directive used when `RUST_LOG` is unset
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "attest-provider".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            json_format: false,
            log_level: "info".to_string(),
        }
    }
}

impl TelemetryConfig {
    pub fn new(log_level: impl Into<String>, json_format: bool) -> Self {
        Self {
            log_level: log_level.into(),
            json_format,
            ..Self::default()
        }
    }

    fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&self.log_level))
            .unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

/// Install the global subscriber.
///
/// Fails if a subscriber is already installed.
pub fn init_telemetry(config: &TelemetryConfig) -> anyhow::Result<()> {
    let subscriber = tracing_subscriber::registry().with(config.env_filter());

    if config.json_format {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_file(true)
            .with_line_number(true);
        subscriber.with(fmt_layer).try_init()?;
    } else {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .compact();
        subscriber.with(fmt_layer).try_init()?;
    }

    tracing::info!(
        service = %config.service_name,
        version = %config.service_version,
        json = config.json_format,
        "Logging initialized"
    );
    Ok(())
}
