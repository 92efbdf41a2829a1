//! HTTPS server bootstrap for the attest provider.
//!
//! This module wires together:
//! - configuration and logging
//! - the registry client and verifier factory
//! - TLS (TLS 1.3 only, optional client certificate verification)
//! - the Axum router, served per connection through hyper

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::Router;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as ConnectionBuilder;
use hyper_util::service::TowerToHyperService;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use crate::config::Cli;
use crate::domain::VerifierConfig;
use crate::infra::{
    shutdown_signal, AttestVerifierFactory, ConnectionGuard, Registry, RegistryClient,
    ShutdownCoordinator, ShutdownSignal, VerifierFactory, USER_AGENT,
};
use crate::metrics::{metric_names, MetricsRegistry};
use crate::telemetry::{init_telemetry, TelemetryConfig};

/// Bound on the TLS handshake of a new connection
const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// How long shutdown waits for in-flight requests
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub verifier_config: Arc<VerifierConfig>,
    pub verifier_factory: Arc<dyn VerifierFactory>,
    pub registry: Arc<dyn Registry>,
    pub metrics: Arc<MetricsRegistry>,
    pub handler_timeout: Duration,
}

/// Start the HTTPS server.
pub async fn run(cli: Cli) -> anyhow::Result<()> {
    init_telemetry(&TelemetryConfig::new(cli.log_level.clone(), cli.log_json))?;

    info!("Starting attest-provider v{}", env!("CARGO_PKG_VERSION"));

    let verifier_config = cli.verifier_config()?;
    let handler_timeout = cli.handler_timeout()?;
    info!("Configuration loaded");
    info!("  TUF root: {}", verifier_config.trust_root);
    info!("  TUF metadata source: {}", verifier_config.metadata_source);
    info!("  TUF targets source: {}", verifier_config.targets_source);
    info!("  Attestation style: {}", verifier_config.attestation_style);
    info!("  Platform: {}", verifier_config.platform);
    info!("  Handler timeout: {}s", handler_timeout.as_secs());

    let Some((cert_file, key_file)) = cli.tls_files() else {
        anyhow::bail!("TLS certificates are not provided, the server will not be started");
    };
    let tls_config = load_tls_config(&cert_file, &key_file, cli.client_ca_file.as_deref())?;

    let registry: Arc<dyn Registry> = Arc::new(RegistryClient::new(USER_AGENT)?);
    let verifier_factory: Arc<dyn VerifierFactory> =
        Arc::new(AttestVerifierFactory::new(registry.clone()));

    let state = AppState {
        verifier_config: Arc::new(verifier_config),
        verifier_factory,
        registry,
        metrics: Arc::new(MetricsRegistry::new()),
        handler_timeout,
    };

    crate::api::handlers::warm_up_verifier(&state).await;

    let app = crate::api::router(state.clone());
    let listener = TcpListener::bind(cli.listen_addr())
        .await
        .with_context(|| format!("unable to listen on {}", cli.listen_addr()))?;

    info!(
        port = cli.port,
        cert_file = %cert_file.display(),
        key_file = %key_file.display(),
        "Starting external data provider server"
    );

    serve(listener, TlsAcceptor::from(tls_config), app, state.metrics).await
}

/// Accept TLS connections until a shutdown signal arrives, then drain.
pub async fn serve(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    app: Router,
    metrics: Arc<MetricsRegistry>,
) -> anyhow::Result<()> {
    let coordinator = ShutdownCoordinator::new();
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "Failed to accept connection");
                        continue;
                    }
                };
                debug!(peer = %peer, "Accepted connection");

                let guard = coordinator.connections().track();
                let connections = coordinator.connections();
                metrics
                    .set_gauge(metric_names::ACTIVE_CONNECTIONS, connections.active_count())
                    .await;

                let acceptor = acceptor.clone();
                let app = app.clone();
                let signal = coordinator.signal();
                let metrics = metrics.clone();
                tokio::spawn(async move {
                    serve_connection(stream, acceptor, app, signal, guard).await;
                    metrics
                        .set_gauge(metric_names::ACTIVE_CONNECTIONS, connections.active_count())
                        .await;
                });
            }
            _ = &mut shutdown => {
                info!("Shutdown signal received, no longer accepting connections");
                break;
            }
        }
    }

    coordinator.graceful_shutdown(DRAIN_TIMEOUT).await;
    Ok(())
}

async fn serve_connection(
    stream: TcpStream,
    acceptor: TlsAcceptor,
    app: Router,
    mut signal: ShutdownSignal,
    _guard: ConnectionGuard,
) {
    let tls_stream =
        match tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await {
            Ok(Ok(tls_stream)) => tls_stream,
            Ok(Err(e)) => {
                debug!(error = %e, "TLS handshake failed");
                return;
            }
            Err(_) => {
                debug!("TLS handshake timed out");
                return;
            }
        };

    let builder = ConnectionBuilder::new(TokioExecutor::new());
    let connection =
        builder.serve_connection(TokioIo::new(tls_stream), TowerToHyperService::new(app));
    tokio::pin!(connection);

    let result = tokio::select! {
        result = connection.as_mut() => result,
        _ = signal.wait() => {
            connection.as_mut().graceful_shutdown();
            connection.await
        }
    };

    if let Err(e) = result {
        debug!(error = %e, "Connection closed with error");
    }
}

/// Build the rustls server configuration.
///
/// TLS 1.3 only. With a client CA, client certificates are verified when
/// presented but not required.
pub fn load_tls_config(
    cert_file: &Path,
    key_file: &Path,
    client_ca_file: Option<&Path>,
) -> anyhow::Result<Arc<ServerConfig>> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());

    let certs = CertificateDer::pem_file_iter(cert_file)
        .with_context(|| format!("unable to read {}", cert_file.display()))?
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("unable to parse certificates in {}", cert_file.display()))?;
    if certs.is_empty() {
        anyhow::bail!("no certificates found in {}", cert_file.display());
    }
    let key = PrivateKeyDer::from_pem_file(key_file)
        .with_context(|| format!("unable to parse private key in {}", key_file.display()))?;

    let builder = ServerConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .context("unable to select TLS 1.3")?;

    let builder = match client_ca_file {
        Some(ca_file) => {
            info!(client_ca_file = %ca_file.display(), "Loading Gatekeeper's CA certificate");
            let mut roots = RootCertStore::empty();
            for cert in CertificateDer::pem_file_iter(ca_file)
                .with_context(|| format!("unable to read {}", ca_file.display()))?
            {
                let cert = cert
                    .with_context(|| format!("unable to parse certificate in {}", ca_file.display()))?;
                roots
                    .add(cert)
                    .with_context(|| format!("unable to add CA certificate from {}", ca_file.display()))?;
            }
            let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider)
                .allow_unauthenticated()
                .build()
                .context("unable to build client certificate verifier")?;
            builder.with_client_cert_verifier(verifier)
        }
        None => builder.with_no_client_auth(),
    };

    let mut config = builder
        .with_single_cert(certs, key)
        .context("invalid server certificate or key")?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    Ok(Arc::new(config))
}
