//! Graceful shutdown for the TLS listener.
//!
//! On SIGINT/SIGTERM the accept loop stops, every connection task is told
//! to finish its in-flight request, and the server waits (bounded) for the
//! open connection count to reach zero.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::signal;
use tokio::sync::{watch, Notify};
use tracing::{error, info, warn};

/// Per-connection view of the shutdown flag
#[derive(Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub fn is_shutdown(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once shutdown starts (or the coordinator is gone)
    pub async fn wait(&mut self) {
        let _ = self.rx.wait_for(|stopping| *stopping).await;
    }
}

/// Counts open connections so shutdown can wait for them
#[derive(Default)]
pub struct ConnectionTracker {
    open: AtomicU64,
    accepted: AtomicU64,
    closed: Notify,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a new connection until the returned guard drops
    pub fn track(self: &Arc<Self>) -> ConnectionGuard {
        self.open.fetch_add(1, Ordering::AcqRel);
        self.accepted.fetch_add(1, Ordering::Relaxed);
        ConnectionGuard {
            tracker: Arc::clone(self),
        }
    }

    pub fn active_count(&self) -> u64 {
        self.open.load(Ordering::Acquire)
    }

    pub fn total_count(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    /// Wait until no connection is open; false if `timeout` passes first
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let drained = async {
            loop {
                let notified = self.closed.notified();
                if self.active_count() == 0 {
                    return;
                }
                notified.await;
            }
        };

        match tokio::time::timeout(timeout, drained).await {
            Ok(()) => true,
            Err(_) => {
                warn!(
                    open = self.active_count(),
                    timeout_secs = timeout.as_secs(),
                    "Connections still open after drain timeout"
                );
                false
            }
        }
    }
}

pub struct ConnectionGuard {
    tracker: Arc<ConnectionTracker>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if self.tracker.open.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.tracker.closed.notify_waiters();
        }
    }
}

/// Owns the shutdown flag and the connection count
pub struct ShutdownCoordinator {
    tx: watch::Sender<bool>,
    connections: Arc<ConnectionTracker>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            tx: watch::Sender::new(false),
            connections: Arc::new(ConnectionTracker::new()),
        }
    }

    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.tx.subscribe(),
        }
    }

    pub fn connections(&self) -> Arc<ConnectionTracker> {
        Arc::clone(&self.connections)
    }

    /// Flip the flag; later calls are no-ops
    pub fn shutdown(&self) {
        if !self.tx.send_replace(true) {
            info!(open = self.connections.active_count(), "Draining connections");
        }
    }

    /// Flip the flag and wait for open connections to close
    pub async fn graceful_shutdown(&self, drain_timeout: Duration) {
        self.shutdown();
        if self.connections.wait_for_drain(drain_timeout).await {
            info!(
                served = self.connections.total_count(),
                "All connections closed"
            );
        }
    }

    pub fn is_shutdown(&self) -> bool {
        *self.tx.borrow()
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Completes on Ctrl+C or SIGTERM
pub async fn shutdown_signal() {
    let interrupt = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Unable to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let sigterm = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Unable to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    let received = tokio::select! {
        _ = interrupt => "SIGINT",
        _ = sigterm => "SIGTERM",
    };
    info!(signal = received, "Shutdown requested");
}
