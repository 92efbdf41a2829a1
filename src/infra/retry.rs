//! Backoff for outbound registry and TUF requests.
//!
//! Only transient failures are retried: connect errors, timeouts, 5xx and
//! 429. Delays double per attempt up to a cap, with proportional jitter.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use reqwest::StatusCode;
use tracing::{debug, warn};

/// Backoff schedule for one outbound call
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Fraction of the delay randomly added or removed, in `0.0..=1.0`
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::registry()
    }
}

impl RetryConfig {
    /// Outbound registry and TUF calls.
    ///
    /// Kept short: the whole request has to finish inside the handler timeout.
    pub fn registry() -> Self {
        Self {
            max_retries: 2,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            jitter: 0.3,
        }
    }

    /// Millisecond delays for loopback endpoints and tests
    pub fn fast() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(500),
            jitter: 0.3,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before retry number `retry` (0 for the first retry)
    pub fn backoff(&self, retry: u32) -> Duration {
        let doubled = self.initial_delay.as_secs_f64() * 2f64.powi(retry.min(30) as i32);
        let delay = doubled.min(self.max_delay.as_secs_f64());
        if self.jitter <= 0.0 {
            return Duration::from_secs_f64(delay);
        }
        let spread = delay * self.jitter;
        let offset = rand::thread_rng().gen_range(-spread..=spread);
        Duration::from_secs_f64((delay + offset).max(0.0))
    }
}

/// Runs an operation under a [`RetryConfig`]
pub struct Retry {
    config: RetryConfig,
}

impl Retry {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Run `operation` until it succeeds, fails permanently, or runs out of
    /// retries. `is_transient` decides which errors are worth another try.
    pub async fn run<F, Fut, T, E, P>(&self, target: &str, operation: F, is_transient: P) -> Result<T, E>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
        P: Fn(&E) -> bool,
    {
        let mut retry = 0;
        loop {
            let err = match operation().await {
                Ok(value) => {
                    if retry > 0 {
                        debug!(target, retries = retry, "Request succeeded after retrying");
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            if retry >= self.config.max_retries || !is_transient(&err) {
                return Err(err);
            }

            let delay = self.config.backoff(retry);
            warn!(
                target,
                retry = retry + 1,
                max_retries = self.config.max_retries,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Transient failure, retrying"
            );
            tokio::time::sleep(delay).await;
            retry += 1;
        }
    }
}

/// 5xx and 429 responses
pub fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

/// Connection-level failures
pub fn is_retryable_transport_error(err: &reqwest::Error) -> bool {
    err.is_connect() || err.is_timeout() || err.is_request()
}
