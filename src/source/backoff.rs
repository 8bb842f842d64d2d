use crate::config::RetryConfig;
use crate::{Error, Result};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Exponential backoff, doubling from `initial` up to `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            attempt: 0,
        }
    }

    pub fn next_backoff(&mut self) -> Duration {
        let backoff = self
            .initial
            .saturating_mul(2u32.saturating_pow(self.attempt));
        self.attempt = self.attempt.saturating_add(1);
        backoff.min(self.max)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

impl From<&RetryConfig> for Backoff {
    fn from(policy: &RetryConfig) -> Self {
        Self::new(policy.initial_backoff, policy.max_backoff)
    }
}

/// Runs `op` up to `policy.attempts` times.
///
/// Only [`Error::Connection`] is retried; any other error, or the last
/// connection error, is returned as is. Cancelling `shutdown` during a
/// backoff ends the loop with [`Error::Shutdown`].
pub async fn retry<T, F, Fut>(
    policy: &RetryConfig,
    shutdown: &CancellationToken,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = policy.attempts.max(1);
    let mut backoff = Backoff::from(policy);

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(Error::Connection(message)) if backoff.attempt() + 1 < attempts => {
                let delay = backoff.next_backoff();
                warn!(
                    "Attempt {}/{} failed: {}; retrying in {:?}",
                    backoff.attempt(),
                    attempts,
                    message,
                    delay
                );

                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => return Err(Error::Shutdown),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Err(e) => return Err(e),
        }
    }
}
