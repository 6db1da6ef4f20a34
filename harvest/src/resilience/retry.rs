use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::config::RetryConfig;
use crate::error::HarvestError;

/// Exponential backoff with additive jitter.
///
/// `retries` is the total number of attempts, so a policy with `retries = 3`
/// calls the operation at most three times.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub retries: u32,
    pub base_delay: Duration,
    pub backoff_factor: f64,
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn new(retries: u32, base_delay: Duration, backoff_factor: f64, jitter: Duration) -> Self {
        Self {
            retries: retries.max(1),
            base_delay,
            backoff_factor,
            jitter,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            config.attempts,
            Duration::from_millis(config.base_delay_ms),
            config.backoff_factor,
            Duration::from_millis(config.jitter_ms),
        )
    }

    /// Deterministic part of the delay after the failed attempt `attempt`
    /// (zero-based): `base_delay * backoff_factor ^ attempt`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = self.backoff_factor.max(0.0).powi(attempt as i32);
        let millis = self.base_delay.as_millis() as f64 * factor;
        if !millis.is_finite() {
            return Duration::from_millis(u64::MAX);
        }
        Duration::from_millis(millis.round() as u64)
    }

    fn delay_with_jitter(&self, attempt: u32) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
        };
        self.backoff_delay(attempt).saturating_add(jitter)
    }

    /// Run `operation` until it succeeds, fails with an error `is_retryable`
    /// rejects, or attempts run out. The last error is returned unchanged.
    pub async fn run<T, E, F, Fut, P>(
        &self,
        operation_name: &str,
        is_retryable: P,
        mut operation: F,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        E: Display,
    {
        let mut attempt = 0u32;
        loop {
            match operation().await {
                Ok(value) => {
                    if attempt > 0 {
                        tracing::info!(
                            operation = operation_name,
                            attempts = attempt + 1,
                            "Operation succeeded after retry"
                        );
                    }
                    return Ok(value);
                }
                Err(error) => {
                    if !is_retryable(&error) {
                        tracing::debug!(
                            operation = operation_name,
                            error = %error,
                            "Non-retryable error, giving up"
                        );
                        return Err(error);
                    }

                    if attempt + 1 >= self.retries {
                        tracing::warn!(
                            operation = operation_name,
                            attempts = self.retries,
                            error = %error,
                            "Retries exhausted"
                        );
                        return Err(error);
                    }

                    let delay = self.delay_with_jitter(attempt);
                    tracing::warn!(
                        operation = operation_name,
                        attempt = attempt + 1,
                        max_attempts = self.retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Retryable error, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// [`RetryPolicy::run`] with [`HarvestError::is_transient`] as the allow-list.
    pub async fn run_transient<T, F, Fut>(
        &self,
        operation_name: &str,
        operation: F,
    ) -> Result<T, HarvestError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, HarvestError>>,
    {
        self.run(operation_name, HarvestError::is_transient, operation)
            .await
    }
}
