//! Capped, jittered exponential retry for transient upstream failures.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::domain::error::Result;

/// Retry policy for one upstream call site.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(4),
        }
    }
}

impl BackoffPolicy {
    /// Delay before the given retry (1-based), exponential with up to 25%
    /// random jitter, capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)));
        let capped = exp.min(self.max_delay);
        let jitter = rand::thread_rng().gen_range(0.0..=0.25);
        capped.mul_f64(1.0 + jitter)
    }
}

/// Run `operation` until it succeeds, retrying only transient errors.
/// Fatal errors and the final transient error propagate unchanged.
pub async fn retry_transient<T, F, Fut>(policy: &BackoffPolicy, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < policy.max_attempts => {
                let delay = policy.delay_for(attempt);
                warn!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "Transient upstream failure, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
