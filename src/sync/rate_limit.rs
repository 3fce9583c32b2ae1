use std::time::Duration;

use crate::config::{seconds, ClientSection};

/// Retry schedule for a single remote operation.
///
/// Attempt `k` (0-based) that fails transiently waits
/// `min(backoff_factor ^ k, max_backoff)` seconds before attempt `k + 1`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_factor: f64,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&ClientSection::default())
    }
}

impl RetryPolicy {
    pub fn from_config(client: &ClientSection) -> Self {
        Self {
            max_retries: client.max_retries,
            backoff_factor: client.retry_backoff_factor,
            max_backoff: seconds(client.max_backoff_seconds),
        }
    }

    /// Total attempts allowed, counting the first.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.backoff_factor.powi(exponent);
        if !secs.is_finite() || secs >= self.max_backoff.as_secs_f64() {
            return self.max_backoff;
        }
        Duration::from_secs_f64(secs.max(0.0))
    }
}

/// Sleep out the backoff that follows failed attempt `attempt`.
pub async fn backoff_sleep(policy: &RetryPolicy, operation: &str, attempt: u32, reason: &str) {
    let wait = policy.delay_for(attempt);
    log::warn!(
        "{operation} failed ({reason}). Waiting {:.1}s before retry {}/{}",
        wait.as_secs_f64(),
        attempt + 1,
        policy.max_retries
    );
    tokio::time::sleep(wait).await;
}
