use std::{future::Future, time::Duration};

use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{CapabilityError, CapabilityResult};

/// Per-call timeout plus bounded exponential backoff.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub timeout_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 4,
            base_delay_ms: 1_000,
            max_delay_ms: 20_000,
            timeout_ms: 60_000,
        }
    }
}

impl RetryPolicy {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Delay before retry number `attempt + 1`: `min(base * 2^attempt, max)`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        Duration::from_millis(
            self.base_delay_ms
                .saturating_mul(factor)
                .min(self.max_delay_ms),
        )
    }
}

/// Runs `op` under the policy's timeout, retrying timeouts and transport
/// failures. Malformed responses are returned immediately.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, label: &str, mut op: F) -> CapabilityResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = CapabilityResult<T>>,
{
    let attempts = policy.attempts.max(1);
    let mut last_error = CapabilityError::Timeout(policy.timeout());

    for attempt in 0..attempts {
        let error = match tokio::time::timeout(policy.timeout(), op()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) if !e.is_retryable() => return Err(e),
            Ok(Err(e)) => e,
            Err(_) => CapabilityError::Timeout(policy.timeout()),
        };

        if attempt + 1 < attempts {
            let delay = policy.backoff(attempt);
            warn!(
                capability = label,
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Capability call failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
        last_error = error;
    }

    Err(last_error)
}
