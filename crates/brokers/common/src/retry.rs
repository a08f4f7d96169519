use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Bounded retry with an optionally growing delay.
///
/// Attempt `n` (1-based) that fails waits `delay_ms * backoff^(n-1)`,
/// capped at `max_delay_ms`, before attempt `n + 1`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay_ms: u64,
    pub backoff: f64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            delay_ms: 1_000,
            backoff: 1.0,
            max_delay_ms: 10_000,
        }
    }
}

impl RetryPolicy {
    /// Try once, never wait.
    pub fn once() -> Self {
        Self {
            max_attempts: 1,
            delay_ms: 0,
            backoff: 1.0,
            max_delay_ms: 0,
        }
    }

    /// Delay after failed attempt `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31) as i32;
        let raw = self.delay_ms as f64 * self.backoff.max(1.0).powi(exp);
        let capped = raw.min(self.max_delay_ms.max(self.delay_ms) as f64);
        Duration::from_millis(capped as u64)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("retry.max_attempts must be at least 1".to_string());
        }
        if !self.backoff.is_finite() || self.backoff < 1.0 {
            return Err("retry.backoff must be >= 1.0".to_string());
        }
        Ok(())
    }
}

/// Run a broker call under a [`RetryPolicy`].
///
/// The call expression is re-evaluated on every attempt, so it may borrow the
/// broker mutably. Errors that are not retryable return immediately.
///
/// ```ignore
/// let tick = retry!(policy, "tick", broker.tick(&symbol))?;
/// ```
#[macro_export]
macro_rules! retry {
    ($policy:expr, $operation:expr, $call:expr) => {{
        let policy: &$crate::RetryPolicy = &$policy;
        let mut attempt: u32 = 1;
        loop {
            match $call.await {
                Ok(value) => break Ok(value),
                Err(err) if attempt < policy.max_attempts && err.is_retryable() => {
                    let delay = policy.delay_for(attempt);
                    $crate::__private::tracing::warn!(
                        operation = $operation,
                        attempt,
                        max_attempts = policy.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Broker call failed, retrying"
                    );
                    $crate::__private::tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => break Err(err),
            }
        }
    }};
}
