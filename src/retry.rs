use backon::{ExponentialBuilder, Retryable};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::error::CallError;

/// Bounded exponential backoff around a breaker-guarded call.
///
/// Only [`CallError::Transient`] failures are retried. Breaker rejections and
/// fatal venue errors surface after the first attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(300),
            max_delay: Duration::from_millis(2000),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry `attempt` (0-indexed):
    /// `min(initial_delay * backoff_multiplier^attempt, max_delay)`.
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let factor = f64::from(self.backoff_multiplier).powi(exponent);
        let delay_nanos = self.initial_delay.as_nanos() as f64 * factor;

        if !delay_nanos.is_finite() || delay_nanos >= self.max_delay.as_nanos() as f64 {
            self.max_delay
        } else {
            Duration::from_nanos(delay_nanos.round() as u64)
        }
    }

    /// Every delay this policy can sleep for, in order.
    pub fn schedule(&self) -> Vec<Duration> {
        (0..self.max_retries)
            .map(|attempt| self.delay_for_attempt(u32::try_from(attempt).unwrap_or(u32::MAX)))
            .collect()
    }

    fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.initial_delay)
            .with_max_delay(self.max_delay)
            .with_factor(self.backoff_multiplier)
            .with_max_times(self.max_retries)
    }

    pub async fn run<T, F, Fut>(&self, operation_name: &str, operation: F) -> Result<T, CallError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CallError>>,
    {
        operation
            .retry(self.backoff())
            .sleep(tokio::time::sleep)
            .when(CallError::is_retryable)
            .notify(|error, delay| {
                warn!(
                    "Retrying {operation_name} in {}ms after error: {error}",
                    delay.as_millis()
                );
            })
            .await
    }
}
