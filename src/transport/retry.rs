//! Exponential backoff around transport calls.
//!
//! A `RateLimited` failure first waits out the platform's own `retry_after`
//! before the backoff delay is applied, so the fixed pacing in the encoder is
//! only needed for backends that never report a rate limit.

use super::{TransportError, TransportResult};
use backon::{ExponentialBuilder, Retryable};
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (not including the initial attempt).
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(30),
            factor: 2.0,
        }
    }
}

impl RetryConfig {
    fn build_backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.initial_delay)
            .with_max_delay(self.max_delay)
            .with_max_times(self.max_retries as usize)
            .with_factor(self.factor)
            .with_jitter()
    }
}

/// Run an idempotent `operation` until it succeeds, fails permanently, or
/// retries run out.
pub async fn retry_transport<F, Fut, T>(
    config: &RetryConfig,
    operation_name: &str,
    operation: F,
) -> TransportResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = TransportResult<T>>,
{
    retry_when(config, operation_name, TransportError::is_transient, operation).await
}

/// Run a non-idempotent `operation` (one that creates something), retrying
/// only failures the platform answered without processing the request.
///
/// A timeout or server fault may come after the message was stored; sending
/// it again would leave a duplicate record behind.
pub async fn retry_unprocessed<F, Fut, T>(
    config: &RetryConfig,
    operation_name: &str,
    operation: F,
) -> TransportResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = TransportResult<T>>,
{
    retry_when(config, operation_name, TransportError::is_safe_to_resend, operation).await
}

async fn retry_when<F, Fut, T>(
    config: &RetryConfig,
    operation_name: &str,
    retry_on: fn(&TransportError) -> bool,
    mut operation: F,
) -> TransportResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = TransportResult<T>>,
{
    let max_retries = config.max_retries;
    let attempt = || {
        let fut = operation();
        async move {
            match fut.await {
                Err(TransportError::RateLimited { retry_after }) => {
                    tokio::time::sleep(retry_after).await;
                    Err(TransportError::RateLimited { retry_after })
                }
                other => other,
            }
        }
    };

    let mut attempts = 0u32;
    let notify = |err: &TransportError, dur: Duration| {
        attempts += 1;
        warn!(
            operation = operation_name,
            attempt = attempts,
            max_retries = max_retries,
            next_delay_ms = dur.as_millis() as u64,
            error = %err,
            "transport call failed, will retry"
        );
    };

    attempt
        .retry(config.build_backoff())
        .when(retry_on)
        .notify(notify)
        .await
}
