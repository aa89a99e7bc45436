//! Handler-internal retry with exponential backoff
//!
//! The consume protocol never requeues: a failed handler means the message is
//! rejected for good. Handlers that expect transient failures (a flaky mail
//! server, a busy database) retry here before signalling final failure.

use crate::{EventEnvelope, EventHandler, EventKind, HandlerError};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Configuration for retry behavior
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, the first one included
    pub max_attempts: u32,
    /// Initial backoff duration (doubles on each retry)
    pub initial_backoff: Duration,
    /// Maximum backoff duration to cap exponential growth
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
        }
    }
}

/// Retry a fallible async operation with exponential backoff
///
/// # Arguments
/// * `operation` - The async operation to retry
/// * `config` - Retry configuration
/// * `context` - Context string for logging (e.g., "send_welcome_email")
///
/// # Returns
/// * `Ok(T)` if operation succeeds within max_attempts
/// * `Err(E)` with the last error once all attempts are exhausted
///
/// # Example
/// ```rust
/// use contact_bus::consumer_retry::{retry_with_backoff, RetryConfig};
///
/// # async fn example() -> Result<(), String> {
/// let config = RetryConfig::default();
/// let result = retry_with_backoff(
///     || async { Ok::<_, String>(42) },
///     &config,
///     "example_operation"
/// ).await?;
/// # Ok(())
/// # }
/// ```
pub async fn retry_with_backoff<F, Fut, T, E>(
    operation: F,
    config: &RetryConfig,
    context: &str,
) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0;
    let mut backoff = config.initial_backoff;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    debug!(
                        context = %context,
                        attempt = attempt,
                        "Operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(e) => {
                if attempt >= config.max_attempts {
                    warn!(
                        context = %context,
                        attempts = attempt,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }

                warn!(
                    context = %context,
                    attempt = attempt,
                    max_attempts = config.max_attempts,
                    backoff_ms = backoff.as_millis(),
                    error = %e,
                    "Operation failed, retrying with backoff"
                );

                sleep(backoff).await;

                backoff = std::cmp::min(backoff * 2, config.max_backoff);
            }
        }
    }
}

/// Wraps a handler so each message gets `max_attempts` tries before the
/// failure reaches the consumer (and the message is rejected)
pub struct RetryingHandler {
    inner: Arc<dyn EventHandler>,
    config: RetryConfig,
}

impl RetryingHandler {
    pub fn new(inner: Arc<dyn EventHandler>, config: RetryConfig) -> Arc<Self> {
        Arc::new(Self { inner, config })
    }
}

#[async_trait]
impl EventHandler for RetryingHandler {
    fn expected_kind(&self) -> Option<EventKind> {
        self.inner.expected_kind()
    }

    fn event_type_name(&self) -> &str {
        self.inner.event_type_name()
    }

    async fn handle(&self, envelope: EventEnvelope, routing_key: &str) -> Result<(), HandlerError> {
        let context = format!("{} {}", envelope.kind(), envelope.event_id());
        retry_with_backoff(
            || self.inner.handle(envelope.clone(), routing_key),
            &self.config,
            &context,
        )
        .await
    }
}
