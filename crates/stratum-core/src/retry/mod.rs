//! Retry logic
//!
//! Wraps a single unit of work with bounded retries and exponential backoff.
//! Only tools flagged `retryable` go through here; the orchestrator calls
//! non-retryable tools directly.

mod backoff;

pub use backoff::RetryConfig;

use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Errors that know whether another attempt could succeed.
pub trait IsRetryable {
    fn is_retryable(&self) -> bool;

    /// Server-suggested delay, overriding the backoff schedule.
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

/// Value produced after `retries` failed attempts.
#[derive(Debug)]
pub struct Retried<T> {
    pub value: T,
    pub retries: u32,
}

/// Final error, annotated with how many attempts were made.
#[derive(Debug)]
pub struct RetryFailure<E> {
    pub error: E,
    pub attempts: u32,
    /// Gave up because the cancellation token fired while waiting
    pub cancelled: bool,
}

impl<E> RetryFailure<E> {
    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }
}

/// Per-invocation context.
#[derive(Debug, Clone, Copy)]
pub struct RetryContext<'a> {
    /// Label used in logs (call id, tool name)
    pub operation: &'a str,
    pub cancel: Option<&'a CancellationToken>,
}

impl<'a> RetryContext<'a> {
    pub fn new(operation: &'a str) -> Self {
        Self {
            operation,
            cancel: None,
        }
    }

    pub fn with_cancel(mut self, cancel: &'a CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct RetryStrategy {
    config: RetryConfig,
}

impl RetryStrategy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Retries allowed after the first attempt.
    pub fn max_retries(&self) -> u32 {
        self.config.max_retries
    }

    /// Run `operation` until it succeeds, returns a permanent error, or the
    /// retry budget is spent.
    pub async fn execute_with_retry<T, E, F, Fut>(
        &self,
        ctx: RetryContext<'_>,
        mut operation: F,
    ) -> Result<Retried<T>, RetryFailure<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: IsRetryable + std::fmt::Display,
    {
        let max_attempts = self.config.max_retries + 1;
        let mut attempt = 0;

        loop {
            attempt += 1;

            let error = match operation(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::info!(
                            operation = ctx.operation,
                            attempt,
                            "Succeeded after retry"
                        );
                    }
                    return Ok(Retried {
                        value,
                        retries: attempt - 1,
                    });
                }
                Err(error) => error,
            };

            if !error.is_retryable() {
                tracing::debug!(
                    operation = ctx.operation,
                    attempt,
                    error = %error,
                    "Permanent failure, not retrying"
                );
                return Err(RetryFailure {
                    error,
                    attempts: attempt,
                    cancelled: false,
                });
            }

            if attempt >= max_attempts {
                tracing::warn!(
                    operation = ctx.operation,
                    attempts = attempt,
                    error = %error,
                    "Giving up after retries"
                );
                return Err(RetryFailure {
                    error,
                    attempts: attempt,
                    cancelled: false,
                });
            }

            let delay = error
                .retry_after()
                .unwrap_or_else(|| self.config.delay_for_retry(attempt))
                .min(self.config.max_delay);

            tracing::warn!(
                operation = ctx.operation,
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Attempt failed, retrying"
            );

            match ctx.cancel {
                Some(cancel) => {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            return Err(RetryFailure {
                                error,
                                attempts: attempt,
                                cancelled: true,
                            });
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                None => tokio::time::sleep(delay).await,
            }
        }
    }
}
