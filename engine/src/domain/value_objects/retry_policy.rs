//! RetryPolicy value object
//! Retries an operation on faults the classifier deems transient, with a backoff schedule

use crate::domain::constants::{DEFAULT_RETRY_DELAY_MS, DEFAULT_RETRY_MAX_ATTEMPTS, RETRY_BACKOFF_BASE};
use crate::domain::DomainError;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Delay schedule between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Same delay before every retry
    Fixed(Duration),

    /// `base * 2^(retry - 1)`, capped at `max`
    Exponential { base: Duration, max: Duration },
}

impl Backoff {
    /// Delay before retry number `retry` (1-based)
    pub fn delay(&self, retry: u32) -> Duration {
        match *self {
            Backoff::Fixed(delay) => delay,
            Backoff::Exponential { base, max } => {
                let factor = RETRY_BACKOFF_BASE.saturating_pow(retry.saturating_sub(1));
                base.saturating_mul(factor).min(max)
            }
        }
    }

    /// Parse from config representation ("fixed" or "exponential")
    pub fn parse(kind: &str, delay: Duration, max: Duration) -> Option<Self> {
        match kind.to_lowercase().as_str() {
            "fixed" => Some(Backoff::Fixed(delay)),
            "exponential" | "exp" => Some(Backoff::Exponential { base: delay, max }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retries: u32,
    backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_RETRY_MAX_ATTEMPTS,
            backoff: Backoff::Exponential {
                base: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
                max: Duration::from_secs(10),
            },
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff: Backoff) -> Self {
        Self {
            max_retries,
            backoff,
        }
    }

    /// A policy that runs the operation exactly once
    pub fn no_retry() -> Self {
        Self::new(0, Backoff::Fixed(Duration::ZERO))
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn backoff(&self) -> Backoff {
        self.backoff
    }

    /// Run `operation`, retrying while `is_retryable` says so and retries remain.
    /// A non-retryable error is returned after the first attempt.
    pub async fn execute<T, F, Fut, C>(
        &self,
        operation_name: &str,
        is_retryable: C,
        mut operation: F,
    ) -> Result<T, DomainError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, DomainError>>,
        C: Fn(&DomainError) -> bool,
    {
        let mut retry = 0;
        loop {
            match operation().await {
                Ok(value) => {
                    if retry > 0 {
                        debug!(
                            operation = operation_name,
                            retries = retry,
                            "Operation succeeded after retrying"
                        );
                    }
                    return Ok(value);
                }
                Err(e) if is_retryable(&e) && retry < self.max_retries => {
                    retry += 1;
                    let delay = self.backoff.delay(retry);
                    warn!(
                        operation = operation_name,
                        retry = retry,
                        max_retries = self.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// `execute` with the default transient-fault classifier
    pub async fn execute_transient<T, F, Fut>(
        &self,
        operation_name: &str,
        operation: F,
    ) -> Result<T, DomainError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, DomainError>>,
    {
        self.execute(operation_name, DomainError::is_transient, operation)
            .await
    }
}
