//! Retry execution.

use crate::cancel::CancelToken;
use nagare_core::{RetryPolicy, StepError};
use std::future::Future;
use tracing::{info, warn};

/// Result of running an operation under a [`RetryPolicy`].
#[derive(Debug)]
pub struct Attempted<T> {
    /// Final result: the first success, or the last error.
    pub result: Result<T, StepError>,
    /// How many times the operation was invoked.
    pub attempts: u32,
}

/// Invokes `op` until it succeeds, fails with a non-retryable error, or the
/// policy's attempt budget is spent.
///
/// `op` receives the 1-based attempt number. Between attempts the policy's
/// backoff is slept; a cancelled `cancel` token stops further attempts and
/// surfaces the last error.
pub async fn attempt<T, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    cancel: Option<&CancelToken>,
    mut op: F,
) -> Attempted<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, StepError>>,
{
    let max_attempts = policy.max_attempts();
    let mut attempt = 1;

    loop {
        let error = match op(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    info!("'{}' succeeded on attempt {}/{}", label, attempt, max_attempts);
                }
                return Attempted {
                    result: Ok(value),
                    attempts: attempt,
                };
            }
            Err(error) => error,
        };

        if attempt >= max_attempts {
            warn!("'{}' failed after {} attempt(s): {}", label, attempt, error);
            return Attempted {
                result: Err(error),
                attempts: attempt,
            };
        }
        if !policy.is_retryable(&error) {
            warn!("'{}' failed with non-retryable error: {}", label, error);
            return Attempted {
                result: Err(error),
                attempts: attempt,
            };
        }

        let delay = policy.delay_for_attempt(attempt);
        info!(
            "'{}' failed ({}), retrying ({}/{}) in {:?}",
            label,
            error,
            attempt + 1,
            max_attempts,
            delay
        );

        let cancelled = match cancel {
            Some(token) if token.is_cancelled() => true,
            Some(token) => {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => false,
                    _ = token.cancelled() => true,
                }
            }
            None => {
                tokio::time::sleep(delay).await;
                false
            }
        };
        if cancelled {
            info!("'{}' cancelled before attempt {}", label, attempt + 1);
            return Attempted {
                result: Err(error),
                attempts: attempt,
            };
        }

        attempt += 1;
    }
}
