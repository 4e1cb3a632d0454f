//! Optional step traits for additional behavior.

use crate::retry::RetryPolicy;
use crate::step::Step;
use std::time::Duration;

/// Optional trait for steps that carry their own retry policy.
///
/// # Examples
///
/// ```
/// use nagare_core::{Context, Retryable, RetryPolicy, Step, StepError, StepName, StepValue};
/// use async_trait::async_trait;
/// use std::time::Duration;
///
/// #[derive(Debug)]
/// struct StopJob;
///
/// #[async_trait]
/// impl Step for StopJob {
///     async fn execute(&self, _ctx: &Context) -> Result<StepValue, StepError> {
///         Ok(StepValue::unit())
///     }
///
///     fn name(&self) -> StepName {
///         StepName::new("stop_job")
///     }
/// }
///
/// impl Retryable for StopJob {
///     fn retry_policy(&self) -> RetryPolicy {
///         RetryPolicy::fixed(3, Duration::from_millis(250)).unwrap_or_default()
///     }
/// }
/// ```
pub trait Retryable: Step {
    /// Returns the retry policy for this step.
    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::once()
    }
}

/// Optional trait for steps with a custom per-attempt timeout.
pub trait WithTimeout: Step {
    /// Returns the timeout for a single attempt.
    fn timeout(&self) -> Duration {
        Duration::from_secs(30)
    }
}
