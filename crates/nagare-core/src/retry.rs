//! Retry policies.

use crate::error::StepError;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Delay schedule between attempts.
#[derive(Clone, Default)]
pub enum Backoff {
    /// Retry immediately.
    #[default]
    None,
    /// Same delay before every retry.
    Fixed(Duration),
    /// Delay grows by `multiplier` after every failed attempt, capped at `max_delay`.
    Exponential {
        /// Delay before the first retry.
        initial_delay: Duration,
        /// Maximum delay cap.
        max_delay: Duration,
        /// Multiplier for each retry.
        multiplier: u32,
    },
    /// Caller supplied schedule, given the number of the attempt that just failed.
    Custom(Arc<dyn Fn(u32) -> Duration + Send + Sync>),
}

impl fmt::Debug for Backoff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backoff::None => write!(f, "None"),
            Backoff::Fixed(delay) => f.debug_tuple("Fixed").field(delay).finish(),
            Backoff::Exponential {
                initial_delay,
                max_delay,
                multiplier,
            } => f
                .debug_struct("Exponential")
                .field("initial_delay", initial_delay)
                .field("max_delay", max_delay)
                .field("multiplier", multiplier)
                .finish(),
            Backoff::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

impl Backoff {
    /// Delay after the given failed attempt (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        match self {
            Backoff::None => Duration::ZERO,
            Backoff::Fixed(delay) => *delay,
            Backoff::Exponential {
                initial_delay,
                max_delay,
                multiplier,
            } => multiplier
                .checked_pow(attempt.saturating_sub(1))
                .and_then(|factor| initial_delay.checked_mul(factor))
                .map(|delay| delay.min(*max_delay))
                .unwrap_or(*max_delay),
            Backoff::Custom(schedule) => schedule(attempt),
        }
    }
}

/// Error returned when [`RetryPolicy`] configuration is invalid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicyError(pub &'static str);

impl fmt::Display for RetryPolicyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for RetryPolicyError {}

type Classifier = Arc<dyn Fn(&StepError) -> bool + Send + Sync>;

/// Bounded retry with backoff.
///
/// `max_attempts` counts every invocation, including the first one, and is
/// always at least 1.
///
/// # Examples
///
/// ```
/// use nagare_core::{PermanentKind, RetryPolicy, StepError};
/// use std::time::Duration;
///
/// // Retry conflicts too, e.g. a stale document revision.
/// let policy = RetryPolicy::fixed(3, Duration::from_millis(100))
///     .expect("valid policy")
///     .with_classifier(|err| {
///         err.is_retryable() || err.permanent_kind() == Some(PermanentKind::Conflict)
///     });
///
/// assert_eq!(policy.max_attempts(), 3);
/// assert!(policy.is_retryable(&StepError::permanent(PermanentKind::Conflict, "stale rev")));
/// assert!(!policy.is_retryable(&StepError::not_found("gone")));
/// ```
#[derive(Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff: Backoff,
    classifier: Option<Classifier>,
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .field("custom_classifier", &self.classifier.is_some())
            .finish()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::once()
    }
}

impl RetryPolicy {
    /// Creates a policy with the given attempt budget and backoff.
    pub fn new(max_attempts: u32, backoff: Backoff) -> Result<Self, RetryPolicyError> {
        if max_attempts == 0 {
            return Err(RetryPolicyError("max_attempts must be at least 1"));
        }
        Ok(Self {
            max_attempts,
            backoff,
            classifier: None,
        })
    }

    /// A single attempt, no retry.
    pub fn once() -> Self {
        Self {
            max_attempts: 1,
            backoff: Backoff::None,
            classifier: None,
        }
    }

    /// Creates a fixed delay policy.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Result<Self, RetryPolicyError> {
        Self::new(max_attempts, Backoff::Fixed(delay))
    }

    /// Creates an exponential backoff policy with default settings.
    pub fn exponential(
        max_attempts: u32,
        initial_delay: Duration,
    ) -> Result<Self, RetryPolicyError> {
        Self::exponential_backoff(max_attempts, initial_delay, Duration::from_secs(60), 2)
    }

    /// Creates an exponential backoff policy with custom settings.
    pub fn exponential_backoff(
        max_attempts: u32,
        initial_delay: Duration,
        max_delay: Duration,
        multiplier: u32,
    ) -> Result<Self, RetryPolicyError> {
        if multiplier == 0 {
            return Err(RetryPolicyError("multiplier must be greater than 0"));
        }
        if multiplier > 10 {
            return Err(RetryPolicyError(
                "multiplier must be 10 or less to avoid overflow",
            ));
        }
        if max_delay < initial_delay {
            return Err(RetryPolicyError("max_delay must be >= initial_delay"));
        }
        Self::new(
            max_attempts,
            Backoff::Exponential {
                initial_delay,
                max_delay,
                multiplier,
            },
        )
    }

    /// Creates a policy with a caller supplied delay schedule.
    pub fn custom<F>(max_attempts: u32, schedule: F) -> Result<Self, RetryPolicyError>
    where
        F: Fn(u32) -> Duration + Send + Sync + 'static,
    {
        Self::new(max_attempts, Backoff::Custom(Arc::new(schedule)))
    }

    /// Replaces the default error classification.
    pub fn with_classifier<F>(mut self, classifier: F) -> Self
    where
        F: Fn(&StepError) -> bool + Send + Sync + 'static,
    {
        self.classifier = Some(Arc::new(classifier));
        self
    }

    /// Maximum number of invocations, including the first.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// The delay schedule.
    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    /// Delay to wait after the given failed attempt (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.backoff.delay_after(attempt)
    }

    /// Whether `error` is worth another attempt.
    pub fn is_retryable(&self, error: &StepError) -> bool {
        match &self.classifier {
            Some(classify) => classify(error),
            None => error.is_retryable(),
        }
    }
}
