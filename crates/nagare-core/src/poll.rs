//! Poll conditions for effects that become visible eventually.

use crate::error::StepError;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Error returned when a [`PollSchedule`] is invalid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollScheduleError(pub &'static str);

impl fmt::Display for PollScheduleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for PollScheduleError {}

/// How often to re-check a condition and for how long.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSchedule {
    interval: Duration,
    timeout: Duration,
    multiplier: u32,
    max_interval: Duration,
}

impl PollSchedule {
    /// Checks every `interval` until `timeout` has elapsed.
    pub fn new(interval: Duration, timeout: Duration) -> Result<Self, PollScheduleError> {
        if interval.is_zero() {
            return Err(PollScheduleError("interval must be greater than 0"));
        }
        if timeout.is_zero() {
            return Err(PollScheduleError("timeout must be greater than 0"));
        }
        Ok(Self {
            interval,
            timeout,
            multiplier: 1,
            max_interval: interval,
        })
    }

    /// Grows the interval by `multiplier` after every unsatisfied poll, up to `max_interval`.
    pub fn with_growth(
        mut self,
        multiplier: u32,
        max_interval: Duration,
    ) -> Result<Self, PollScheduleError> {
        if multiplier == 0 || multiplier > 10 {
            return Err(PollScheduleError("multiplier must be between 1 and 10"));
        }
        if max_interval < self.interval {
            return Err(PollScheduleError("max_interval must be >= interval"));
        }
        self.multiplier = multiplier;
        self.max_interval = max_interval;
        Ok(self)
    }

    /// Initial interval between polls.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Total budget, measured from the first poll.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Interval to wait after the given unsatisfied poll (1-based).
    pub fn interval_after(&self, poll: u32) -> Duration {
        self.multiplier
            .checked_pow(poll.saturating_sub(1))
            .and_then(|factor| self.interval.checked_mul(factor))
            .map(|interval| interval.min(self.max_interval))
            .unwrap_or(self.max_interval)
    }
}

/// Boxed future returned by a poll fetch.
pub type PollFuture<T> = Pin<Box<dyn Future<Output = Result<T, StepError>> + Send>>;

type Fetch<T> = Box<dyn Fn() -> PollFuture<T> + Send + Sync>;
type Predicate<T> = Box<dyn Fn(&T) -> bool + Send + Sync>;

/// An asynchronously fetched value, a predicate over it, and a schedule.
///
/// The fetch runs again on every poll; values are never cached between polls.
///
/// # Examples
///
/// ```
/// use nagare_core::{PollCondition, PollSchedule};
/// use std::time::Duration;
///
/// let schedule = PollSchedule::new(Duration::from_millis(500), Duration::from_secs(10))
///     .expect("valid schedule");
/// let condition = PollCondition::new(
///     "replication triggered",
///     schedule,
///     || async { Ok("triggered".to_string()) },
///     |state: &String| state == "triggered",
/// );
/// assert_eq!(condition.description(), "replication triggered");
/// ```
pub struct PollCondition<T> {
    description: String,
    schedule: PollSchedule,
    fetch: Fetch<T>,
    predicate: Predicate<T>,
}

impl<T> fmt::Debug for PollCondition<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PollCondition")
            .field("description", &self.description)
            .field("schedule", &self.schedule)
            .finish()
    }
}

impl<T> PollCondition<T> {
    /// Creates a condition from a fetch and a predicate.
    pub fn new<F, Fut, P>(
        description: impl Into<String>,
        schedule: PollSchedule,
        fetch: F,
        predicate: P,
    ) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, StepError>> + Send + 'static,
        P: Fn(&T) -> bool + Send + Sync + 'static,
    {
        Self {
            description: description.into(),
            schedule,
            fetch: Box::new(move || Box::pin(fetch())),
            predicate: Box::new(predicate),
        }
    }

    /// What the condition waits for, in words.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Poll schedule.
    pub fn schedule(&self) -> &PollSchedule {
        &self.schedule
    }

    /// Issues one fetch.
    pub fn fetch(&self) -> PollFuture<T> {
        (self.fetch)()
    }

    /// Evaluates the predicate against a fetched value.
    pub fn is_satisfied(&self, value: &T) -> bool {
        (self.predicate)(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schedule_validation() {
        assert!(PollSchedule::new(Duration::ZERO, Duration::from_secs(1)).is_err());
        assert!(PollSchedule::new(Duration::from_millis(10), Duration::ZERO).is_err());

        let schedule = PollSchedule::new(Duration::from_millis(100), Duration::from_secs(1))
            .expect("valid schedule");
        assert!(schedule.with_growth(0, Duration::from_secs(1)).is_err());
        assert!(schedule.with_growth(2, Duration::from_millis(50)).is_err());
    }

    #[test]
    fn test_fixed_interval() {
        let schedule = PollSchedule::new(Duration::from_millis(100), Duration::from_secs(1))
            .expect("valid schedule");
        assert_eq!(schedule.interval_after(1), Duration::from_millis(100));
        assert_eq!(schedule.interval_after(7), Duration::from_millis(100));
    }

    #[test]
    fn test_growing_interval() {
        let schedule = PollSchedule::new(Duration::from_millis(100), Duration::from_secs(5))
            .and_then(|s| s.with_growth(2, Duration::from_millis(500)))
            .expect("valid schedule");
        assert_eq!(schedule.interval_after(1), Duration::from_millis(100));
        assert_eq!(schedule.interval_after(2), Duration::from_millis(200));
        assert_eq!(schedule.interval_after(3), Duration::from_millis(400));
        assert_eq!(schedule.interval_after(4), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_fetch_is_reissued() {
        use std::sync::atomic::{AtomicU32, Ordering};
        use std::sync::Arc;

        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let schedule = PollSchedule::new(Duration::from_millis(10), Duration::from_secs(1))
            .expect("valid schedule");
        let condition = PollCondition::new(
            "third call",
            schedule,
            move || {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                async move { Ok(n) }
            },
            |n: &u32| *n >= 3,
        );

        let first = condition.fetch().await.expect("fetch");
        let second = condition.fetch().await.expect("fetch");
        let third = condition.fetch().await.expect("fetch");
        assert!(!condition.is_satisfied(&first));
        assert!(!condition.is_satisfied(&second));
        assert!(condition.is_satisfied(&third));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
