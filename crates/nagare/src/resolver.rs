//! Eventual-consistency polling.

use crate::cancel::CancelToken;
use async_trait::async_trait;
use nagare_core::{Context, PollCondition, Step, StepError, StepName, StepValue};
use std::any::Any;
use std::fmt::{self, Debug};
use std::marker::PhantomData;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// A value that satisfied a [`PollCondition`].
#[derive(Debug, Clone, PartialEq)]
pub struct Resolved<T> {
    /// The satisfying value.
    pub value: T,
    /// How many times the condition was fetched, including the satisfying one.
    pub polls: u32,
    /// Time from the first fetch until the condition held.
    pub elapsed: Duration,
}

/// Re-evaluates poll conditions until they hold or time out.
///
/// Time is measured with `tokio::time`, so tests can drive the resolver
/// with a paused clock.
#[derive(Debug, Clone, Default)]
pub struct Resolver {
    cancel: Option<CancelToken>,
}

impl Resolver {
    /// Creates a resolver that cannot be cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stops waiting between polls once `token` is cancelled.
    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Polls `condition` until its predicate holds.
    ///
    /// The first fetch happens immediately. After an unsatisfied fetch the
    /// resolver sleeps for the scheduled interval, clamped so the final
    /// fetch happens exactly at the timeout. A fetch still pending at the
    /// deadline is abandoned and counts as the final unsatisfied poll.
    /// Transient fetch errors count as unsatisfied polls; any other fetch
    /// error ends resolution.
    pub async fn resolve<T>(&self, condition: &PollCondition<T>) -> Result<Resolved<T>, StepError> {
        let schedule = condition.schedule();
        let started = Instant::now();
        let deadline = started + schedule.timeout();
        let mut polls = 0u32;

        loop {
            polls += 1;
            let remaining = deadline.saturating_duration_since(Instant::now());
            let fetched = match tokio::time::timeout(remaining, condition.fetch()).await {
                Ok(fetched) => fetched,
                Err(_) => {
                    warn!(
                        "'{}' fetch still pending at the {:?} deadline (poll {})",
                        condition.description(),
                        schedule.timeout(),
                        polls
                    );
                    return Err(StepError::TimeoutExceeded {
                        timeout: schedule.timeout(),
                        polls,
                    });
                }
            };
            match fetched {
                Ok(value) if condition.is_satisfied(&value) => {
                    let elapsed = started.elapsed();
                    debug!(
                        "'{}' satisfied after {} poll(s) in {:?}",
                        condition.description(),
                        polls,
                        elapsed
                    );
                    return Ok(Resolved {
                        value,
                        polls,
                        elapsed,
                    });
                }
                Ok(_) => {
                    debug!("'{}' not satisfied on poll {}", condition.description(), polls);
                }
                Err(error) if error.is_retryable() => {
                    debug!(
                        "'{}' fetch failed on poll {}: {}",
                        condition.description(),
                        polls,
                        error
                    );
                }
                Err(error) => return Err(error),
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(
                    "'{}' not satisfied within {:?} ({} polls)",
                    condition.description(),
                    schedule.timeout(),
                    polls
                );
                return Err(StepError::TimeoutExceeded {
                    timeout: schedule.timeout(),
                    polls,
                });
            }

            let wait = schedule.interval_after(polls).min(deadline - now);
            match &self.cancel {
                Some(token) => {
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {}
                        _ = token.cancelled() => return Err(StepError::Cancelled),
                    }
                }
                None => tokio::time::sleep(wait).await,
            }
        }
    }
}

/// A workflow step that waits for a condition built from earlier results.
///
/// The factory runs once per execution and may fail (e.g. when an input is
/// missing). The satisfying value is recorded as the step's result.
pub struct PollStep<T, F> {
    name: StepName,
    resolver: Resolver,
    factory: F,
    _value: PhantomData<fn() -> T>,
}

impl<T, F> PollStep<T, F>
where
    F: Fn(&Context) -> Result<PollCondition<T>, StepError> + Send + Sync,
{
    /// Creates a poll step.
    pub fn new(name: impl Into<StepName>, resolver: Resolver, factory: F) -> Self {
        Self {
            name: name.into(),
            resolver,
            factory,
            _value: PhantomData,
        }
    }
}

impl<T, F> Debug for PollStep<T, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PollStep")
            .field("name", &self.name)
            .field("resolver", &self.resolver)
            .finish()
    }
}

#[async_trait]
impl<T, F> Step for PollStep<T, F>
where
    T: Any + Send + Sync + Debug,
    F: Fn(&Context) -> Result<PollCondition<T>, StepError> + Send + Sync,
{
    async fn execute(&self, ctx: &Context) -> Result<StepValue, StepError> {
        let condition = (self.factory)(ctx)?;
        let resolved = self.resolver.resolve(&condition).await?;
        info!(
            "'{}' resolved after {} poll(s) in {:?}",
            self.name, resolved.polls, resolved.elapsed
        );
        Ok(StepValue::new(resolved.value))
    }

    fn name(&self) -> StepName {
        self.name.clone()
    }
}
