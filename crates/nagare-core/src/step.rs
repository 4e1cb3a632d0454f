//! Step trait and step descriptors.

use crate::context::{Context, StepValue};
use crate::error::StepError;
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use std::any::Any;
use std::fmt::{self, Debug};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Type-safe step name wrapper.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StepName(String);

impl StepName {
    /// Creates a new StepName.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the step name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StepName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for StepName {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for StepName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl AsRef<str> for StepName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::borrow::Borrow<str> for StepName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// A unit of asynchronous work.
///
/// A step reads whatever it needs from the results of earlier steps and
/// returns its own result. It never writes to the context; the coordinator
/// records the returned value under the step's name.
///
/// # Examples
///
/// ```
/// use nagare_core::{Context, Step, StepError, StepName, StepValue};
/// use async_trait::async_trait;
///
/// #[derive(Debug)]
/// struct JobIdLength;
///
/// #[async_trait]
/// impl Step for JobIdLength {
///     async fn execute(&self, ctx: &Context) -> Result<StepValue, StepError> {
///         let job_id = ctx.require::<String>("start_replication")?;
///         Ok(StepValue::new(job_id.len()))
///     }
///
///     fn name(&self) -> StepName {
///         StepName::new("job_id_length")
///     }
/// }
/// ```
#[async_trait]
pub trait Step: Send + Sync + Debug {
    /// Executes the step logic.
    async fn execute(&self, ctx: &Context) -> Result<StepValue, StepError>;

    /// Returns the step name.
    fn name(&self) -> StepName;
}

/// A step backed by a closure.
///
/// The closure receives the context and returns a future that owns whatever
/// it extracted, so the future does not borrow the context.
pub struct FnStep<F> {
    name: StepName,
    op: F,
}

impl<F> FnStep<F> {
    /// Creates a step named `name` that runs `op`.
    pub fn new(name: impl Into<StepName>, op: F) -> Self {
        Self {
            name: name.into(),
            op,
        }
    }
}

impl<F> Debug for FnStep<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnStep").field("name", &self.name).finish()
    }
}

#[async_trait]
impl<F, Fut> Step for FnStep<F>
where
    F: Fn(&Context) -> Fut + Send + Sync,
    Fut: Future<Output = Result<StepValue, StepError>> + Send + 'static,
{
    async fn execute(&self, ctx: &Context) -> Result<StepValue, StepError> {
        (self.op)(ctx).await
    }

    fn name(&self) -> StepName {
        self.name.clone()
    }
}

/// How a step's failure affects the rest of the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StepMode {
    /// Failure ends the run.
    #[default]
    Fatal,
    /// Failure is recorded and the run continues. A permanent "not found"
    /// error counts as success. Best-effort steps still run after an
    /// earlier fatal failure, which makes them suitable for cleanup.
    BestEffort,
}

impl fmt::Display for StepMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepMode::Fatal => write!(f, "fatal"),
            StepMode::BestEffort => write!(f, "best-effort"),
        }
    }
}

/// Configuration for a workflow step.
#[derive(Debug, Clone)]
pub struct StepConfig {
    /// Maximum time allowed for a single attempt.
    pub timeout: Option<Duration>,
    /// Retry policy when the step fails.
    pub retry_policy: Option<RetryPolicy>,
    /// Whether failure ends the run.
    pub mode: StepMode,
}

impl Default for StepConfig {
    fn default() -> Self {
        Self {
            timeout: Some(Duration::from_secs(30)),
            retry_policy: None,
            mode: StepMode::Fatal,
        }
    }
}

/// Predicate a step result must satisfy to count as success.
#[derive(Clone)]
pub struct SuccessPredicate {
    description: String,
    check: Arc<dyn Fn(&StepValue) -> bool + Send + Sync>,
}

impl SuccessPredicate {
    /// Creates a predicate over the result value of type `T`.
    ///
    /// A result of any other type fails the predicate.
    pub fn new<T, P>(description: impl Into<String>, check: P) -> Self
    where
        T: Any,
        P: Fn(&T) -> bool + Send + Sync + 'static,
    {
        Self {
            description: description.into(),
            check: Arc::new(move |value: &StepValue| {
                value.downcast_ref::<T>().map(&check).unwrap_or(false)
            }),
        }
    }

    /// What the predicate expects, in words.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Evaluates the predicate.
    pub fn check(&self, value: &StepValue) -> bool {
        (self.check)(value)
    }
}

impl Debug for SuccessPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SuccessPredicate")
            .field("description", &self.description)
            .finish()
    }
}

/// A step together with everything the coordinator needs to run it.
///
/// # Examples
///
/// ```
/// use nagare_core::{Context, FnStep, RetryPolicy, StepError, StepValue, WorkflowStep};
/// use std::time::Duration;
///
/// let step = WorkflowStep::new(FnStep::new("ping", |_ctx: &Context| async {
///     Ok::<_, StepError>(StepValue::new(true))
/// }))
/// .expect_that("ping answers true", |ok: &bool| *ok)
/// .with_retry(RetryPolicy::fixed(3, Duration::from_millis(10)).expect("valid policy"))
/// .best_effort();
///
/// assert_eq!(step.name().as_str(), "ping");
/// assert_eq!(step.expectation(), "ping answers true");
/// ```
#[derive(Debug)]
pub struct WorkflowStep {
    step: Box<dyn Step>,
    config: StepConfig,
    predicate: Option<SuccessPredicate>,
}

impl WorkflowStep {
    /// Wraps a step with the default configuration: fatal, 30s timeout, no retry.
    pub fn new<S: Step + 'static>(step: S) -> Self {
        Self::with_config(step, StepConfig::default())
    }

    /// Wraps a step with an explicit configuration.
    pub fn with_config<S: Step + 'static>(step: S, config: StepConfig) -> Self {
        Self {
            step: Box::new(step),
            config,
            predicate: None,
        }
    }

    /// Sets the retry policy.
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.config.retry_policy = Some(policy);
        self
    }

    /// Sets the per-attempt timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = Some(timeout);
        self
    }

    /// Removes the per-attempt timeout.
    pub fn without_timeout(mut self) -> Self {
        self.config.timeout = None;
        self
    }

    /// Marks the step best-effort.
    pub fn best_effort(mut self) -> Self {
        self.config.mode = StepMode::BestEffort;
        self
    }

    /// Requires the result to satisfy `check`.
    pub fn expect_that<T, P>(mut self, description: impl Into<String>, check: P) -> Self
    where
        T: Any,
        P: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(SuccessPredicate::new(description, check));
        self
    }

    /// Requires the result to satisfy an already built predicate.
    pub fn with_predicate(mut self, predicate: SuccessPredicate) -> Self {
        self.predicate = Some(predicate);
        self
    }

    /// The wrapped step's name.
    pub fn name(&self) -> StepName {
        self.step.name()
    }

    /// The wrapped step.
    pub fn step(&self) -> &dyn Step {
        self.step.as_ref()
    }

    /// Step configuration.
    pub fn config(&self) -> &StepConfig {
        &self.config
    }

    /// Whether failure ends the run.
    pub fn mode(&self) -> StepMode {
        self.config.mode
    }

    /// The success predicate, if any.
    pub fn predicate(&self) -> Option<&SuccessPredicate> {
        self.predicate.as_ref()
    }

    /// What the author expects from this step, in words.
    pub fn expectation(&self) -> &str {
        self.predicate
            .as_ref()
            .map(|p| p.description())
            .unwrap_or("completes without error")
    }

    /// Applies the success predicate to a produced value.
    pub fn verify(&self, value: &StepValue) -> Result<(), StepError> {
        match &self.predicate {
            Some(predicate) if !predicate.check(value) => Err(StepError::Rejected {
                expected: predicate.description().to_string(),
                actual: value.summary().to_string(),
            }),
            _ => Ok(()),
        }
    }
}
