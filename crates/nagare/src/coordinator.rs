//! Sequential workflow coordinator.

use crate::cancel::CancelToken;
use crate::report::{Report, Reporter, RunStatus, StepOutcome};
use crate::retry::{self, Attempted};
use nagare_core::{
    Context, RetryPolicy, Retryable, Step, StepConfig, StepError, StepMode, StepName, StepValue,
    WithTimeout, WorkflowError, WorkflowStep,
};
use std::collections::HashSet;
use std::fmt;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

/// Where a run is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkflowState {
    /// Not started.
    Pending,
    /// Executing the step at `index`.
    Running {
        /// 0-based step position.
        index: usize,
        /// Step name.
        step_name: StepName,
    },
    /// A fatal step failed; remaining best-effort steps may still be running.
    Failed {
        /// 0-based position of the failing step.
        index: usize,
        /// Step name.
        step_name: StepName,
    },
    /// All steps ran and every fatal step succeeded.
    Completed,
    /// Cancelled.
    Aborted {
        /// 0-based position of the step that was running or about to run.
        index: usize,
        /// Step name.
        step_name: StepName,
    },
}

impl WorkflowState {
    /// `true` for `Completed` and `Aborted`, and for `Failed` once the run has
    /// returned.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, WorkflowState::Pending | WorkflowState::Running { .. })
    }
}

/// Terminal outcome of a run: the report plus the context as it stood when
/// the run ended.
#[derive(Debug)]
pub struct WorkflowResult {
    context: Context,
    report: Report,
}

impl WorkflowResult {
    /// Terminal status.
    pub fn status(&self) -> &RunStatus {
        self.report.status()
    }

    /// `true` when the run completed.
    pub fn is_completed(&self) -> bool {
        self.report.passed()
    }

    /// The error that ended the run, if any.
    pub fn error(&self) -> Option<WorkflowError> {
        self.report.status().error()
    }

    /// Results recorded up to the end of the run.
    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Per-step outcomes.
    pub fn report(&self) -> &Report {
        &self.report
    }

    /// Splits the result into its context and report.
    pub fn into_parts(self) -> (Context, Report) {
        (self.context, self.report)
    }
}

/// Runs an ordered list of steps once.
///
/// Each step sees the results of every step before it. A fatal step that
/// fails after its retry policy is exhausted ends forward progress: later
/// fatal steps are skipped and only best-effort steps still run. A
/// coordinator is consumed by [`Coordinator::run`] or [`Coordinator::spawn`].
pub struct Coordinator {
    steps: Vec<WorkflowStep>,
    cancel: CancelToken,
    state: watch::Sender<WorkflowState>,
}

impl fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coordinator")
            .field(
                "steps",
                &self.steps.iter().map(|s| s.name()).collect::<Vec<_>>(),
            )
            .field("state", &*self.state.borrow())
            .finish()
    }
}

impl Coordinator {
    /// Creates a new coordinator builder.
    pub fn builder() -> CoordinatorBuilder {
        CoordinatorBuilder::new()
    }

    /// Step names in execution order.
    pub fn step_names(&self) -> impl Iterator<Item = StepName> + '_ {
        self.steps.iter().map(|s| s.name())
    }

    /// Returns the number of steps.
    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    /// The token that cancels this run.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Observes state transitions.
    pub fn subscribe(&self) -> watch::Receiver<WorkflowState> {
        self.state.subscribe()
    }

    /// Runs the workflow on a new task.
    pub fn spawn(self) -> WorkflowHandle {
        let cancel = self.cancel.clone();
        let state = self.state.subscribe();
        let join = tokio::spawn(self.run());
        WorkflowHandle {
            cancel,
            state,
            join,
        }
    }

    /// Runs every step in order and returns the outcome.
    pub async fn run(self) -> WorkflowResult {
        let Coordinator {
            steps,
            cancel,
            state,
        } = self;

        let mut ctx = Context::new();
        let mut reporter = Reporter::new();
        let mut failure: Option<RunStatus> = None;

        info!("Workflow started with {} step(s)", steps.len());

        for (index, entry) in steps.iter().enumerate() {
            let step_name = entry.name();

            if cancel.is_cancelled() {
                return abort(&steps, index, index, failure, ctx, reporter, &state);
            }

            if failure.is_some() && entry.mode() == StepMode::Fatal {
                debug!("Skipping step '{}' after fatal failure", step_name);
                reporter.skip(step_name);
                continue;
            }

            if failure.is_none() {
                state.send_replace(WorkflowState::Running {
                    index,
                    step_name: step_name.clone(),
                });
            }

            let started = Instant::now();
            let attempted = execute_step(entry, &ctx, &cancel).await;
            let elapsed = started.elapsed();

            if cancel.is_cancelled() {
                info!("Step '{}' finished after cancellation; discarding result", step_name);
                return abort(&steps, index, index + 1, failure, ctx, reporter, &state);
            }

            let Attempted { result, attempts } = attempted;
            let outcome = |actual: String, passed: bool, tolerated: bool| StepOutcome {
                index,
                step_name: step_name.clone(),
                mode: entry.mode(),
                expected: entry.expectation().to_string(),
                actual,
                passed,
                tolerated,
                attempts_used: attempts,
                elapsed,
            };

            let error = match result {
                Ok(value) => {
                    info!("Step '{}' completed successfully", step_name);
                    let actual = value.summary().to_string();
                    match ctx.record(step_name.clone(), value) {
                        Ok(()) => {
                            reporter.record(outcome(actual, true, false));
                            continue;
                        }
                        Err(error) => error,
                    }
                }
                Err(error) if entry.mode() == StepMode::BestEffort && error.is_not_found() => {
                    info!(
                        "Best-effort step '{}' found nothing to do: {}",
                        step_name, error
                    );
                    let actual = format!("no-op ({})", error);
                    if ctx.record(step_name.clone(), StepValue::unit()).is_ok() {
                        reporter.record(outcome(actual, true, true));
                        continue;
                    }
                    WorkflowError::Configuration(format!(
                        "result for step '{}' already recorded",
                        step_name
                    ))
                }
                Err(error) if entry.mode() == StepMode::BestEffort => {
                    warn!("Best-effort step '{}' failed: {}", step_name, error);
                    reporter.record(outcome(error.to_string(), false, true));
                    continue;
                }
                Err(error) => WorkflowError::StepFailed {
                    step_name: step_name.clone(),
                    attempts,
                    source: error,
                },
            };

            warn!("Workflow failed at step '{}': {}", step_name, error);
            reporter.record(outcome(error.to_string(), false, false));
            state.send_replace(WorkflowState::Failed {
                index,
                step_name: step_name.clone(),
            });
            failure = Some(RunStatus::Failed {
                step_index: index,
                step_name,
                error,
            });
        }

        let status = match failure {
            Some(status) => status,
            None => {
                state.send_replace(WorkflowState::Completed);
                info!("Workflow completed");
                RunStatus::Completed
            }
        };

        WorkflowResult {
            context: ctx,
            report: reporter.finish(status),
        }
    }
}

async fn execute_step(
    entry: &WorkflowStep,
    ctx: &Context,
    cancel: &CancelToken,
) -> Attempted<StepValue> {
    let policy = entry
        .config()
        .retry_policy
        .clone()
        .unwrap_or_else(RetryPolicy::once);
    let limit = entry.config().timeout;
    let label = entry.name();

    retry::attempt(&policy, label.as_str(), Some(cancel), move |attempt| {
        execute_attempt(entry, ctx, limit, attempt)
    })
    .await
}

async fn execute_attempt(
    entry: &WorkflowStep,
    ctx: &Context,
    limit: Option<Duration>,
    attempt: u32,
) -> Result<StepValue, StepError> {
    debug!("Step '{}' attempt {}", entry.name(), attempt);
    let value = match limit {
        Some(limit) => timeout(limit, entry.step().execute(ctx))
            .await
            .map_err(|_| StepError::Timeout { after: limit })??,
        None => entry.step().execute(ctx).await?,
    };
    entry.verify(&value)?;
    Ok(value)
}

/// Ends a cancelled run. Steps from `first_unrun` on are reported as
/// skipped. A fatal failure recorded before the cancellation stays the run's
/// status.
fn abort(
    steps: &[WorkflowStep],
    index: usize,
    first_unrun: usize,
    failure: Option<RunStatus>,
    ctx: Context,
    mut reporter: Reporter,
    state: &watch::Sender<WorkflowState>,
) -> WorkflowResult {
    let step_name = steps
        .get(index)
        .map(|s| s.name())
        .unwrap_or_else(|| StepName::new("<end>"));

    for entry in steps.iter().skip(first_unrun) {
        reporter.skip(entry.name());
    }

    let status = match failure {
        Some(status) => {
            warn!(
                "Workflow cancelled during cleanup at step '{}'; keeping earlier failure",
                step_name
            );
            status
        }
        None => {
            warn!("Workflow aborted at step '{}'", step_name);
            state.send_replace(WorkflowState::Aborted {
                index,
                step_name: step_name.clone(),
            });
            RunStatus::Aborted {
                step_index: index,
                step_name,
            }
        }
    };

    WorkflowResult {
        context: ctx,
        report: reporter.finish(status),
    }
}

/// A run in progress on its own task.
#[derive(Debug)]
pub struct WorkflowHandle {
    cancel: CancelToken,
    state: watch::Receiver<WorkflowState>,
    join: JoinHandle<WorkflowResult>,
}

impl WorkflowHandle {
    /// Requests cancellation. The step in flight completes and its result is discarded.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// A token that cancels this run, usable after the handle is joined.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// The current state.
    pub fn state(&self) -> WorkflowState {
        self.state.borrow().clone()
    }

    /// Waits until the state satisfies `f` and returns it.
    ///
    /// Returns `None` if the run ended without reaching such a state.
    pub async fn wait_for_state<F>(&mut self, mut f: F) -> Option<WorkflowState>
    where
        F: FnMut(&WorkflowState) -> bool,
    {
        self.state.wait_for(|s| f(s)).await.ok().map(|s| s.clone())
    }

    /// Waits for the run to end.
    pub async fn join(self) -> Result<WorkflowResult, WorkflowError> {
        self.join
            .await
            .map_err(|e| WorkflowError::TaskFailed(e.to_string()))
    }
}

/// Builder for constructing [`Coordinator`] instances.
#[derive(Default)]
pub struct CoordinatorBuilder {
    steps: Vec<WorkflowStep>,
    cancel: Option<CancelToken>,
}

impl CoordinatorBuilder {
    /// Creates a new empty builder.
    pub fn new() -> Self {
        Self {
            steps: Vec::new(),
            cancel: None,
        }
    }

    /// Appends a fully described step.
    pub fn add(mut self, step: WorkflowStep) -> Self {
        self.steps.push(step);
        self
    }

    /// Appends a step with the default configuration.
    pub fn add_step<S: Step + 'static>(self, step: S) -> Self {
        self.add(WorkflowStep::new(step))
    }

    /// Appends a step that supplies its own retry policy.
    pub fn add_retryable<S: Retryable + 'static>(self, step: S) -> Self {
        let policy = step.retry_policy();
        self.add(WorkflowStep::new(step).with_retry(policy))
    }

    /// Appends a step with a custom timeout.
    pub fn add_with_timeout<S: Step + 'static>(self, step: S, timeout: Duration) -> Self {
        self.add(WorkflowStep::new(step).with_timeout(timeout))
    }

    /// Appends a step that implements [`WithTimeout`].
    pub fn add_with_timeout_trait<S: WithTimeout + 'static>(self, step: S) -> Self {
        let timeout = step.timeout();
        self.add(WorkflowStep::new(step).with_timeout(timeout))
    }

    /// Appends a step with an explicit configuration.
    pub fn add_configured<S: Step + 'static>(self, step: S, config: StepConfig) -> Self {
        self.add(WorkflowStep::with_config(step, config))
    }

    /// Appends a best-effort step.
    pub fn add_best_effort<S: Step + 'static>(self, step: S) -> Self {
        self.add(WorkflowStep::new(step).best_effort())
    }

    /// Uses `token` to cancel the run.
    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Builds the coordinator.
    pub fn build(self) -> Result<Coordinator, WorkflowError> {
        if self.steps.is_empty() {
            return Err(WorkflowError::Configuration(
                "At least one step must be added".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for step in &self.steps {
            let name = step.name();
            if !seen.insert(name.clone()) {
                return Err(WorkflowError::Configuration(format!(
                    "Duplicate step name: {}",
                    name
                )));
            }
        }

        let (state, _) = watch::channel(WorkflowState::Pending);
        Ok(Coordinator {
            steps: self.steps,
            cancel: self.cancel.unwrap_or_default(),
            state,
        })
    }
}
