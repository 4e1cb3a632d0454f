//! Per-step outcomes and the final run report.

use nagare_core::{StepMode, StepName, WorkflowError};
use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use std::fmt;
use std::time::Duration;

/// Terminal status of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStatus {
    /// Every fatal step succeeded.
    Completed,
    /// A fatal step failed; later fatal steps did not run.
    Failed {
        /// 0-based position of the failing step.
        step_index: usize,
        /// The failing step.
        step_name: StepName,
        /// Why it failed.
        error: WorkflowError,
    },
    /// The run was cancelled.
    Aborted {
        /// 0-based position of the step that was running or about to run.
        step_index: usize,
        /// That step's name.
        step_name: StepName,
    },
}

impl RunStatus {
    /// Short lowercase label.
    pub fn label(&self) -> &'static str {
        match self {
            RunStatus::Completed => "completed",
            RunStatus::Failed { .. } => "failed",
            RunStatus::Aborted { .. } => "aborted",
        }
    }

    /// The error that ended the run, if it did not complete.
    pub fn error(&self) -> Option<WorkflowError> {
        match self {
            RunStatus::Completed => None,
            RunStatus::Failed { error, .. } => Some(error.clone()),
            RunStatus::Aborted { step_name, .. } => Some(WorkflowError::WorkflowAborted {
                step_name: step_name.clone(),
            }),
        }
    }
}

/// What happened to one executed step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepOutcome {
    /// 0-based position in the workflow.
    pub index: usize,
    /// Step name.
    #[serde(rename = "step", serialize_with = "as_display")]
    pub step_name: StepName,
    /// Fatal or best-effort.
    #[serde(serialize_with = "as_display")]
    pub mode: StepMode,
    /// What the author expected.
    pub expected: String,
    /// What was observed: the result's debug rendering or the error.
    pub actual: String,
    /// Whether the expectation held.
    pub passed: bool,
    /// Failure absorbed by a best-effort step.
    pub tolerated: bool,
    /// How many times the step was invoked.
    #[serde(rename = "attempts")]
    pub attempts_used: u32,
    /// Wall time across all attempts.
    #[serde(rename = "elapsed_ms", serialize_with = "as_millis")]
    pub elapsed: Duration,
}

fn as_display<T: fmt::Display, S: Serializer>(value: &T, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(value)
}

fn as_millis<S: Serializer>(elapsed: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
}

/// Collects step outcomes while a run progresses.
#[derive(Debug, Default)]
pub struct Reporter {
    outcomes: Vec<StepOutcome>,
    skipped: Vec<StepName>,
}

impl Reporter {
    /// Creates an empty reporter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an executed step.
    pub fn record(&mut self, outcome: StepOutcome) {
        self.outcomes.push(outcome);
    }

    /// Records a step that never ran.
    pub fn skip(&mut self, step_name: StepName) {
        self.skipped.push(step_name);
    }

    /// Outcomes recorded so far.
    pub fn outcomes(&self) -> &[StepOutcome] {
        &self.outcomes
    }

    /// Produces the final report.
    pub fn finish(self, status: RunStatus) -> Report {
        Report {
            status,
            outcomes: self.outcomes,
            skipped: self.skipped,
        }
    }
}

/// Final report of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    status: RunStatus,
    outcomes: Vec<StepOutcome>,
    skipped: Vec<StepName>,
}

impl Report {
    /// Terminal status.
    pub fn status(&self) -> &RunStatus {
        &self.status
    }

    /// Outcomes of executed steps, in execution order.
    pub fn outcomes(&self) -> &[StepOutcome] {
        &self.outcomes
    }

    /// Outcome of the named step, if it ran.
    pub fn outcome(&self, step_name: &str) -> Option<&StepOutcome> {
        self.outcomes
            .iter()
            .find(|o| o.step_name.as_str() == step_name)
    }

    /// Steps that never ran.
    pub fn skipped(&self) -> &[StepName] {
        &self.skipped
    }

    /// `true` when the run completed.
    ///
    /// Failed best-effort steps show up as failed outcomes but do not fail
    /// the run.
    pub fn passed(&self) -> bool {
        self.status == RunStatus::Completed
    }

    /// The first fatal failure, with its outcome.
    pub fn first_failure(&self) -> Option<&StepOutcome> {
        match &self.status {
            RunStatus::Failed { step_index, .. } => {
                self.outcomes.iter().find(|o| o.index == *step_index)
            }
            _ => None,
        }
    }

    /// Process exit code: `0` on completion, otherwise the 1-based index of
    /// the failing (or aborted) step.
    pub fn exit_code(&self) -> i32 {
        match &self.status {
            RunStatus::Completed => 0,
            RunStatus::Failed { step_index, .. } | RunStatus::Aborted { step_index, .. } => {
                i32::try_from(*step_index + 1).unwrap_or(i32::MAX)
            }
        }
    }
}

/// Serializes as `{status, passed, exit_code, error, steps, skipped}`.
impl Serialize for Report {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let skipped: Vec<&str> = self.skipped.iter().map(StepName::as_str).collect();
        let mut report = serializer.serialize_struct("Report", 6)?;
        report.serialize_field("status", self.status.label())?;
        report.serialize_field("passed", &self.passed())?;
        report.serialize_field("exit_code", &self.exit_code())?;
        report.serialize_field("error", &self.status.error().map(|e| e.to_string()))?;
        report.serialize_field("steps", &self.outcomes)?;
        report.serialize_field("skipped", &skipped)?;
        report.end()
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for o in &self.outcomes {
            let mark = match (o.passed, o.tolerated) {
                (true, _) => "ok",
                (false, true) => "warn",
                (false, false) => "FAIL",
            };
            writeln!(
                f,
                "[{:<4}] {:>2}. {} ({}, {} attempt(s), {:?})",
                mark,
                o.index + 1,
                o.step_name,
                o.mode,
                o.attempts_used,
                o.elapsed
            )?;
            writeln!(f, "         expected: {}", o.expected)?;
            writeln!(f, "         actual:   {}", o.actual)?;
        }
        for name in &self.skipped {
            writeln!(f, "[skip] {}", name)?;
        }
        match self.status.error() {
            None => write!(f, "workflow {}", self.status.label()),
            Some(error) => write!(f, "workflow {}: {}", self.status.label(), error),
        }
    }
}
