//! Workflow error types.

use crate::step::StepName;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Why a permanent failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PermanentKind {
    /// The request was malformed or a required input was missing.
    InvalidInput,
    /// The resource does not exist.
    NotFound,
    /// The resource exists in a conflicting state (e.g. a stale revision).
    Conflict,
    /// The caller is not allowed to perform the operation.
    Unauthorized,
    /// Any other non-retryable failure.
    Other,
}

impl fmt::Display for PermanentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PermanentKind::InvalidInput => write!(f, "invalid_input"),
            PermanentKind::NotFound => write!(f, "not_found"),
            PermanentKind::Conflict => write!(f, "conflict"),
            PermanentKind::Unauthorized => write!(f, "unauthorized"),
            PermanentKind::Other => write!(f, "other"),
        }
    }
}

/// Failure of a single step attempt.
///
/// The variant decides how the default retry classifier treats it; see
/// [`StepError::is_retryable`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum StepError {
    /// Network trouble, a busy service or any other failure worth retrying.
    #[error("transient: {0}")]
    Transient(String),

    /// A failure that will not go away by retrying.
    #[error("permanent ({kind}): {message}")]
    Permanent {
        /// Classification of the failure.
        kind: PermanentKind,
        /// Details about the failure.
        message: String,
    },

    /// The step did not finish within its per-step timeout.
    #[error("step timed out after {after:?}")]
    Timeout {
        /// The timeout that elapsed.
        after: Duration,
    },

    /// The step finished but its result did not satisfy the success predicate.
    #[error("result rejected: expected {expected}, got {actual}")]
    Rejected {
        /// What the step author expected.
        expected: String,
        /// Debug rendering of the value that was produced.
        actual: String,
    },

    /// The run was cancelled while the step was waiting.
    #[error("step cancelled")]
    Cancelled,

    /// A poll condition never held within its budget.
    #[error("condition not satisfied within {timeout:?} after {polls} polls")]
    TimeoutExceeded {
        /// The configured poll timeout.
        timeout: Duration,
        /// How many times the condition was evaluated.
        polls: u32,
    },
}

impl StepError {
    /// Creates a transient error.
    pub fn transient(message: impl Into<String>) -> Self {
        StepError::Transient(message.into())
    }

    /// Creates a permanent error of the given kind.
    pub fn permanent(kind: PermanentKind, message: impl Into<String>) -> Self {
        StepError::Permanent {
            kind,
            message: message.into(),
        }
    }

    /// Creates a permanent "not found" error.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::permanent(PermanentKind::NotFound, message)
    }

    /// Creates a permanent "invalid input" error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::permanent(PermanentKind::InvalidInput, message)
    }

    /// Default retry classification.
    ///
    /// Transient errors, step timeouts and rejected results are retryable.
    /// Permanent errors and exhausted poll conditions are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StepError::Transient(_) | StepError::Timeout { .. } | StepError::Rejected { .. }
        )
    }

    /// Returns the permanent kind, if this is a permanent error.
    pub fn permanent_kind(&self) -> Option<PermanentKind> {
        match self {
            StepError::Permanent { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Returns `true` for a permanent "not found" error.
    pub fn is_not_found(&self) -> bool {
        self.permanent_kind() == Some(PermanentKind::NotFound)
    }
}

/// Errors that end or invalidate a workflow run.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum WorkflowError {
    /// A step failed and its retry policy is exhausted (or the failure was fatal).
    #[error("Step failed: {step_name} after {attempts} attempt(s): {source}")]
    StepFailed {
        /// The name of the step that failed.
        step_name: StepName,
        /// How many times the step was invoked.
        attempts: u32,
        /// The last error the step produced.
        source: StepError,
    },

    /// The run was cancelled before or during the named step.
    #[error("Workflow aborted at step: {step_name}")]
    WorkflowAborted {
        /// The step that was running or about to run.
        step_name: StepName,
    },

    /// The task driving a spawned run terminated without a result.
    #[error("Workflow task failed: {0}")]
    TaskFailed(String),

    /// The workflow definition is invalid.
    #[error("Invalid workflow configuration: {0}")]
    Configuration(String),
}
