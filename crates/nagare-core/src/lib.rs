//! Core traits and types for the nagare workflow coordinator.
//!
//! This crate provides minimal abstractions without runtime dependencies.
//! Library authors should depend on this crate to implement custom steps.
//!
//! # Core Types
//!
//! - [`Step`] - The core trait for workflow steps
//! - [`WorkflowStep`] - A step plus its retry policy, timeout, predicate and mode
//! - [`Context`] - Append-only results of completed steps, keyed by step name
//! - [`RetryPolicy`] - Attempt budget, backoff and error classification
//! - [`PollCondition`] - A fetch, a predicate and a poll schedule
//! - [`StepError`] / [`WorkflowError`] - Error types for workflow execution
//!
//! # Optional Traits
//!
//! - [`Retryable`] - Configure retry policy
//! - [`WithTimeout`] - Configure custom timeout

mod context;
mod error;
mod poll;
mod retry;
mod step;
mod traits;

pub use context::{Context, StepValue};
pub use error::{PermanentKind, StepError, WorkflowError};
pub use poll::{PollCondition, PollFuture, PollSchedule, PollScheduleError};
pub use retry::{Backoff, RetryPolicy, RetryPolicyError};
pub use step::{FnStep, Step, StepConfig, StepMode, StepName, SuccessPredicate, WorkflowStep};
pub use traits::{Retryable, WithTimeout};
