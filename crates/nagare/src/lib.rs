//! Asynchronous workflow coordinator with retry and eventual-consistency polling.
//!
//! A [`Coordinator`] runs an ordered list of steps. Each step sees the results
//! of the steps before it through the [`Context`], may carry a
//! [`RetryPolicy`], a per-attempt timeout and a success predicate, and is
//! either fatal or best-effort. Steps that wait for effects to become
//! visible use a [`PollStep`] driven by the [`Resolver`].
//!
//! The [`rpc`] module defines the database boundary the replication workflow
//! ([`ReplicationScenario`]) is built on.
//!
//! # Example
//!
//! ```rust
//! use nagare::prelude::*;
//!
//! # tokio_test::block_on(async {
//! let coordinator = Coordinator::builder()
//!     .add(WorkflowStep::new(FnStep::new("source", |_ctx: &Context| async {
//!         Ok::<_, StepError>(StepValue::new("db_a".to_string()))
//!     })))
//!     .add(
//!         WorkflowStep::new(FnStep::new("length", |ctx: &Context| {
//!             let source = ctx.require::<String>("source").cloned();
//!             async move { source.map(|s| StepValue::new(s.len())) }
//!         }))
//!         .expect_that("source name has 4 characters", |n: &usize| *n == 4),
//!     )
//!     .build()
//!     .expect("valid workflow");
//!
//! let result = coordinator.run().await;
//! assert!(result.is_completed());
//! assert_eq!(result.context().get::<usize>("length"), Some(&4));
//! # });
//! ```

mod cancel;
mod config;
mod coordinator;
mod replication;
mod report;
mod resolver;
mod retry;
pub mod rpc;

// Re-export core types
pub use nagare_core::*;

pub use cancel::CancelToken;
pub use config::{ClientConfig, ConfigError, ReplicationConfig};
pub use coordinator::{
    Coordinator, CoordinatorBuilder, WorkflowHandle, WorkflowResult, WorkflowState,
};
pub use replication::ReplicationScenario;
pub use report::{Report, Reporter, RunStatus, StepOutcome};
pub use resolver::{PollStep, Resolved, Resolver};
pub use retry::{attempt, Attempted};
pub use rpc::{CouchClient, DatabaseClient, MemoryClient, RpcError};

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::{
        CancelToken, Context, Coordinator, FnStep, PollCondition, PollSchedule, PollStep,
        Report, Resolver, RetryPolicy, Retryable, RunStatus, Step, StepConfig, StepError,
        StepMode, StepName, StepValue, WithTimeout, WorkflowError, WorkflowResult, WorkflowStep,
    };
}
