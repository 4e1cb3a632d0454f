//! Document database RPC boundary.
//!
//! [`DatabaseClient`] is the only interface the coordinator's replication
//! steps use to reach the database. [`CouchClient`] talks HTTP to a
//! CouchDB-compatible server; [`MemoryClient`] is an in-process stand-in.

mod couch;
mod memory;

pub use couch::{classify_status, CouchClient};
pub use memory::{MemoryClient, Operation};

use async_trait::async_trait;
use nagare_core::{PermanentKind, StepError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// Failure of a single RPC.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RpcError {
    /// Network failure, timeout or an overloaded server.
    #[error("transient RPC failure: {0}")]
    Transient(String),

    /// The server rejected the request.
    #[error("{kind}: {message}")]
    Permanent {
        /// Classification of the rejection.
        kind: PermanentKind,
        /// Server supplied reason.
        message: String,
    },
}

impl RpcError {
    /// Creates a permanent error.
    pub fn permanent(kind: PermanentKind, message: impl Into<String>) -> Self {
        RpcError::Permanent {
            kind,
            message: message.into(),
        }
    }

    /// Creates a permanent "not found" error.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::permanent(PermanentKind::NotFound, message)
    }

    /// Creates a permanent "conflict" error.
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::permanent(PermanentKind::Conflict, message)
    }
}

impl From<RpcError> for StepError {
    fn from(error: RpcError) -> Self {
        match error {
            RpcError::Transient(message) => StepError::Transient(message),
            RpcError::Permanent { kind, message } => StepError::Permanent { kind, message },
        }
    }
}

/// Result alias for RPC calls.
pub type RpcResult<T> = Result<T, RpcError>;

/// Plain acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    /// `true` when the server accepted the request.
    pub ok: bool,
}

/// A database that was just created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseInfo {
    /// Database name.
    pub name: String,
    /// `true` when the server accepted the request.
    pub ok: bool,
}

/// Options for starting a replication job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationOptions {
    /// Create the target database if it does not exist.
    pub create_target: bool,
    /// Keep replicating new changes until stopped.
    pub continuous: bool,
}

impl Default for ReplicationOptions {
    fn default() -> Self {
        Self {
            create_target: false,
            continuous: true,
        }
    }
}

/// Reference to a replication job: its document id and revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRef {
    /// Job id.
    pub id: String,
    /// Revision of the job document.
    pub rev: String,
}

/// Lifecycle state reported for a replication job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicationState {
    /// Accepted, not yet running.
    Initializing,
    /// Waiting for a scheduler slot.
    Pending,
    /// Started.
    Triggered,
    /// Actively replicating.
    Running,
    /// One-shot replication finished.
    Completed,
    /// Repeatedly failing; will be retried by the server.
    Crashing,
    /// Temporarily failed.
    Error,
    /// Permanently failed.
    Failed,
    /// Anything this client does not know about.
    #[serde(other)]
    Unknown,
}

impl ReplicationState {
    /// `true` once the job is actually moving data (or is done).
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ReplicationState::Triggered | ReplicationState::Running | ReplicationState::Completed
        )
    }

    /// `true` for states the job will not leave on its own.
    pub fn is_failed(&self) -> bool {
        matches!(self, ReplicationState::Failed)
    }
}

/// Status of a replication job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationStatus {
    /// Job id.
    pub id: String,
    /// Current revision of the job document.
    pub rev: String,
    /// Reported state; absent until the server has picked the job up.
    pub state: Option<ReplicationState>,
    /// Source as recorded on the job.
    pub source: String,
    /// Target as recorded on the job.
    pub target: String,
}

impl ReplicationStatus {
    /// A job reference carrying the current revision.
    pub fn job_ref(&self) -> JobRef {
        JobRef {
            id: self.id.clone(),
            rev: self.rev.clone(),
        }
    }
}

/// Reference to a stored document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocRef {
    /// Document id.
    pub id: String,
    /// Document revision.
    pub rev: String,
}

/// A fetched document.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    /// Document id.
    pub id: String,
    /// Document revision.
    pub rev: String,
    /// Full body, including `_id` and `_rev`.
    pub body: Value,
}

/// Asynchronous operations against a document database.
///
/// Implementations hold no per-workflow state and must be safe to call from
/// concurrent runs.
#[async_trait]
pub trait DatabaseClient: Send + Sync + fmt::Debug {
    /// Creates a database.
    async fn create_database(&self, name: &str) -> RpcResult<DatabaseInfo>;

    /// Deletes a database.
    async fn delete_database(&self, name: &str) -> RpcResult<Ack>;

    /// Starts replicating `source` into `target`.
    async fn start_replication(
        &self,
        source: &str,
        target: &str,
        options: ReplicationOptions,
    ) -> RpcResult<JobRef>;

    /// Stops a replication job. The revision must be current.
    async fn stop_replication(&self, job: &JobRef) -> RpcResult<Ack>;

    /// Looks up a replication job.
    async fn replication_status(&self, job_id: &str) -> RpcResult<ReplicationStatus>;

    /// Stores a new document in `db`.
    async fn save_doc(&self, db: &str, doc: &Value) -> RpcResult<DocRef>;

    /// Fetches a document from `db`.
    async fn get_doc(&self, db: &str, id: &str) -> RpcResult<Document>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rpc_error_into_step_error() {
        let step: StepError = RpcError::Transient("reset".to_string()).into();
        assert!(step.is_retryable());

        let step: StepError = RpcError::not_found("missing").into();
        assert!(step.is_not_found());
        assert!(!step.is_retryable());
    }

    #[test]
    fn test_replication_state_parsing() {
        let state: ReplicationState =
            serde_json::from_str("\"triggered\"").expect("known state");
        assert_eq!(state, ReplicationState::Triggered);
        assert!(state.is_active());

        let state: ReplicationState =
            serde_json::from_str("\"something_new\"").expect("unknown state");
        assert_eq!(state, ReplicationState::Unknown);
        assert!(!state.is_active());
    }
}
