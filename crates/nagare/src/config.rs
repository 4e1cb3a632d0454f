//! Client and scenario configuration.

use nagare_core::{PermanentKind, PollSchedule, PollScheduleError, RetryPolicy, RetryPolicyError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A value is out of range or malformed.
    #[error("invalid configuration: {0}")]
    Invalid(String),

    /// The HTTP client could not be constructed.
    #[error("failed to build HTTP client: {0}")]
    Client(String),

    /// The stop retry policy is invalid.
    #[error("invalid retry policy: {0}")]
    RetryPolicy(#[from] RetryPolicyError),

    /// The poll schedule is invalid.
    #[error("invalid poll schedule: {0}")]
    PollSchedule(#[from] PollScheduleError),

    /// The configuration document is not valid JSON.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Connection settings for [`CouchClient`](crate::CouchClient).
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server root, e.g. `http://localhost:5984`.
    pub base_url: String,
    /// Per-request timeout.
    pub timeout_secs: u64,
    /// Basic auth user.
    pub username: Option<String>,
    /// Basic auth password.
    pub password: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:5984".to_string(),
            timeout_secs: 30,
            username: None,
            password: None,
        }
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("base_url", &self.base_url)
            .field("timeout_secs", &self.timeout_secs)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

/// Settings for a replication scenario.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// Database replicated from.
    pub source: String,
    /// Databases replicated into, in order.
    pub targets: Vec<String>,
    /// Create the source at the start and delete it at the end.
    pub create_source: bool,
    /// Let the server create the targets instead of creating them up front.
    pub create_target: bool,
    /// Keep replicating until stopped.
    pub continuous: bool,
    /// Documents to seed into the source and wait for in every target.
    pub documents: usize,
    /// Delay between replication status checks.
    pub poll_interval_ms: u64,
    /// Budget for each poll step.
    pub poll_timeout_ms: u64,
    /// Attempts to stop a replication job.
    pub stop_attempts: u32,
    /// Delay between stop attempts.
    pub stop_backoff_ms: u64,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            source: "nagare_source".to_string(),
            targets: vec!["nagare_target".to_string()],
            create_source: true,
            create_target: false,
            continuous: true,
            documents: 0,
            poll_interval_ms: 250,
            poll_timeout_ms: 10_000,
            stop_attempts: 3,
            stop_backoff_ms: 500,
        }
    }
}

impl ReplicationConfig {
    /// Parses a JSON document; missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks names and derived policies.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.source.is_empty() {
            return Err(ConfigError::Invalid("source must not be empty".to_string()));
        }
        if self.targets.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one target is required".to_string(),
            ));
        }
        for (i, target) in self.targets.iter().enumerate() {
            if target.is_empty() {
                return Err(ConfigError::Invalid(format!("target {} is empty", i + 1)));
            }
            if *target == self.source {
                return Err(ConfigError::Invalid(format!(
                    "target '{}' is the source",
                    target
                )));
            }
            if self.targets[..i].contains(target) {
                return Err(ConfigError::Invalid(format!(
                    "target '{}' is listed twice",
                    target
                )));
            }
        }
        self.poll_schedule()?;
        self.stop_policy()?;
        Ok(())
    }

    /// Schedule shared by the scenario's poll steps.
    pub fn poll_schedule(&self) -> Result<PollSchedule, ConfigError> {
        Ok(PollSchedule::new(
            Duration::from_millis(self.poll_interval_ms),
            Duration::from_millis(self.poll_timeout_ms),
        )?)
    }

    /// Retry policy of the stop step.
    ///
    /// Transient failures and conflicts are retried: the job document's
    /// revision moves while the job runs.
    pub fn stop_policy(&self) -> Result<RetryPolicy, ConfigError> {
        let policy = RetryPolicy::fixed(
            self.stop_attempts,
            Duration::from_millis(self.stop_backoff_ms),
        )?;
        Ok(policy.with_classifier(|error| {
            error.is_retryable() || error.permanent_kind() == Some(PermanentKind::Conflict)
        }))
    }
}
