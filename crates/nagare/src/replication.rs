//! The database replication workflow.
//!
//! For a source and each target the scenario runs, in order:
//!
//! 1. `create_database:{db}` for the source and every target
//! 2. `seed_documents:{source}` when documents are requested
//! 3. per target: `start_replication`, `await_replication`,
//!    `verify_documents` (when seeding) and `stop_replication`
//! 4. best-effort `delete_database:{db}` for every target, then the source
//!
//! Deleting a target first stops its replication job when the job was
//! started but `stop_replication` never succeeded, so a failed run does not
//! leave a continuous job behind.
//!
//! Later steps read the job reference and seeded documents from the context.

use crate::cancel::CancelToken;
use crate::config::ReplicationConfig;
use crate::coordinator::{Coordinator, CoordinatorBuilder};
use crate::resolver::{PollStep, Resolver};
use crate::rpc::{
    Ack, DatabaseClient, DatabaseInfo, DocRef, JobRef, ReplicationOptions, ReplicationState,
    ReplicationStatus,
};
use async_trait::async_trait;
use nagare_core::{
    Context, FnStep, PermanentKind, PollCondition, PollSchedule, RetryPolicy, Retryable, Step,
    StepError, StepName, StepValue, WorkflowError, WorkflowStep,
};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

const SEED_DATA: &str = "abcdefghijklmnopqrstuvwxyz";

/// Builds the replication workflow against any [`DatabaseClient`].
///
/// # Examples
///
/// ```
/// use nagare::{MemoryClient, ReplicationConfig, ReplicationScenario};
/// use std::sync::Arc;
///
/// # tokio_test::block_on(async {
/// let scenario = ReplicationScenario::new(
///     Arc::new(MemoryClient::new()),
///     ReplicationConfig::default(),
/// );
/// let result = scenario.build().expect("valid scenario").run().await;
/// assert!(result.is_completed());
/// assert_eq!(result.report().outcomes().len(), 7);
/// # });
/// ```
#[derive(Debug)]
pub struct ReplicationScenario {
    client: Arc<dyn DatabaseClient>,
    config: ReplicationConfig,
    cancel: Option<CancelToken>,
}

impl ReplicationScenario {
    /// Creates a scenario.
    pub fn new(client: Arc<dyn DatabaseClient>, config: ReplicationConfig) -> Self {
        Self {
            client,
            config,
            cancel: None,
        }
    }

    /// Cancels the run, including any poll in progress, when `token` fires.
    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// The scenario's configuration.
    pub fn config(&self) -> &ReplicationConfig {
        &self.config
    }

    /// Validates the configuration and lays out the steps.
    pub fn build(self) -> Result<Coordinator, WorkflowError> {
        let config = &self.config;
        config
            .validate()
            .map_err(|e| WorkflowError::Configuration(e.to_string()))?;
        let schedule = config
            .poll_schedule()
            .map_err(|e| WorkflowError::Configuration(e.to_string()))?;
        let stop_policy = config
            .stop_policy()
            .map_err(|e| WorkflowError::Configuration(e.to_string()))?;

        let cancel = self.cancel.clone().unwrap_or_default();
        let resolver = Resolver::new().with_cancel_token(cancel.clone());
        let options = ReplicationOptions {
            create_target: config.create_target,
            continuous: config.continuous,
        };
        let seed_step = step_name("seed_documents", &config.source);

        let mut builder = CoordinatorBuilder::new().with_cancel_token(cancel);

        if config.create_source {
            builder = builder.add(create_database(&self.client, &config.source));
        }
        if !config.create_target {
            for target in &config.targets {
                builder = builder.add(create_database(&self.client, target));
            }
        }
        if config.documents > 0 {
            builder = builder.add(seed_documents(
                &self.client,
                &config.source,
                config.documents,
            ));
        }

        for target in &config.targets {
            let start_step = step_name("start_replication", target);
            builder = builder
                .add(start_replication(
                    &self.client,
                    &config.source,
                    target,
                    options,
                ))
                .add(await_replication(
                    &self.client,
                    &resolver,
                    schedule,
                    target,
                    start_step.clone(),
                ));
            if config.documents > 0 {
                builder = builder.add(verify_documents(
                    &self.client,
                    &resolver,
                    schedule,
                    target,
                    seed_step.clone(),
                    config.documents,
                ));
            }
            builder = builder.add_retryable(StopReplication {
                name: step_name("stop_replication", target),
                client: self.client.clone(),
                start_step,
                policy: stop_policy.clone(),
            });
        }

        for target in &config.targets {
            builder = builder.add(
                WorkflowStep::new(DeleteTarget {
                    name: step_name("delete_database", target),
                    client: self.client.clone(),
                    db: target.clone(),
                    start_step: step_name("start_replication", target),
                    stop_step: step_name("stop_replication", target),
                })
                .expect_that("database deleted", |ack: &Ack| ack.ok)
                .best_effort(),
            );
        }
        if config.create_source {
            builder = builder.add(delete_database(&self.client, &config.source));
        }

        builder.build()
    }
}

fn step_name(action: &str, db: &str) -> StepName {
    StepName::new(format!("{}:{}", action, db))
}

fn create_database(client: &Arc<dyn DatabaseClient>, db: &str) -> WorkflowStep {
    let client = client.clone();
    let db_name = db.to_string();
    WorkflowStep::new(FnStep::new(
        step_name("create_database", db),
        move |_ctx: &Context| {
            let client = client.clone();
            let db = db_name.clone();
            async move {
                client
                    .create_database(&db)
                    .await
                    .map(StepValue::new)
                    .map_err(StepError::from)
            }
        },
    ))
    .expect_that("database created", |info: &DatabaseInfo| info.ok)
}

fn delete_database(client: &Arc<dyn DatabaseClient>, db: &str) -> WorkflowStep {
    let client = client.clone();
    let db_name = db.to_string();
    WorkflowStep::new(FnStep::new(
        step_name("delete_database", db),
        move |_ctx: &Context| {
            let client = client.clone();
            let db = db_name.clone();
            async move {
                client
                    .delete_database(&db)
                    .await
                    .map(StepValue::new)
                    .map_err(StepError::from)
            }
        },
    ))
    .expect_that("database deleted", |ack: &Ack| ack.ok)
    .best_effort()
}

fn seed_documents(client: &Arc<dyn DatabaseClient>, db: &str, count: usize) -> WorkflowStep {
    let client = client.clone();
    let db_name = db.to_string();
    WorkflowStep::new(FnStep::new(
        step_name("seed_documents", db),
        move |_ctx: &Context| {
            let client = client.clone();
            let db = db_name.clone();
            async move {
                let mut saved = Vec::with_capacity(count);
                for i in 0..count {
                    let doc = json!({ "i": i, "test": true, "data": SEED_DATA });
                    match client.save_doc(&db, &doc).await {
                        Ok(doc_ref) => saved.push(doc_ref),
                        Err(error) => return Err(StepError::from(error)),
                    }
                }
                Ok(StepValue::new(saved))
            }
        },
    ))
    .expect_that(format!("{} documents saved", count), move |saved: &Vec<DocRef>| {
        saved.len() == count
    })
}

fn start_replication(
    client: &Arc<dyn DatabaseClient>,
    source: &str,
    target: &str,
    options: ReplicationOptions,
) -> WorkflowStep {
    let client = client.clone();
    let source = source.to_string();
    let target_name = target.to_string();
    WorkflowStep::new(FnStep::new(
        step_name("start_replication", target),
        move |_ctx: &Context| {
            let client = client.clone();
            let source = source.clone();
            let target = target_name.clone();
            async move {
                client
                    .start_replication(&source, &target, options)
                    .await
                    .map(StepValue::new)
                    .map_err(StepError::from)
            }
        },
    ))
    .expect_that("replication job id defined", |job: &JobRef| {
        !job.id.is_empty()
    })
}

fn await_replication(
    client: &Arc<dyn DatabaseClient>,
    resolver: &Resolver,
    schedule: PollSchedule,
    target: &str,
    start_step: StepName,
) -> WorkflowStep {
    let client = client.clone();
    let step = PollStep::new(
        step_name("await_replication", target),
        resolver.clone(),
        move |ctx: &Context| {
            let job = ctx.require::<JobRef>(start_step.as_str())?.clone();
            let client = client.clone();
            let job_id = job.id.clone();
            Ok(PollCondition::new(
                format!("replication {} active", job.id),
                schedule,
                move || {
                    let client = client.clone();
                    let job_id = job_id.clone();
                    async move { fetch_status(client, job_id).await }
                },
                move |status: &ReplicationStatus| status.id == job.id && is_active(status),
            ))
        },
    );
    WorkflowStep::new(step)
        .without_timeout()
        .expect_that("replication job triggered", is_active)
}

fn is_active(status: &ReplicationStatus) -> bool {
    status
        .state
        .as_ref()
        .is_some_and(ReplicationState::is_active)
}

async fn fetch_status(
    client: Arc<dyn DatabaseClient>,
    job_id: String,
) -> Result<ReplicationStatus, StepError> {
    let status = client.replication_status(&job_id).await?;
    if status
        .state
        .as_ref()
        .is_some_and(ReplicationState::is_failed)
    {
        return Err(StepError::permanent(
            PermanentKind::Other,
            format!("replication {} failed", job_id),
        ));
    }
    Ok(status)
}

fn verify_documents(
    client: &Arc<dyn DatabaseClient>,
    resolver: &Resolver,
    schedule: PollSchedule,
    target: &str,
    seed_step: StepName,
    count: usize,
) -> WorkflowStep {
    let client = client.clone();
    let target_name = target.to_string();
    let step = PollStep::new(
        step_name("verify_documents", target),
        resolver.clone(),
        move |ctx: &Context| {
            let ids: Arc<Vec<String>> = Arc::new(
                ctx.require::<Vec<DocRef>>(seed_step.as_str())?
                    .iter()
                    .map(|doc| doc.id.clone())
                    .collect(),
            );
            let expected = ids.len();
            let client = client.clone();
            let target = target_name.clone();
            Ok(PollCondition::new(
                format!("{} documents visible in {}", expected, target),
                schedule,
                move || count_visible(client.clone(), target.clone(), ids.clone()),
                move |visible: &usize| *visible == expected,
            ))
        },
    );
    WorkflowStep::new(step)
        .without_timeout()
        .expect_that(
            format!("{} documents replicated", count),
            move |visible: &usize| *visible == count,
        )
}

/// Number of `ids` readable from `db`.
async fn count_visible(
    client: Arc<dyn DatabaseClient>,
    db: String,
    ids: Arc<Vec<String>>,
) -> Result<usize, StepError> {
    let mut visible = 0;
    for id in ids.iter() {
        match client.get_doc(&db, id).await {
            Ok(_) => visible += 1,
            Err(error) => {
                let error = StepError::from(error);
                if !error.is_not_found() {
                    return Err(error);
                }
            }
        }
    }
    Ok(visible)
}

/// Stops a replication job.
///
/// The job document's revision changes as the server updates its state, so
/// every attempt reads the current revision first.
#[derive(Debug)]
struct StopReplication {
    name: StepName,
    client: Arc<dyn DatabaseClient>,
    start_step: StepName,
    policy: RetryPolicy,
}

#[async_trait]
impl Step for StopReplication {
    async fn execute(&self, ctx: &Context) -> Result<StepValue, StepError> {
        let job = ctx.require::<JobRef>(self.start_step.as_str())?;
        let current = self.client.replication_status(&job.id).await?;
        debug!("Stopping replication {} at rev {}", current.id, current.rev);
        let ack = self.client.stop_replication(&current.job_ref()).await?;
        Ok(StepValue::new(ack))
    }

    fn name(&self) -> StepName {
        self.name.clone()
    }
}

impl Retryable for StopReplication {
    fn retry_policy(&self) -> RetryPolicy {
        self.policy.clone()
    }
}

/// Deletes a target database, stopping a replication job still writing to it.
#[derive(Debug)]
struct DeleteTarget {
    name: StepName,
    client: Arc<dyn DatabaseClient>,
    db: String,
    start_step: StepName,
    stop_step: StepName,
}

impl DeleteTarget {
    async fn release(&self, job: &JobRef) -> Result<(), StepError> {
        let current = self.client.replication_status(&job.id).await?;
        info!(
            "Stopping replication {} left running at rev {}",
            current.id, current.rev
        );
        self.client.stop_replication(&current.job_ref()).await?;
        Ok(())
    }
}

#[async_trait]
impl Step for DeleteTarget {
    async fn execute(&self, ctx: &Context) -> Result<StepValue, StepError> {
        if !ctx.contains(self.stop_step.as_str()) {
            if let Some(job) = ctx.get::<JobRef>(self.start_step.as_str()) {
                if let Err(error) = self.release(job).await {
                    warn!("Could not stop replication {}: {}", job.id, error);
                }
            }
        }
        let ack = self.client.delete_database(&self.db).await?;
        Ok(StepValue::new(ack))
    }

    fn name(&self) -> StepName {
        self.name.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::{MemoryClient, Operation};

    fn names(coordinator: &Coordinator) -> Vec<String> {
        coordinator
            .step_names()
            .map(|n| n.as_str().to_string())
            .collect()
    }

    #[test]
    fn test_default_layout() {
        let scenario = ReplicationScenario::new(
            Arc::new(MemoryClient::new()),
            ReplicationConfig::default(),
        );
        let coordinator = scenario.build().expect("valid scenario");

        assert_eq!(
            names(&coordinator),
            vec![
                "create_database:nagare_source",
                "create_database:nagare_target",
                "start_replication:nagare_target",
                "await_replication:nagare_target",
                "stop_replication:nagare_target",
                "delete_database:nagare_target",
                "delete_database:nagare_source",
            ]
        );
    }

    #[test]
    fn test_layout_with_documents_and_targets() {
        let config = ReplicationConfig {
            source: "src".to_string(),
            targets: vec!["a".to_string(), "b".to_string()],
            create_target: true,
            documents: 5,
            ..ReplicationConfig::default()
        };
        let coordinator = ReplicationScenario::new(Arc::new(MemoryClient::new()), config)
            .build()
            .expect("valid scenario");

        assert_eq!(
            names(&coordinator),
            vec![
                "create_database:src",
                "seed_documents:src",
                "start_replication:a",
                "await_replication:a",
                "verify_documents:a",
                "stop_replication:a",
                "start_replication:b",
                "await_replication:b",
                "verify_documents:b",
                "stop_replication:b",
                "delete_database:a",
                "delete_database:b",
                "delete_database:src",
            ]
        );
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = ReplicationConfig {
            targets: Vec::new(),
            ..ReplicationConfig::default()
        };
        let result = ReplicationScenario::new(Arc::new(MemoryClient::new()), config).build();
        assert!(matches!(result, Err(WorkflowError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_stop_uses_current_revision() {
        let client = MemoryClient::new();
        client.create_database("src").await.expect("create src");
        client.create_database("dst").await.expect("create dst");
        let job = client
            .start_replication("src", "dst", ReplicationOptions::default())
            .await
            .expect("start");

        let mut ctx = Context::new();
        ctx.record(StepName::new("start"), StepValue::new(job))
            .expect("record");

        let step = StopReplication {
            name: StepName::new("stop"),
            client: Arc::new(client.clone()),
            start_step: StepName::new("start"),
            policy: RetryPolicy::once(),
        };
        let value = step.execute(&ctx).await.expect("stop succeeds");
        assert_eq!(value.downcast_ref::<Ack>(), Some(&Ack { ok: true }));
        assert_eq!(client.active_jobs().await, 0);
    }

    #[tokio::test]
    async fn test_delete_target_stops_unstopped_job() {
        let client = MemoryClient::new();
        client.create_database("src").await.expect("create src");
        client.create_database("dst").await.expect("create dst");
        let job = client
            .start_replication("src", "dst", ReplicationOptions::default())
            .await
            .expect("start");

        let mut ctx = Context::new();
        ctx.record(StepName::new("start"), StepValue::new(job))
            .expect("record");

        let step = DeleteTarget {
            name: StepName::new("delete"),
            client: Arc::new(client.clone()),
            db: "dst".to_string(),
            start_step: StepName::new("start"),
            stop_step: StepName::new("stop"),
        };
        let value = step.execute(&ctx).await.expect("delete succeeds");

        assert_eq!(value.downcast_ref::<Ack>(), Some(&Ack { ok: true }));
        assert_eq!(client.active_jobs().await, 0);
        assert!(!client.has_database("dst").await);
    }

    #[tokio::test]
    async fn test_delete_target_leaves_stopped_job_alone() {
        let client = MemoryClient::new();
        client.create_database("dst").await.expect("create dst");

        let mut ctx = Context::new();
        ctx.record(
            StepName::new("start"),
            StepValue::new(JobRef {
                id: "gone".to_string(),
                rev: "1-memory".to_string(),
            }),
        )
        .expect("record start");
        ctx.record(StepName::new("stop"), StepValue::new(Ack { ok: true }))
            .expect("record stop");

        let step = DeleteTarget {
            name: StepName::new("delete"),
            client: Arc::new(client.clone()),
            db: "dst".to_string(),
            start_step: StepName::new("start"),
            stop_step: StepName::new("stop"),
        };
        step.execute(&ctx).await.expect("delete succeeds");

        assert_eq!(client.calls(Operation::ReplicationStatus).await, 0);
        assert_eq!(client.calls(Operation::StopReplication).await, 0);
    }
}
