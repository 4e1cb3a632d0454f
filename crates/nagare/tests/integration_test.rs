use async_trait::async_trait;
use nagare::prelude::*;
use nagare::WorkflowState;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_test::assert_ok;

#[derive(Debug)]
struct Step1;

#[async_trait]
impl Step for Step1 {
    async fn execute(&self, _ctx: &Context) -> Result<StepValue, StepError> {
        Ok(StepValue::new("db_a".to_string()))
    }

    fn name(&self) -> StepName {
        StepName::new("Step1")
    }
}

#[derive(Debug)]
struct Step2;

#[async_trait]
impl Step for Step2 {
    async fn execute(&self, ctx: &Context) -> Result<StepValue, StepError> {
        let previous = ctx.require::<String>("Step1")?;
        Ok(StepValue::new(format!("{}_copy", previous)))
    }

    fn name(&self) -> StepName {
        StepName::new("Step2")
    }
}

/// Counts invocations and fails with a transient error until `fail_until`.
#[derive(Debug)]
struct CountingStep {
    name: &'static str,
    calls: Arc<AtomicU32>,
    fail_until: u32,
}

impl CountingStep {
    fn new(name: &'static str, calls: &Arc<AtomicU32>) -> Self {
        Self {
            name,
            calls: calls.clone(),
            fail_until: 0,
        }
    }

    fn failing(name: &'static str, calls: &Arc<AtomicU32>, fail_until: u32) -> Self {
        Self {
            fail_until,
            ..Self::new(name, calls)
        }
    }
}

#[async_trait]
impl Step for CountingStep {
    async fn execute(&self, _ctx: &Context) -> Result<StepValue, StepError> {
        let attempt = self.calls.fetch_add(1, Ordering::SeqCst);
        if attempt < self.fail_until {
            Err(StepError::transient(format!("Attempt {} failed", attempt + 1)))
        } else {
            Ok(StepValue::new(attempt + 1))
        }
    }

    fn name(&self) -> StepName {
        StepName::new(self.name)
    }
}

impl Retryable for CountingStep {
    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::fixed(3, Duration::from_millis(10)).unwrap_or_default()
    }
}

#[derive(Debug)]
struct FatalStep;

#[async_trait]
impl Step for FatalStep {
    async fn execute(&self, _ctx: &Context) -> Result<StepValue, StepError> {
        Err(StepError::invalid_input("no such source"))
    }

    fn name(&self) -> StepName {
        StepName::new("FatalStep")
    }
}

#[derive(Debug)]
struct SlowStep;

#[async_trait]
impl Step for SlowStep {
    async fn execute(&self, _ctx: &Context) -> Result<StepValue, StepError> {
        tokio::time::sleep(Duration::from_secs(10)).await;
        Ok(StepValue::unit())
    }

    fn name(&self) -> StepName {
        StepName::new("SlowStep")
    }
}

impl WithTimeout for SlowStep {
    fn timeout(&self) -> Duration {
        Duration::from_millis(20)
    }
}

#[tokio::test]
async fn test_complete_workflow() {
    let coordinator = assert_ok!(Coordinator::builder()
        .add_step(Step1)
        .add_step(Step2)
        .build());

    let result = coordinator.run().await;

    assert!(result.is_completed());
    assert_eq!(result.report().exit_code(), 0);
    assert_eq!(
        result.context().get::<String>("Step2").map(|s| s.as_str()),
        Some("db_a_copy")
    );
    let order: Vec<&str> = result.context().steps().map(|s| s.as_str()).collect();
    assert_eq!(order, vec!["Step1", "Step2"]);
    assert!(result.report().outcomes().iter().all(|o| o.passed));
}

#[tokio::test]
async fn test_fatal_failure_stops_forward_progress() {
    let before = Arc::new(AtomicU32::new(0));
    let after = Arc::new(AtomicU32::new(0));
    let cleanup = Arc::new(AtomicU32::new(0));

    let coordinator = assert_ok!(Coordinator::builder()
        .add_step(CountingStep::new("first", &before))
        .add_step(CountingStep::new("second", &before))
        .add_step(FatalStep)
        .add_step(CountingStep::new("fourth", &after))
        .add_best_effort(CountingStep::new("cleanup", &cleanup))
        .build());

    let result = coordinator.run().await;
    let report = result.report();

    assert_eq!(before.load(Ordering::SeqCst), 2);
    assert_eq!(after.load(Ordering::SeqCst), 0);
    assert_eq!(cleanup.load(Ordering::SeqCst), 1);

    assert!(matches!(
        result.status(),
        RunStatus::Failed { step_index: 2, step_name, .. } if step_name.as_str() == "FatalStep"
    ));
    assert_eq!(report.exit_code(), 3);
    assert_eq!(report.skipped(), &[StepName::new("fourth")]);
    assert_eq!(
        report.first_failure().map(|o| o.step_name.as_str()),
        Some("FatalStep")
    );

    // Results recorded before the failure survive.
    assert!(result.context().contains("second"));
    assert!(!result.context().contains("FatalStep"));
}

#[tokio::test(start_paused = true)]
async fn test_timeout_error() {
    let coordinator = assert_ok!(Coordinator::builder()
        .add_with_timeout(SlowStep, Duration::from_millis(50))
        .build());

    let result = coordinator.run().await;

    assert!(matches!(
        result.error(),
        Some(WorkflowError::StepFailed {
            source: StepError::Timeout { after },
            ..
        }) if after == Duration::from_millis(50)
    ));
}

#[tokio::test(start_paused = true)]
async fn test_timeouts_are_retried() {
    let coordinator = assert_ok!(Coordinator::builder()
        .add(
            WorkflowStep::new(SlowStep)
                .with_timeout(SlowStep.timeout())
                .with_retry(assert_ok!(RetryPolicy::fixed(2, Duration::from_millis(5)))),
        )
        .build());

    let result = coordinator.run().await;

    assert_eq!(result.report().outcomes()[0].attempts_used, 2);
    assert!(matches!(
        result.error(),
        Some(WorkflowError::StepFailed { attempts: 2, .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn test_with_timeout_trait() {
    let coordinator = assert_ok!(Coordinator::builder()
        .add_with_timeout_trait(SlowStep)
        .build());

    let result = coordinator.run().await;
    let outcome = &result.report().outcomes()[0];
    assert!(!outcome.passed);
    assert!(outcome.actual.contains("timed out"), "{}", outcome.actual);
}

#[tokio::test(start_paused = true)]
async fn test_retry_eventual_success() {
    let calls = Arc::new(AtomicU32::new(0));

    let coordinator = assert_ok!(Coordinator::builder()
        .add_retryable(CountingStep::failing("retry", &calls, 2))
        .build());

    let result = coordinator.run().await;

    assert!(result.is_completed());
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(result.report().outcomes()[0].attempts_used, 3);
    assert_eq!(result.context().get::<u32>("retry"), Some(&3));
}

#[tokio::test(start_paused = true)]
async fn test_retry_exhausted() {
    let calls = Arc::new(AtomicU32::new(0));

    let coordinator = assert_ok!(Coordinator::builder()
        .add_retryable(CountingStep::failing("retry", &calls, 10))
        .build());

    let result = coordinator.run().await;

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert!(matches!(
        result.error(),
        Some(WorkflowError::StepFailed {
            attempts: 3,
            source: StepError::Transient(_),
            ..
        })
    ));
}

#[tokio::test]
async fn test_best_effort_delete_of_absent_resource() {
    let coordinator = assert_ok!(Coordinator::builder()
        .add_step(Step1)
        .add(
            WorkflowStep::new(FnStep::new("delete_database:gone", |_ctx: &Context| async {
                Err::<StepValue, _>(StepError::not_found("Database does not exist."))
            }))
            .best_effort(),
        )
        .build());

    let result = coordinator.run().await;

    assert!(result.is_completed());
    let outcome = result
        .report()
        .outcome("delete_database:gone")
        .expect("delete ran");
    assert!(outcome.passed);
    assert!(outcome.tolerated);
}

#[tokio::test]
async fn test_best_effort_failure_does_not_fail_run() {
    let coordinator = assert_ok!(Coordinator::builder()
        .add_best_effort(FatalStep)
        .add_step(Step1)
        .build());

    let result = coordinator.run().await;

    assert!(result.is_completed());
    let outcome = &result.report().outcomes()[0];
    assert!(!outcome.passed);
    assert!(outcome.tolerated);
    assert!(result.context().contains("Step1"));
}

#[tokio::test]
async fn test_predicate_rejection() {
    let coordinator = assert_ok!(Coordinator::builder()
        .add(WorkflowStep::new(Step1).expect_that("names the target", |db: &String| db == "db_b"))
        .build());

    let result = coordinator.run().await;

    assert!(matches!(
        result.error(),
        Some(WorkflowError::StepFailed {
            source: StepError::Rejected { .. },
            ..
        })
    ));
    assert_eq!(result.report().outcomes()[0].expected, "names the target");
    assert!(!result.context().contains("Step1"));
}

#[tokio::test]
async fn test_heterogeneous_context() {
    #[derive(Debug)]
    struct Typed<T: Clone + std::fmt::Debug + Send + Sync + 'static>(&'static str, T);

    #[async_trait]
    impl<T: Clone + std::fmt::Debug + Send + Sync + 'static> Step for Typed<T> {
        async fn execute(&self, _ctx: &Context) -> Result<StepValue, StepError> {
            Ok(StepValue::new(self.1.clone()))
        }

        fn name(&self) -> StepName {
            StepName::new(self.0)
        }
    }

    let coordinator = assert_ok!(Coordinator::builder()
        .add_step(Typed("int_val", 42i32))
        .add_step(Typed("str_val", "hello".to_string()))
        .add_step(Typed("bool_val", true))
        .build());

    let result = coordinator.run().await;
    let ctx = result.context();

    assert_eq!(ctx.get::<i32>("int_val"), Some(&42));
    assert_eq!(ctx.get::<String>("str_val"), Some(&"hello".to_string()));
    assert_eq!(ctx.get::<bool>("bool_val"), Some(&true));

    // Wrong type returns None
    assert_eq!(ctx.get::<String>("int_val"), None);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_via_handle() {
    let after = Arc::new(AtomicU32::new(0));

    let coordinator = assert_ok!(Coordinator::builder()
        .add_step(Step1)
        .add(WorkflowStep::new(SlowStep).without_timeout())
        .add_step(CountingStep::new("after", &after))
        .add_best_effort(CountingStep::new("cleanup", &after))
        .build());

    let mut handle = coordinator.spawn();
    let running = handle
        .wait_for_state(|s| matches!(s, WorkflowState::Running { index: 1, .. }))
        .await;
    assert!(running.is_some());
    handle.cancel();

    let result = assert_ok!(handle.join().await);

    assert!(matches!(
        result.status(),
        RunStatus::Aborted { step_index: 1, .. }
    ));
    assert_eq!(result.report().exit_code(), 2);
    assert!(matches!(
        result.error(),
        Some(WorkflowError::WorkflowAborted { step_name }) if step_name.as_str() == "SlowStep"
    ));
    assert_eq!(after.load(Ordering::SeqCst), 0);
    assert!(result.context().contains("Step1"));
    assert!(!result.context().contains("SlowStep"));
    // SlowStep ran; its result was discarded rather than skipped.
    assert_eq!(
        result.report().skipped(),
        &[StepName::new("after"), StepName::new("cleanup")]
    );
    assert!(result.report().outcome("SlowStep").is_none());
}

#[derive(Debug)]
struct CancellingStep(CancelToken);

#[async_trait]
impl Step for CancellingStep {
    async fn execute(&self, _ctx: &Context) -> Result<StepValue, StepError> {
        self.0.cancel();
        Ok(StepValue::unit())
    }

    fn name(&self) -> StepName {
        StepName::new("cleanup")
    }
}

#[tokio::test]
async fn test_cancel_during_cleanup_keeps_failure() {
    let token = CancelToken::new();
    let calls = Arc::new(AtomicU32::new(0));

    let coordinator = assert_ok!(Coordinator::builder()
        .with_cancel_token(token.clone())
        .add_step(Step1)
        .add_step(FatalStep)
        .add_step(CountingStep::new("after", &calls))
        .add_best_effort(CancellingStep(token))
        .add_best_effort(CountingStep::new("late_cleanup", &calls))
        .build());
    let state = coordinator.subscribe();

    let result = coordinator.run().await;
    let report = result.report();

    assert!(matches!(
        report.status(),
        RunStatus::Failed { step_index: 1, step_name, .. } if step_name.as_str() == "FatalStep"
    ));
    assert_eq!(report.exit_code(), 2);
    assert_eq!(
        report.first_failure().map(|o| o.step_name.as_str()),
        Some("FatalStep")
    );
    assert!(matches!(
        result.error(),
        Some(WorkflowError::StepFailed { step_name, .. }) if step_name.as_str() == "FatalStep"
    ));
    assert_eq!(
        report.skipped(),
        &[StepName::new("after"), StepName::new("late_cleanup")]
    );
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(matches!(
        &*state.borrow(),
        WorkflowState::Failed { index: 1, .. }
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_runs_are_isolated() {
    let mut handles = Vec::new();
    for run in 0..8u32 {
        let coordinator = assert_ok!(Coordinator::builder()
            .add(WorkflowStep::new(FnStep::new("run_id", move |_ctx: &Context| async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                Ok::<_, StepError>(StepValue::new(run))
            })))
            .add(WorkflowStep::new(FnStep::new("double", |ctx: &Context| {
                let run = ctx.require::<u32>("run_id").copied();
                async move { run.map(|n| StepValue::new(n * 2)) }
            })))
            .build());
        handles.push((run, coordinator.spawn()));
    }

    for (run, handle) in handles {
        let result = assert_ok!(handle.join().await);
        assert!(result.is_completed());
        assert_eq!(result.context().get::<u32>("double"), Some(&(run * 2)));
    }
}
