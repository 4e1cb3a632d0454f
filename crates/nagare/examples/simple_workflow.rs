//! Simple two-step workflow example.

use async_trait::async_trait;
use nagare::prelude::*;

#[derive(Debug)]
struct DataLoadStep;

#[async_trait]
impl Step for DataLoadStep {
    async fn execute(&self, _ctx: &Context) -> Result<StepValue, StepError> {
        println!("Loading data...");
        Ok(StepValue::new("sample data".to_string()))
    }

    fn name(&self) -> StepName {
        StepName::new("load")
    }
}

#[derive(Debug)]
struct WordCountStep;

#[async_trait]
impl Step for WordCountStep {
    async fn execute(&self, ctx: &Context) -> Result<StepValue, StepError> {
        let data = ctx.require::<String>("load")?;
        Ok(StepValue::new(data.split_whitespace().count()))
    }

    fn name(&self) -> StepName {
        StepName::new("count")
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let coordinator = Coordinator::builder()
        .add_step(DataLoadStep)
        .add(WorkflowStep::new(WordCountStep).expect_that("two words", |n: &usize| *n == 2))
        .build()?;

    let result = coordinator.run().await;
    println!("{}", result.report());

    if let Some(count) = result.context().get::<usize>("count") {
        println!("Words: {}", count);
    }

    Ok(())
}
