//! Replication workflow against the in-memory database.
//!
//! Seeds documents, replicates them into two targets and stops each job.
//! The first stop attempt fails with a transient error and is retried.
//!
//! Run with `RUST_LOG=debug` to watch the polls.

use nagare::rpc::Operation;
use nagare::{MemoryClient, ReplicationConfig, ReplicationScenario, RpcError};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let client = MemoryClient::new();
    client.trigger_after(3).await;
    client
        .fail_next(
            Operation::StopReplication,
            RpcError::Transient("connection reset by peer".to_string()),
        )
        .await;

    let config = ReplicationConfig {
        source: "demo_source".to_string(),
        targets: vec!["demo_target_a".to_string(), "demo_target_b".to_string()],
        documents: 20,
        poll_interval_ms: 100,
        stop_backoff_ms: 100,
        ..ReplicationConfig::default()
    };

    let coordinator = ReplicationScenario::new(Arc::new(client), config).build()?;
    let result = coordinator.run().await;
    let report = result.report();

    println!("{}", report);
    println!("{}", serde_json::to_string_pretty(report)?);

    if !report.passed() {
        std::process::exit(report.exit_code());
    }
    Ok(())
}
