//! Runs the replication workflow against a CouchDB-compatible server.

use clap::Parser;
use nagare::{
    ClientConfig, CouchClient, ReplicationConfig, ReplicationScenario, Report, RunStatus,
};
use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Server root URL
    #[arg(long, env = "NAGARE_URL", default_value = "http://localhost:5984")]
    url: String,

    /// Basic auth user
    #[arg(long, env = "NAGARE_USER")]
    user: Option<String>,

    /// Basic auth password
    #[arg(long, env = "NAGARE_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Per-request timeout in seconds
    #[arg(long, default_value_t = 30)]
    timeout: u64,

    /// JSON scenario file; flags below override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// Source database
    #[arg(long)]
    source: Option<String>,

    /// Target database (repeatable)
    #[arg(long = "target")]
    targets: Vec<String>,

    /// Documents to seed and verify in every target
    #[arg(long)]
    documents: Option<usize>,

    /// Let the server create the targets
    #[arg(long)]
    create_target: bool,

    /// Replicate once instead of continuously
    #[arg(long)]
    one_shot: bool,

    /// Print the report as JSON
    #[arg(long)]
    json: bool,
}

impl Cli {
    fn replication_config(&self) -> Result<ReplicationConfig, Box<dyn Error + Send + Sync>> {
        let file = match &self.config {
            Some(path) => Some(std::fs::read_to_string(path)?),
            None => None,
        };
        self.merge_config(file.as_deref())
    }

    /// Applies the flags over the scenario file, then validates the result.
    fn merge_config(
        &self,
        file: Option<&str>,
    ) -> Result<ReplicationConfig, Box<dyn Error + Send + Sync>> {
        let mut config: ReplicationConfig = match file {
            Some(json) => serde_json::from_str(json)?,
            None => ReplicationConfig::default(),
        };
        if let Some(source) = &self.source {
            config.source = source.clone();
        }
        if !self.targets.is_empty() {
            config.targets = self.targets.clone();
        }
        if let Some(documents) = self.documents {
            config.documents = documents;
        }
        if self.create_target {
            config.create_target = true;
        }
        if self.one_shot {
            config.continuous = false;
        }
        config.validate()?;
        Ok(config)
    }

    fn client_config(&self) -> ClientConfig {
        ClientConfig {
            base_url: self.url.clone(),
            timeout_secs: self.timeout,
            username: self.user.clone(),
            password: self.password.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    let cli = Cli::parse();

    Registry::default()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = cli.replication_config()?;
    let client = CouchClient::new(cli.client_config())?;
    info!(
        "Replicating {} into {:?} via {}",
        config.source, config.targets, cli.url
    );

    let coordinator = ReplicationScenario::new(Arc::new(client), config).build()?;
    let handle = coordinator.spawn();

    let cancel = handle.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted; stopping after the current step");
            cancel.cancel();
        }
    });

    let result = handle.join().await?;
    let report = result.report();

    if cli.json {
        println!("{}", serde_json::to_string_pretty(report)?);
    } else {
        println!("{}", report);
    }

    if let RunStatus::Failed { step_name, .. } = report.status() {
        warn!("Replication workflow failed at '{}'", step_name);
    }
    std::process::exit(exit_status(report));
}

/// The report's exit code, kept within the 1..=255 a process can return
/// whenever the run did not complete.
fn exit_status(report: &Report) -> i32 {
    match report.status() {
        RunStatus::Completed => 0,
        _ => report.exit_code().clamp(1, 255),
    }
}
