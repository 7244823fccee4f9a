use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Args;
use colored::Colorize;
use taskrelay::config::RelayConfig;
use taskrelay::submit::{SubmitRequest, Submitter, TaskResult};

#[derive(Debug, Args)]
pub struct SubmitArgs {
    /// Submitting user
    #[arg(long)]
    pub user: String,

    /// Function id
    #[arg(long)]
    pub function: String,

    /// Target endpoint
    #[arg(long)]
    pub endpoint: String,

    /// Inline payload
    #[arg(long, conflicts_with = "payload_file")]
    pub payload: Option<String>,

    /// Read the payload from a file
    #[arg(long)]
    pub payload_file: Option<PathBuf>,

    /// Wait up to this many seconds for the result
    #[arg(long)]
    pub wait: Option<u64>,
}

pub async fn execute(config: &RelayConfig, args: SubmitArgs) -> Result<()> {
    let payload = match (&args.payload, &args.payload_file) {
        (Some(inline), None) => inline.as_bytes().to_vec(),
        (None, Some(path)) => {
            std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?
        },
        _ => bail!("one of --payload or --payload-file is required"),
    };

    let store = config.store.open().await.context("failed to open store")?;
    let submitter = Submitter::new(store, config.keyspace()).with_ttls(config.ttl.task(), config.ttl.group());
    let task = submitter
        .submit(SubmitRequest::new(args.user, args.function, args.endpoint, payload))
        .await?;
    println!("{}", task.task_id());

    let Some(wait) = args.wait else {
        return Ok(());
    };
    let deadline = tokio::time::Instant::now() + Duration::from_secs(wait);
    loop {
        match submitter.fetch_result(task.task_id()).await? {
            TaskResult::Success(result) => {
                println!("{} {}", "✓".green(), String::from_utf8_lossy(&result));
                return Ok(());
            },
            TaskResult::Failed(exception) => {
                bail!("task failed: {}", String::from_utf8_lossy(&exception));
            },
            TaskResult::Pending(status) if tokio::time::Instant::now() >= deadline => {
                bail!("task still {status} after {wait}s");
            },
            TaskResult::Pending(_) => tokio::time::sleep(Duration::from_millis(250)).await,
        }
    }
}
