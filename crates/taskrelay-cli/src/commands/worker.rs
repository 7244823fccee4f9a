use anyhow::Result;
use async_trait::async_trait;
use colored::Colorize;
use taskrelay::config::RelayConfig;
use taskrelay::forwarder::{ExecutorHandler, TaskExecutor};
use taskrelay::rpc::RpcWorker;
use taskrelay::TaskOutcome;

/// Returns every payload unchanged.
struct Echo;

#[async_trait]
impl TaskExecutor for Echo {
    async fn execute(&self, task_id: &str, payload: Vec<u8>) -> TaskOutcome {
        tracing::info!(task_id, bytes = payload.len(), "echoing task");
        TaskOutcome::Success(payload)
    }
}

pub async fn execute(config: &RelayConfig) -> Result<()> {
    println!(
        "\n{} {}",
        "Echo worker on".bright_cyan().bold(),
        config.rpc.backend.bright_yellow()
    );
    RpcWorker::new(config.rpc.backend.clone(), ExecutorHandler::new(Echo))
        .run(super::interrupt_token())
        .await?;
    Ok(())
}
