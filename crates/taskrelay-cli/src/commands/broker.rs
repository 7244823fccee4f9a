use anyhow::{Context, Result};
use colored::Colorize;
use taskrelay::config::RelayConfig;
use taskrelay::rpc::RelayBroker;

pub async fn execute(config: &RelayConfig) -> Result<()> {
    let broker = RelayBroker::bind(&config.rpc.frontend, &config.rpc.backend)
        .await
        .context("failed to start broker")?;

    println!("\n{}", "Relay broker".bright_cyan().bold());
    println!("  {} frontend: {}", "→".blue(), broker.frontend_addr()?.to_string().bright_yellow());
    println!("  {} backend:  {}", "→".blue(), broker.backend_addr()?.to_string().bright_yellow());

    broker.run(super::interrupt_token()).await?;
    println!("  {} broker stopped", "✓".green());
    Ok(())
}
