use std::time::Duration;

use anyhow::{Context, Result};
use colored::Colorize;
use taskrelay::config::RelayConfig;
use taskrelay::status_log::EndpointStatusLog;

pub async fn execute(config: &RelayConfig, endpoint_id: &str, count: usize) -> Result<()> {
    let store = config.store.open().await.context("failed to open store")?;
    let log = EndpointStatusLog::with_capacity(store, config.keyspace(), config.status.capacity);

    let threshold = Duration::from_secs(config.status.liveness_threshold_secs);
    let online = log.liveness(endpoint_id, threshold).await?;
    println!(
        "\n{} {} {}",
        "Endpoint".bright_cyan().bold(),
        endpoint_id.bright_yellow(),
        if online { "online".green() } else { "offline".red() }
    );

    let metadata = log.metadata(endpoint_id).await?;
    if !metadata.is_empty() {
        println!("  {} {}", "metadata:".bright_white(), serde_json::to_string(&metadata)?);
    }

    for entry in log.read_recent(endpoint_id, count).await? {
        let at = entry
            .submitted_at()
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| entry.timestamp.to_string());
        println!("  {} {} {}", "•".blue(), at, serde_json::Value::Object(entry.metrics));
    }

    println!(
        "  {} {:.3}",
        "total compute hours:".bright_white(),
        log.global_compute_hours().await?
    );
    Ok(())
}
