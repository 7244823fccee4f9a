//! taskrelay: operator CLI for the task dispatch fabric.
//!
//! Runs the relay broker and per-endpoint forwarders, submits tasks and
//! reports endpoint status against a shared store.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use taskrelay::config::RelayConfig;

mod commands;

/// Task dispatch fabric operator CLI
#[derive(Parser)]
#[command(name = "taskrelay")]
#[command(about = "Run brokers and forwarders, submit tasks, inspect endpoints", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (TOML). Defaults apply when omitted.
    #[arg(long, global = true, env = "TASKRELAY_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay broker
    ///
    /// Binds the client-facing frontend and worker-facing backend and relays
    /// between them until interrupted.
    Broker {
        /// Frontend address (overrides rpc.frontend)
        #[arg(long)]
        frontend: Option<String>,

        /// Backend address (overrides rpc.backend)
        #[arg(long)]
        backend: Option<String>,
    },

    /// Run the forwarder for one endpoint
    Forwarder(commands::forwarder::ForwarderArgs),

    /// Register an endpoint and serve it
    ///
    /// Records the endpoint's address, prints the connection info the
    /// endpoint must dial, then runs its forwarder until interrupted.
    Register {
        /// Endpoint id
        endpoint_id: String,

        /// Public address the endpoint connects from
        #[arg(long)]
        address: String,
    },

    /// Submit a task
    Submit(commands::submit::SubmitArgs),

    /// Show an endpoint's liveness, heartbeats and metadata
    Status {
        /// Endpoint id
        endpoint_id: String,

        /// Number of recent heartbeats to show
        #[arg(long, default_value = "5")]
        count: usize,
    },

    /// Run an echo worker against the broker backend (local smoke tests)
    Worker {
        /// Backend address (overrides rpc.backend)
        #[arg(long)]
        backend: Option<String>,
    },
}

fn load_config(path: Option<&PathBuf>) -> Result<RelayConfig> {
    let mut config = match path {
        Some(path) => RelayConfig::from_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => RelayConfig::default(),
    };
    config.apply_env();
    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    taskrelay::logging::init_logging(taskrelay::logging::DEFAULT_FILTER);
    let config = load_config(cli.config.as_ref())?;

    let runtime = tokio::runtime::Runtime::new().context("failed to start tokio runtime")?;
    runtime.block_on(execute_command(cli.command, config))
}

async fn execute_command(command: Commands, mut config: RelayConfig) -> Result<()> {
    match command {
        Commands::Broker { frontend, backend } => {
            if let Some(frontend) = frontend {
                config.rpc.frontend = frontend;
            }
            if let Some(backend) = backend {
                config.rpc.backend = backend;
            }
            commands::broker::execute(&config).await?;
        },
        Commands::Forwarder(args) => {
            commands::forwarder::execute(&config, args).await?;
        },
        Commands::Register {
            endpoint_id,
            address,
        } => {
            commands::register::execute(&config, endpoint_id, address).await?;
        },
        Commands::Submit(args) => {
            commands::submit::execute(&config, args).await?;
        },
        Commands::Status { endpoint_id, count } => {
            commands::status::execute(&config, &endpoint_id, count).await?;
        },
        Commands::Worker { backend } => {
            if let Some(backend) = backend {
                config.rpc.backend = backend;
            }
            commands::worker::execute(&config).await?;
        },
    }
    Ok(())
}
