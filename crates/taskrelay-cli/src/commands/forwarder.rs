use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use taskrelay::config::RelayConfig;
use taskrelay::forwarder::{
    ConnectionInfo, DispatchSource, Forwarder, ForwarderState, QueueSource, RpcBackend, TaskSource,
};
use taskrelay::queue::EndpointQueue;
use taskrelay::status_log::EndpointStatusLog;
use taskrelay::store::SharedStore;

#[derive(Debug, Args)]
pub struct ForwarderArgs {
    /// Endpoint id
    pub endpoint_id: String,

    /// Pull from the endpoint's direct queue instead of the dispatcher
    #[arg(long)]
    pub queue: bool,

    /// Endpoint address for geo lookup (requires geo.enabled)
    #[arg(long)]
    pub ip: Option<String>,
}

pub async fn execute(config: &RelayConfig, args: ForwarderArgs) -> Result<()> {
    let store = config.store.open().await.context("failed to open store")?;
    let keys = config.keyspace();
    if args.queue {
        let queue = EndpointQueue::new(store.clone(), keys, args.endpoint_id.clone()).with_ttl(config.ttl.task());
        run(config, store, args, QueueSource::new(queue)).await
    } else {
        let source = DispatchSource::connect(store.clone(), keys, args.endpoint_id.clone())
            .await
            .context("failed to connect dispatcher")?;
        run(config, store, args, source).await
    }
}

pub(crate) async fn run<S: TaskSource>(
    config: &RelayConfig,
    store: SharedStore,
    args: ForwarderArgs,
    source: S,
) -> Result<()> {
    let keys = config.keyspace();
    let backend = RpcBackend::new(
        Arc::new(config.rpc.connector()),
        ConnectionInfo {
            address: config.rpc.backend.clone(),
        },
    )
    .with_max_in_flight(config.rpc.max_in_flight)
    .with_execution_timeout(config.rpc.execution_timeout());

    let mut forwarder = Forwarder::new(args.endpoint_id.clone(), source, Arc::new(backend), store.clone(), keys.clone())
        .with_config(config.forwarder_config())
        .with_status_log(EndpointStatusLog::with_capacity(store, keys, config.status.capacity));
    if let Some(ip) = args.ip.filter(|_| config.geo.enabled) {
        forwarder = with_geo(forwarder, config, ip)?;
    }

    let interrupt = super::interrupt_token();
    let shutdown = forwarder.shutdown_token();
    tokio::spawn(async move {
        interrupt.cancelled().await;
        shutdown.cancel();
    });

    let mut state = forwarder.state();
    tokio::spawn(async move {
        while state.changed().await.is_ok() {
            let current = *state.borrow_and_update();
            let label = match current {
                ForwarderState::Starting => "starting".normal(),
                ForwarderState::AwaitEndpoint => "awaiting endpoint".yellow(),
                ForwarderState::TaskLoop => "forwarding".green(),
                ForwarderState::Stopped => "stopped".red(),
            };
            println!("  {} {}", "→".blue(), label);
        }
    });

    println!("\n{} {}", "Forwarder for".bright_cyan().bold(), args.endpoint_id.bright_yellow());
    forwarder.run().await.context("forwarder failed")
}

#[cfg(feature = "http-client")]
fn with_geo<S: TaskSource>(
    forwarder: Forwarder<S, RpcBackend>,
    config: &RelayConfig,
    ip: String,
) -> Result<Forwarder<S, RpcBackend>> {
    let locator = taskrelay::forwarder::HttpGeoLocator::with_base_url(config.geo.base_url.clone())?;
    Ok(forwarder.with_geo(Arc::new(locator), ip))
}

#[cfg(not(feature = "http-client"))]
fn with_geo<S: TaskSource>(
    forwarder: Forwarder<S, RpcBackend>,
    _config: &RelayConfig,
    _ip: String,
) -> Result<Forwarder<S, RpcBackend>> {
    tracing::warn!("geo lookup requested but taskrelay was built without `http-client`");
    Ok(forwarder)
}
