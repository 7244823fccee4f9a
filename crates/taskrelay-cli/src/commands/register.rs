use anyhow::{Context, Result};
use taskrelay::config::RelayConfig;
use taskrelay::forwarder::{ConnectionInfo, DispatchSource};
use taskrelay::status_log::{EndpointMetadata, EndpointStatusLog};

use super::forwarder::{self, ForwarderArgs};

pub async fn execute(config: &RelayConfig, endpoint_id: String, address: String) -> Result<()> {
    let store = config.store.open().await.context("failed to open store")?;
    let keys = config.keyspace();

    let status_log = EndpointStatusLog::new(store.clone(), keys.clone());
    let metadata = EndpointMetadata {
        ip_address: Some(address.clone()),
        ..EndpointMetadata::default()
    };
    status_log
        .set_metadata(&endpoint_id, &metadata)
        .await
        .context("failed to record endpoint address")?;

    // The endpoint reads this from stdout to learn where to dial.
    let info = ConnectionInfo {
        address: config.rpc.backend.clone(),
    };
    println!("{}", serde_json::to_string(&info)?);

    let source = DispatchSource::connect(store.clone(), keys, endpoint_id.clone())
        .await
        .context("failed to connect dispatcher")?;
    let args = ForwarderArgs {
        endpoint_id,
        queue: false,
        ip: Some(address),
    };
    forwarder::run(config, store, args, source).await
}
