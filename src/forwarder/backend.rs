//! The execution backend seam: where the forwarder sends work.

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use async_trait::async_trait;

use crate::task::TaskOutcome;

/// Resolves when the backend finishes a submitted unit of work.
///
/// Runs independently of the forwarder's task loop; the forwarder spawns it
/// and records the outcome on completion. [`BackendError::Lost`] means the
/// outcome never arrived and the task must be delivered again.
pub type PendingResult = BoxFuture<'static, Result<TaskOutcome, BackendError>>;

/// Why the backend refused a request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    /// The endpoint is up but cannot take more work right now.
    #[error("backend busy: {0}")]
    Busy(String),

    /// The endpoint side is unreachable.
    #[error("endpoint unavailable: {0}")]
    Unavailable(String),

    /// This particular submission was rejected; the endpoint itself is fine.
    #[error("submission rejected: {0}")]
    Rejected(String),

    /// The task was accepted but its outcome was lost in transit.
    #[error("task outcome lost: {0}")]
    Lost(String),
}

impl BackendError {
    /// `true` for busy/unreachable errors, which send the forwarder back to
    /// waiting for the endpoint.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Busy(_) | Self::Unavailable(_))
    }
}

/// Metrics returned by a liveness probe.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusInfo {
    /// Backend-reported metrics, recorded as a heartbeat.
    #[serde(flatten)]
    pub metrics: Map<String, Value>,
}

/// Where a remote endpoint must dial in to reach this backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    /// Address of the worker-facing side, `host:port`.
    pub address: String,
}

/// Remote compute manager that actually runs user code.
#[async_trait]
pub trait ExecutionBackend: Send + Sync + 'static {
    /// Submits `payload` for `task_id`. Returns as soon as the work is
    /// accepted; the returned future resolves with the outcome.
    async fn submit(&self, task_id: &str, payload: Vec<u8>) -> Result<PendingResult, BackendError>;

    /// Non-blocking liveness probe.
    async fn request_status_info(&self) -> Result<StatusInfo, BackendError>;

    /// Waits until an endpoint has registered with the backend.
    async fn wait_for_endpoint(&self);

    /// Dial-back information for the remote endpoint.
    fn connection_info(&self) -> ConnectionInfo;
}
