//! [`ExecutionBackend`] over the RPC transport, plus the worker-side handler
//! that answers it.
//!
//! Submissions use the `task` service with body `[task_id, payload]` and
//! expect `[b"ok", result]` or `[b"err", exception]` back. Probes use the
//! `status` service and expect one JSON object of metrics.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, warn};

use super::backend::{BackendError, ConnectionInfo, ExecutionBackend, PendingResult, StatusInfo};
use crate::rpc::{Connector, RequestHandler, RpcRequest, RpcTransport, STATUS_SERVICE, TASK_SERVICE};
use crate::task::TaskOutcome;

/// Default bound on concurrently outstanding submissions.
pub const DEFAULT_MAX_IN_FLIGHT: usize = 64;

/// Default time a task may run on the endpoint before its reply is given up.
pub const DEFAULT_EXECUTION_TIMEOUT: Duration = Duration::from_secs(300);

const REPLY_OK: &[u8] = b"ok";
const REPLY_ERR: &[u8] = b"err";

/// Remote execution through a [`Connector`].
///
/// Each submission opens its own transport so replies can arrive in any
/// order. A semaphore bounds outstanding submissions: with no permit left,
/// [`submit`](ExecutionBackend::submit) reports [`BackendError::Busy`].
/// The backend starts unavailable; [`wait_for_endpoint`] flips it once a
/// probe is answered and a failed probe flips it back.
///
/// Task requests are sent exactly once and wait up to the execution timeout,
/// independent of the transport's probe-sized timeout. A reply that never
/// arrives resolves as [`BackendError::Lost`], never as a task failure.
///
/// [`wait_for_endpoint`]: ExecutionBackend::wait_for_endpoint
pub struct RpcBackend {
    connector: Arc<dyn Connector>,
    probe: Mutex<Option<Box<dyn RpcTransport>>>,
    admission: Arc<Semaphore>,
    max_in_flight: usize,
    available: AtomicBool,
    connection_info: ConnectionInfo,
    probe_timeout: Duration,
    probe_interval: Duration,
    execution_timeout: Duration,
}

impl std::fmt::Debug for RpcBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcBackend")
            .field("connection_info", &self.connection_info)
            .field("max_in_flight", &self.max_in_flight)
            .field("available", &self.is_available())
            .finish_non_exhaustive()
    }
}

impl RpcBackend {
    /// Creates a backend. `connection_info` is what remote endpoints are told
    /// to dial.
    pub fn new(connector: Arc<dyn Connector>, connection_info: ConnectionInfo) -> Self {
        Self {
            connector,
            probe: Mutex::new(None),
            admission: Arc::new(Semaphore::new(DEFAULT_MAX_IN_FLIGHT)),
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            available: AtomicBool::new(false),
            connection_info,
            probe_timeout: Duration::from_secs(1),
            probe_interval: Duration::from_millis(500),
            execution_timeout: DEFAULT_EXECUTION_TIMEOUT,
        }
    }

    /// Bounds outstanding submissions (at least one).
    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = max_in_flight.max(1);
        self.admission = Arc::new(Semaphore::new(self.max_in_flight));
        self
    }

    /// Sets the per-attempt timeout of liveness probes.
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Sets the pause between probes while waiting for an endpoint.
    pub fn with_probe_interval(mut self, interval: Duration) -> Self {
        self.probe_interval = interval;
        self
    }

    /// Sets how long a submitted task may run before its reply is given up.
    pub fn with_execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout = timeout;
        self
    }

    /// Whether the last probe was answered.
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    /// Submissions currently awaiting a reply.
    pub fn in_flight(&self) -> usize {
        self.max_in_flight - self.admission.available_permits()
    }

    fn mark_unavailable(&self, reason: &str) -> BackendError {
        if self.available.swap(false, Ordering::AcqRel) {
            warn!(reason, "endpoint became unavailable");
        }
        BackendError::Unavailable(reason.to_string())
    }
}

/// Decodes a `task` reply body into an outcome.
fn decode_task_reply(body: Vec<Bytes>) -> TaskOutcome {
    let mut frames = body.into_iter();
    match (frames.next(), frames.next()) {
        (Some(kind), Some(data)) if kind.as_ref() == REPLY_OK => TaskOutcome::Success(data.to_vec()),
        (Some(kind), Some(data)) if kind.as_ref() == REPLY_ERR => TaskOutcome::Failure(data.to_vec()),
        _ => TaskOutcome::failure("malformed task reply from endpoint"),
    }
}

/// Encodes an outcome as a `task` reply body.
fn encode_task_reply(outcome: TaskOutcome) -> Vec<Bytes> {
    match outcome {
        TaskOutcome::Success(result) => vec![Bytes::from_static(REPLY_OK), Bytes::from(result)],
        TaskOutcome::Failure(exception) => vec![Bytes::from_static(REPLY_ERR), Bytes::from(exception)],
    }
}

#[async_trait]
impl ExecutionBackend for RpcBackend {
    async fn submit(&self, task_id: &str, payload: Vec<u8>) -> Result<PendingResult, BackendError> {
        if !self.is_available() {
            return Err(BackendError::Unavailable("no endpoint registered".into()));
        }
        let permit = self
            .admission
            .clone()
            .try_acquire_owned()
            .map_err(|_| BackendError::Busy(format!("{} submissions in flight", self.max_in_flight)))?;
        let mut transport = self
            .connector
            .connect()
            .await
            .map_err(|e| self.mark_unavailable(&e.to_string()))?;

        let task_id = task_id.to_string();
        let request = RpcRequest::new(
            TASK_SERVICE,
            vec![Bytes::copy_from_slice(task_id.as_bytes()), Bytes::from(payload)],
        )
        .with_timeout(self.execution_timeout)
        .with_retries(1);
        Ok(Box::pin(async move {
            let _permit = permit;
            match transport.request(request).await {
                Ok(Some(reply)) => Ok(decode_task_reply(reply.body)),
                Ok(None) => {
                    warn!(%task_id, "no reply for task");
                    Err(BackendError::Lost("endpoint did not reply".into()))
                },
                Err(e) => {
                    warn!(%task_id, error = %e, "transport failed for task");
                    Err(BackendError::Lost(format!("transport error: {e}")))
                },
            }
        }))
    }

    async fn request_status_info(&self) -> Result<StatusInfo, BackendError> {
        let mut probe = self.probe.lock().await;
        if probe.is_none() {
            let transport = self
                .connector
                .connect()
                .await
                .map_err(|e| self.mark_unavailable(&e.to_string()))?;
            *probe = Some(transport);
        }
        let Some(transport) = probe.as_mut() else {
            return Err(self.mark_unavailable("probe transport missing"));
        };

        let request = RpcRequest::new(STATUS_SERVICE, Vec::new()).with_timeout(self.probe_timeout);
        let reply = match transport.request(request).await {
            Ok(Some(reply)) => reply,
            Ok(None) => {
                *probe = None;
                return Err(self.mark_unavailable("status probe unanswered"));
            },
            Err(e) => {
                *probe = None;
                return Err(self.mark_unavailable(&e.to_string()));
            },
        };
        let info = match reply.body.first() {
            Some(frame) if !frame.is_empty() => serde_json::from_slice(frame)
                .map_err(|e| BackendError::Rejected(format!("invalid status reply: {e}")))?,
            _ => StatusInfo::default(),
        };
        if !self.available.swap(true, Ordering::AcqRel) {
            debug!("endpoint answered status probe");
        }
        Ok(info)
    }

    async fn wait_for_endpoint(&self) {
        loop {
            match self.request_status_info().await {
                Ok(_) => return,
                Err(e) => debug!(error = %e, "endpoint not ready"),
            }
            tokio::time::sleep(self.probe_interval).await;
        }
    }

    fn connection_info(&self) -> ConnectionInfo {
        self.connection_info.clone()
    }
}

/// What actually runs tasks on the endpoint side.
#[async_trait]
pub trait TaskExecutor: Send + Sync + 'static {
    /// Runs one task.
    async fn execute(&self, task_id: &str, payload: Vec<u8>) -> TaskOutcome;

    /// Metrics reported to liveness probes.
    async fn status(&self) -> StatusInfo {
        StatusInfo::default()
    }
}

/// [`RequestHandler`] answering the `task` and `status` services with a
/// [`TaskExecutor`].
#[derive(Debug, Clone)]
pub struct ExecutorHandler<E> {
    executor: E,
}

impl<E: TaskExecutor> ExecutorHandler<E> {
    /// Wraps `executor`.
    pub fn new(executor: E) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl<E: TaskExecutor> RequestHandler for ExecutorHandler<E> {
    async fn handle(&self, service: &str, body: Vec<Bytes>) -> Option<Vec<Bytes>> {
        match service {
            TASK_SERVICE => {
                let mut frames = body.into_iter();
                let (Some(task_id), Some(payload)) = (frames.next(), frames.next()) else {
                    warn!("task request without id and payload");
                    return None;
                };
                let task_id = String::from_utf8_lossy(&task_id).into_owned();
                let outcome = self.executor.execute(&task_id, payload.to_vec()).await;
                Some(encode_task_reply(outcome))
            },
            STATUS_SERVICE => {
                let info = self.executor.status().await;
                let encoded = serde_json::to_vec(&info).ok()?;
                Some(vec![Bytes::from(encoded)])
            },
            other => {
                debug!(service = other, "request for unknown service");
                None
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::rpc::RpcReply;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::collections::VecDeque;

    /// Transport answering from a shared script; an exhausted script means
    /// "no reply".
    struct Scripted {
        replies: Arc<parking_lot::Mutex<VecDeque<Option<Vec<Bytes>>>>>,
        sent: Arc<parking_lot::Mutex<Vec<(String, Option<Duration>, Option<u32>)>>>,
    }

    #[async_trait]
    impl RpcTransport for Scripted {
        async fn request(&mut self, request: RpcRequest) -> Result<Option<RpcReply>, TransportError> {
            self.sent
                .lock()
                .push((request.service.clone(), request.timeout, request.retries));
            let next = self.replies.lock().pop_front().flatten();
            Ok(next.map(|body| RpcReply {
                service: request.service,
                body,
            }))
        }
    }

    struct ScriptedConnector {
        replies: Arc<parking_lot::Mutex<VecDeque<Option<Vec<Bytes>>>>>,
        sent: Arc<parking_lot::Mutex<Vec<(String, Option<Duration>, Option<u32>)>>>,
    }

    impl ScriptedConnector {
        fn new(replies: Vec<Option<Vec<Bytes>>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Arc::new(parking_lot::Mutex::new(replies.into())),
                sent: Arc::default(),
            })
        }
    }

    #[async_trait]
    impl Connector for ScriptedConnector {
        async fn connect(&self) -> Result<Box<dyn RpcTransport>, TransportError> {
            Ok(Box::new(Scripted {
                replies: self.replies.clone(),
                sent: self.sent.clone(),
            }))
        }
    }

    fn info() -> ConnectionInfo {
        ConnectionInfo {
            address: "127.0.0.1:50002".into(),
        }
    }

    fn status_reply() -> Option<Vec<Bytes>> {
        Some(vec![Bytes::from(json!({"total_core_hrs": 0.5}).to_string())])
    }

    #[tokio::test]
    async fn submit_before_endpoint_is_unavailable() {
        let backend = RpcBackend::new(ScriptedConnector::new(vec![]), info());
        let err = backend.submit("t1", b"p".to_vec()).await.err().unwrap();
        assert!(matches!(err, BackendError::Unavailable(_)));
    }

    #[tokio::test]
    async fn probe_then_submit_succeeds() {
        let connector = ScriptedConnector::new(vec![
            status_reply(),
            Some(vec![Bytes::from_static(b"ok"), Bytes::from_static(b"42")]),
        ]);
        let backend = RpcBackend::new(connector, info());
        backend.wait_for_endpoint().await;
        assert!(backend.is_available());

        let pending = backend.submit("t1", b"p".to_vec()).await.unwrap();
        assert_eq!(pending.await, Ok(TaskOutcome::Success(b"42".to_vec())));
        assert_eq!(backend.in_flight(), 0);
    }

    #[tokio::test]
    async fn lost_reply_is_not_a_task_failure() {
        let connector = ScriptedConnector::new(vec![status_reply(), None]);
        let backend = RpcBackend::new(connector, info());
        backend.wait_for_endpoint().await;

        let outcome = backend.submit("t1", b"p".to_vec()).await.unwrap().await;
        assert!(matches!(outcome, Err(BackendError::Lost(_))));
        assert_eq!(backend.in_flight(), 0);
    }

    #[tokio::test]
    async fn task_requests_are_sent_once_with_execution_timeout() {
        let connector = ScriptedConnector::new(vec![
            status_reply(),
            Some(vec![Bytes::from_static(b"ok"), Bytes::new()]),
        ]);
        let backend = RpcBackend::new(connector.clone(), info())
            .with_probe_timeout(Duration::from_millis(50))
            .with_execution_timeout(Duration::from_secs(90));
        backend.wait_for_endpoint().await;
        backend.submit("t1", b"p".to_vec()).await.unwrap().await.unwrap();

        let sent = connector.sent.lock().clone();
        assert_eq!(
            sent,
            vec![
                (STATUS_SERVICE.to_string(), Some(Duration::from_millis(50)), None),
                (TASK_SERVICE.to_string(), Some(Duration::from_secs(90)), Some(1)),
            ]
        );
    }

    #[tokio::test]
    async fn exhausted_permits_report_busy() {
        let connector = ScriptedConnector::new(vec![status_reply()]);
        let backend = RpcBackend::new(connector, info()).with_max_in_flight(1);
        backend.wait_for_endpoint().await;

        let held = backend.submit("t1", b"p".to_vec()).await.unwrap();
        let err = backend.submit("t2", b"p".to_vec()).await.err().unwrap();
        assert!(matches!(err, BackendError::Busy(_)));
        assert!(err.is_unavailable());
        drop(held);
        assert_eq!(backend.in_flight(), 0);
    }

    #[tokio::test]
    async fn unanswered_probe_marks_unavailable() {
        let connector = ScriptedConnector::new(vec![status_reply(), None]);
        let backend = RpcBackend::new(connector, info());
        let metrics = backend.request_status_info().await.unwrap();
        assert_eq!(metrics.metrics["total_core_hrs"], json!(0.5));
        assert!(backend.is_available());

        let err = backend.request_status_info().await.unwrap_err();
        assert!(matches!(err, BackendError::Unavailable(_)));
        assert!(!backend.is_available());
    }

    struct Echo;

    #[async_trait]
    impl TaskExecutor for Echo {
        async fn execute(&self, _task_id: &str, payload: Vec<u8>) -> TaskOutcome {
            if payload.is_empty() {
                TaskOutcome::failure("empty payload")
            } else {
                TaskOutcome::Success(payload)
            }
        }
    }

    #[tokio::test]
    async fn executor_handler_answers_both_services() {
        let handler = ExecutorHandler::new(Echo);
        let reply = handler
            .handle(TASK_SERVICE, vec![Bytes::from_static(b"t1"), Bytes::from_static(b"hi")])
            .await
            .unwrap();
        assert_eq!(decode_task_reply(reply), TaskOutcome::Success(b"hi".to_vec()));

        let reply = handler
            .handle(TASK_SERVICE, vec![Bytes::from_static(b"t2"), Bytes::new()])
            .await
            .unwrap();
        assert!(!decode_task_reply(reply).is_success());

        let status = handler.handle(STATUS_SERVICE, Vec::new()).await.unwrap();
        assert_eq!(status.len(), 1);
        assert!(handler.handle("nope", Vec::new()).await.is_none());
    }
}
