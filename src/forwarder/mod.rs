//! Per-endpoint bridge between dispatched tasks and an execution backend.
//!
//! A [`Forwarder`] cycles between two states for as long as it runs:
//!
//! ```text
//!             ┌──────────────── busy / unreachable ────────────────┐
//!             ▼                                                    │
//! Starting ─► AwaitEndpoint ── endpoint registered ──► TaskLoop ───┘
//! ```
//!
//! In the task loop it pulls the next task (up to the heartbeat threshold),
//! submits it and moves on without waiting for the result; completions are
//! recorded concurrently on their own tasks. An idle threshold triggers a
//! liveness probe whose metrics are logged as a heartbeat. Work it could not
//! hand over is returned to the head of the endpoint's backlog whenever the
//! loop is left, so nothing pulled is ever dropped.
//!
//! A rejected submission is retried after `retry_delay` while newer work keeps
//! flowing, and failed once `max_submit_attempts` is reached. A submission
//! whose outcome is lost in transit is handed back to its source and runs
//! again.

pub mod backend;
pub mod geo;
pub mod rpc_backend;
pub mod source;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashSet;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, warn};

use crate::error::{Error, Result};
use crate::keys::Keyspace;
use crate::status_log::EndpointStatusLog;
use crate::store::SharedStore;
use crate::task::{TaskOutcome, TaskRecord, TaskStatus};

pub use backend::{BackendError, ConnectionInfo, ExecutionBackend, PendingResult, StatusInfo};
pub use geo::{GeoError, GeoLocator, StaticGeoLocator};
#[cfg(feature = "http-client")]
pub use geo::HttpGeoLocator;
pub use rpc_backend::{ExecutorHandler, RpcBackend, TaskExecutor};
pub use source::{DispatchSource, PulledTask, QueueSource, Redeliver, TaskSource};

/// Default number of rejected submissions before a task is failed.
pub const DEFAULT_MAX_SUBMIT_ATTEMPTS: u32 = 5;

/// Process-level forwarder state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwarderState {
    /// Recording startup metadata.
    Starting,
    /// Waiting for the backend to report an endpoint.
    AwaitEndpoint,
    /// Pulling and submitting tasks.
    TaskLoop,
    /// Shut down.
    Stopped,
}

/// Forwarder timing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwarderConfig {
    /// How long a pull may sit idle before the backend is probed.
    pub heartbeat_threshold: Duration,
    /// Delay before a rejected submission is tried again, and pause after
    /// leaving the task loop.
    pub retry_delay: Duration,
    /// How long shutdown waits for outstanding completions.
    pub shutdown_grace: Duration,
    /// Rejected submissions tolerated before the task is marked `FAILED`.
    pub max_submit_attempts: u32,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            heartbeat_threshold: Duration::from_secs(30),
            retry_delay: Duration::from_millis(500),
            shutdown_grace: Duration::from_secs(10),
            max_submit_attempts: DEFAULT_MAX_SUBMIT_ATTEMPTS,
        }
    }
}

/// A pulled task waiting for another submission.
#[derive(Debug)]
struct Retry {
    task: PulledTask,
    due: Instant,
    rejections: u32,
}

impl Retry {
    fn now(task: PulledTask, rejections: u32) -> Self {
        Self {
            task,
            due: Instant::now(),
            rejections,
        }
    }
}

/// Why the task loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopExit {
    EndpointLost,
    Shutdown,
}

/// Forwards tasks for one endpoint.
///
/// # Examples
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use taskrelay::forwarder::{ConnectionInfo, DispatchSource, Forwarder, RpcBackend};
/// use taskrelay::rpc::TcpConnector;
/// use taskrelay::store::MemoryStore;
/// use taskrelay::Keyspace;
///
/// # async fn example() -> taskrelay::Result<()> {
/// let store: taskrelay::store::SharedStore = Arc::new(MemoryStore::new());
/// let keys = Keyspace::default();
/// let source = DispatchSource::connect(store.clone(), keys.clone(), "ep-1").await?;
/// let backend = RpcBackend::new(
///     Arc::new(TcpConnector::new("127.0.0.1:50001")),
///     ConnectionInfo { address: "127.0.0.1:50002".into() },
/// );
/// let forwarder = Forwarder::new("ep-1", source, Arc::new(backend), store, keys);
/// let shutdown = forwarder.shutdown_token();
/// tokio::spawn(async move { tokio::signal::ctrl_c().await.ok(); shutdown.cancel(); });
/// forwarder.run().await
/// # }
/// ```
pub struct Forwarder<S, B: ?Sized> {
    source: S,
    core: Core<B>,
    config: ForwarderConfig,
    shutdown: CancellationToken,
    state: watch::Sender<ForwarderState>,
    retry: VecDeque<Retry>,
}

/// Everything the loop shares with completion tasks. Kept apart from the
/// source, which is `Send` but not necessarily `Sync`.
struct Core<B: ?Sized> {
    endpoint_id: String,
    backend: Arc<B>,
    store: SharedStore,
    keys: Keyspace,
    status_log: EndpointStatusLog,
    geo: Option<(Arc<dyn GeoLocator>, String)>,
    in_flight: Arc<DashSet<String>>,
    tracker: TaskTracker,
    redeliver: Arc<dyn Redeliver>,
}

impl<S, B: ?Sized> std::fmt::Debug for Forwarder<S, B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Forwarder")
            .field("endpoint_id", &self.core.endpoint_id)
            .field("state", &*self.state.borrow())
            .field("in_flight", &self.core.in_flight.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<S, B> Forwarder<S, B>
where
    S: TaskSource,
    B: ExecutionBackend + ?Sized,
{
    /// Creates a forwarder for `endpoint_id`.
    pub fn new(
        endpoint_id: impl Into<String>,
        source: S,
        backend: Arc<B>,
        store: SharedStore,
        keys: Keyspace,
    ) -> Self {
        let (state, _) = watch::channel(ForwarderState::Starting);
        Self {
            core: Core {
                redeliver: source.redeliverer(),
                endpoint_id: endpoint_id.into(),
                backend,
                status_log: EndpointStatusLog::new(store.clone(), keys.clone()),
                store,
                keys,
                geo: None,
                in_flight: Arc::new(DashSet::new()),
                tracker: TaskTracker::new(),
            },
            source,
            config: ForwarderConfig::default(),
            shutdown: CancellationToken::new(),
            state,
            retry: VecDeque::new(),
        }
    }

    /// Replaces the timing configuration.
    pub fn with_config(mut self, config: ForwarderConfig) -> Self {
        self.config = config;
        self
    }

    /// Uses `status_log` for heartbeats and metadata.
    pub fn with_status_log(mut self, status_log: EndpointStatusLog) -> Self {
        self.core.status_log = status_log;
        self
    }

    /// Looks up `ip_address` with `locator` at startup and records the
    /// result as endpoint metadata.
    pub fn with_geo(mut self, locator: Arc<dyn GeoLocator>, ip_address: impl Into<String>) -> Self {
        self.core.geo = Some((locator, ip_address.into()));
        self
    }

    /// Token that stops [`run`](Self::run) when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Watches the process-level state.
    pub fn state(&self) -> watch::Receiver<ForwarderState> {
        self.state.subscribe()
    }

    /// Submissions whose outcome has not been recorded yet.
    pub fn in_flight_count(&self) -> usize {
        self.core.in_flight.len()
    }

    /// The endpoint served.
    pub fn endpoint_id(&self) -> &str {
        &self.core.endpoint_id
    }

    fn set_state(&self, state: ForwarderState) {
        self.state.send_replace(state);
        debug!(endpoint_id = %self.core.endpoint_id, ?state, "forwarder state");
    }

    /// Runs until the shutdown token is cancelled, then waits (bounded by
    /// the shutdown grace) for outstanding completions.
    ///
    /// # Errors
    ///
    /// Store failures are fatal and returned after pulled work has been
    /// handed back to the backlog where possible.
    #[instrument(skip_all, fields(endpoint_id = %self.core.endpoint_id))]
    pub async fn run(mut self) -> Result<()> {
        self.set_state(ForwarderState::Starting);
        self.core.record_location().await;

        let result = self.cycle().await;

        self.set_state(ForwarderState::Stopped);
        self.core.tracker.close();
        if tokio::time::timeout(self.config.shutdown_grace, self.core.tracker.wait())
            .await
            .is_err()
        {
            warn!(
                outstanding = self.core.in_flight.len(),
                "shutdown grace elapsed with completions outstanding"
            );
        }
        info!("forwarder stopped");
        result
    }

    async fn cycle(&mut self) -> Result<()> {
        loop {
            self.set_state(ForwarderState::AwaitEndpoint);
            tokio::select! {
                biased;
                () = self.shutdown.cancelled() => return Ok(()),
                () = self.core.backend.wait_for_endpoint() => {},
            }
            info!(
                connection = %self.core.backend.connection_info().address,
                "endpoint available"
            );

            self.source.attach().await?;
            self.set_state(ForwarderState::TaskLoop);
            let outcome = self.task_loop().await;

            let unfinished: Vec<String> = self.retry.drain(..).map(|retry| retry.task.task_id).collect();
            if !unfinished.is_empty() {
                debug!(count = unfinished.len(), "returning unfinished work to backlog");
            }
            self.source.detach(unfinished).await?;

            match outcome? {
                LoopExit::Shutdown => return Ok(()),
                LoopExit::EndpointLost => {
                    info!("endpoint lost, waiting for it to return");
                    tokio::select! {
                        biased;
                        () = self.shutdown.cancelled() => return Ok(()),
                        () = tokio::time::sleep(self.config.retry_delay) => {},
                    }
                },
            }
        }
    }

    async fn task_loop(&mut self) -> Result<LoopExit> {
        loop {
            if self.shutdown.is_cancelled() {
                return Ok(LoopExit::Shutdown);
            }
            let now = Instant::now();
            let is_due = self.retry.front().is_some_and(|retry| retry.due <= now);
            let due = if is_due { self.retry.pop_front() } else { None };
            let (task, rejections) = match due {
                Some(retry) => (retry.task, retry.rejections),
                None => {
                    // A waiting retry shortens the pull; only a full idle pull probes.
                    let timeout = self.retry.front().map_or(self.config.heartbeat_threshold, |retry| {
                        retry
                            .due
                            .saturating_duration_since(now)
                            .min(self.config.heartbeat_threshold)
                    });
                    match self.source.next(timeout, &self.shutdown).await {
                        Ok(Some(task)) if self.shutdown.is_cancelled() => {
                            self.retry.push_back(Retry::now(task, 0));
                            return Ok(LoopExit::Shutdown);
                        },
                        Ok(Some(task)) => (task, 0),
                        Ok(None) if self.shutdown.is_cancelled() => return Ok(LoopExit::Shutdown),
                        Ok(None) if timeout < self.config.heartbeat_threshold => continue,
                        Ok(None) => {
                            if self.core.probe().await? {
                                continue;
                            }
                            return Ok(LoopExit::EndpointLost);
                        },
                        Err(Error::UnknownTask { task_id }) => {
                            warn!(%task_id, "dropping task whose record has expired");
                            continue;
                        },
                        Err(e) => return Err(e),
                    }
                },
            };

            if self.core.in_flight.contains(&task.task_id) {
                debug!(task_id = %task.task_id, "task already in flight, skipping duplicate");
                continue;
            }

            match self.core.backend.submit(&task.task_id, task.payload.clone()).await {
                Ok(pending) => self.core.track(task.task_id, pending).await?,
                Err(e) if e.is_unavailable() => {
                    warn!(task_id = %task.task_id, error = %e, "backend unavailable, requeueing task");
                    self.retry.push_front(Retry::now(task, rejections));
                    return Ok(LoopExit::EndpointLost);
                },
                Err(e) => {
                    let rejections = rejections + 1;
                    if rejections >= self.config.max_submit_attempts {
                        warn!(task_id = %task.task_id, rejections, error = %e, "giving up on task");
                        self.core
                            .fail(&task.task_id, format!("submission rejected {rejections} times: {e}"))
                            .await?;
                    } else {
                        warn!(task_id = %task.task_id, rejections, error = %e, "submission failed, will retry");
                        self.retry.push_back(Retry {
                            task,
                            due: Instant::now() + self.config.retry_delay,
                            rejections,
                        });
                    }
                },
            }
        }
    }
}

impl<B: ExecutionBackend + ?Sized> Core<B> {
    /// Probes the backend after an idle pull. `Ok(false)` means the endpoint
    /// is gone.
    async fn probe(&self) -> Result<bool> {
        match self.backend.request_status_info().await {
            Ok(info) => {
                self.status_log
                    .record_heartbeat(&self.endpoint_id, info.metrics)
                    .await?;
                Ok(true)
            },
            Err(e) if e.is_unavailable() => {
                info!(error = %e, "liveness probe failed");
                Ok(false)
            },
            Err(e) => {
                warn!(error = %e, "liveness probe returned an error");
                Ok(true)
            },
        }
    }

    /// Marks the task running and records its outcome when `pending`
    /// resolves.
    async fn track(&self, task_id: String, pending: PendingResult) -> Result<()> {
        let record = TaskRecord::attach(self.store.clone(), &self.keys, task_id.clone());
        let advanced = async {
            record.advance_status(TaskStatus::WaitingForEp).await?;
            record.advance_status(TaskStatus::Running).await
        }
        .await;

        self.in_flight.insert(task_id);
        let in_flight = self.in_flight.clone();
        let redeliver = self.redeliver.clone();
        let completed = record.clone();
        self.tracker.spawn(async move {
            let outcome = match pending.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    // Free the id first so the redelivered copy is not
                    // skipped as a duplicate.
                    in_flight.remove(completed.task_id());
                    warn!(task_id = %completed.task_id(), error = %e, "task outcome lost, delivering again");
                    if let Err(e) = redeliver.redeliver(completed.task_id()).await {
                        warn!(task_id = %completed.task_id(), error = %e, "could not redeliver task");
                    }
                    return;
                },
            };
            let success = outcome.is_success();
            match completed.complete(outcome).await {
                Ok(status) => debug!(task_id = %completed.task_id(), %status, "task finished"),
                Err(e) => warn!(
                    task_id = %completed.task_id(),
                    success,
                    error = %e,
                    "could not record task outcome"
                ),
            }
            in_flight.remove(completed.task_id());
        });

        match advanced {
            Ok(_) => Ok(()),
            Err(e) if e.is_infrastructure() => Err(e),
            Err(e) => {
                warn!(task_id = %record.task_id(), error = %e, "could not mark task running");
                Ok(())
            },
        }
    }

    /// Marks a task that cannot be submitted as `FAILED`.
    async fn fail(&self, task_id: &str, reason: String) -> Result<()> {
        let record = TaskRecord::attach(self.store.clone(), &self.keys, task_id);
        match record.complete(TaskOutcome::failure(reason)).await {
            Ok(status) => {
                debug!(task_id, %status, "task failed");
                Ok(())
            },
            Err(e) if e.is_infrastructure() => Err(e),
            Err(e) => {
                warn!(task_id, error = %e, "could not mark task failed");
                Ok(())
            },
        }
    }

    async fn record_location(&self) {
        let Some((locator, ip_address)) = &self.geo else {
            return;
        };
        let metadata = match locator.locate(ip_address).await {
            Ok(metadata) => metadata,
            Err(e) => {
                warn!(%ip_address, error = %e, "geo lookup failed");
                return;
            },
        };
        match self.status_log.set_metadata(&self.endpoint_id, &metadata).await {
            Ok(wrote) => debug!(wrote, "endpoint metadata recorded"),
            Err(e) => warn!(error = %e, "could not record endpoint metadata"),
        }
    }
}
