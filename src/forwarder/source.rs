//! Where a forwarder pulls its work from.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::dispatch::{Dispatcher, TaskPublisher};
use crate::error::Result;
use crate::keys::Keyspace;
use crate::queue::EndpointQueue;
use crate::store::SharedStore;
use crate::task::{fields, TaskRecord};

/// Longest single pop while pulling from a queue.
const QUEUE_POLL_SLICE: Duration = Duration::from_millis(100);

/// A task id together with its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PulledTask {
    /// Task id.
    pub task_id: String,
    /// Serialized function and arguments.
    pub payload: Vec<u8>,
}

/// Stream of work for one endpoint.
#[async_trait]
pub trait TaskSource: Send {
    /// Starts receiving work (subscribe and drain any backlog).
    async fn attach(&mut self) -> Result<()>;

    /// Waits up to `timeout` for the next task. `Ok(None)` means idle or
    /// `cancel` fired.
    ///
    /// Cancellation is only observed while nothing has been taken off the
    /// source, so an id is never consumed without being returned.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownTask`](crate::Error::UnknownTask) when an id arrives
    /// whose record has expired; the id is consumed.
    async fn next(
        &mut self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Option<PulledTask>>;

    /// Stops receiving work. `unfinished` ids (pulled but never submitted)
    /// go back to the head of the line in order, ahead of anything delivered
    /// but not yet pulled.
    async fn detach(&mut self, unfinished: Vec<String>) -> Result<()>;

    /// Handle that puts a submitted task back in line after its outcome was
    /// lost. Usable from completion tasks while the source keeps pulling.
    fn redeliverer(&self) -> Arc<dyn Redeliver>;
}

/// Returns a task to its source for another delivery.
#[async_trait]
pub trait Redeliver: Send + Sync + 'static {
    /// Makes `task_id` available to the next pull.
    async fn redeliver(&self, task_id: &str) -> Result<()>;
}

/// [`TaskSource`] over the pub/sub [`Dispatcher`]; payloads are read from
/// the task record.
pub struct DispatchSource {
    dispatcher: Dispatcher,
    store: SharedStore,
    keys: Keyspace,
    endpoint_id: String,
}

impl std::fmt::Debug for DispatchSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchSource")
            .field("endpoint_id", &self.endpoint_id)
            .finish_non_exhaustive()
    }
}

impl DispatchSource {
    /// Opens a dispatcher connection for `endpoint_id`.
    pub async fn connect(
        store: SharedStore,
        keys: Keyspace,
        endpoint_id: impl Into<String>,
    ) -> Result<Self> {
        let dispatcher = Dispatcher::connect(store.clone(), keys.clone()).await?;
        Ok(Self {
            dispatcher,
            store,
            keys,
            endpoint_id: endpoint_id.into(),
        })
    }
}

#[async_trait]
impl TaskSource for DispatchSource {
    async fn attach(&mut self) -> Result<()> {
        self.dispatcher.subscribe(&self.endpoint_id).await?;
        Ok(())
    }

    async fn next(
        &mut self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Option<PulledTask>> {
        // Waiting on the subscription consumes nothing until it resolves.
        let delivery = tokio::select! {
            biased;
            () = cancel.cancelled() => return Ok(None),
            delivery = self.dispatcher.get(timeout) => delivery?,
        };
        let Some(delivery) = delivery else {
            return Ok(None);
        };
        let record = TaskRecord::attach(self.store.clone(), &self.keys, delivery.task_id);
        let payload = record.payload().await?;
        Ok(Some(PulledTask {
            task_id: record.task_id().to_string(),
            payload,
        }))
    }

    async fn detach(&mut self, mut unfinished: Vec<String>) -> Result<()> {
        if self.dispatcher.subscriber_count() > 0 {
            self.dispatcher.unsubscribe(&self.endpoint_id).await?;
        }
        let stranded = self.dispatcher.drain_pending().await?;
        debug!(
            endpoint_id = %self.endpoint_id,
            unfinished = unfinished.len(),
            stranded = stranded.len(),
            "detaching from dispatcher"
        );
        unfinished.extend(
            stranded
                .into_iter()
                .filter(|d| d.endpoint_id == self.endpoint_id)
                .map(|d| d.task_id),
        );
        self.dispatcher
            .requeue_front(&self.endpoint_id, &unfinished)
            .await
    }

    fn redeliverer(&self) -> Arc<dyn Redeliver> {
        Arc::new(DispatchRedeliver {
            publisher: self.dispatcher.publisher().clone(),
            store: self.store.clone(),
            keys: self.keys.clone(),
            endpoint_id: self.endpoint_id.clone(),
        })
    }
}

/// Republishes through the dispatcher: live to an attached forwarder,
/// otherwise into the endpoint's backlog.
struct DispatchRedeliver {
    publisher: TaskPublisher,
    store: SharedStore,
    keys: Keyspace,
    endpoint_id: String,
}

#[async_trait]
impl Redeliver for DispatchRedeliver {
    async fn redeliver(&self, task_id: &str) -> Result<()> {
        let record = TaskRecord::attach(self.store.clone(), &self.keys, task_id);
        self.publisher.put(&self.endpoint_id, &record).await?;
        Ok(())
    }
}

/// [`TaskSource`] over a direct [`EndpointQueue`], reading one record field
/// as the payload.
#[derive(Debug, Clone)]
pub struct QueueSource {
    queue: EndpointQueue,
    kind: String,
}

impl QueueSource {
    /// Reads the record's `payload` field.
    pub fn new(queue: EndpointQueue) -> Self {
        Self::with_kind(queue, fields::PAYLOAD)
    }

    /// Reads the record field `kind`.
    pub fn with_kind(queue: EndpointQueue, kind: impl Into<String>) -> Self {
        Self {
            queue,
            kind: kind.into(),
        }
    }
}

#[async_trait]
impl TaskSource for QueueSource {
    async fn attach(&mut self) -> Result<()> {
        Ok(())
    }

    async fn next(
        &mut self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Option<PulledTask>> {
        // A pop cannot be abandoned halfway, so wait in short slices and
        // check for cancellation between them.
        let deadline = Instant::now() + timeout;
        loop {
            if cancel.is_cancelled() {
                return Ok(None);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            let slice = remaining.min(QUEUE_POLL_SLICE);
            if let Some(queued) = self.queue.get(&self.kind, slice).await? {
                return Ok(Some(PulledTask {
                    task_id: queued.task_id,
                    payload: queued.payload,
                }));
            }
            if remaining <= QUEUE_POLL_SLICE {
                return Ok(None);
            }
        }
    }

    async fn detach(&mut self, unfinished: Vec<String>) -> Result<()> {
        for task_id in unfinished.iter().rev() {
            self.queue.requeue_front(task_id).await?;
        }
        Ok(())
    }

    fn redeliverer(&self) -> Arc<dyn Redeliver> {
        Arc::new(self.queue.clone())
    }
}

#[async_trait]
impl Redeliver for EndpointQueue {
    async fn redeliver(&self, task_id: &str) -> Result<()> {
        self.requeue_front(task_id).await
    }
}
