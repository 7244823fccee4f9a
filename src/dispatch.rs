//! Publish/subscribe task dispatch with a durable backlog fallback.
//!
//! Each endpoint has a pub/sub channel and a backlog list (see
//! [`Keyspace`]). The publishing side ([`TaskPublisher`]) hands a task id to
//! the store's atomic `publish_or_push`: if the backlog is empty and somebody
//! is subscribed, the id goes out live; otherwise it is appended to the
//! backlog. The consuming side ([`Dispatcher`]) subscribes first and then
//! drains the backlog onto the channel with the atomic `republish_list`.
//!
//! Because a non-empty backlog forces new ids to queue behind it, and the
//! drain pops each entry exactly once, a consumer observes every buffered id
//! once, in FIFO order, before any id published live after it subscribed.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::Result;
use crate::keys::Keyspace;
use crate::store::{decode_utf8, PublishOutcome, SharedStore, Subscriber};
use crate::task::{TaskRecord, TaskStatus};

/// One task id delivered to an endpoint consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Endpoint whose channel carried the id.
    pub endpoint_id: String,
    /// The dispatched task id.
    pub task_id: String,
}

/// Submission-side half of the dispatcher.
///
/// Cheap to clone; holds no subscription.
#[derive(Clone)]
pub struct TaskPublisher {
    store: SharedStore,
    keys: Keyspace,
}

impl std::fmt::Debug for TaskPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskPublisher")
            .field("keys", &self.keys)
            .finish_non_exhaustive()
    }
}

impl TaskPublisher {
    /// Creates a publisher over `store`.
    pub fn new(store: SharedStore, keys: Keyspace) -> Self {
        Self { store, keys }
    }

    /// Marks the task `WAITING_FOR_EP` and routes its id to the endpoint.
    ///
    /// Never blocks on endpoint availability: with no live subscriber the id
    /// lands in the endpoint's backlog.
    pub async fn put(&self, endpoint_id: &str, task: &TaskRecord) -> Result<PublishOutcome> {
        task.advance_status(TaskStatus::WaitingForEp).await?;
        let outcome = self
            .store
            .publish_or_push(
                &self.keys.endpoint_channel(endpoint_id),
                &self.keys.endpoint_backlog(endpoint_id),
                task.task_id().as_bytes(),
            )
            .await?;
        debug!(endpoint_id, task_id = task.task_id(), ?outcome, "task dispatched");
        Ok(outcome)
    }

    /// Number of ids buffered for the endpoint.
    pub async fn backlog_len(&self, endpoint_id: &str) -> Result<usize> {
        Ok(self
            .store
            .llen(&self.keys.endpoint_backlog(endpoint_id))
            .await?)
    }

    /// Buffered ids, oldest first.
    pub async fn backlog(&self, endpoint_id: &str) -> Result<Vec<String>> {
        let key = self.keys.endpoint_backlog(endpoint_id);
        self.store
            .lrange(&key, 0, -1)
            .await?
            .into_iter()
            .map(|raw| decode_utf8(&key, "", raw))
            .collect()
    }

    /// Pushes ids back to the head of the endpoint's backlog so that
    /// `task_ids[0]` is delivered next.
    pub async fn requeue_front(&self, endpoint_id: &str, task_ids: &[String]) -> Result<()> {
        let key = self.keys.endpoint_backlog(endpoint_id);
        for task_id in task_ids.iter().rev() {
            self.store.lpush(&key, task_id.as_bytes()).await?;
        }
        if !task_ids.is_empty() {
            info!(endpoint_id, count = task_ids.len(), "task ids returned to backlog");
        }
        Ok(())
    }
}

/// Consumer-side dispatcher: one pub/sub connection following any number of
/// endpoint channels.
pub struct Dispatcher {
    publisher: TaskPublisher,
    subscriber: Box<dyn Subscriber>,
    subscriber_count: usize,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("publisher", &self.publisher)
            .field("subscriber_count", &self.subscriber_count)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Opens a pub/sub connection on `store`.
    pub async fn connect(store: SharedStore, keys: Keyspace) -> Result<Self> {
        let subscriber = store.subscriber().await?;
        Ok(Self {
            publisher: TaskPublisher::new(store, keys),
            subscriber,
            subscriber_count: 0,
        })
    }

    /// The publishing half, for callers that also submit.
    pub fn publisher(&self) -> &TaskPublisher {
        &self.publisher
    }

    /// See [`TaskPublisher::put`].
    ///
    /// The returned future borrows only the publishing half, so it is `Send`
    /// even though the subscriber connection is not `Sync`.
    pub fn put<'a>(
        &'a self,
        endpoint_id: &'a str,
        task: &'a TaskRecord,
    ) -> impl Future<Output = Result<PublishOutcome>> + Send + 'a {
        self.publisher.put(endpoint_id, task)
    }

    /// Number of active subscriptions held by this dispatcher.
    pub fn subscriber_count(&self) -> usize {
        self.subscriber_count
    }

    /// Subscribes to the endpoint's channel, then drains its backlog onto
    /// the channel in FIFO order before returning. Returns how many buffered
    /// ids were drained.
    pub async fn subscribe(&mut self, endpoint_id: &str) -> Result<usize> {
        let keys = &self.publisher.keys;
        let channel = keys.endpoint_channel(endpoint_id);
        self.subscriber.subscribe(&channel).await?;
        self.subscriber_count += 1;

        let drained = self
            .publisher
            .store
            .republish_list(&keys.endpoint_backlog(endpoint_id), &channel)
            .await?;
        info!(endpoint_id, drained, "subscribed to endpoint channel");
        Ok(drained)
    }

    /// Stops following the endpoint's channel. The subscriber count never
    /// drops below zero.
    pub async fn unsubscribe(&mut self, endpoint_id: &str) -> Result<()> {
        let channel = self.publisher.keys.endpoint_channel(endpoint_id);
        self.subscriber.unsubscribe(&channel).await?;
        self.subscriber_count = self.subscriber_count.saturating_sub(1);
        debug!(endpoint_id, "unsubscribed from endpoint channel");
        Ok(())
    }

    /// Waits up to `timeout` for the next delivered task id.
    ///
    /// Returns `None` immediately when nothing is subscribed, so a detached
    /// dispatcher never waits on a channel it does not follow.
    pub async fn get(&mut self, timeout: Duration) -> Result<Option<Delivery>> {
        if self.subscriber_count == 0 {
            return Ok(None);
        }
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let Some(message) = self.subscriber.next_message(remaining).await? else {
                return Ok(None);
            };
            if let Some(delivery) = self.delivery(message.channel, message.payload)? {
                return Ok(Some(delivery));
            }
            if remaining.is_zero() {
                return Ok(None);
            }
        }
    }

    /// Returns every message already received but not yet consumed, without
    /// waiting.
    pub async fn drain_pending(&mut self) -> Result<Vec<Delivery>> {
        let mut pending = Vec::new();
        while let Some(message) = self.subscriber.next_message(Duration::ZERO).await? {
            if let Some(delivery) = self.delivery(message.channel, message.payload)? {
                pending.push(delivery);
            }
        }
        Ok(pending)
    }

    /// See [`TaskPublisher::requeue_front`].
    pub fn requeue_front<'a>(
        &'a self,
        endpoint_id: &'a str,
        task_ids: &'a [String],
    ) -> impl Future<Output = Result<()>> + Send + 'a {
        self.publisher.requeue_front(endpoint_id, task_ids)
    }

    fn delivery(&self, channel: String, payload: Vec<u8>) -> Result<Option<Delivery>> {
        let Some(endpoint_id) = self.publisher.keys.endpoint_from_channel(&channel) else {
            warn!(%channel, "message on unrecognised channel ignored");
            return Ok(None);
        };
        let task_id = decode_utf8(&channel, "", payload)?;
        Ok(Some(Delivery {
            endpoint_id: endpoint_id.to_string(),
            task_id,
        }))
    }
}
