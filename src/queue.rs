//! Direct per-endpoint task queue.
//!
//! [`EndpointQueue`] is a thin pull interface: `put` stores a named
//! sub-field of the task record and appends the id to the endpoint's list;
//! `get` pops an id (waiting up to a timeout) and reads that sub-field back.
//! Records written by `put` expire like any other task record.

use std::time::Duration;

use tracing::trace;

use crate::error::{Error, Result};
use crate::keys::Keyspace;
use crate::store::{decode_utf8, SharedStore};
use crate::task::DEFAULT_TASK_TTL;

/// A task pulled off a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedTask {
    /// The popped task id.
    pub task_id: String,
    /// The requested sub-field of the task record.
    pub payload: Vec<u8>,
}

/// List-backed queue scoped to one endpoint.
#[derive(Clone)]
pub struct EndpointQueue {
    store: SharedStore,
    keys: Keyspace,
    endpoint_id: String,
    queue_key: String,
    ttl: Duration,
}

impl std::fmt::Debug for EndpointQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointQueue")
            .field("endpoint_id", &self.endpoint_id)
            .field("queue_key", &self.queue_key)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl EndpointQueue {
    /// Creates a queue handle for `endpoint_id`.
    pub fn new(store: SharedStore, keys: Keyspace, endpoint_id: impl Into<String>) -> Self {
        let endpoint_id = endpoint_id.into();
        Self {
            queue_key: keys.endpoint_queue(&endpoint_id),
            store,
            keys,
            endpoint_id,
            ttl: DEFAULT_TASK_TTL,
        }
    }

    /// Sets the expiry given to records that `put` creates.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// The endpoint this queue serves.
    pub fn endpoint_id(&self) -> &str {
        &self.endpoint_id
    }

    /// Stores `payload` under field `kind` of the task record and enqueues
    /// the id. A record without an expiry gets the queue's TTL; an existing
    /// expiry is left alone.
    pub async fn put(&self, task_id: &str, kind: &str, payload: &[u8]) -> Result<()> {
        let key = self.keys.task(task_id);
        self.store.hset(&key, kind, payload).await?;
        self.store.expire_if_unset(&key, self.ttl).await?;
        self.store
            .rpush(&self.queue_key, task_id.as_bytes())
            .await?;
        trace!(endpoint_id = %self.endpoint_id, task_id, kind, "task enqueued");
        Ok(())
    }

    /// Pops the next task id, waiting up to `timeout`, and reads field `kind`
    /// of its record.
    ///
    /// Returns `Ok(None)` when the queue stayed empty for the whole timeout.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownTask`] if the popped id has no such field (the record
    /// expired or was deleted while queued). The id is consumed either way.
    pub async fn get(&self, kind: &str, timeout: Duration) -> Result<Option<QueuedTask>> {
        let Some(raw) = self.store.blpop(&self.queue_key, timeout).await? else {
            return Ok(None);
        };
        let task_id = decode_utf8(&self.queue_key, "", raw)?;
        let payload = self
            .store
            .hget(&self.keys.task(&task_id), kind)
            .await?
            .ok_or_else(|| Error::unknown_task(&task_id))?;
        Ok(Some(QueuedTask { task_id, payload }))
    }

    /// Pushes an id back to the head of the queue.
    pub async fn requeue_front(&self, task_id: &str) -> Result<()> {
        self.store
            .lpush(&self.queue_key, task_id.as_bytes())
            .await?;
        Ok(())
    }

    /// Number of queued ids.
    pub async fn len(&self) -> Result<usize> {
        Ok(self.store.llen(&self.queue_key).await?)
    }

    /// Returns `true` if nothing is queued.
    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }
}
