//! The shared key/value engine that every taskrelay component talks to.
//!
//! # Architecture
//!
//! [`Store`] is a dumb engine interface: hashes, lists, plain values,
//! pub/sub, per-key TTL and a float counter. It contains **no** knowledge of
//! tasks, endpoints or statuses; that lives in [`task`](crate::task),
//! [`dispatch`](crate::dispatch) and friends, which build keys through a
//! [`Keyspace`](crate::keys::Keyspace).
//!
//! Two operations are composite and must execute atomically in the engine:
//!
//! - [`publish_or_push`](Store::publish_or_push) - append behind a non-empty
//!   backlog, otherwise publish, otherwise append.
//! - [`republish_list`](Store::republish_list) - pop every backlog entry and
//!   publish it, restoring the entry and stopping if nobody is listening.
//!
//! Together they guarantee that a task id is delivered exactly once per
//! `put`, and that buffered ids are always observed before live ones.
//!
//! # Backends
//!
//! - [`MemoryStore`](memory::MemoryStore) - in-process engine for tests and
//!   single-process deployments.
//! - [`RedisStore`](redis::RedisStore) - Redis, behind the `redis` feature.
//!
//! # Failure semantics
//!
//! Every method returns [`StoreError`] on engine failure. Nothing is retried
//! inside the store: losing the store means losing durability guarantees, so
//! the calling operation must fail.

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreError;

pub use memory::MemoryStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisStore;

/// The handle every component holds on the shared store.
pub type SharedStore = Arc<dyn Store>;

/// A message received on a pub/sub channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Channel the message was published on.
    pub channel: String,
    /// Raw payload.
    pub payload: Vec<u8>,
}

/// What [`Store::publish_or_push`] did with a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Delivered live to this many subscribers.
    Published(usize),
    /// Appended to the backlog list, either because the backlog already held
    /// entries or because nobody was subscribed.
    Queued,
}

/// Low-level key/value engine.
///
/// Implementations must be `Send + Sync`; all components share one store via
/// `Arc<dyn Store>`.
#[async_trait]
pub trait Store: Send + Sync {
    /// Returns `true` if the key exists (and has not expired).
    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    /// Deletes a key. Returns `true` if it existed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Reads a plain value.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Reads one hash field.
    async fn hget(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Reads every field of a hash. Missing keys yield an empty map.
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, Vec<u8>>, StoreError>;

    /// Writes one hash field unconditionally.
    async fn hset(&self, key: &str, field: &str, value: &[u8]) -> Result<(), StoreError>;

    /// Writes one hash field only if it is not already set. Returns `true`
    /// if the value was written.
    async fn hset_nx(&self, key: &str, field: &str, value: &[u8]) -> Result<bool, StoreError>;

    /// Returns `true` if the hash field is set.
    async fn hexists(&self, key: &str, field: &str) -> Result<bool, StoreError>;

    /// Atomically replaces a hash field if it currently equals `expected`.
    /// Returns `true` if the swap happened.
    async fn hcas(
        &self,
        key: &str,
        field: &str,
        expected: &[u8],
        value: &[u8],
    ) -> Result<bool, StoreError>;

    /// Attaches a TTL to an existing key that has none. Returns `true` if the
    /// TTL was set; a key that already carries a TTL is left untouched.
    async fn expire_if_unset(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Remaining time-to-live. `None` if the key is missing or persistent.
    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError>;

    /// Appends to the tail of a list. Returns the new length.
    async fn rpush(&self, key: &str, value: &[u8]) -> Result<usize, StoreError>;

    /// Prepends to the head of a list. Returns the new length.
    async fn lpush(&self, key: &str, value: &[u8]) -> Result<usize, StoreError>;

    /// Pops the head of a list.
    async fn lpop(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Pops the head of a list, waiting up to `timeout` for an element.
    async fn blpop(&self, key: &str, timeout: Duration) -> Result<Option<Vec<u8>>, StoreError>;

    /// Returns list elements between `start` and `stop` inclusive. Negative
    /// indexes count from the tail, as in Redis.
    async fn lrange(&self, key: &str, start: isize, stop: isize)
        -> Result<Vec<Vec<u8>>, StoreError>;

    /// Trims a list to the inclusive range `start..=stop`.
    async fn ltrim(&self, key: &str, start: isize, stop: isize) -> Result<(), StoreError>;

    /// Length of a list (0 if missing).
    async fn llen(&self, key: &str) -> Result<usize, StoreError>;

    /// Atomically adds `delta` to a float counter, returning the new value.
    async fn incr_by_float(&self, key: &str, delta: f64) -> Result<f64, StoreError>;

    /// Publishes a message. Returns the number of subscribers reached.
    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<usize, StoreError>;

    /// Atomically delivers `payload` on `channel` or appends it to `backlog`.
    ///
    /// If `backlog` is non-empty the payload is appended without publishing,
    /// so it stays behind older buffered entries. Otherwise it is published,
    /// and appended only if nobody received it.
    async fn publish_or_push(
        &self,
        channel: &str,
        backlog: &str,
        payload: &[u8],
    ) -> Result<PublishOutcome, StoreError>;

    /// Atomically pops each `backlog` entry in FIFO order and publishes it on
    /// `channel`. If a publish reaches nobody, the entry is pushed back to the
    /// head and draining stops. Returns the number of entries moved.
    async fn republish_list(&self, backlog: &str, channel: &str) -> Result<usize, StoreError>;

    /// Opens a new pub/sub subscriber.
    async fn subscriber(&self) -> Result<Box<dyn Subscriber>, StoreError>;
}

/// One pub/sub connection that can follow several channels.
#[async_trait]
pub trait Subscriber: Send {
    /// Starts following `channel`. Returns once the engine acknowledged it,
    /// so publishes issued afterwards are guaranteed to be received.
    async fn subscribe(&mut self, channel: &str) -> Result<(), StoreError>;

    /// Stops following `channel`. Messages already received stay buffered
    /// and are still returned by [`next_message`](Self::next_message).
    async fn unsubscribe(&mut self, channel: &str) -> Result<(), StoreError>;

    /// Waits up to `timeout` for the next message on any followed channel.
    async fn next_message(&mut self, timeout: Duration) -> Result<Option<Message>, StoreError>;
}

/// Decodes a stored value as UTF-8.
pub(crate) fn decode_utf8(key: &str, field: &str, raw: Vec<u8>) -> crate::Result<String> {
    String::from_utf8(raw).map_err(|e| crate::Error::MalformedField {
        key: key.to_string(),
        field: field.to_string(),
        message: e.to_string(),
    })
}
