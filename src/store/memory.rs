//! In-memory store engine.
//!
//! [`MemoryStore`] implements [`Store`] entirely in process: hashes, lists and
//! plain values live in one map behind a `parking_lot::Mutex`, subscribers
//! receive messages through unbounded `tokio::sync::mpsc` channels, and
//! blocked list pops wake through a `tokio::sync::Notify`.
//!
//! Composite operations ([`publish_or_push`](Store::publish_or_push),
//! [`republish_list`](Store::republish_list), [`hcas`](Store::hcas)) run
//! under the single state lock, which gives them the same atomicity Redis
//! gives a Lua script.
//!
//! Expiry uses `tokio::time::Instant`, so tests running with a paused clock
//! can advance time to expire records.
//!
//! # Examples
//!
//! ```
//! use taskrelay::store::{MemoryStore, Store};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let store = MemoryStore::new();
//! store.hset("k", "f", b"v").await.unwrap();
//! assert_eq!(store.hget("k", "f").await.unwrap(), Some(b"v".to_vec()));
//! # }
//! ```

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;

use super::{Message, PublishOutcome, Store, Subscriber};
use crate::error::StoreError;

#[derive(Debug)]
enum Value {
    Plain(Vec<u8>),
    Hash(HashMap<String, Vec<u8>>),
    List(VecDeque<Vec<u8>>),
}

#[derive(Debug)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: Value) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }
}

type SubscriberMap = HashMap<u64, mpsc::UnboundedSender<Message>>;

#[derive(Debug, Default)]
struct State {
    entries: HashMap<String, Entry>,
    channels: HashMap<String, SubscriberMap>,
}

fn wrong_type(key: &str) -> StoreError {
    StoreError::WrongType {
        key: key.to_string(),
    }
}

impl State {
    /// Returns the entry for `key`, dropping it first if it has expired.
    fn live(&mut self, key: &str) -> Option<&mut Entry> {
        let now = Instant::now();
        let expired = self
            .entries
            .get(key)
            .and_then(|e| e.expires_at)
            .is_some_and(|at| at <= now);
        if expired {
            self.entries.remove(key);
        }
        self.entries.get_mut(key)
    }

    fn hash(&mut self, key: &str) -> Result<Option<&mut HashMap<String, Vec<u8>>>, StoreError> {
        match self.live(key) {
            None => Ok(None),
            Some(Entry {
                value: Value::Hash(h),
                ..
            }) => Ok(Some(h)),
            Some(_) => Err(wrong_type(key)),
        }
    }

    fn hash_or_insert(&mut self, key: &str) -> Result<&mut HashMap<String, Vec<u8>>, StoreError> {
        self.live(key);
        let entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(Value::Hash(HashMap::new())));
        match &mut entry.value {
            Value::Hash(h) => Ok(h),
            _ => Err(wrong_type(key)),
        }
    }

    fn list(&mut self, key: &str) -> Result<Option<&mut VecDeque<Vec<u8>>>, StoreError> {
        match self.live(key) {
            None => Ok(None),
            Some(Entry {
                value: Value::List(l),
                ..
            }) => Ok(Some(l)),
            Some(_) => Err(wrong_type(key)),
        }
    }

    fn list_or_insert(&mut self, key: &str) -> Result<&mut VecDeque<Vec<u8>>, StoreError> {
        self.live(key);
        let entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(Value::List(VecDeque::new())));
        match &mut entry.value {
            Value::List(l) => Ok(l),
            _ => Err(wrong_type(key)),
        }
    }

    fn list_len(&mut self, key: &str) -> Result<usize, StoreError> {
        Ok(self.list(key)?.map_or(0, |l| l.len()))
    }

    fn pop_front(&mut self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let Some(list) = self.list(key)? else {
            return Ok(None);
        };
        let item = list.pop_front();
        if list.is_empty() {
            self.entries.remove(key);
        }
        Ok(item)
    }

    /// Empty lists do not exist, as in Redis.
    fn drop_if_empty_list(&mut self, key: &str) {
        if matches!(self.entries.get(key), Some(Entry { value: Value::List(l), .. }) if l.is_empty())
        {
            self.entries.remove(key);
        }
    }

    fn publish(&mut self, channel: &str, payload: &[u8]) -> usize {
        let Some(subscribers) = self.channels.get_mut(channel) else {
            return 0;
        };
        subscribers.retain(|_, tx| !tx.is_closed());
        let message = Message {
            channel: channel.to_string(),
            payload: payload.to_vec(),
        };
        subscribers
            .values()
            .filter(|tx| tx.send(message.clone()).is_ok())
            .count()
    }
}

/// Converts Redis-style inclusive, possibly negative, indexes into a
/// concrete range over a list of `len` elements.
fn normalize_range(start: isize, stop: isize, len: usize) -> Option<(usize, usize)> {
    let len = isize::try_from(len).unwrap_or(isize::MAX);
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if start > stop || start >= len {
        None
    } else {
        Some((start as usize, stop as usize))
    }
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<State>,
    pushed: Notify,
    next_subscriber: AtomicU64,
}

/// Thread-safe in-process implementation of [`Store`].
///
/// Cloning is cheap: clones share the same underlying data.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys.
    pub fn key_count(&self) -> usize {
        let mut state = self.shared.state.lock();
        let keys: Vec<String> = state.entries.keys().cloned().collect();
        keys.iter().filter(|k| state.live(k).is_some()).count()
    }

    /// Number of subscribers currently following `channel`.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        let state = self.shared.state.lock();
        state
            .channels
            .get(channel)
            .map_or(0, |subs| subs.values().filter(|tx| !tx.is_closed()).count())
    }

    fn pushed(&self) {
        self.shared.pushed.notify_waiters();
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.shared.state.lock().live(key).is_some())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut state = self.shared.state.lock();
        let existed = state.live(key).is_some();
        state.entries.remove(key);
        Ok(existed)
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let mut state = self.shared.state.lock();
        match state.live(key) {
            None => Ok(None),
            Some(Entry {
                value: Value::Plain(v),
                ..
            }) => Ok(Some(v.clone())),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let mut state = self.shared.state.lock();
        Ok(state.hash(key)?.and_then(|h| h.get(field).cloned()))
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, Vec<u8>>, StoreError> {
        let mut state = self.shared.state.lock();
        Ok(state.hash(key)?.cloned().unwrap_or_default())
    }

    async fn hset(&self, key: &str, field: &str, value: &[u8]) -> Result<(), StoreError> {
        let mut state = self.shared.state.lock();
        state
            .hash_or_insert(key)?
            .insert(field.to_string(), value.to_vec());
        Ok(())
    }

    async fn hset_nx(&self, key: &str, field: &str, value: &[u8]) -> Result<bool, StoreError> {
        let mut state = self.shared.state.lock();
        let hash = state.hash_or_insert(key)?;
        if hash.contains_key(field) {
            return Ok(false);
        }
        hash.insert(field.to_string(), value.to_vec());
        Ok(true)
    }

    async fn hexists(&self, key: &str, field: &str) -> Result<bool, StoreError> {
        let mut state = self.shared.state.lock();
        Ok(state.hash(key)?.is_some_and(|h| h.contains_key(field)))
    }

    async fn hcas(
        &self,
        key: &str,
        field: &str,
        expected: &[u8],
        value: &[u8],
    ) -> Result<bool, StoreError> {
        let mut state = self.shared.state.lock();
        let Some(hash) = state.hash(key)? else {
            return Ok(false);
        };
        match hash.get_mut(field) {
            Some(current) if current.as_slice() == expected => {
                *current = value.to_vec();
                Ok(true)
            },
            _ => Ok(false),
        }
    }

    async fn expire_if_unset(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut state = self.shared.state.lock();
        match state.live(key) {
            Some(entry) if entry.expires_at.is_none() => {
                entry.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            },
            _ => Ok(false),
        }
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        let mut state = self.shared.state.lock();
        let now = Instant::now();
        Ok(state
            .live(key)
            .and_then(|e| e.expires_at)
            .map(|at| at.saturating_duration_since(now)))
    }

    async fn rpush(&self, key: &str, value: &[u8]) -> Result<usize, StoreError> {
        let len = {
            let mut state = self.shared.state.lock();
            let list = state.list_or_insert(key)?;
            list.push_back(value.to_vec());
            list.len()
        };
        self.pushed();
        Ok(len)
    }

    async fn lpush(&self, key: &str, value: &[u8]) -> Result<usize, StoreError> {
        let len = {
            let mut state = self.shared.state.lock();
            let list = state.list_or_insert(key)?;
            list.push_front(value.to_vec());
            list.len()
        };
        self.pushed();
        Ok(len)
    }

    async fn lpop(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.shared.state.lock().pop_front(key)
    }

    async fn blpop(&self, key: &str, timeout: Duration) -> Result<Option<Vec<u8>>, StoreError> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.shared.pushed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(item) = self.shared.state.lock().pop_front(key)? {
                return Ok(Some(item));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.shared.state.lock().pop_front(key);
            }
        }
    }

    async fn lrange(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<Vec<u8>>, StoreError> {
        let mut state = self.shared.state.lock();
        let Some(list) = state.list(key)? else {
            return Ok(Vec::new());
        };
        Ok(match normalize_range(start, stop, list.len()) {
            Some((s, e)) => list.iter().skip(s).take(e - s + 1).cloned().collect(),
            None => Vec::new(),
        })
    }

    async fn ltrim(&self, key: &str, start: isize, stop: isize) -> Result<(), StoreError> {
        let mut state = self.shared.state.lock();
        let Some(list) = state.list(key)? else {
            return Ok(());
        };
        match normalize_range(start, stop, list.len()) {
            Some((s, e)) => {
                list.truncate(e + 1);
                list.drain(..s);
            },
            None => list.clear(),
        }
        state.drop_if_empty_list(key);
        Ok(())
    }

    async fn llen(&self, key: &str) -> Result<usize, StoreError> {
        self.shared.state.lock().list_len(key)
    }

    async fn incr_by_float(&self, key: &str, delta: f64) -> Result<f64, StoreError> {
        let mut state = self.shared.state.lock();
        let current = match state.live(key) {
            None => 0.0,
            Some(Entry {
                value: Value::Plain(v),
                ..
            }) => std::str::from_utf8(v)
                .ok()
                .and_then(|s| s.parse::<f64>().ok())
                .ok_or_else(|| StoreError::Protocol {
                    message: format!("value at {key} is not a valid float"),
                })?,
            Some(_) => return Err(wrong_type(key)),
        };
        let updated = current + delta;
        let encoded = updated.to_string().into_bytes();
        match state.live(key) {
            Some(entry) => entry.value = Value::Plain(encoded),
            None => {
                state
                    .entries
                    .insert(key.to_string(), Entry::new(Value::Plain(encoded)));
            },
        }
        Ok(updated)
    }

    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<usize, StoreError> {
        Ok(self.shared.state.lock().publish(channel, payload))
    }

    async fn publish_or_push(
        &self,
        channel: &str,
        backlog: &str,
        payload: &[u8],
    ) -> Result<PublishOutcome, StoreError> {
        let outcome = {
            let mut state = self.shared.state.lock();
            if state.list_len(backlog)? > 0 {
                state.list_or_insert(backlog)?.push_back(payload.to_vec());
                PublishOutcome::Queued
            } else {
                match state.publish(channel, payload) {
                    0 => {
                        state.list_or_insert(backlog)?.push_back(payload.to_vec());
                        PublishOutcome::Queued
                    },
                    n => PublishOutcome::Published(n),
                }
            }
        };
        if outcome == PublishOutcome::Queued {
            self.pushed();
        }
        Ok(outcome)
    }

    async fn republish_list(&self, backlog: &str, channel: &str) -> Result<usize, StoreError> {
        let mut state = self.shared.state.lock();
        let mut moved = 0;
        while let Some(item) = state.pop_front(backlog)? {
            if state.publish(channel, &item) == 0 {
                state.list_or_insert(backlog)?.push_front(item);
                break;
            }
            moved += 1;
        }
        Ok(moved)
    }

    async fn subscriber(&self) -> Result<Box<dyn Subscriber>, StoreError> {
        let (tx, rx) = mpsc::unbounded_channel();
        Ok(Box::new(MemorySubscriber {
            id: self.shared.next_subscriber.fetch_add(1, Ordering::Relaxed),
            shared: Arc::clone(&self.shared),
            tx,
            rx,
            channels: HashSet::new(),
        }))
    }
}

/// Subscriber handed out by [`MemoryStore::subscriber`].
#[derive(Debug)]
pub struct MemorySubscriber {
    id: u64,
    shared: Arc<Shared>,
    tx: mpsc::UnboundedSender<Message>,
    rx: mpsc::UnboundedReceiver<Message>,
    channels: HashSet<String>,
}

impl MemorySubscriber {
    fn detach(&self, state: &mut State, channel: &str) {
        if let Some(subscribers) = state.channels.get_mut(channel) {
            subscribers.remove(&self.id);
            if subscribers.is_empty() {
                state.channels.remove(channel);
            }
        }
    }
}

#[async_trait]
impl Subscriber for MemorySubscriber {
    async fn subscribe(&mut self, channel: &str) -> Result<(), StoreError> {
        let mut state = self.shared.state.lock();
        state
            .channels
            .entry(channel.to_string())
            .or_default()
            .insert(self.id, self.tx.clone());
        self.channels.insert(channel.to_string());
        Ok(())
    }

    async fn unsubscribe(&mut self, channel: &str) -> Result<(), StoreError> {
        let mut state = self.shared.state.lock();
        self.detach(&mut state, channel);
        self.channels.remove(channel);
        Ok(())
    }

    async fn next_message(&mut self, timeout: Duration) -> Result<Option<Message>, StoreError> {
        if let Ok(message) = self.rx.try_recv() {
            return Ok(Some(message));
        }
        if timeout.is_zero() {
            return Ok(None);
        }
        Ok(tokio::time::timeout(timeout, self.rx.recv())
            .await
            .ok()
            .flatten())
    }
}

impl Drop for MemorySubscriber {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        for channel in &self.channels {
            self.detach(&mut state, channel);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const SHORT: Duration = Duration::from_millis(50);

    #[tokio::test]
    async fn hash_fields_round_trip() {
        let store = MemoryStore::new();
        assert!(!store.exists("h").await.unwrap());
        store.hset("h", "a", b"1").await.unwrap();
        assert!(store.exists("h").await.unwrap());
        assert!(store.hexists("h", "a").await.unwrap());
        assert!(!store.hexists("h", "b").await.unwrap());
        assert_eq!(store.hget("h", "a").await.unwrap(), Some(b"1".to_vec()));
        assert_eq!(store.hgetall("h").await.unwrap().len(), 1);
        assert!(store.delete("h").await.unwrap());
        assert!(!store.delete("h").await.unwrap());
    }

    #[tokio::test]
    async fn hset_nx_keeps_first_value() {
        let store = MemoryStore::new();
        assert!(store.hset_nx("h", "status", b"first").await.unwrap());
        assert!(!store.hset_nx("h", "status", b"second").await.unwrap());
        assert_eq!(
            store.hget("h", "status").await.unwrap(),
            Some(b"first".to_vec())
        );
    }

    #[tokio::test]
    async fn hcas_swaps_only_on_match() {
        let store = MemoryStore::new();
        assert!(!store.hcas("h", "f", b"x", b"y").await.unwrap());
        store.hset("h", "f", b"x").await.unwrap();
        assert!(!store.hcas("h", "f", b"nope", b"y").await.unwrap());
        assert!(store.hcas("h", "f", b"x", b"y").await.unwrap());
        assert_eq!(store.hget("h", "f").await.unwrap(), Some(b"y".to_vec()));
    }

    #[tokio::test]
    async fn wrong_type_is_reported() {
        let store = MemoryStore::new();
        store.rpush("l", b"1").await.unwrap();
        let err = store.hget("l", "f").await.unwrap_err();
        assert!(matches!(err, StoreError::WrongType { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn expire_if_unset_is_idempotent_and_expires() {
        let store = MemoryStore::new();
        assert!(!store.expire_if_unset("missing", SHORT).await.unwrap());

        store.hset("h", "f", b"v").await.unwrap();
        assert!(store
            .expire_if_unset("h", Duration::from_secs(10))
            .await
            .unwrap());
        assert!(!store
            .expire_if_unset("h", Duration::from_secs(1000))
            .await
            .unwrap());
        let ttl = store.ttl("h").await.unwrap().unwrap();
        assert!(ttl <= Duration::from_secs(10));

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(!store.exists("h").await.unwrap());
        assert_eq!(store.hget("h", "f").await.unwrap(), None);
    }

    #[tokio::test]
    async fn list_operations_follow_redis_semantics() {
        let store = MemoryStore::new();
        for i in 0..5u8 {
            store.rpush("l", &[i]).await.unwrap();
        }
        store.lpush("l", &[9]).await.unwrap();
        assert_eq!(store.llen("l").await.unwrap(), 6);
        assert_eq!(
            store.lrange("l", 0, 1).await.unwrap(),
            vec![vec![9], vec![0]]
        );
        assert_eq!(store.lrange("l", -2, -1).await.unwrap(), vec![vec![3], vec![4]]);
        assert_eq!(store.lrange("l", 10, 20).await.unwrap(), Vec::<Vec<u8>>::new());

        store.ltrim("l", 0, 2).await.unwrap();
        assert_eq!(
            store.lrange("l", 0, -1).await.unwrap(),
            vec![vec![9], vec![0], vec![1]]
        );
        assert_eq!(store.lpop("l").await.unwrap(), Some(vec![9]));

        store.ltrim("l", 5, 10).await.unwrap();
        assert!(!store.exists("l").await.unwrap());
    }

    #[tokio::test]
    async fn blpop_waits_for_a_push() {
        let store = MemoryStore::new();
        let producer = store.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.rpush("q", b"job").await.unwrap();
        });
        let popped = store.blpop("q", Duration::from_secs(2)).await.unwrap();
        assert_eq!(popped, Some(b"job".to_vec()));
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn blpop_times_out_on_empty_list() {
        let store = MemoryStore::new();
        assert_eq!(store.blpop("q", SHORT).await.unwrap(), None);
    }

    #[tokio::test]
    async fn float_counter_accumulates() {
        let store = MemoryStore::new();
        assert_eq!(store.incr_by_float("c", 1.5).await.unwrap(), 1.5);
        assert_eq!(store.incr_by_float("c", 2.25).await.unwrap(), 3.75);
        assert_eq!(store.get("c").await.unwrap(), Some(b"3.75".to_vec()));
    }

    #[tokio::test]
    async fn publish_counts_subscribers() {
        let store = MemoryStore::new();
        assert_eq!(store.publish("ch", b"x").await.unwrap(), 0);

        let mut sub = store.subscriber().await.unwrap();
        sub.subscribe("ch").await.unwrap();
        assert_eq!(store.publish("ch", b"x").await.unwrap(), 1);
        let msg = sub.next_message(SHORT).await.unwrap().unwrap();
        assert_eq!(msg.channel, "ch");
        assert_eq!(msg.payload, b"x".to_vec());

        drop(sub);
        assert_eq!(store.subscriber_count("ch"), 0);
        assert_eq!(store.publish("ch", b"x").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn unsubscribe_keeps_already_received_messages() {
        let store = MemoryStore::new();
        let mut sub = store.subscriber().await.unwrap();
        sub.subscribe("ch").await.unwrap();
        store.publish("ch", b"1").await.unwrap();
        sub.unsubscribe("ch").await.unwrap();
        assert_eq!(store.publish("ch", b"2").await.unwrap(), 0);
        let msg = sub.next_message(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(msg.payload, b"1".to_vec());
        assert!(sub.next_message(Duration::ZERO).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn publish_or_push_queues_behind_backlog() {
        let store = MemoryStore::new();
        assert_eq!(
            store.publish_or_push("ch", "bl", b"a").await.unwrap(),
            PublishOutcome::Queued
        );

        let mut sub = store.subscriber().await.unwrap();
        sub.subscribe("ch").await.unwrap();
        // Backlog is non-empty, so even with a listener the id queues.
        assert_eq!(
            store.publish_or_push("ch", "bl", b"b").await.unwrap(),
            PublishOutcome::Queued
        );
        assert_eq!(store.republish_list("bl", "ch").await.unwrap(), 2);
        assert_eq!(
            store.publish_or_push("ch", "bl", b"c").await.unwrap(),
            PublishOutcome::Published(1)
        );

        let mut seen = Vec::new();
        while let Some(m) = sub.next_message(SHORT).await.unwrap() {
            seen.push(m.payload);
        }
        assert_eq!(seen, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }

    #[tokio::test]
    async fn republish_list_stops_without_listeners() {
        let store = MemoryStore::new();
        store.rpush("bl", b"a").await.unwrap();
        store.rpush("bl", b"b").await.unwrap();
        assert_eq!(store.republish_list("bl", "ch").await.unwrap(), 0);
        assert_eq!(
            store.lrange("bl", 0, -1).await.unwrap(),
            vec![b"a".to_vec(), b"b".to_vec()]
        );
    }

    #[test]
    fn normalize_range_matches_redis() {
        assert_eq!(normalize_range(0, -1, 3), Some((0, 2)));
        assert_eq!(normalize_range(-5, 1, 3), Some((0, 1)));
        assert_eq!(normalize_range(2, 1, 3), None);
        assert_eq!(normalize_range(0, -1, 0), None);
        assert_eq!(normalize_range(1, 100, 3), Some((1, 2)));
    }
}
