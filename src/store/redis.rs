//! Redis store engine.
//!
//! [`RedisStore`] implements [`Store`] on top of a Redis server. Plain
//! commands go through a shared [`MultiplexedConnection`]; the composite
//! operations are Lua scripts (`redis::Script`) so they execute atomically on
//! the server:
//!
//! | Operation | Script |
//! |-----------|--------|
//! | [`hcas`](Store::hcas) | `HGET` compare, then `HSET` |
//! | [`expire_if_unset`](Store::expire_if_unset) | `PTTL == -1`, then `PEXPIRE` |
//! | [`publish_or_push`](Store::publish_or_push) | `LLEN`, `PUBLISH`, `RPUSH` |
//! | [`republish_list`](Store::republish_list) | `LPOP`/`PUBLISH` loop, `LPUSH` back on miss |
//!
//! # Blocking pops
//!
//! `BLPOP` would hold the multiplexed connection hostage for the whole
//! timeout, stalling every other command sharing it. [`blpop`](Store::blpop)
//! instead polls `LPOP` with an adaptive interval that starts at
//! `min_poll_interval` and doubles up to `max_poll_interval` while the list
//! stays empty.
//!
//! # Pub/sub
//!
//! Each [`subscriber`](Store::subscriber) call opens a dedicated pub/sub
//! connection through [`redis::Client::get_async_pubsub`].
//!
//! # Usage
//!
//! ```rust,no_run
//! use taskrelay::store::RedisStore;
//!
//! # async fn example() {
//! let store = RedisStore::new("redis://127.0.0.1:6379").await.unwrap();
//! # }
//! ```

use std::collections::HashMap;
use std::time::Duration;

use ::redis::aio::{MultiplexedConnection, PubSub};
use ::redis::{AsyncCommands, Client, FromRedisValue, RedisError, Script};
use async_trait::async_trait;
use futures::StreamExt;

use super::{Message, PublishOutcome, Store, Subscriber};
use crate::error::StoreError;

/// Compare-and-swap on one hash field.
///
/// KEYS[1] = hash key. ARGV[1] = field, ARGV[2] = expected, ARGV[3] = new.
/// Returns 1 if swapped, 0 otherwise.
const LUA_HCAS: &str = r#"
local current = redis.call('HGET', KEYS[1], ARGV[1])
if current == ARGV[2] then
    redis.call('HSET', KEYS[1], ARGV[1], ARGV[3])
    return 1
end
return 0
"#;

/// Attach a TTL only to a persistent key.
///
/// KEYS[1] = key. ARGV[1] = ttl in milliseconds.
/// Returns 1 if the TTL was set, 0 if the key is missing or already expiring.
const LUA_EXPIRE_IF_UNSET: &str = r#"
if redis.call('PTTL', KEYS[1]) == -1 then
    redis.call('PEXPIRE', KEYS[1], ARGV[1])
    return 1
end
return 0
"#;

/// Publish, or append to the backlog.
///
/// KEYS[1] = backlog list. ARGV[1] = channel, ARGV[2] = payload.
/// Returns the number of receivers; 0 means the payload was appended.
const LUA_PUBLISH_OR_PUSH: &str = r#"
if redis.call('LLEN', KEYS[1]) > 0 then
    redis.call('RPUSH', KEYS[1], ARGV[2])
    return 0
end
local receivers = redis.call('PUBLISH', ARGV[1], ARGV[2])
if receivers == 0 then
    redis.call('RPUSH', KEYS[1], ARGV[2])
end
return receivers
"#;

/// Drain the backlog onto the channel.
///
/// KEYS[1] = backlog list. ARGV[1] = channel.
/// Returns the number of entries published.
const LUA_REPUBLISH: &str = r#"
local moved = 0
while true do
    local item = redis.call('LPOP', KEYS[1])
    if not item then
        break
    end
    if redis.call('PUBLISH', ARGV[1], item) == 0 then
        redis.call('LPUSH', KEYS[1], item)
        break
    end
    moved = moved + 1
end
return moved
"#;

const DEFAULT_MIN_POLL: Duration = Duration::from_millis(10);
const DEFAULT_MAX_POLL: Duration = Duration::from_millis(250);

/// Redis implementation of [`Store`].
///
/// # Connection Model
///
/// `RedisStore` holds a [`MultiplexedConnection`], which clones cheaply and
/// shares one TCP connection. Each method clones it for concurrent use.
/// The [`Client`] is kept to open pub/sub connections on demand.
#[derive(Debug, Clone)]
pub struct RedisStore {
    client: Client,
    conn: MultiplexedConnection,
    min_poll_interval: Duration,
    max_poll_interval: Duration,
}

impl RedisStore {
    /// Connects to Redis at `url` (`redis://[:<password>@]<host>:<port>[/<db>]`).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Connection`] if the client cannot be created or
    /// the server cannot be reached.
    pub async fn new(url: &str) -> Result<Self, StoreError> {
        let client = Client::open(url).map_err(|e| StoreError::Connection {
            message: format!("failed to create Redis client: {e}"),
            source: Some(Box::new(e)),
        })?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| StoreError::Connection {
                message: format!("failed to connect to Redis: {e}"),
                source: Some(Box::new(e)),
            })?;
        Ok(Self::with_connection(client, conn))
    }

    /// Wraps an existing client and multiplexed connection.
    pub fn with_connection(client: Client, conn: MultiplexedConnection) -> Self {
        Self {
            client,
            conn,
            min_poll_interval: DEFAULT_MIN_POLL,
            max_poll_interval: DEFAULT_MAX_POLL,
        }
    }

    /// Sets the `LPOP` polling bounds used by [`blpop`](Store::blpop).
    pub fn with_poll_interval(mut self, min: Duration, max: Duration) -> Self {
        self.min_poll_interval = min;
        self.max_poll_interval = max.max(min);
        self
    }

    async fn script<T: FromRedisValue>(
        &self,
        source: &str,
        keys: &[&str],
        args: &[&[u8]],
    ) -> Result<T, StoreError> {
        let script = Script::new(source);
        let mut invocation = script.prepare_invoke();
        for key in keys {
            invocation.key(*key);
        }
        for arg in args {
            invocation.arg(*arg);
        }
        invocation
            .invoke_async(&mut self.conn.clone())
            .await
            .map_err(|e| map_redis_error(e, keys.first().copied().unwrap_or_default()))
    }
}

/// Maps a Redis error onto [`StoreError`].
fn map_redis_error(err: RedisError, key: &str) -> StoreError {
    if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
        StoreError::Connection {
            message: format!("Redis connection failed for key {key}: {err}"),
            source: Some(Box::new(err)),
        }
    } else if err.code() == Some("WRONGTYPE") {
        StoreError::WrongType {
            key: key.to_string(),
        }
    } else {
        StoreError::Backend {
            message: format!("Redis error for key {key}: {err}"),
            source: Some(Box::new(err)),
        }
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        conn.exists(key).await.map_err(|e| map_redis_error(e, key))
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let removed: usize = conn.del(key).await.map_err(|e| map_redis_error(e, key))?;
        Ok(removed > 0)
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let mut conn = self.conn.clone();
        conn.get(key).await.map_err(|e| map_redis_error(e, key))
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let mut conn = self.conn.clone();
        conn.hget(key, field)
            .await
            .map_err(|e| map_redis_error(e, key))
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, Vec<u8>>, StoreError> {
        let mut conn = self.conn.clone();
        conn.hgetall(key).await.map_err(|e| map_redis_error(e, key))
    }

    async fn hset(&self, key: &str, field: &str, value: &[u8]) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: i64 = conn
            .hset(key, field, value)
            .await
            .map_err(|e| map_redis_error(e, key))?;
        Ok(())
    }

    async fn hset_nx(&self, key: &str, field: &str, value: &[u8]) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        conn.hset_nx(key, field, value)
            .await
            .map_err(|e| map_redis_error(e, key))
    }

    async fn hexists(&self, key: &str, field: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        conn.hexists(key, field)
            .await
            .map_err(|e| map_redis_error(e, key))
    }

    async fn hcas(
        &self,
        key: &str,
        field: &str,
        expected: &[u8],
        value: &[u8],
    ) -> Result<bool, StoreError> {
        let swapped: i64 = self
            .script(LUA_HCAS, &[key], &[field.as_bytes(), expected, value])
            .await?;
        Ok(swapped == 1)
    }

    async fn expire_if_unset(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let millis = ttl.as_millis().max(1).to_string();
        let set: i64 = self
            .script(LUA_EXPIRE_IF_UNSET, &[key], &[millis.as_bytes()])
            .await?;
        Ok(set == 1)
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        let mut conn = self.conn.clone();
        let millis: i64 = ::redis::cmd("PTTL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| map_redis_error(e, key))?;
        // -2 missing, -1 persistent
        Ok(u64::try_from(millis).ok().map(Duration::from_millis))
    }

    async fn rpush(&self, key: &str, value: &[u8]) -> Result<usize, StoreError> {
        let mut conn = self.conn.clone();
        conn.rpush(key, value)
            .await
            .map_err(|e| map_redis_error(e, key))
    }

    async fn lpush(&self, key: &str, value: &[u8]) -> Result<usize, StoreError> {
        let mut conn = self.conn.clone();
        conn.lpush(key, value)
            .await
            .map_err(|e| map_redis_error(e, key))
    }

    async fn lpop(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let mut conn = self.conn.clone();
        ::redis::cmd("LPOP")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| map_redis_error(e, key))
    }

    async fn blpop(&self, key: &str, timeout: Duration) -> Result<Option<Vec<u8>>, StoreError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut interval = self.min_poll_interval;
        loop {
            if let Some(item) = self.lpop(key).await? {
                return Ok(Some(item));
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(interval.min(deadline - now)).await;
            interval = (interval * 2).min(self.max_poll_interval);
        }
    }

    async fn lrange(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<Vec<u8>>, StoreError> {
        let mut conn = self.conn.clone();
        conn.lrange(key, start, stop)
            .await
            .map_err(|e| map_redis_error(e, key))
    }

    async fn ltrim(&self, key: &str, start: isize, stop: isize) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.ltrim(key, start, stop)
            .await
            .map_err(|e| map_redis_error(e, key))
    }

    async fn llen(&self, key: &str) -> Result<usize, StoreError> {
        let mut conn = self.conn.clone();
        conn.llen(key).await.map_err(|e| map_redis_error(e, key))
    }

    async fn incr_by_float(&self, key: &str, delta: f64) -> Result<f64, StoreError> {
        let mut conn = self.conn.clone();
        ::redis::cmd("INCRBYFLOAT")
            .arg(key)
            .arg(delta)
            .query_async(&mut conn)
            .await
            .map_err(|e| map_redis_error(e, key))
    }

    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<usize, StoreError> {
        let mut conn = self.conn.clone();
        conn.publish(channel, payload)
            .await
            .map_err(|e| map_redis_error(e, channel))
    }

    async fn publish_or_push(
        &self,
        channel: &str,
        backlog: &str,
        payload: &[u8],
    ) -> Result<PublishOutcome, StoreError> {
        let receivers: i64 = self
            .script(
                LUA_PUBLISH_OR_PUSH,
                &[backlog],
                &[channel.as_bytes(), payload],
            )
            .await?;
        Ok(match usize::try_from(receivers) {
            Ok(n) if n > 0 => PublishOutcome::Published(n),
            _ => PublishOutcome::Queued,
        })
    }

    async fn republish_list(&self, backlog: &str, channel: &str) -> Result<usize, StoreError> {
        let moved: i64 = self
            .script(LUA_REPUBLISH, &[backlog], &[channel.as_bytes()])
            .await?;
        Ok(usize::try_from(moved).unwrap_or(0))
    }

    async fn subscriber(&self) -> Result<Box<dyn Subscriber>, StoreError> {
        let pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| StoreError::Connection {
                message: format!("failed to open Redis pub/sub connection: {e}"),
                source: Some(Box::new(e)),
            })?;
        Ok(Box::new(RedisSubscriber { pubsub }))
    }
}

/// Dedicated pub/sub connection handed out by [`RedisStore::subscriber`].
pub struct RedisSubscriber {
    pubsub: PubSub,
}

impl std::fmt::Debug for RedisSubscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisSubscriber").finish_non_exhaustive()
    }
}

#[async_trait]
impl Subscriber for RedisSubscriber {
    async fn subscribe(&mut self, channel: &str) -> Result<(), StoreError> {
        self.pubsub
            .subscribe(channel)
            .await
            .map_err(|e| map_redis_error(e, channel))
    }

    async fn unsubscribe(&mut self, channel: &str) -> Result<(), StoreError> {
        self.pubsub
            .unsubscribe(channel)
            .await
            .map_err(|e| map_redis_error(e, channel))
    }

    async fn next_message(&mut self, timeout: Duration) -> Result<Option<Message>, StoreError> {
        let mut stream = self.pubsub.on_message();
        match tokio::time::timeout(timeout, stream.next()).await {
            Ok(Some(msg)) => Ok(Some(Message {
                channel: msg.get_channel_name().to_string(),
                payload: msg.get_payload_bytes().to_vec(),
            })),
            Ok(None) => Err(StoreError::Connection {
                message: "Redis pub/sub connection closed".to_string(),
                source: None,
            }),
            Err(_) => Ok(None),
        }
    }
}
