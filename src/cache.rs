//! Bounded read-through cache for external registry lookups.
//!
//! Entries are served for at most `max_age` after they were fetched, and the
//! cache never holds more than `capacity` entries: inserting into a full
//! cache evicts the oldest insertion. Staleness is therefore bounded by
//! `max_age`; a registry change becomes visible no later than that.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

/// Cached value with its fetch time.
struct CachedData<V> {
    data: V,
    fetched_at: Instant,
}

impl<V> CachedData<V> {
    fn is_expired(&self, max_age: Duration) -> bool {
        self.fetched_at.elapsed() > max_age
    }
}

struct Inner<K, V> {
    entries: HashMap<K, CachedData<V>>,
    order: VecDeque<K>,
}

/// Capacity-bounded cache with a staleness window.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use taskrelay::cache::BoundedCache;
///
/// let cache = BoundedCache::new(2, Duration::from_secs(60));
/// cache.insert("a", 1);
/// cache.insert("b", 2);
/// cache.insert("c", 3);
/// assert_eq!(cache.get(&"a"), None);
/// assert_eq!(cache.get(&"c"), Some(3));
/// assert_eq!(cache.len(), 2);
/// ```
pub struct BoundedCache<K, V> {
    inner: Mutex<Inner<K, V>>,
    capacity: usize,
    max_age: Duration,
}

impl<K, V> std::fmt::Debug for BoundedCache<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundedCache")
            .field("capacity", &self.capacity)
            .field("max_age", &self.max_age)
            .field("len", &self.inner.lock().entries.len())
            .finish()
    }
}

impl<K, V> BoundedCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Creates a cache holding at most `capacity` entries (minimum 1), each
    /// fresh for `max_age`.
    pub fn new(capacity: usize, max_age: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                order: VecDeque::new(),
            }),
            capacity: capacity.max(1),
            max_age,
        }
    }

    /// Returns a fresh cached value. Stale entries are dropped.
    pub fn get(&self, key: &K) -> Option<V> {
        let mut inner = self.inner.lock();
        let expired = inner.entries.get(key)?.is_expired(self.max_age);
        if expired {
            inner.entries.remove(key);
            inner.order.retain(|k| k != key);
            return None;
        }
        inner.entries.get(key).map(|cached| cached.data.clone())
    }

    /// Inserts or refreshes a value, evicting the oldest entries while the
    /// cache is over capacity.
    pub fn insert(&self, key: K, value: V) {
        let mut inner = self.inner.lock();
        if inner.entries.contains_key(&key) {
            inner.order.retain(|k| k != &key);
        }
        inner.order.push_back(key.clone());
        inner.entries.insert(
            key,
            CachedData {
                data: value,
                fetched_at: Instant::now(),
            },
        );
        while inner.entries.len() > self.capacity {
            let Some(oldest) = inner.order.pop_front() else {
                break;
            };
            inner.entries.remove(&oldest);
        }
    }

    /// Drops one entry.
    pub fn invalidate(&self, key: &K) {
        let mut inner = self.inner.lock();
        inner.entries.remove(key);
        inner.order.retain(|k| k != key);
    }

    /// Drops everything.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.order.clear();
    }

    /// Number of entries currently held, stale ones included.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Returns `true` if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn entries_go_stale() {
        let cache = BoundedCache::new(4, Duration::from_secs(10));
        cache.insert("k", 1);
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(cache.get(&"k"), Some(1));
        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(cache.get(&"k"), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn refresh_moves_entry_to_back() {
        let cache = BoundedCache::new(2, Duration::from_secs(60));
        cache.insert("a", 1);
        cache.insert("b", 2);
        cache.insert("a", 10);
        cache.insert("c", 3);
        assert_eq!(cache.get(&"a"), Some(10));
        assert_eq!(cache.get(&"b"), None);
        assert_eq!(cache.get(&"c"), Some(3));
    }

    #[test]
    fn invalidate_and_clear() {
        let cache = BoundedCache::new(3, Duration::from_secs(60));
        cache.insert(1, "x");
        cache.insert(2, "y");
        cache.invalidate(&1);
        assert_eq!(cache.get(&1), None);
        assert_eq!(cache.len(), 1);
        cache.clear();
        assert!(cache.is_empty());
    }
}
