//! Time-based expiring map
//!
//! Backs the per-session cursor cache: prepared statements and result sets
//! held for the wire layer by integer id. Entries expire a fixed interval
//! after their last access; expired entries are swept on the next map
//! operation. Explicit removal on close is still mandatory for the caller.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

struct Entry<V> {
    value: V,
    last_access: Instant,
}

/// A map whose entries expire after a period of no access
pub struct ExpiringMap<K, V> {
    inner: Mutex<HashMap<K, Entry<V>>>,
    ttl: Duration,
    on_expire: Option<Box<dyn Fn(V) + Send + Sync>>,
}

impl<K: Eq + Hash + Clone, V> ExpiringMap<K, V> {
    /// Create a map whose entries live `ttl` past their last access
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            ttl,
            on_expire: None,
        }
    }

    /// Create a map that runs `on_expire` for each entry dropped by the sweep
    pub fn with_expire_handler(ttl: Duration, on_expire: Box<dyn Fn(V) + Send + Sync>) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            ttl,
            on_expire: Some(on_expire),
        }
    }

    /// Insert or replace a value
    pub fn put(&self, key: K, value: V) -> Option<V> {
        let mut inner = self.inner.lock();
        Self::sweep(&mut inner, self.ttl, self.on_expire.as_deref());
        inner
            .insert(
                key,
                Entry {
                    value,
                    last_access: Instant::now(),
                },
            )
            .map(|e| e.value)
    }

    /// Get a clone of the value, refreshing its expiry
    pub fn get(&self, key: &K) -> Option<V>
    where
        V: Clone,
    {
        let mut inner = self.inner.lock();
        Self::sweep(&mut inner, self.ttl, self.on_expire.as_deref());
        inner.get_mut(key).map(|entry| {
            entry.last_access = Instant::now();
            entry.value.clone()
        })
    }

    /// Remove an entry, returning its value
    pub fn remove(&self, key: &K) -> Option<V> {
        self.inner.lock().remove(key).map(|e| e.value)
    }

    /// Number of live entries (expired entries are swept first)
    pub fn len(&self) -> usize {
        let mut inner = self.inner.lock();
        Self::sweep(&mut inner, self.ttl, self.on_expire.as_deref());
        inner.len()
    }

    /// Whether the map has no live entries
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drain every entry, returning the values
    pub fn close(&self) -> Vec<V> {
        let mut inner = self.inner.lock();
        inner.drain().map(|(_, e)| e.value).collect()
    }

    fn sweep(inner: &mut HashMap<K, Entry<V>>, ttl: Duration, on_expire: Option<&(dyn Fn(V) + Send + Sync)>) {
        let now = Instant::now();
        let expired: Vec<K> = inner
            .iter()
            .filter(|(_, e)| now.duration_since(e.last_access) >= ttl)
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            if let Some(entry) = inner.remove(&key) {
                if let Some(handler) = on_expire {
                    handler(entry.value);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_put_get_remove() {
        let map = ExpiringMap::new(Duration::from_secs(60));
        map.put(1, "a");
        assert_eq!(map.get(&1), Some("a"));
        assert_eq!(map.remove(&1), Some("a"));
        assert_eq!(map.get(&1), None);
    }

    #[test]
    fn test_entries_expire() {
        let map = ExpiringMap::new(Duration::from_millis(20));
        map.put(1, "a");
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(map.get(&1), None);
        assert!(map.is_empty());
    }

    #[test]
    fn test_access_refreshes_expiry() {
        let map = ExpiringMap::new(Duration::from_millis(60));
        map.put(1, "a");
        std::thread::sleep(Duration::from_millis(35));
        assert_eq!(map.get(&1), Some("a"));
        std::thread::sleep(Duration::from_millis(35));
        assert_eq!(map.get(&1), Some("a"));
    }

    #[test]
    fn test_expire_handler_runs_once_per_entry() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let map = ExpiringMap::with_expire_handler(
            Duration::from_millis(10),
            Box::new(move |_v: u32| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        map.put(1, 7);
        std::thread::sleep(Duration::from_millis(30));
        map.put(2, 8);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_close_drains() {
        let map = ExpiringMap::new(Duration::from_secs(60));
        map.put(1, "a");
        map.put(2, "b");
        let mut drained = map.close();
        drained.sort();
        assert_eq!(drained, vec!["a", "b"]);
        assert!(map.is_empty());
    }
}
