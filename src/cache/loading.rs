//! Thread-safe loading cache with reference-aware eviction.
//!
//! Values are loaded at most once per key: a second caller asking for a key
//! that is being loaded waits for the first load to finish. Entries are only
//! evicted while the cache holds the last reference to them, so a value in
//! use by a scan stays shared with later callers.

use crate::error::Result;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

/// Statistics for cache performance monitoring.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups answered from the cache
    pub hits: u64,
    /// Lookups that ran the loader
    pub misses: u64,
    /// Loads that failed
    pub failures: u64,
    /// Entries evicted by purges
    pub evictions: u64,
}

impl CacheStats {
    /// Calculate the cache hit rate (0.0 to 1.0)
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            0.0
        } else {
            self.hits as f64 / lookups as f64
        }
    }
}

enum Slot<V> {
    Loading,
    Ready { value: Arc<V>, last_used: u64 },
}

struct CacheState<K, V> {
    entries: HashMap<K, Slot<V>>,
    clock: u64,
    stats: CacheStats,
}

/// A cache that loads missing values on demand.
pub struct LoadingCache<K, V> {
    threshold: usize,
    state: Mutex<CacheState<K, V>>,
    loaded: Condvar,
}

impl<K, V> std::fmt::Debug for LoadingCache<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("LoadingCache")
            .field("threshold", &self.threshold)
            .field("entries", &state.entries.len())
            .finish()
    }
}

impl<K, V> LoadingCache<K, V>
where
    K: Eq + Hash + Clone,
{
    /// Create a cache that trims itself back to `threshold` entries once it
    /// grows past twice that many.
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold,
            state: Mutex::new(CacheState { entries: HashMap::new(), clock: 0, stats: CacheStats::default() }),
            loaded: Condvar::new(),
        }
    }

    /// Return the cached value for `key`, loading it with `load` if absent.
    ///
    /// A failed load caches nothing; the error goes to the caller that ran
    /// the loader and waiters retry.
    pub fn get_or_load<F>(&self, key: &K, load: F) -> Result<Arc<V>>
    where
        F: FnOnce(&K) -> Result<V>,
    {
        let mut state = self.state.lock();
        loop {
            state.clock += 1;
            let now = state.clock;
            let found = match state.entries.get_mut(key) {
                Some(Slot::Ready { value, last_used }) => {
                    *last_used = now;
                    Some(Some(Arc::clone(value)))
                }
                Some(Slot::Loading) => Some(None),
                None => None,
            };
            match found {
                Some(Some(value)) => {
                    state.stats.hits += 1;
                    return Ok(value);
                }
                Some(None) => self.loaded.wait(&mut state),
                None => break,
            }
        }
        state.entries.insert(key.clone(), Slot::Loading);
        state.stats.misses += 1;
        drop(state);

        let mut guard = LoadGuard { cache: self, key, armed: true };
        let result = load(key);
        guard.armed = false;

        let mut state = self.state.lock();
        let outcome = match result {
            Ok(value) => {
                let value = Arc::new(value);
                state.clock += 1;
                let last_used = state.clock;
                state.entries.insert(key.clone(), Slot::Ready { value: Arc::clone(&value), last_used });
                if state.entries.len() > self.threshold.saturating_mul(2) {
                    purge_locked(&mut state, self.threshold);
                }
                Ok(value)
            }
            Err(e) => {
                state.entries.remove(key);
                state.stats.failures += 1;
                Err(e)
            }
        };
        drop(state);
        self.loaded.notify_all();
        outcome
    }

    /// Return the cached value for `key` without loading.
    pub fn get(&self, key: &K) -> Option<Arc<V>> {
        let state = self.state.lock();
        match state.entries.get(key) {
            Some(Slot::Ready { value, .. }) => Some(Arc::clone(value)),
            _ => None,
        }
    }

    /// Drop the entry for `key`, returning it if it was loaded.
    pub fn remove(&self, key: &K) -> Option<Arc<V>> {
        let mut state = self.state.lock();
        match state.entries.get(key) {
            Some(Slot::Ready { .. }) => match state.entries.remove(key) {
                Some(Slot::Ready { value, .. }) => Some(value),
                _ => None,
            },
            _ => None,
        }
    }

    /// Evict unreferenced entries, least recently used first, until at most
    /// `threshold` entries remain or none are evictable.
    pub fn purge(&self) {
        let mut state = self.state.lock();
        purge_locked(&mut state, self.threshold);
    }

    /// Number of entries, including loads in progress.
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// True if the cache holds nothing.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A snapshot of the cache statistics.
    pub fn stats(&self) -> CacheStats {
        self.state.lock().stats.clone()
    }
}

fn purge_locked<K: Eq + Hash + Clone, V>(state: &mut CacheState<K, V>, threshold: usize) {
    if state.entries.len() <= threshold {
        return;
    }
    let mut idle: Vec<(u64, K)> = state
        .entries
        .iter()
        .filter_map(|(k, slot)| match slot {
            Slot::Ready { value, last_used } if Arc::strong_count(value) == 1 => Some((*last_used, k.clone())),
            _ => None,
        })
        .collect();
    idle.sort_by_key(|(used, _)| *used);
    let excess = state.entries.len() - threshold;
    for (_, key) in idle.into_iter().take(excess) {
        state.entries.remove(&key);
        state.stats.evictions += 1;
    }
}

// Clears a `Loading` slot if the loader panics.
struct LoadGuard<'a, K: Eq + Hash + Clone, V> {
    cache: &'a LoadingCache<K, V>,
    key: &'a K,
    armed: bool,
}

impl<K: Eq + Hash + Clone, V> Drop for LoadGuard<'_, K, V> {
    fn drop(&mut self) {
        if self.armed {
            self.cache.state.lock().entries.remove(self.key);
            self.cache.loaded.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_loads_once() {
        let cache: LoadingCache<u32, String> = LoadingCache::new(10);
        let calls = AtomicUsize::new(0);
        for _ in 0..3 {
            let v = cache
                .get_or_load(&7, |k| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(format!("value-{}", k))
                })
                .unwrap();
            assert_eq!(*v, "value-7");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().hits, 2);
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn test_failed_load_is_not_cached() {
        let cache: LoadingCache<u32, u32> = LoadingCache::new(10);
        let err = cache.get_or_load(&1, |_| Err(Error::not_found("missing")));
        assert!(err.is_err());
        assert!(cache.is_empty());
        assert_eq!(*cache.get_or_load(&1, |_| Ok(5)).unwrap(), 5);
    }

    #[test]
    fn test_concurrent_callers_share_one_load() {
        let cache: Arc<LoadingCache<u32, u32>> = Arc::new(LoadingCache::new(10));
        let calls = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let calls = Arc::clone(&calls);
                thread::spawn(move || {
                    *cache
                        .get_or_load(&1, |_| {
                            calls.fetch_add(1, Ordering::SeqCst);
                            thread::sleep(Duration::from_millis(20));
                            Ok(42)
                        })
                        .unwrap()
                })
            })
            .collect();
        for h in handles {
            assert_eq!(h.join().unwrap(), 42);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_purge_keeps_referenced_entries() {
        let cache: LoadingCache<u32, u32> = LoadingCache::new(2);
        let held = cache.get_or_load(&0, |k| Ok(*k)).unwrap();
        for k in 1..4 {
            cache.get_or_load(&k, |k| Ok(*k)).unwrap();
        }
        assert_eq!(cache.len(), 4);
        cache.purge();
        assert_eq!(cache.len(), 2);
        // The held entry is the oldest but still referenced.
        assert!(cache.get(&0).is_some());
        assert!(cache.get(&3).is_some());
        drop(held);
    }

    #[test]
    fn test_automatic_purge_past_twice_threshold() {
        let cache: LoadingCache<u32, u32> = LoadingCache::new(2);
        for k in 0..5 {
            cache.get_or_load(&k, |k| Ok(*k)).unwrap();
        }
        assert!(cache.len() <= 4);
    }

    #[test]
    fn test_remove() {
        let cache: LoadingCache<&'static str, u32> = LoadingCache::new(4);
        cache.get_or_load(&"a", |_| Ok(1)).unwrap();
        assert_eq!(cache.remove(&"a").map(|v| *v), Some(1));
        assert!(cache.get(&"a").is_none());
        assert!(cache.remove(&"a").is_none());
    }
}
