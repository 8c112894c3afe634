//! Write-buffer cache (§4.3): bounded `(key, value)` entries with a dirty
//! bit and LRU eviction, used as the absorbing layer under the columnar
//! store (C4).

use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use moka::notification::RemovalCause;
use moka::sync::Cache as MokaCache;
use parking_lot::Mutex;

/// Why an entry left the cache (§4.3 `onEvict` hook).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictReason {
    Count,
    Size,
    Explicit,
}

fn from_removal_cause(cause: RemovalCause) -> EvictReason {
    match cause {
        RemovalCause::Explicit => EvictReason::Explicit,
        RemovalCause::Size => EvictReason::Size,
        // moka has no separate "count" cause; our weigher returns a
        // constant weight of 1 per entry when count-bounded, so a
        // capacity-driven removal there is reported as `Count`.
        RemovalCause::Replaced | RemovalCause::Expired => EvictReason::Explicit,
    }
}

/// Values stored in the write-buffer cache must know their own byte size so
/// the cache can enforce a byte-size threshold alongside an entry count.
pub trait CacheWeight {
    fn cache_weight(&self) -> u32;
}

#[derive(Clone)]
struct Entry<V> {
    value: V,
    weight: u32,
}

/// Stats snapshot for `getStats`.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    pub entry_count: u64,
    pub weighted_size: u64,
    pub dirty_count: usize,
}

/// `was_dirty` tells the hook whether the entry still had unflushed writes
/// at the moment it was evicted, so callers can flush it instead of
/// silently dropping the write (§4.3, §4.4 `CheckpointTrigger::Eviction`).
pub type EvictHook<K, V> = Arc<dyn Fn(&K, &V, EvictReason, bool) + Send + Sync>;

/// Bounded LRU buffer with dirty-key tracking, generic over any key/value
/// pair the columnar store wants to absorb writes for.
pub struct WriteBufferCache<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + CacheWeight + 'static,
{
    cache: MokaCache<K, Entry<V>>,
    dirty: DashSet<K>,
    last_access: DashMap<K, u64>,
    access_counter: AtomicU64,
    max_entries: u64,
    on_evict: Mutex<Option<EvictHook<K, V>>>,
}

impl<K, V> WriteBufferCache<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + CacheWeight + 'static,
{
    pub fn new(max_entries: usize, max_bytes: u64) -> Arc<Self> {
        let this = Arc::new_cyclic(|weak: &std::sync::Weak<Self>| {
            let weak = weak.clone();
            let cache = MokaCache::builder()
                .max_capacity(max_bytes)
                .weigher(|_k: &K, v: &Entry<V>| v.weight)
                .eviction_listener(move |key, entry: Entry<V>, cause| {
                    if let Some(this) = weak.upgrade() {
                        let was_dirty = this.dirty.remove(&key).is_some();
                        this.last_access.remove(&key);
                        let reason = from_removal_cause(cause);
                        if let Some(hook) = this.on_evict.lock().as_ref() {
                            hook(&key, &entry.value, reason, was_dirty);
                        }
                    }
                })
                .build();
            Self {
                cache,
                dirty: DashSet::new(),
                last_access: DashMap::new(),
                access_counter: AtomicU64::new(0),
                max_entries: max_entries as u64,
                on_evict: Mutex::new(None),
            }
        });
        this
    }

    pub fn set_on_evict(&self, hook: EvictHook<K, V>) {
        *self.on_evict.lock() = Some(hook);
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let value = self.cache.get(key).map(|entry| entry.value);
        if value.is_some() {
            self.touch(key);
        }
        value
    }

    /// Inserts or replaces `key`. Evicts the least-recently-used entry if
    /// either the entry-count or byte-size threshold is now exceeded.
    pub fn set(&self, key: K, value: V, mark_dirty: bool) {
        let weight = value.cache_weight();
        self.touch(&key);
        self.cache.insert(key.clone(), Entry { value, weight });
        if mark_dirty {
            self.dirty.insert(key);
        }
        self.cache.run_pending_tasks();
        self.enforce_count_limit();
    }

    fn touch(&self, key: &K) {
        let stamp = self.access_counter.fetch_add(1, Ordering::Relaxed);
        self.last_access.insert(key.clone(), stamp);
    }

    /// Evicts by our own last-access tracking rather than `MokaCache::iter`,
    /// whose iteration order moka documents as arbitrary, not LRU.
    fn enforce_count_limit(&self) {
        while self.cache.entry_count() > self.max_entries {
            let Some(oldest) = self
                .last_access
                .iter()
                .min_by_key(|e| *e.value())
                .map(|e| e.key().clone())
            else {
                break;
            };
            self.cache.invalidate(&oldest);
            self.last_access.remove(&oldest);
            self.cache.run_pending_tasks();
        }
    }

    pub fn delete(&self, key: &K) {
        self.dirty.remove(key);
        self.last_access.remove(key);
        self.cache.invalidate(key);
        self.cache.run_pending_tasks();
    }

    /// All entries currently marked dirty, as `(key, value)` pairs.
    pub fn get_dirty_entries(&self) -> Vec<(K, V)> {
        self.dirty
            .iter()
            .filter_map(|key| self.cache.get(&key).map(|entry| (key.clone(), entry.value)))
            .collect()
    }

    pub fn mark_clean(&self, keys: &[K]) {
        for key in keys {
            self.dirty.remove(key);
        }
    }

    pub fn get_stats(&self) -> CacheStats {
        self.cache.run_pending_tasks();
        CacheStats {
            entry_count: self.cache.entry_count(),
            weighted_size: self.cache.weighted_size(),
            dirty_count: self.dirty.len(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone)]
    struct Blob(Vec<u8>);

    impl CacheWeight for Blob {
        fn cache_weight(&self) -> u32 {
            self.0.len() as u32
        }
    }

    #[test]
    fn dirty_entries_survive_clean_reads() {
        let cache = WriteBufferCache::<String, Blob>::new(10, 1024 * 1024);
        cache.set("a".to_string(), Blob(vec![1, 2, 3]), true);
        assert_eq!(cache.get_dirty_entries().len(), 1);
        cache.mark_clean(&["a".to_string()]);
        assert!(cache.get_dirty_entries().is_empty());
        assert!(cache.get(&"a".to_string()).is_some());
    }

    #[test]
    fn eviction_hook_fires_on_explicit_delete() {
        let cache = WriteBufferCache::<String, Blob>::new(10, 1024 * 1024);
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        cache.set_on_evict(Arc::new(move |_k, _v, _reason, _was_dirty| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        }));
        cache.set("a".to_string(), Blob(vec![0; 8]), false);
        cache.delete(&"a".to_string());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn count_threshold_evicts_oldest() {
        let cache = WriteBufferCache::<String, Blob>::new(2, 1024 * 1024);
        cache.set("a".to_string(), Blob(vec![0; 4]), false);
        cache.set("b".to_string(), Blob(vec![0; 4]), false);
        cache.set("c".to_string(), Blob(vec![0; 4]), false);
        assert!(cache.get_stats().entry_count <= 2);
        assert!(cache.get(&"a".to_string()).is_none(), "least-recently-used entry should be the one evicted");
        assert!(cache.get(&"b".to_string()).is_some());
        assert!(cache.get(&"c".to_string()).is_some());
    }

    #[test]
    fn get_refreshes_recency_so_it_survives_eviction() {
        let cache = WriteBufferCache::<String, Blob>::new(2, 1024 * 1024);
        cache.set("a".to_string(), Blob(vec![0; 4]), false);
        cache.set("b".to_string(), Blob(vec![0; 4]), false);
        assert!(cache.get(&"a".to_string()).is_some());
        cache.set("c".to_string(), Blob(vec![0; 4]), false);
        assert!(cache.get(&"a".to_string()).is_some(), "recently-read entry should not be the eviction victim");
        assert!(cache.get(&"b".to_string()).is_none());
    }
}
