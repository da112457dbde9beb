//! Bounded in-memory cache for parsed formula trees and staircase
//! classifications.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use parking_lot::Mutex;
use tracing::debug;

use crate::errors::FormulaResult;
use crate::query::guards::{clamp_cache_entries, DEFAULT_CACHE_ENTRIES, DEFAULT_CACHE_TTL_SECONDS};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheMode {
    Hit,
    Miss,
}

impl CacheMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheMode::Hit => "cache_hit",
            CacheMode::Miss => "cache_miss",
        }
    }
}

struct CacheEntry<V> {
    value: V,
    expires_at: Instant,
}

/// LRU keyed cache with a per-entry time to live.
pub struct PlanCache<K, V> {
    max_entries: usize,
    ttl: Duration,
    cache: Mutex<IndexMap<K, CacheEntry<V>>>,
}

impl<K: Hash + Eq + Clone, V: Clone> Default for PlanCache<K, V> {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_ENTRIES, DEFAULT_CACHE_TTL_SECONDS)
    }
}

impl<K: Hash + Eq + Clone, V: Clone> PlanCache<K, V> {
    pub fn new(max_entries: usize, ttl_seconds: f64) -> Self {
        Self {
            max_entries: clamp_cache_entries(i64::try_from(max_entries).unwrap_or(i64::MAX)),
            ttl: Duration::from_secs_f64(ttl_seconds.max(0.1)),
            cache: Mutex::new(IndexMap::new()),
        }
    }

    fn evict_expired(cache: &mut IndexMap<K, CacheEntry<V>>, now: Instant) {
        cache.retain(|_, entry| entry.expires_at > now);
    }

    fn evict_over_capacity(&self, cache: &mut IndexMap<K, CacheEntry<V>>) {
        let mut evicted = 0;
        while cache.len() > self.max_entries {
            cache.shift_remove_index(0);
            evicted += 1;
        }
        if evicted > 0 {
            debug!(evicted, max_entries = self.max_entries, "plan cache eviction");
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let mut cache = self.cache.lock();
        Self::evict_expired(&mut cache, Instant::now());
        let index = cache.get_index_of(key)?;
        let last = cache.len() - 1;
        cache.move_index(index, last);
        cache.get_index(last).map(|(_, entry)| entry.value.clone())
    }

    pub fn insert(&self, key: K, value: V) {
        let mut cache = self.cache.lock();
        cache.shift_remove(&key);
        cache.insert(
            key,
            CacheEntry {
                value,
                expires_at: Instant::now() + self.ttl,
            },
        );
        self.evict_over_capacity(&mut cache);
    }

    /// Return the cached value for `key`, computing and storing it on a miss.
    /// Errors from `compute` are returned and nothing is cached.
    pub fn get_or_compute<F>(&self, key: &K, compute: F) -> FormulaResult<(V, CacheMode)>
    where
        F: FnOnce() -> FormulaResult<V>,
    {
        if let Some(value) = self.get(key) {
            return Ok((value, CacheMode::Hit));
        }
        // Computed outside the lock: `compute` may consult this cache again.
        let value = compute()?;
        self.insert(key.clone(), value.clone());
        Ok((value, CacheMode::Miss))
    }

    pub fn invalidate(&self, key: &K) -> bool {
        self.cache.lock().shift_remove(key).is_some()
    }

    pub fn clear(&self) {
        self.cache.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.cache.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> HashMap<String, i64> {
        let cache = self.cache.lock();
        let mut result = HashMap::new();
        result.insert("entries".to_string(), cache.len() as i64);
        result.insert("max_entries".to_string(), self.max_entries as i64);
        result
    }
}
