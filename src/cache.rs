//! TTL cache with LRU bound and fetch coalescing.
//!
//! Backs both the opaque introspection results and the JWKS signing keys.
//! Entries expire strictly by wall-clock TTL and are dropped lazily on access;
//! when the cache is full the least-recently-used entry is evicted.
//!
//! # Fetch coalescing
//!
//! [`TtlCache::get_or_try_insert_with`] guarantees at most one in-flight fetch
//! per key: concurrent misses for the same key wait on a per-key gate and then
//! re-read the cache instead of fetching again. Misses for *different* keys
//! proceed in parallel. The gates live in a `DashMap` and are removed once the
//! last waiter leaves, so the map only ever holds keys with work in progress.

use dashmap::DashMap;
use lru::LruCache;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::debug;

/// Capacity used when a caller asks for a zero-sized cache.
const MIN_CAPACITY: NonZeroUsize = NonZeroUsize::MIN;

/// Cache performance counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of cache hits (fresh entry found)
    pub hits: u64,
    /// Number of cache misses (absent or expired)
    pub misses: u64,
    /// Number of entries evicted due to LRU capacity
    pub evictions: u64,
    /// Current number of entries in cache
    pub size: usize,
    /// Maximum capacity of cache
    pub capacity: usize,
}

impl CacheStats {
    /// Calculate cache hit rate as a percentage
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }
}

struct CacheEntry<V> {
    value: V,
    inserted_at: Instant,
    ttl: Duration,
}

impl<V> CacheEntry<V> {
    fn is_fresh(&self) -> bool {
        self.inserted_at.elapsed() < self.ttl
    }
}

/// Per-key mutual exclusion for expensive fetches.
///
/// Used directly by the JWT validator, where one JWKS fetch fills many key
/// entries and the gate must be per issuer rather than per cached key.
pub(crate) struct InFlight<K: Eq + Hash> {
    gates: DashMap<K, Arc<Mutex<()>>>,
}

impl<K: Eq + Hash + Clone> InFlight<K> {
    pub(crate) fn new() -> Self {
        Self {
            gates: DashMap::new(),
        }
    }

    /// Run `f` while holding the gate for `key`.
    ///
    /// Callers for the same key are serialized; `f` should re-check whatever
    /// cache it guards before doing the expensive work.
    pub(crate) fn run<R>(&self, key: &K, f: impl FnOnce() -> R) -> R {
        let gate = Arc::clone(
            &self
                .gates
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        );

        let out = {
            let _guard = gate.lock().unwrap_or_else(PoisonError::into_inner);
            f()
        };

        // Only the map's reference and ours left: nobody else is waiting.
        self.gates
            .remove_if(key, |_, g| Arc::strong_count(g) == 2);
        out
    }

    #[cfg(test)]
    fn pending(&self) -> usize {
        self.gates.len()
    }
}

/// Thread-safe TTL cache bounded by LRU capacity.
pub struct TtlCache<K: Eq + Hash, V> {
    entries: Mutex<LruCache<K, CacheEntry<V>>>,
    capacity: usize,
    in_flight: InFlight<K>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Create a cache holding at most `capacity` entries (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(MIN_CAPACITY);
        Self {
            entries: Mutex::new(LruCache::new(cap)),
            capacity: cap.get(),
            in_flight: InFlight::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LruCache<K, CacheEntry<V>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lookup(&self, key: &K, record_miss: bool) -> Option<V> {
        let mut entries = self.lock();
        let fresh = match entries.get(key) {
            Some(entry) if entry.is_fresh() => Some(entry.value.clone()),
            _ => None,
        };
        if fresh.is_none() {
            entries.pop(key);
        }
        drop(entries);

        match fresh {
            Some(v) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(v)
            }
            None => {
                if record_miss {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                }
                None
            }
        }
    }

    /// Fresh value for `key`, if any. Expired entries are removed.
    pub fn get(&self, key: &K) -> Option<V> {
        self.lookup(key, true)
    }

    /// Like [`TtlCache::get`] but a miss is not counted. For re-reading the
    /// cache after waiting on a fetch gate.
    pub(crate) fn recheck(&self, key: &K) -> Option<V> {
        self.lookup(key, false)
    }

    /// Insert or replace `key`. A zero TTL stores nothing and drops any
    /// existing entry.
    pub fn put(&self, key: K, value: V, ttl: Duration) {
        let mut entries = self.lock();
        if ttl.is_zero() {
            entries.pop(&key);
            return;
        }
        let entry = CacheEntry {
            value,
            inserted_at: Instant::now(),
            ttl,
        };
        if let Some((evicted, _)) = entries.push(key.clone(), entry) {
            if evicted != key {
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn invalidate(&self, key: &K) {
        self.lock().pop(key);
    }

    /// Drop every entry. Counters are kept.
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Number of stored entries, including expired ones not yet accessed.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            size: self.len(),
            capacity: self.capacity,
        }
    }

    /// Return the cached value, or run `fetch` once and cache its result.
    ///
    /// `fetch` returns the value together with its TTL. Errors are returned
    /// to the caller that ran the fetch and are not cached; callers that were
    /// waiting on the same key retry with their own fetch.
    pub fn get_or_try_insert_with<F, E>(&self, key: K, fetch: F) -> Result<V, E>
    where
        F: FnOnce() -> Result<(V, Duration), E>,
    {
        if let Some(v) = self.get(&key) {
            return Ok(v);
        }

        self.in_flight.run(&key, || -> Result<V, E> {
            // Another caller may have filled the entry while we waited.
            if let Some(v) = self.recheck(&key) {
                debug!("cache miss resolved by concurrent fetch");
                return Ok(v);
            }
            let (value, ttl) = fetch()?;
            self.put(key.clone(), value.clone(), ttl);
            Ok(value)
        })
    }
}
