use std::fmt;

use moka::sync::Cache;
use parking_lot::RwLock;

use super::{CacheValue, Storage};
use crate::key::CacheKey;

type InMemoryCache<V> = Cache<CacheKey, V>;

/// Capacity limits of a [`MemoryStorage`].
///
/// The limits are a best-effort approximation, and not an exact limit. Eviction happens
/// asynchronously after an insertion.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct MemoryLimits {
    /// The maximum total [`weight`](CacheValue::weight) of all the entries.
    pub cost_limit: Option<u64>,
    /// The maximum number of entries.
    ///
    /// Combined with a `cost_limit`, every entry weighs at least `cost_limit / count_limit`
    /// (rounded up), so neither limit can be exceeded.
    pub count_limit: Option<u64>,
}

/// A transient in-memory [`Storage`].
pub struct MemoryStorage<V> {
    limits: MemoryLimits,
    cache: RwLock<InMemoryCache<V>>,
}

impl<V> fmt::Debug for MemoryStorage<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryStorage")
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

impl<V: CacheValue> MemoryStorage<V> {
    pub fn new(limits: MemoryLimits) -> Self {
        Self {
            limits,
            cache: RwLock::new(Self::build(limits)),
        }
    }

    /// Creates a storage without any capacity limits.
    pub fn unbounded() -> Self {
        Self::new(MemoryLimits::default())
    }

    fn build(limits: MemoryLimits) -> InMemoryCache<V> {
        let builder = InMemoryCache::builder().name("flightcache");
        match (limits.cost_limit, limits.count_limit) {
            (Some(cost_limit), count_limit) => {
                let min_weight = count_limit
                    .map(|count| cost_limit.div_ceil(count.max(1)))
                    .unwrap_or(0)
                    .min(u32::MAX as u64) as u32;
                builder
                    .max_capacity(cost_limit)
                    .weigher(move |_k, v: &V| v.weight().max(min_weight))
                    .build()
            }
            (None, Some(count_limit)) => builder.max_capacity(count_limit).build(),
            (None, None) => builder.build(),
        }
    }

    pub fn limits(&self) -> MemoryLimits {
        self.limits
    }

    /// Replaces all the entries with an empty cache.
    ///
    /// Concurrent readers either see the complete old contents, or the new empty cache.
    pub fn reset(&self) {
        let fresh = Self::build(self.limits);
        let old = std::mem::replace(&mut *self.cache.write(), fresh);
        tracing::debug!(entries = old.entry_count(), "Reset in-memory cache");
    }

    /// Creates a new, empty storage with the same limits.
    pub fn fresh(&self) -> Self {
        Self::new(self.limits)
    }

    /// Returns the number of stored entries.
    ///
    /// This applies all pending evictions first, so the number is accurate at the time of the
    /// call.
    pub fn entry_count(&self) -> u64 {
        let cache = self.cache_handle();
        cache.run_pending_tasks();
        cache.entry_count()
    }

    fn cache_handle(&self) -> InMemoryCache<V> {
        // cloning a moka cache only clones a pointer to the shared internals
        self.cache.read().clone()
    }
}

impl<V: CacheValue> Storage<V> for MemoryStorage<V> {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn get(&self, key: &CacheKey) -> Option<V> {
        self.cache_handle().get(key)
    }

    fn put(&self, key: CacheKey, value: V) {
        self.cache_handle().insert(key, value);
    }
}
