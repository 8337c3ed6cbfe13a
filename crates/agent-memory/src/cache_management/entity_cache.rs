//! Read-through cache for one entity type
use crate::error::MemoryResult;
use moka::future::Cache;
use serde::Serialize;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Counters shared by every entity cache of a `MemoryCache`.
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    timeouts: AtomicU64,
    invalidation_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub timeouts: u64,
    pub invalidation_failures: u64,
}

impl CacheStats {
    pub fn snapshot(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            invalidation_failures: self.invalidation_failures.load(Ordering::Relaxed),
        }
    }
}

pub struct EntityCache<K, V>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    name: &'static str,
    inner: Cache<K, V>,
    enabled: bool,
    timeout: Duration,
    invalidation_attempts: u32,
    stats: Arc<CacheStats>,
}

impl<K, V> EntityCache<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + std::fmt::Debug + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new(
        name: &'static str,
        capacity: u64,
        ttl: Duration,
        enabled: bool,
        timeout: Duration,
        invalidation_attempts: u32,
        stats: Arc<CacheStats>,
    ) -> Self {
        Self {
            name,
            inner: Cache::builder().max_capacity(capacity).time_to_live(ttl).build(),
            enabled,
            timeout,
            invalidation_attempts: invalidation_attempts.max(1),
            stats,
        }
    }

    /// Cached value, or `None` on miss. A lookup that overruns the cache
    /// deadline counts as a miss.
    pub async fn get(&self, key: &K) -> Option<V> {
        if !self.enabled {
            return None;
        }
        match tokio::time::timeout(self.timeout, self.inner.get(key)).await {
            Ok(Some(value)) => {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_cache_event("hit");
                Some(value)
            }
            Ok(None) => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_cache_event("miss");
                None
            }
            Err(_) => {
                self.stats.timeouts.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_cache_event("timeout");
                warn!("{} cache lookup timed out for {:?}; falling through to store", self.name, key);
                None
            }
        }
    }

    pub async fn put(&self, key: K, value: V) {
        if !self.enabled {
            return;
        }
        if tokio::time::timeout(self.timeout, self.inner.insert(key, value))
            .await
            .is_err()
        {
            self.stats.timeouts.fetch_add(1, Ordering::Relaxed);
            debug!("{} cache populate timed out", self.name);
        }
    }

    /// Removes `key`, retrying on timeout. Returns false when every attempt
    /// timed out.
    pub async fn invalidate(&self, key: &K) -> bool {
        if !self.enabled {
            return true;
        }
        for attempt in 1..=self.invalidation_attempts {
            if tokio::time::timeout(self.timeout, self.inner.invalidate(key))
                .await
                .is_ok()
            {
                return true;
            }
            debug!("{} cache invalidation attempt {} timed out", self.name, attempt);
        }
        self.stats.invalidation_failures.fetch_add(1, Ordering::Relaxed);
        warn!("{} cache invalidation for {:?} failed", self.name, key);
        false
    }

    /// Cache-then-store: serve from cache, otherwise load and populate.
    /// Errors from `load` are returned and never cached.
    pub async fn read_through<F, Fut>(&self, key: K, load: F) -> MemoryResult<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = MemoryResult<V>>,
    {
        if let Some(value) = self.get(&key).await {
            return Ok(value);
        }
        let value = load().await?;
        self.put(key, value.clone()).await;
        Ok(value)
    }

    pub fn entry_count(&self) -> u64 {
        self.inner.entry_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MemoryError;

    fn cache(enabled: bool) -> EntityCache<String, u32> {
        EntityCache::new(
            "test",
            100,
            Duration::from_secs(60),
            enabled,
            Duration::from_millis(50),
            3,
            Arc::new(CacheStats::default()),
        )
    }

    #[test]
    fn test_read_through_populates_once() {
        tokio_test::block_on(async {
            let cache = cache(true);
            let first = cache.read_through("a".to_string(), || async { Ok(7) }).await.unwrap();
            assert_eq!(first, 7);

            let second = cache
                .read_through("a".to_string(), || async {
                    Err(MemoryError::Task("loader should not run".into()))
                })
                .await
                .unwrap();
            assert_eq!(second, 7);

            let stats = cache.stats.snapshot();
            assert_eq!(stats.hits, 1);
            assert_eq!(stats.misses, 1);
        });
    }

    #[test]
    fn test_load_errors_are_not_cached() {
        tokio_test::block_on(async {
            let cache = cache(true);
            let err = cache
                .read_through("missing".to_string(), || async {
                    Err(MemoryError::not_found("conversation", "missing"))
                })
                .await;
            assert!(err.is_err());
            assert!(cache.get(&"missing".to_string()).await.is_none());
        });
    }

    #[test]
    fn test_invalidate_removes_entry() {
        tokio_test::block_on(async {
            let cache = cache(true);
            cache.put("k".to_string(), 1).await;
            assert_eq!(cache.get(&"k".to_string()).await, Some(1));
            assert!(cache.invalidate(&"k".to_string()).await);
            assert_eq!(cache.get(&"k".to_string()).await, None);
        });
    }

    #[test]
    fn test_disabled_cache_always_loads() {
        tokio_test::block_on(async {
            let cache = cache(false);
            cache.put("k".to_string(), 1).await;
            let value = cache.read_through("k".to_string(), || async { Ok(2) }).await.unwrap();
            assert_eq!(value, 2);
        });
    }
}
