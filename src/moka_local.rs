//! In-process L1 store on Moka

use std::time::{Duration, Instant};

use async_trait::async_trait;
use moka::Expiry;
use moka::future::Cache;

use crate::{CacheSpecification, CacheStore, CachedValue, Cacheable, Result};

#[derive(Clone)]
struct LocalEntry<V> {
    value: CachedValue<V>,
    ttl: Duration,
}

/// Expires each entry after the TTL it was written with
struct PerEntryTtl;

impl<V> Expiry<String, LocalEntry<V>> for PerEntryTtl {
    fn expire_after_create(
        &self,
        _key: &String,
        entry: &LocalEntry<V>,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(entry.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        entry: &LocalEntry<V>,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(entry.ttl)
    }
}

/// Bounded in-memory L1 cache with per-entry TTL. Never fails.
#[derive(Clone)]
pub struct MokaLocalCache<V: Cacheable> {
    cache: Cache<String, LocalEntry<V>>,
}

impl<V: Cacheable> MokaLocalCache<V> {
    /// Create an L1 cache holding at most `max_capacity` entries
    pub fn new(max_capacity: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_capacity)
            .expire_after(PerEntryTtl)
            .build();
        Self { cache }
    }

    pub fn from_spec(spec: &CacheSpecification) -> Self {
        Self::new(spec.local_max_capacity)
    }

    /// Approximate number of live entries
    pub async fn entry_count(&self) -> u64 {
        self.cache.run_pending_tasks().await;
        self.cache.entry_count()
    }
}

#[async_trait]
impl<V: Cacheable> CacheStore<V> for MokaLocalCache<V> {
    fn layer(&self) -> &'static str {
        "L1"
    }

    async fn get(&self, key: &str) -> Result<Option<CachedValue<V>>> {
        Ok(self.cache.get(key).await.map(|entry| entry.value))
    }

    async fn put(&self, key: &str, value: CachedValue<V>, ttl: Duration) -> Result<()> {
        self.cache
            .insert(key.to_owned(), LocalEntry { value, ttl })
            .await;
        Ok(())
    }

    async fn evict(&self, key: &str) -> Result<()> {
        self.cache.invalidate(key).await;
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.cache.invalidate_all();
        Ok(())
    }
}
