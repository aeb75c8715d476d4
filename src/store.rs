//! Cache layer trait
//!
//! Both tiers share one shape: L1 is an in-process store (see
//! [`MokaLocalCache`](crate::MokaLocalCache)) and L2 a shared store that may
//! fail with I/O errors (see [`RedisRemoteCache`](crate::RedisRemoteCache)).
//! Implementations must be safe for concurrent use and own their TTL
//! handling. Batch operations default to per-key iteration; stores with a
//! native bulk primitive should override them.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::{CachedValue, Cacheable, Result};

#[async_trait]
pub trait CacheStore<V: Cacheable>: Send + Sync {
    /// Name used in logs and errors ("L1", "L2", ...)
    fn layer(&self) -> &'static str;

    async fn get(&self, key: &str) -> Result<Option<CachedValue<V>>>;

    async fn put(&self, key: &str, value: CachedValue<V>, ttl: Duration) -> Result<()>;

    async fn evict(&self, key: &str) -> Result<()>;

    /// Remove every entry belonging to this store
    async fn clear(&self) -> Result<()>;

    /// Fetch many keys; missing keys are absent from the returned map
    async fn get_all(&self, keys: &[String]) -> Result<HashMap<String, CachedValue<V>>> {
        let mut found = HashMap::with_capacity(keys.len());
        for key in keys {
            if let Some(value) = self.get(key).await? {
                found.insert(key.clone(), value);
            }
        }
        Ok(found)
    }

    async fn put_all(&self, entries: &HashMap<String, CachedValue<V>>, ttl: Duration) -> Result<()> {
        for (key, value) in entries {
            self.put(key, value.clone(), ttl).await?;
        }
        Ok(())
    }

    /// Evict many keys. Every key is attempted; the first failure is
    /// returned once all of them have been tried.
    async fn evict_all(&self, keys: &[String]) -> Result<()> {
        let mut first_error = None;
        for key in keys {
            if let Err(e) = self.evict(key).await {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}
