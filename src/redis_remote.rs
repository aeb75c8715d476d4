//! Shared L2 store on Redis
//!
//! Values are stored as JSON-encoded [`CachedValue`]s so negative lookups
//! survive the trip through Redis. Bulk operations use native primitives:
//! `MGET` for reads, a `MULTI` pipeline of `PSETEX` for writes and a single
//! multi-key `DEL` for evictions.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use tracing::{debug, warn};

use crate::{CacheError, CacheSpecification, CacheStore, CachedValue, Cacheable, Result};

const SCAN_BATCH: usize = 500;

/// Trait for generating Redis keys for a cache
pub trait KeyFormatter: Send + Sync + 'static {
    /// Build the L2 key for Redis
    fn format_key(&self, key: &str) -> String;

    /// Glob matching every key this formatter can produce
    fn match_pattern(&self) -> String;
}

/// `"{prefix}{cache_name}::{key}"`
#[derive(Debug, Clone)]
pub struct PrefixKeyFormatter {
    namespace: String,
}

impl PrefixKeyFormatter {
    pub fn new(prefix: &str, cache_name: &str) -> Self {
        Self {
            namespace: format!("{prefix}{cache_name}::"),
        }
    }
}

impl KeyFormatter for PrefixKeyFormatter {
    fn format_key(&self, key: &str) -> String {
        format!("{}{}", self.namespace, key)
    }

    fn match_pattern(&self) -> String {
        // Escape glob metacharacters in the namespace itself
        let mut pattern = String::with_capacity(self.namespace.len() + 1);
        for c in self.namespace.chars() {
            if matches!(c, '*' | '?' | '[' | ']' | '\\') {
                pattern.push('\\');
            }
            pattern.push(c);
        }
        pattern.push('*');
        pattern
    }
}

/// Redis-backed L2 cache for one cache name
pub struct RedisRemoteCache<V: Cacheable> {
    redis: redis::aio::ConnectionManager,
    key_formatter: Arc<dyn KeyFormatter>,
    _value: PhantomData<fn() -> V>,
}

impl<V: Cacheable> Clone for RedisRemoteCache<V> {
    fn clone(&self) -> Self {
        Self {
            redis: self.redis.clone(),
            key_formatter: Arc::clone(&self.key_formatter),
            _value: PhantomData,
        }
    }
}

impl<V: Cacheable> RedisRemoteCache<V> {
    /// Connect and build an L2 store using a custom key formatter
    pub async fn new(
        redis_client: redis::Client,
        key_formatter: impl KeyFormatter,
    ) -> std::result::Result<Self, redis::RedisError> {
        let redis = redis::aio::ConnectionManager::new(redis_client).await?;
        Ok(Self::with_connection(redis, key_formatter))
    }

    /// Connect using the specification's key prefix
    pub async fn for_cache(
        redis_client: redis::Client,
        cache_name: &str,
        spec: &CacheSpecification,
    ) -> std::result::Result<Self, redis::RedisError> {
        Self::new(
            redis_client,
            PrefixKeyFormatter::new(&spec.key_prefix, cache_name),
        )
        .await
    }

    /// Reuse an existing connection manager (shared between caches)
    pub fn with_connection(
        redis: redis::aio::ConnectionManager,
        key_formatter: impl KeyFormatter,
    ) -> Self {
        Self {
            redis,
            key_formatter: Arc::new(key_formatter),
            _value: PhantomData,
        }
    }

    fn decode(&self, key: &str, json: &str) -> Option<CachedValue<V>> {
        match serde_json::from_str::<CachedValue<V>>(json) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(
                    "Failed to deserialize L2 value for key {}: {}. Deleting corrupt entry.",
                    key, e
                );
                None
            }
        }
    }

    async fn delete_corrupt(&self, redis_keys: Vec<String>) {
        if redis_keys.is_empty() {
            return;
        }
        let mut conn = self.redis.clone();
        if let Err(e) = conn.del::<_, ()>(&redis_keys).await {
            warn!("Failed to delete corrupt L2 entries {:?}: {}", redis_keys, e);
        }
    }
}

fn ttl_millis(ttl: Duration) -> Result<u64> {
    let millis = ttl.as_millis();
    if millis == 0 {
        return Err(CacheError::invalid(format!(
            "L2 TTL must be at least 1ms, got {ttl:?}"
        )));
    }
    Ok(u64::try_from(millis).unwrap_or(u64::MAX))
}

fn backend(operation: &'static str) -> impl FnOnce(redis::RedisError) -> CacheError {
    move |e| CacheError::backend("L2", operation, e)
}

#[async_trait]
impl<V: Cacheable> CacheStore<V> for RedisRemoteCache<V> {
    fn layer(&self) -> &'static str {
        "L2"
    }

    async fn get(&self, key: &str) -> Result<Option<CachedValue<V>>> {
        let redis_key = self.key_formatter.format_key(key);
        let mut conn = self.redis.clone();

        let cached: Option<String> = conn.get(&redis_key).await.map_err(backend("get"))?;
        let Some(json) = cached else {
            return Ok(None);
        };
        match self.decode(key, &json) {
            Some(value) => Ok(Some(value)),
            None => {
                self.delete_corrupt(vec![redis_key]).await;
                Ok(None)
            }
        }
    }

    async fn put(&self, key: &str, value: CachedValue<V>, ttl: Duration) -> Result<()> {
        let millis = ttl_millis(ttl)?;
        let json = serde_json::to_string(&value)?;
        let redis_key = self.key_formatter.format_key(key);
        let mut conn = self.redis.clone();

        conn.pset_ex::<_, _, ()>(&redis_key, json, millis)
            .await
            .map_err(backend("put"))
    }

    async fn evict(&self, key: &str) -> Result<()> {
        let redis_key = self.key_formatter.format_key(key);
        let mut conn = self.redis.clone();
        conn.del::<_, ()>(&redis_key).await.map_err(backend("evict"))
    }

    async fn clear(&self) -> Result<()> {
        let pattern = self.key_formatter.match_pattern();
        let mut conn = self.redis.clone();
        let mut cursor: u64 = 0;
        let mut removed = 0usize;

        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await
                .map_err(backend("clear"))?;

            if !keys.is_empty() {
                removed += keys.len();
                conn.del::<_, ()>(&keys).await.map_err(backend("clear"))?;
            }
            if next == 0 {
                break;
            }
            cursor = next;
        }

        debug!("Cleared {} L2 keys matching {}", removed, pattern);
        Ok(())
    }

    async fn get_all(&self, keys: &[String]) -> Result<HashMap<String, CachedValue<V>>> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }
        let redis_keys: Vec<String> = keys
            .iter()
            .map(|k| self.key_formatter.format_key(k))
            .collect();
        let mut conn = self.redis.clone();

        let values: Vec<Option<String>> = redis::cmd("MGET")
            .arg(&redis_keys)
            .query_async(&mut conn)
            .await
            .map_err(backend("get_all"))?;

        let mut found = HashMap::with_capacity(keys.len());
        let mut corrupt = Vec::new();
        for ((key, redis_key), json) in keys.iter().zip(redis_keys).zip(values) {
            let Some(json) = json else { continue };
            match self.decode(key, &json) {
                Some(value) => {
                    found.insert(key.clone(), value);
                }
                None => corrupt.push(redis_key),
            }
        }
        self.delete_corrupt(corrupt).await;
        Ok(found)
    }

    async fn put_all(&self, entries: &HashMap<String, CachedValue<V>>, ttl: Duration) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let millis = ttl_millis(ttl)?;
        let mut pipe = redis::pipe();
        pipe.atomic();
        for (key, value) in entries {
            let json = serde_json::to_string(value)?;
            pipe.pset_ex(self.key_formatter.format_key(key), json, millis)
                .ignore();
        }

        let mut conn = self.redis.clone();
        let _: () = pipe
            .query_async(&mut conn)
            .await
            .map_err(backend("put_all"))?;
        Ok(())
    }

    async fn evict_all(&self, keys: &[String]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let redis_keys: Vec<String> = keys
            .iter()
            .map(|k| self.key_formatter.format_key(k))
            .collect();
        let mut conn = self.redis.clone();
        conn.del::<_, ()>(&redis_keys)
            .await
            .map_err(backend("evict_all"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_key_formatter() {
        let formatter = PrefixKeyFormatter::new("cache:", "users");
        assert_eq!(formatter.format_key("u1"), "cache:users::u1");
        assert_eq!(formatter.match_pattern(), "cache:users::*");
    }

    #[test]
    fn test_match_pattern_escapes_glob_characters() {
        let formatter = PrefixKeyFormatter::new("app[1]:", "a*b");
        assert_eq!(formatter.match_pattern(), "app\\[1\\]:a\\*b::*");
    }

    #[test]
    fn test_ttl_millis() {
        assert_eq!(ttl_millis(Duration::from_secs(5)).unwrap(), 5000);
        assert_eq!(ttl_millis(Duration::from_micros(1500)).unwrap(), 1);
        assert!(ttl_millis(Duration::from_micros(10)).is_err());
    }
}
