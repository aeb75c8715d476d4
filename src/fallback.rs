//! Reactions to L2 failures
//!
//! An orchestrator holds one policy for its lifetime. The built-in
//! [`FallbackStrategy`] variants cover the common cases; implement
//! [`FallbackPolicy`] directly for anything else (e.g. serving a default).

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, warn};

use crate::{CacheError, CacheStore, CachedValue, Cacheable, FallbackStrategy, Result};

#[async_trait]
pub trait FallbackPolicy<V: Cacheable>: Send + Sync {
    /// Called when an L2 read failed. `Ok(Some(_))` is served to the caller,
    /// `Ok(None)` is treated as a miss and `Err` is surfaced.
    async fn on_read_failure(
        &self,
        key: &str,
        l1: &dyn CacheStore<V>,
        error: &CacheError,
    ) -> Result<Option<CachedValue<V>>>;

    /// Called when an L2 write failed. `local_ttl` is the L1 lifetime the
    /// cache is configured with.
    async fn on_write_failure(
        &self,
        key: &str,
        value: &CachedValue<V>,
        l1: &dyn CacheStore<V>,
        local_ttl: Duration,
        error: &CacheError,
    ) -> Result<()>;
}

#[async_trait]
impl<V: Cacheable> FallbackPolicy<V> for FallbackStrategy {
    async fn on_read_failure(
        &self,
        key: &str,
        l1: &dyn CacheStore<V>,
        error: &CacheError,
    ) -> Result<Option<CachedValue<V>>> {
        match self {
            FallbackStrategy::DegradeToL1 => {
                warn!("L2 read failed for key {}, degrading to L1: {}", key, error);
                match l1.get(key).await {
                    Ok(value) => Ok(value),
                    Err(e) => {
                        error!("L1 fallback read also failed for key {}: {}", key, e);
                        Ok(None)
                    }
                }
            }
            FallbackStrategy::FailFast => {
                error!("L2 read failed for key {}, failing fast: {}", key, error);
                Err(error.clone())
            }
            FallbackStrategy::Ignore => {
                debug!("L2 read failed for key {}, ignoring: {}", key, error);
                Ok(None)
            }
        }
    }

    async fn on_write_failure(
        &self,
        key: &str,
        value: &CachedValue<V>,
        l1: &dyn CacheStore<V>,
        local_ttl: Duration,
        error: &CacheError,
    ) -> Result<()> {
        match self {
            FallbackStrategy::DegradeToL1 => {
                warn!("L2 write failed for key {}, writing L1 only: {}", key, error);
                if let Err(e) = l1.put(key, value.clone(), local_ttl).await {
                    error!("L1 fallback write also failed for key {}: {}", key, e);
                }
                Ok(())
            }
            FallbackStrategy::FailFast => {
                error!("L2 write failed for key {}, failing fast: {}", key, error);
                Err(error.clone())
            }
            FallbackStrategy::Ignore => {
                debug!("L2 write failed for key {}, ignoring: {}", key, error);
                Ok(())
            }
        }
    }
}
