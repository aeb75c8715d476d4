//! Two-level cache orchestration
//!
//! A [`CacheOrchestrator`] fronts one cache name. Reads go L1 then L2, with
//! L2 hits copied back into L1 in the background; loader-based reads are
//! single-flighted per key. Writes follow the cache's [`ConsistencyLevel`]:
//!
//! - `Strong`: L2 then L1, both must succeed; an L1 failure rolls L2 back.
//! - `Eventual`: L2 must succeed (or the fallback policy decides); L1
//!   failures are logged.
//! - `BestEffort`: both layers attempted, backend failures never surface.
//!
//! The membership filter is consulted on reads for observability only; a
//! negative answer never skips the L2 lookup.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, trace, warn};

use crate::error::BoxError;
use crate::{
    BackgroundQueue, CacheError, CacheMetrics, CacheSpecification, CacheStore, CachedValue,
    Cacheable, ConsistencyLevel, FallbackPolicy, FilterSizing, FilterStats, HitLevel,
    InvalidationPublisher, MembershipFilter, OrchestratorConfig, RefillCoordinator, Result,
    SingleFlightLoader,
};

fn elapsed_nanos(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_nanos()).unwrap_or(u64::MAX)
}

fn check_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(CacheError::invalid("key must not be empty"));
    }
    Ok(())
}

fn check_ttl(ttl: Duration) -> Result<()> {
    if ttl.is_zero() {
        return Err(CacheError::invalid(format!("TTL must be positive, got {ttl:?}")));
    }
    Ok(())
}

/// Builds a [`CacheOrchestrator`].
///
/// Background machinery (queue, membership filter, refill coordinator) is
/// normally shared through a [`CacheManager`](crate::CacheManager); when it
/// is not supplied the orchestrator creates and owns its own.
pub struct OrchestratorBuilder<V: Cacheable> {
    name: String,
    spec: CacheSpecification,
    l1: Arc<dyn CacheStore<V>>,
    l2: Arc<dyn CacheStore<V>>,
    config: OrchestratorConfig,
    background: Option<(Arc<MembershipFilter>, Arc<RefillCoordinator>)>,
    fallback: Option<Arc<dyn FallbackPolicy<V>>>,
    metrics: Option<Arc<dyn CacheMetrics>>,
    publisher: Option<Arc<dyn InvalidationPublisher>>,
}

impl<V: Cacheable> OrchestratorBuilder<V> {
    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the configured [`FallbackStrategy`](crate::FallbackStrategy)
    /// with a custom policy
    pub fn with_fallback_policy(mut self, policy: Arc<dyn FallbackPolicy<V>>) -> Self {
        self.fallback = Some(policy);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn CacheMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_publisher(mut self, publisher: Arc<dyn InvalidationPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Share the membership filter and refill coordinator (and through them
    /// the background queue) with other orchestrators
    pub fn with_background(
        mut self,
        membership: Arc<MembershipFilter>,
        refill: Arc<RefillCoordinator>,
    ) -> Self {
        self.background = Some((membership, refill));
        self
    }

    /// Validate and build. Must run inside a Tokio runtime when no shared
    /// background machinery was supplied.
    pub fn build(self) -> Result<CacheOrchestrator<V>> {
        let Self {
            name,
            spec,
            l1,
            l2,
            config,
            background,
            fallback,
            metrics,
            publisher,
        } = self;

        if name.is_empty() {
            return Err(CacheError::invalid("cache name must not be empty"));
        }
        spec.validate()?;

        let (membership, refill, owned_queue) = match background {
            Some((membership, refill)) => (membership, refill, None),
            None => {
                let queue = Arc::new(BackgroundQueue::new(
                    config.queue_capacity,
                    config.background_concurrency,
                    config.backpressure,
                ));
                let membership = Arc::new(MembershipFilter::new(
                    Arc::clone(&queue),
                    metrics.clone(),
                ));
                let refill = Arc::new(RefillCoordinator::new(
                    Arc::clone(&queue),
                    metrics.clone(),
                ));
                (membership, refill, Some(queue))
            }
        };

        if spec.enable_bloom_filter {
            membership.register(&name, FilterSizing::from(&spec));
        }

        let fallback: Arc<dyn FallbackPolicy<V>> = match fallback {
            Some(policy) => policy,
            None => Arc::new(config.fallback),
        };

        debug!(
            "Building cache {} ({:?}, bloom filter {})",
            name, spec.consistency_level, spec.enable_bloom_filter
        );

        Ok(CacheOrchestrator {
            inner: Arc::new(OrchestratorInner {
                name,
                spec,
                l1,
                l2,
                membership,
                refill,
                fallback,
                metrics,
                publisher,
                single_flight: SingleFlightLoader::new(),
                owned_queue,
            }),
        })
    }
}

struct OrchestratorInner<V: Cacheable> {
    name: String,
    spec: CacheSpecification,
    l1: Arc<dyn CacheStore<V>>,
    l2: Arc<dyn CacheStore<V>>,
    membership: Arc<MembershipFilter>,
    refill: Arc<RefillCoordinator>,
    fallback: Arc<dyn FallbackPolicy<V>>,
    metrics: Option<Arc<dyn CacheMetrics>>,
    publisher: Option<Arc<dyn InvalidationPublisher>>,
    single_flight: SingleFlightLoader<Option<V>>,
    owned_queue: Option<Arc<BackgroundQueue>>,
}

/// L1/L2 cache for one cache name; cheap to clone
pub struct CacheOrchestrator<V: Cacheable> {
    inner: Arc<OrchestratorInner<V>>,
}

impl<V: Cacheable> Clone for CacheOrchestrator<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V: Cacheable> CacheOrchestrator<V> {
    pub fn builder(
        name: impl Into<String>,
        spec: CacheSpecification,
        l1: Arc<dyn CacheStore<V>>,
        l2: Arc<dyn CacheStore<V>>,
    ) -> OrchestratorBuilder<V> {
        OrchestratorBuilder {
            name: name.into(),
            spec,
            l1,
            l2,
            config: OrchestratorConfig::default(),
            background: None,
            fallback: None,
            metrics: None,
            publisher: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn specification(&self) -> &CacheSpecification {
        &self.inner.spec
    }

    /// Shape of this cache's membership filter, if one was created
    pub fn filter_stats(&self) -> Option<FilterStats> {
        self.inner.membership.stats(&self.inner.name)
    }

    fn record(&self, f: impl FnOnce(&dyn CacheMetrics, &str)) {
        if let Some(metrics) = &self.inner.metrics {
            f(metrics.as_ref(), &self.inner.name);
        }
    }

    /// L1 entries never outlive the L2 entry they were written with
    fn local_ttl(&self, ttl: Duration) -> Duration {
        ttl.min(self.inner.spec.local_ttl)
    }

    fn check_value(&self, value: &CachedValue<V>) -> Result<()> {
        if value.is_absent() && !self.inner.spec.allow_null_values {
            return Err(CacheError::invalid(format!(
                "null values are not allowed for cache {}",
                self.inner.name
            )));
        }
        Ok(())
    }

    // ---- reads ----

    /// Look a key up in L1, then L2.
    ///
    /// `Ok(None)` means the key is not cached; `Ok(Some(CachedValue::Absent))`
    /// means a negative lookup was cached.
    pub async fn get(&self, key: &str) -> Result<Option<CachedValue<V>>> {
        check_key(key)?;
        let name = self.inner.name.as_str();
        self.record(|m, cache| m.record_key_access(cache, key));

        let predicted_absent =
            self.inner.spec.enable_bloom_filter && !self.inner.membership.might_contain(name, key);
        if predicted_absent {
            // advisory only, L2 is still queried
            self.record(|m, cache| m.record_filter_filtered(cache));
        }

        let started = Instant::now();
        let l1_result = self.inner.l1.get(key).await;
        let nanos = elapsed_nanos(started);
        self.record(|m, cache| m.record_latency(cache, HitLevel::L1, nanos));
        match l1_result {
            Ok(Some(value)) => {
                trace!("Cache hit L1 for {}::{}", name, key);
                self.record(|m, cache| m.record_hit(cache, HitLevel::L1));
                return Ok(Some(value));
            }
            Ok(None) => {}
            Err(e) => warn!("L1 read failed for {}::{}: {}", name, key, e),
        }

        let started = Instant::now();
        let l2_result = self.inner.l2.get(key).await;
        let nanos = elapsed_nanos(started);
        self.record(|m, cache| m.record_latency(cache, HitLevel::L2, nanos));

        match l2_result {
            Ok(Some(value)) => {
                trace!("Cache hit L2 for {}::{}", name, key);
                self.record(|m, cache| m.record_hit(cache, HitLevel::L2));
                if predicted_absent {
                    self.record(|m, cache| m.record_filter_false_positive(cache));
                }
                self.schedule_refill(key, value.clone()).await;
                Ok(Some(value))
            }
            Ok(None) => {
                trace!("Cache miss for {}::{}", name, key);
                self.record(|m, cache| m.record_miss(cache));
                Ok(None)
            }
            Err(e) if e.is_argument_error() => Err(e),
            Err(e) => {
                warn!("L2 read failed for {}::{}: {}", name, key, e);
                let degraded = self
                    .inner
                    .fallback
                    .on_read_failure(key, self.inner.l1.as_ref(), &e)
                    .await?;
                if degraded.is_none() {
                    self.record(|m, cache| m.record_miss(cache));
                }
                Ok(degraded)
            }
        }
    }

    async fn schedule_refill(&self, key: &str, value: CachedValue<V>) {
        let result = self
            .inner
            .refill
            .refill(
                &self.inner.name,
                key,
                value,
                Arc::clone(&self.inner.l1),
                self.inner.spec.local_ttl,
            )
            .await;
        if let Err(e) = result {
            warn!("Could not schedule L1 refill for {}::{}: {}", self.inner.name, key, e);
        }
    }

    /// Read through, running `loader` on a miss.
    ///
    /// Concurrent misses for the same key share one loader call and its
    /// outcome. A loaded value is written with the cache's TTL and
    /// consistency level; a loaded `None` is cached as absent when null
    /// values are allowed. A cached absent value returns `None` without
    /// calling the loader.
    pub async fn get_with<F, Fut, E>(&self, key: &str, loader: F) -> Result<Option<V>>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = std::result::Result<Option<V>, E>> + Send,
        E: Into<BoxError>,
    {
        if let Some(cached) = self.get(key).await? {
            return Ok(cached.into_option());
        }

        self.inner
            .single_flight
            .load(key, || async move {
                // an earlier leader may have stored the value since our lookup
                if let Some(cached) = self.get(key).await? {
                    return Ok(cached.into_option());
                }
                let loaded = loader().await.map_err(CacheError::loader)?;
                self.store_loaded(key, &loaded).await;
                Ok(loaded)
            })
            .await
    }

    async fn store_loaded(&self, key: &str, loaded: &Option<V>) {
        let value = match loaded {
            Some(v) => CachedValue::Present(v.clone()),
            None if self.inner.spec.allow_null_values => CachedValue::Absent,
            None => {
                debug!("Loader returned nothing for {}::{}, not caching", self.inner.name, key);
                return;
            }
        };
        if let Err(e) = self.put_default(key, value).await {
            warn!("Failed to cache loaded value for {}::{}: {}", self.inner.name, key, e);
        }
    }

    /// Look many keys up; missing keys are absent from the result
    pub async fn batch_get(&self, keys: &[String]) -> Result<HashMap<String, CachedValue<V>>> {
        let mut seen = HashSet::with_capacity(keys.len());
        let mut unique = Vec::with_capacity(keys.len());
        for key in keys {
            check_key(key)?;
            if seen.insert(key.as_str()) {
                unique.push(key.clone());
            }
        }
        if unique.is_empty() {
            return Ok(HashMap::new());
        }
        let name = self.inner.name.as_str();
        for key in &unique {
            self.record(|m, cache| m.record_key_access(cache, key));
        }

        let started = Instant::now();
        let mut found = match self.inner.l1.get_all(&unique).await {
            Ok(found) => found,
            Err(e) => {
                warn!("L1 batch read failed for cache {}: {}", name, e);
                HashMap::new()
            }
        };
        let per_key = elapsed_nanos(started) / unique.len() as u64;
        self.record(|m, cache| m.record_latency(cache, HitLevel::L1, per_key));
        for _ in 0..found.len() {
            self.record(|m, cache| m.record_hit(cache, HitLevel::L1));
        }

        let remaining: Vec<String> = unique
            .iter()
            .filter(|k| !found.contains_key(*k))
            .cloned()
            .collect();

        if !remaining.is_empty() {
            let started = Instant::now();
            let l2_result = self.inner.l2.get_all(&remaining).await;
            let per_key = elapsed_nanos(started) / remaining.len() as u64;
            self.record(|m, cache| m.record_latency(cache, HitLevel::L2, per_key));

            match l2_result {
                Ok(l2_found) => {
                    for (key, value) in l2_found {
                        self.record(|m, cache| m.record_hit(cache, HitLevel::L2));
                        self.schedule_refill(&key, value.clone()).await;
                        found.insert(key, value);
                    }
                }
                Err(e) => {
                    warn!("L2 batch read failed for cache {}: {}", name, e);
                    for key in &remaining {
                        if let Some(value) = self
                            .inner
                            .fallback
                            .on_read_failure(key, self.inner.l1.as_ref(), &e)
                            .await?
                        {
                            found.insert(key.clone(), value);
                        }
                    }
                }
            }
        }

        for _ in found.len()..unique.len() {
            self.record(|m, cache| m.record_miss(cache));
        }
        Ok(found)
    }

    // ---- writes ----

    /// Write with the given TTL and consistency level
    pub async fn put(
        &self,
        key: &str,
        value: CachedValue<V>,
        ttl: Duration,
        level: ConsistencyLevel,
    ) -> Result<()> {
        check_key(key)?;
        check_ttl(ttl)?;
        self.check_value(&value)?;

        self.write(key, value, ttl, level).await?;
        self.track_keys(std::iter::once(key)).await;
        Ok(())
    }

    /// Write with the specification's TTL and consistency level
    pub async fn put_default(&self, key: &str, value: CachedValue<V>) -> Result<()> {
        let spec = &self.inner.spec;
        self.put(key, value, spec.ttl, spec.consistency_level).await
    }

    async fn write(
        &self,
        key: &str,
        value: CachedValue<V>,
        ttl: Duration,
        level: ConsistencyLevel,
    ) -> Result<()> {
        match level {
            ConsistencyLevel::Strong => self.write_strong(key, value, ttl).await,
            ConsistencyLevel::Eventual => self.write_eventual(key, value, ttl).await,
            ConsistencyLevel::BestEffort => {
                self.write_best_effort(key, value, ttl).await;
                Ok(())
            }
        }
    }

    async fn write_strong(&self, key: &str, value: CachedValue<V>, ttl: Duration) -> Result<()> {
        let name = &self.inner.name;
        if let Err(e) = self.inner.l2.put(key, value.clone(), ttl).await {
            error!("L2 write failed with STRONG consistency for {}::{}: {}", name, key, e);
            return Err(CacheError::Write {
                layer: "L2",
                key: key.to_owned(),
                source: Box::new(e),
            });
        }

        if let Err(e) = self.inner.l1.put(key, value, self.local_ttl(ttl)).await {
            error!("L1 write failed with STRONG consistency for {}::{}: {}", name, key, e);
            if let Err(rollback) = self.inner.l2.evict(key).await {
                warn!("Failed to roll back L2 for {}::{}: {}", name, key, rollback);
            }
            return Err(CacheError::Write {
                layer: "L1",
                key: key.to_owned(),
                source: Box::new(e),
            });
        }
        Ok(())
    }

    async fn write_eventual(&self, key: &str, value: CachedValue<V>, ttl: Duration) -> Result<()> {
        let name = &self.inner.name;
        let local_ttl = self.local_ttl(ttl);
        if let Err(e) = self.inner.l2.put(key, value.clone(), ttl).await {
            if e.is_argument_error() {
                return Err(e);
            }
            error!("L2 write failed for {}::{}: {}", name, key, e);
            return self
                .inner
                .fallback
                .on_write_failure(key, &value, self.inner.l1.as_ref(), local_ttl, &e)
                .await;
        }

        if let Err(e) = self.inner.l1.put(key, value, local_ttl).await {
            error!("L1 write failed for {}::{}: {}", name, key, e);
        }
        Ok(())
    }

    async fn write_best_effort(&self, key: &str, value: CachedValue<V>, ttl: Duration) {
        let name = &self.inner.name;
        let local_ttl = self.local_ttl(ttl);
        if let Err(e) = self.inner.l2.put(key, value.clone(), ttl).await {
            warn!("L2 write failed with BEST_EFFORT for {}::{}: {}", name, key, e);
            if let Err(e) = self
                .inner
                .fallback
                .on_write_failure(key, &value, self.inner.l1.as_ref(), local_ttl, &e)
                .await
            {
                debug!("Fallback failed for {}::{}, ignored: {}", name, key, e);
            }
        }

        if let Err(e) = self.inner.l1.put(key, value, local_ttl).await {
            warn!("L1 write failed with BEST_EFFORT for {}::{}: {}", name, key, e);
        }
    }

    /// Write many entries with the specification's consistency level.
    ///
    /// Bulk L2 writes are used first; if the bulk write fails as a whole,
    /// `Eventual` and `BestEffort` fall back to per-key writes.
    pub async fn batch_put(&self, entries: HashMap<String, CachedValue<V>>, ttl: Duration) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        check_ttl(ttl)?;
        for (key, value) in &entries {
            check_key(key)?;
            self.check_value(value)?;
        }

        match self.inner.spec.consistency_level {
            ConsistencyLevel::Strong => self.batch_write_strong(&entries, ttl).await?,
            ConsistencyLevel::Eventual => self.batch_write_eventual(&entries, ttl).await,
            ConsistencyLevel::BestEffort => self.batch_write_best_effort(&entries, ttl).await,
        }

        self.track_keys(entries.keys().map(String::as_str)).await;
        Ok(())
    }

    async fn batch_write_strong(&self, entries: &HashMap<String, CachedValue<V>>, ttl: Duration) -> Result<()> {
        let name = &self.inner.name;
        let batch_label = || {
            let mut keys: Vec<&str> = entries.keys().map(String::as_str).collect();
            keys.sort_unstable();
            format!("[{}]", keys.join(", "))
        };

        if let Err(e) = self.inner.l2.put_all(entries, ttl).await {
            error!("L2 batch write failed with STRONG consistency for cache {}: {}", name, e);
            return Err(CacheError::Write {
                layer: "L2",
                key: batch_label(),
                source: Box::new(e),
            });
        }

        if let Err(e) = self.inner.l1.put_all(entries, self.local_ttl(ttl)).await {
            error!("L1 batch write failed with STRONG consistency for cache {}: {}", name, e);
            let keys: Vec<String> = entries.keys().cloned().collect();
            self.evict_keys(self.inner.l2.as_ref(), &keys).await;
            return Err(CacheError::Write {
                layer: "L1",
                key: batch_label(),
                source: Box::new(e),
            });
        }
        Ok(())
    }

    async fn batch_write_eventual(&self, entries: &HashMap<String, CachedValue<V>>, ttl: Duration) {
        let name = &self.inner.name;
        if let Err(e) = self.inner.l2.put_all(entries, ttl).await {
            error!("L2 batch write failed for cache {}, writing per key: {}", name, e);
            for (key, value) in entries {
                if let Err(e) = self.write_eventual(key, value.clone(), ttl).await {
                    warn!("Failed to put {}::{}: {}", name, key, e);
                }
            }
            return;
        }

        if let Err(e) = self.inner.l1.put_all(entries, self.local_ttl(ttl)).await {
            error!("L1 batch write failed for cache {}: {}", name, e);
        }
    }

    async fn batch_write_best_effort(&self, entries: &HashMap<String, CachedValue<V>>, ttl: Duration) {
        let name = &self.inner.name;
        let local_ttl = self.local_ttl(ttl);
        if let Err(e) = self.inner.l2.put_all(entries, ttl).await {
            warn!("L2 batch write failed with BEST_EFFORT for cache {}: {}", name, e);
            for (key, value) in entries {
                if let Err(e) = self.inner.l2.put(key, value.clone(), ttl).await {
                    warn!("L2 write failed with BEST_EFFORT for {}::{}: {}", name, key, e);
                    if let Err(e) = self
                        .inner
                        .fallback
                        .on_write_failure(key, value, self.inner.l1.as_ref(), local_ttl, &e)
                        .await
                    {
                        debug!("Fallback failed for {}::{}, ignored: {}", name, key, e);
                    }
                }
            }
        }

        if let Err(e) = self.inner.l1.put_all(entries, local_ttl).await {
            warn!("L1 batch write failed with BEST_EFFORT for cache {}: {}", name, e);
        }
    }

    async fn track_keys<'a>(&self, keys: impl Iterator<Item = &'a str>) {
        if !self.inner.spec.enable_bloom_filter {
            return;
        }
        for key in keys {
            match self.inner.membership.insert_async(&self.inner.name, key).await {
                Ok(true) => {}
                Ok(false) => debug!("Bloom filter insert dropped for {}::{}", self.inner.name, key),
                Err(e) => warn!("Failed to update bloom filter for {}::{}: {}", self.inner.name, key, e),
            }
        }
    }

    // ---- invalidation ----

    /// Remove a key from both layers. Never fails for backend errors.
    pub async fn evict(&self, key: &str) -> Result<()> {
        check_key(key)?;
        let name = &self.inner.name;
        if let Err(e) = self.inner.l1.evict(key).await {
            warn!("Failed to evict {}::{} from L1: {}", name, key, e);
        }
        if let Err(e) = self.inner.l2.evict(key).await {
            error!("Failed to evict {}::{} from L2: {}", name, key, e);
        }
        if let Some(publisher) = &self.inner.publisher
            && let Err(e) = publisher.publish_eviction(name, key).await
        {
            warn!("Failed to publish eviction of {}::{}: {}", name, key, e);
        }
        Ok(())
    }

    pub async fn batch_evict(&self, keys: &[String]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        for key in keys {
            check_key(key)?;
        }
        let name = &self.inner.name;
        self.evict_keys(self.inner.l1.as_ref(), keys).await;
        self.evict_keys(self.inner.l2.as_ref(), keys).await;
        if let Some(publisher) = &self.inner.publisher {
            for key in keys {
                if let Err(e) = publisher.publish_eviction(name, key).await {
                    warn!("Failed to publish eviction of {}::{}: {}", name, key, e);
                }
            }
        }
        Ok(())
    }

    /// Bulk evict from one layer, retrying key by key if the bulk call fails
    async fn evict_keys(&self, store: &dyn CacheStore<V>, keys: &[String]) {
        let name = &self.inner.name;
        let layer = store.layer();
        let Err(e) = store.evict_all(keys).await else {
            return;
        };
        warn!(
            "Batch evict of {} keys from {} cache {} failed, evicting per key: {}",
            keys.len(),
            layer,
            name,
            e
        );
        for key in keys {
            if let Err(e) = store.evict(key).await {
                error!("Failed to evict {}::{} from {}: {}", name, key, layer, e);
            }
        }
    }

    /// Remove every entry of this cache from both layers
    pub async fn clear(&self) -> Result<()> {
        let name = &self.inner.name;
        if let Err(e) = self.inner.l1.clear().await {
            warn!("Failed to clear L1 cache {}: {}", name, e);
        }
        if let Err(e) = self.inner.l2.clear().await {
            error!("Failed to clear L2 cache {}: {}", name, e);
        }
        if self.inner.spec.enable_bloom_filter {
            self.inner.membership.clear(name);
        }
        if let Some(publisher) = &self.inner.publisher
            && let Err(e) = publisher.publish_clear(name).await
        {
            warn!("Failed to publish clear of cache {}: {}", name, e);
        }
        Ok(())
    }

    /// Drop a key from L1 only, after another node evicted it
    pub async fn evict_local(&self, key: &str) {
        if let Err(e) = self.inner.l1.evict(key).await {
            warn!("Failed to apply remote eviction of {}::{}: {}", self.inner.name, key, e);
        }
    }

    /// Clear L1 only, after another node cleared the cache
    pub async fn clear_local(&self) {
        if let Err(e) = self.inner.l1.clear().await {
            warn!("Failed to apply remote clear of cache {}: {}", self.inner.name, e);
        }
    }

    /// Drain background work if this orchestrator owns its queue
    pub async fn shutdown(&self) {
        if let Some(queue) = &self.inner.owned_queue {
            queue.shutdown().await;
        }
    }
}
