//! Per-process registry of named caches
//!
//! A [`CacheManager`] owns the machinery every cache of one process shares:
//! the background queue, the membership filters, the refill coordinator, the
//! metrics sink and the invalidation publisher. It also routes invalidations
//! received from other nodes to the right L1.

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::{debug, info, trace, warn};

use crate::{
    BackgroundQueue, CacheError, CacheMetrics, CacheOrchestrator, CacheSpecification, CacheStore,
    Cacheable, InvalidationHandler, InvalidationKind, InvalidationMessage, InvalidationPublisher,
    MembershipFilter, MokaLocalCache, OrchestratorConfig, PrefixKeyFormatter, RedisInvalidationListener,
    RedisInvalidationPublisher, RedisRemoteCache, RefillCoordinator, Result,
};

/// Type-erased view used to apply remote invalidations
#[async_trait]
trait LocalInvalidation: Send + Sync {
    async fn evict_local(&self, key: &str);

    async fn clear_local(&self);
}

#[async_trait]
impl<V: Cacheable> LocalInvalidation for CacheOrchestrator<V> {
    async fn evict_local(&self, key: &str) {
        CacheOrchestrator::evict_local(self, key).await
    }

    async fn clear_local(&self) {
        CacheOrchestrator::clear_local(self).await
    }
}

struct RegisteredCache {
    typed: Box<dyn Any + Send + Sync>,
    local: Arc<dyn LocalInvalidation>,
}

impl RegisteredCache {
    fn new<V: Cacheable>(cache: &CacheOrchestrator<V>) -> Self {
        Self {
            typed: Box::new(cache.clone()),
            local: Arc::new(cache.clone()),
        }
    }

    fn downcast<V: Cacheable>(&self) -> Option<CacheOrchestrator<V>> {
        self.typed.downcast_ref::<CacheOrchestrator<V>>().cloned()
    }
}

pub struct CacheManager {
    config: OrchestratorConfig,
    redis: Option<redis::aio::ConnectionManager>,
    queue: Arc<BackgroundQueue>,
    membership: Arc<MembershipFilter>,
    refill: Arc<RefillCoordinator>,
    metrics: Option<Arc<dyn CacheMetrics>>,
    publisher: Option<Arc<dyn InvalidationPublisher>>,
    caches: DashMap<String, RegisteredCache>,
}

impl CacheManager {
    /// Manager without Redis or metrics. Caches must be added with
    /// [`register`](Self::register). Must run inside a Tokio runtime.
    pub fn new(config: OrchestratorConfig) -> Self {
        Self::with_parts(config, None)
    }

    /// Manager whose background machinery reports to `metrics`
    pub fn with_metrics(config: OrchestratorConfig, metrics: Arc<dyn CacheMetrics>) -> Self {
        Self::with_parts(config, Some(metrics))
    }

    fn with_parts(config: OrchestratorConfig, metrics: Option<Arc<dyn CacheMetrics>>) -> Self {
        let queue = Arc::new(BackgroundQueue::new(
            config.queue_capacity,
            config.background_concurrency,
            config.backpressure,
        ));
        let membership = Arc::new(MembershipFilter::new(Arc::clone(&queue), metrics.clone()));
        let refill = Arc::new(RefillCoordinator::new(Arc::clone(&queue), metrics.clone()));
        Self {
            config,
            redis: None,
            queue,
            membership,
            refill,
            metrics,
            publisher: None,
            caches: DashMap::new(),
        }
    }

    /// Connect to Redis for L2 storage and invalidation publishing
    pub async fn connect(
        config: OrchestratorConfig,
        redis_client: redis::Client,
        metrics: Option<Arc<dyn CacheMetrics>>,
    ) -> Result<Self> {
        let redis = redis::aio::ConnectionManager::new(redis_client).await?;
        let publisher = RedisInvalidationPublisher::new(
            redis.clone(),
            config.invalidation_channel.clone(),
            config.node_id.clone(),
        );
        info!(
            "Cache manager {} connected to Redis, invalidations on {}",
            config.node_id, config.invalidation_channel
        );
        Ok(Self::with_parts(config, metrics)
            .with_redis(redis)
            .with_publisher(Arc::new(publisher)))
    }

    /// Use this connection for L2 stores built by [`cache`](Self::cache)
    pub fn with_redis(mut self, redis: redis::aio::ConnectionManager) -> Self {
        self.redis = Some(redis);
        self
    }

    pub fn with_publisher(mut self, publisher: Arc<dyn InvalidationPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Return the cache registered under `name`, building it with a Moka L1
    /// and a Redis L2 if it does not exist yet.
    ///
    /// Fails if no Redis connection is configured or if `name` is already
    /// registered with a different value type.
    pub fn cache<V: Cacheable>(&self, name: &str, spec: CacheSpecification) -> Result<CacheOrchestrator<V>> {
        match self.caches.entry(name.to_owned()) {
            Entry::Occupied(entry) => entry.get().downcast::<V>().ok_or_else(|| {
                CacheError::invalid(format!("cache {name} is registered with a different value type"))
            }),
            Entry::Vacant(entry) => {
                let Some(redis) = &self.redis else {
                    return Err(CacheError::invalid(format!(
                        "cannot build cache {name}: no Redis connection configured"
                    )));
                };
                let l1: Arc<dyn CacheStore<V>> = Arc::new(MokaLocalCache::from_spec(&spec));
                let l2: Arc<dyn CacheStore<V>> = Arc::new(RedisRemoteCache::with_connection(
                    redis.clone(),
                    PrefixKeyFormatter::new(&spec.key_prefix, name),
                ));
                let cache = self.build(name, spec, l1, l2)?;
                entry.insert(RegisteredCache::new(&cache));
                Ok(cache)
            }
        }
    }

    /// Register a cache over caller-supplied stores
    pub fn register<V: Cacheable>(
        &self,
        name: &str,
        spec: CacheSpecification,
        l1: Arc<dyn CacheStore<V>>,
        l2: Arc<dyn CacheStore<V>>,
    ) -> Result<CacheOrchestrator<V>> {
        match self.caches.entry(name.to_owned()) {
            Entry::Occupied(_) => Err(CacheError::invalid(format!("cache {name} is already registered"))),
            Entry::Vacant(entry) => {
                let cache = self.build(name, spec, l1, l2)?;
                entry.insert(RegisteredCache::new(&cache));
                Ok(cache)
            }
        }
    }

    fn build<V: Cacheable>(
        &self,
        name: &str,
        spec: CacheSpecification,
        l1: Arc<dyn CacheStore<V>>,
        l2: Arc<dyn CacheStore<V>>,
    ) -> Result<CacheOrchestrator<V>> {
        let mut builder = CacheOrchestrator::builder(name, spec, l1, l2)
            .with_config(self.config.clone())
            .with_background(Arc::clone(&self.membership), Arc::clone(&self.refill));
        if let Some(metrics) = &self.metrics {
            builder = builder.with_metrics(Arc::clone(metrics));
        }
        if let Some(publisher) = &self.publisher {
            builder = builder.with_publisher(Arc::clone(publisher));
        }
        let cache = builder.build()?;
        debug!("Registered cache {}", name);
        Ok(cache)
    }

    /// Look up a registered cache; `None` if unknown or of another value type
    pub fn get<V: Cacheable>(&self, name: &str) -> Option<CacheOrchestrator<V>> {
        self.caches.get(name)?.downcast::<V>()
    }

    pub fn cache_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.caches.iter().map(|e| e.key().clone()).collect();
        names.sort_unstable();
        names
    }

    /// Drop L1 entries named by an invalidation from another node
    pub async fn apply_invalidation(&self, message: &InvalidationMessage) {
        let Some(local) = self
            .caches
            .get(&message.cache_name)
            .map(|c| Arc::clone(&c.local))
        else {
            trace!("Ignoring invalidation for unknown cache {}", message.cache_name);
            return;
        };

        match (message.kind, message.key.as_deref()) {
            (InvalidationKind::Key, Some(key)) => {
                debug!(
                    "Evicting {}::{} from L1 on behalf of node {}",
                    message.cache_name, key, message.node_id
                );
                local.evict_local(key).await;
            }
            (InvalidationKind::Cache, _) => {
                debug!(
                    "Clearing L1 cache {} on behalf of node {}",
                    message.cache_name, message.node_id
                );
                local.clear_local().await;
            }
            (InvalidationKind::Key, None) => {
                warn!("Key invalidation for cache {} carries no key", message.cache_name);
            }
        }
    }

    /// Subscribe to the configured invalidation channel and apply what other
    /// nodes publish
    pub fn listen_for_invalidations(self: &Arc<Self>, redis_client: redis::Client) -> RedisInvalidationListener {
        let handler: Arc<dyn InvalidationHandler> = Arc::clone(self) as Arc<dyn InvalidationHandler>;
        RedisInvalidationListener::start(
            redis_client,
            self.config.invalidation_channel.clone(),
            self.config.node_id.clone(),
            handler,
        )
    }

    /// Wait for queued refills and filter inserts, then stop background work
    pub async fn shutdown(&self) {
        self.queue.shutdown().await;
        info!("Cache manager {} shut down", self.config.node_id);
    }
}

#[async_trait]
impl InvalidationHandler for CacheManager {
    async fn on_invalidation(&self, message: InvalidationMessage) {
        self.apply_invalidation(&message).await;
    }
}
