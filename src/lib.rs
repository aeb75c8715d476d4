//! tiercache - Two-level cache orchestration
//!
//! This library fronts an in-process cache (L1) and a shared cache (L2) with
//! one API per cache name:
//! - L1: In-memory Moka cache (fastest, per process)
//! - L2: Redis cache (shared across instances)
//!
//! The cache supports:
//! - Strong, eventual and best-effort write consistency
//! - Single-flight loading (one loader call per key across concurrent misses)
//! - Background L1 refill after L2 hits
//! - Per-cache scalable bloom filters for miss observability
//! - Pluggable fallback policies for L2 outages
//! - Redis pub/sub for L1 invalidation across instances
//! - Batch get, put and evict

mod background;
mod cache_metrics;
mod config;
mod error;
mod fallback;
mod invalidation;
mod manager;
mod membership;
mod moka_local;
mod orchestrator;
mod redis_remote;
mod refill;
mod single_flight;
pub mod store;
mod value;

pub use background::{BackgroundQueue, QueueStats};
pub use cache_metrics::{AtomicCacheMetrics, CacheMetrics, HitLevel, MetricsSnapshot, RecorderMetrics};
pub use config::{
    Backpressure, CacheSpecification, ConsistencyLevel, FallbackStrategy, OrchestratorConfig,
};
pub use error::{BoxError, CacheError, Result, SharedError};
pub use fallback::FallbackPolicy;
pub use invalidation::{
    DEFAULT_INVALIDATION_CHANNEL, InvalidationHandler, InvalidationKind, InvalidationMessage,
    InvalidationPublisher, RedisInvalidationListener, RedisInvalidationPublisher, decode_for_node,
};
pub use manager::CacheManager;
pub use membership::{CacheBloomFilter, FilterSizing, FilterStats, MembershipFilter};
pub use moka_local::MokaLocalCache;
pub use orchestrator::{CacheOrchestrator, OrchestratorBuilder};
pub use redis_remote::{KeyFormatter, PrefixKeyFormatter, RedisRemoteCache};
pub use refill::RefillCoordinator;
pub use single_flight::SingleFlightLoader;
pub use store::CacheStore;
pub use value::{CachedValue, Cacheable};

// Re-export async_trait for convenience
pub use async_trait::async_trait;
