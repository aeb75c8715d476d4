//! Per-cache membership filters
//!
//! Each cache name owns a scalable bloom filter from `probabilistic_collections`:
//! a chain of bloom filters where a larger, tighter one is appended once the
//! newest nears its false-positive bound. Lookups check every filter in the
//! chain, so growing never loses a key that was inserted before. Filters are
//! created lazily on the first insertion for a cache name.
//!
//! The filter is advisory. [`MembershipFilter::might_contain`] answers
//! `true` whenever it cannot answer reliably (no filter yet, poisoned lock).

use std::sync::{Arc, RwLock};

use dashmap::DashMap;
use probabilistic_collections::bloom::ScalableBloomFilter;
use tracing::{debug, info, warn};

use crate::{BackgroundQueue, CacheMetrics, CacheSpecification, Result};

/// Bit count multiplier between consecutive filters
const GROWTH_RATIO: f64 = 2.0;
/// False-positive rate multiplier between consecutive filters
const TIGHTENING_RATIO: f64 = 0.5;
const MIN_INITIAL_BITS: usize = 64;

/// Sizing of the first filter of a cache's chain
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FilterSizing {
    pub expected_insertions: u64,
    pub false_positive_rate: f64,
}

impl FilterSizing {
    /// Optimal bit count for the expected insertions at the target rate
    fn initial_bits(&self) -> usize {
        let ln2 = std::f64::consts::LN_2;
        let n = self.expected_insertions.max(1) as f64;
        let bits = (-(n * self.false_positive_rate.ln()) / (ln2 * ln2)).ceil();
        (bits as usize).max(MIN_INITIAL_BITS)
    }
}

impl Default for FilterSizing {
    fn default() -> Self {
        let spec = CacheSpecification::default();
        Self::from(&spec)
    }
}

impl From<&CacheSpecification> for FilterSizing {
    fn from(spec: &CacheSpecification) -> Self {
        Self {
            expected_insertions: spec.bloom_expected_insertions.max(1),
            false_positive_rate: spec.bloom_false_positive_rate,
        }
    }
}

/// Shape of one cache's filter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterStats {
    pub slices: usize,
    pub insertions: u64,
    /// Nominal expected insertions across the chain
    pub capacity: u64,
    pub bits: u64,
}

/// One cache's growing bloom filter, counting distinct insertions
pub struct CacheBloomFilter {
    inner: ScalableBloomFilter<String>,
    sizing: FilterSizing,
    insertions: u64,
}

impl CacheBloomFilter {
    pub fn new(sizing: FilterSizing) -> Self {
        Self {
            inner: ScalableBloomFilter::new(
                sizing.initial_bits(),
                sizing.false_positive_rate,
                GROWTH_RATIO,
                TIGHTENING_RATIO,
            ),
            sizing,
            insertions: 0,
        }
    }

    pub fn might_contain(&self, key: &str) -> bool {
        self.inner.contains(key)
    }

    /// Insert a key, returning `(old_capacity, new_capacity)` if the chain
    /// grew to make room.
    pub fn insert(&mut self, key: &str) -> Option<(u64, u64)> {
        if self.inner.contains(key) {
            return None;
        }
        let before = self.inner.filter_count();
        self.inner.insert(key);
        self.insertions += 1;

        let after = self.inner.filter_count();
        (after > before).then(|| (self.capacity_of(before), self.capacity_of(after)))
    }

    fn capacity_of(&self, slices: usize) -> u64 {
        let base = self.sizing.expected_insertions as f64;
        let nominal: f64 = (0..slices).map(|i| base * GROWTH_RATIO.powi(i as i32)).sum();
        nominal as u64
    }

    pub fn stats(&self) -> FilterStats {
        let slices = self.inner.filter_count();
        FilterStats {
            slices,
            insertions: self.insertions,
            capacity: self.capacity_of(slices),
            bits: self.inner.len() as u64,
        }
    }
}

type SharedFilter = Arc<RwLock<CacheBloomFilter>>;

struct FilterRegistry {
    sizing: DashMap<String, FilterSizing>,
    filters: DashMap<String, SharedFilter>,
    metrics: Option<Arc<dyn CacheMetrics>>,
}

impl FilterRegistry {
    fn filter_for(&self, cache: &str) -> SharedFilter {
        if let Some(filter) = self.filters.get(cache) {
            return Arc::clone(&filter);
        }
        let sizing = self
            .sizing
            .get(cache)
            .map(|s| *s)
            .unwrap_or_default();
        let filter = self.filters.entry(cache.to_owned()).or_insert_with(|| {
            debug!(
                "Creating bloom filter for cache {} ({} expected insertions, fpp {})",
                cache, sizing.expected_insertions, sizing.false_positive_rate
            );
            Arc::new(RwLock::new(CacheBloomFilter::new(sizing)))
        });
        Arc::clone(&filter)
    }

    fn insert(&self, cache: &str, key: &str) {
        let filter = self.filter_for(cache);
        let grown = {
            let mut guard = match filter.write() {
                Ok(guard) => guard,
                Err(poisoned) => {
                    warn!("Bloom filter lock for cache {} was poisoned, recovering", cache);
                    poisoned.into_inner()
                }
            };
            guard.insert(key)
        };

        if let Some((old_capacity, new_capacity)) = grown {
            info!(
                "Bloom filter for cache {} grew from {} to {} expected insertions",
                cache, old_capacity, new_capacity
            );
            if let Some(metrics) = &self.metrics {
                metrics.record_filter_resize(cache, old_capacity, new_capacity);
            }
        }
    }
}

/// Probabilistic "might contain" oracle for every cache name of one manager
pub struct MembershipFilter {
    registry: Arc<FilterRegistry>,
    queue: Arc<BackgroundQueue>,
}

impl MembershipFilter {
    pub fn new(queue: Arc<BackgroundQueue>, metrics: Option<Arc<dyn CacheMetrics>>) -> Self {
        Self {
            registry: Arc::new(FilterRegistry {
                sizing: DashMap::new(),
                filters: DashMap::new(),
                metrics,
            }),
            queue,
        }
    }

    /// Set the first-slice sizing used when the cache's filter is created
    pub fn register(&self, cache: &str, sizing: FilterSizing) {
        self.registry.sizing.insert(cache.to_owned(), sizing);
    }

    /// `false` only if the key was definitely never inserted
    pub fn might_contain(&self, cache: &str, key: &str) -> bool {
        let Some(filter) = self.registry.filters.get(cache).map(|f| Arc::clone(&f)) else {
            return true;
        };
        match filter.read() {
            Ok(guard) => guard.might_contain(key),
            Err(_) => {
                warn!("Bloom filter for cache {} is unavailable, failing open", cache);
                true
            }
        }
    }

    /// Insert synchronously on the calling task
    pub fn insert(&self, cache: &str, key: &str) {
        self.registry.insert(cache, key);
    }

    /// Queue the insertion on the background queue. Returns whether the
    /// job was accepted.
    pub async fn insert_async(&self, cache: &str, key: &str) -> Result<bool> {
        let label = format!("bloom insert {cache}");
        let registry = Arc::clone(&self.registry);
        let (cache, key) = (cache.to_owned(), key.to_owned());
        self.queue
            .submit(&label, async move {
                registry.insert(&cache, &key);
            })
            .await
    }

    pub fn stats(&self, cache: &str) -> Option<FilterStats> {
        let filter = self.registry.filters.get(cache).map(|f| Arc::clone(&f))?;
        let guard = filter.read().ok()?;
        Some(guard.stats())
    }

    /// Drop the cache's filter; the next insertion starts a fresh one
    pub fn clear(&self, cache: &str) {
        if self.registry.filters.remove(cache).is_some() {
            debug!("Cleared bloom filter for cache {}", cache);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AtomicCacheMetrics, Backpressure};

    fn sizing(expected_insertions: u64, false_positive_rate: f64) -> FilterSizing {
        FilterSizing {
            expected_insertions,
            false_positive_rate,
        }
    }

    #[test]
    fn test_no_false_negatives_across_growth() {
        let mut filter = CacheBloomFilter::new(sizing(100, 0.01));
        let mut resizes = 0;
        for i in 0..1000 {
            if filter.insert(&format!("key-{i}")).is_some() {
                resizes += 1;
            }
        }

        for i in 0..1000 {
            assert!(filter.might_contain(&format!("key-{i}")), "lost key-{i}");
        }
        let stats = filter.stats();
        assert!(stats.slices > 1);
        assert_eq!(stats.slices - 1, resizes);
        assert_eq!(stats.insertions, 1000);
        assert!(stats.bits > sizing(100, 0.01).initial_bits() as u64);
    }

    #[test]
    fn test_false_positive_rate_is_bounded() {
        let mut filter = CacheBloomFilter::new(sizing(1000, 0.01));
        for i in 0..1000 {
            filter.insert(&format!("present-{i}"));
        }
        let false_positives = (0..10_000)
            .filter(|i| filter.might_contain(&format!("absent-{i}")))
            .count();
        assert!(false_positives < 300, "{false_positives} false positives");
    }

    #[test]
    fn test_duplicate_inserts_do_not_count() {
        let mut filter = CacheBloomFilter::new(sizing(10, 0.01));
        for _ in 0..50 {
            filter.insert("same");
        }
        assert_eq!(filter.stats().insertions, 1);
        assert_eq!(filter.stats().slices, 1);
    }

    #[tokio::test]
    async fn test_fails_open_without_filter() {
        let queue = Arc::new(BackgroundQueue::new(16, 1, Backpressure::Block));
        let filter = MembershipFilter::new(queue, None);
        assert!(filter.might_contain("users", "anything"));
        assert!(filter.stats("users").is_none());
    }

    #[tokio::test]
    async fn test_fails_open_on_poisoned_lock() {
        let queue = Arc::new(BackgroundQueue::new(16, 1, Backpressure::Block));
        let filter = MembershipFilter::new(queue, None);
        filter.register("users", sizing(1000, 1e-6));
        filter.insert("users", "known");
        assert!(!filter.might_contain("users", "unknown"));

        let shared = filter.registry.filter_for("users");
        let poisoner = Arc::clone(&shared);
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.write().unwrap();
            panic!("poison the filter lock");
        })
        .join();
        assert!(shared.is_poisoned());

        assert!(filter.might_contain("users", "unknown"));
        assert!(filter.might_contain("users", "known"));
    }

    #[tokio::test]
    async fn test_insert_async_and_clear() {
        let queue = Arc::new(BackgroundQueue::new(16, 2, Backpressure::Block));
        let metrics = Arc::new(AtomicCacheMetrics::new());
        let filter = MembershipFilter::new(Arc::clone(&queue), Some(metrics.clone() as Arc<dyn CacheMetrics>));
        filter.register("users", sizing(4, 0.01));

        for i in 0..20 {
            assert!(filter.insert_async("users", &format!("u{i}")).await.unwrap());
        }
        queue.shutdown().await;

        for i in 0..20 {
            assert!(filter.might_contain("users", &format!("u{i}")));
        }
        let stats = filter.stats("users").unwrap();
        assert!(stats.slices > 1);
        assert_eq!(
            metrics.snapshot("users").filter_resizes,
            (stats.slices - 1) as u64
        );

        filter.clear("users");
        assert!(filter.stats("users").is_none());
        assert!(filter.might_contain("users", "u1"));
    }

    #[tokio::test]
    async fn test_filters_are_per_cache() {
        let queue = Arc::new(BackgroundQueue::new(16, 1, Backpressure::Block));
        let filter = MembershipFilter::new(queue, None);
        filter.register("a", sizing(1000, 1e-6));
        filter.register("b", sizing(1000, 1e-6));
        filter.insert("a", "k1");
        filter.insert("b", "k2");

        assert!(filter.might_contain("a", "k1"));
        assert!(!filter.might_contain("a", "k2"));
        assert!(filter.might_contain("b", "k2"));
        assert!(!filter.might_contain("b", "k1"));
    }
}
