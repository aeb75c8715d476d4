//! Cache metrics sinks
//!
//! The orchestrator reports through an optional `Arc<dyn CacheMetrics>`;
//! when none is configured nothing is recorded. Two sinks are provided:
//! [`AtomicCacheMetrics`] keeps in-process counters per cache name, and
//! [`RecorderMetrics`] forwards to whatever `metrics` recorder the host
//! application installed.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

/// Layer that answered a lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HitLevel {
    L1,
    L2,
}

impl HitLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            HitLevel::L1 => "L1",
            HitLevel::L2 => "L2",
        }
    }
}

impl fmt::Display for HitLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fire-and-forget metrics sink
pub trait CacheMetrics: Send + Sync {
    fn record_hit(&self, cache: &str, level: HitLevel);

    fn record_miss(&self, cache: &str);

    /// The membership filter predicted the key is absent
    fn record_filter_filtered(&self, cache: &str);

    /// The filter predicted absence but L2 had the key
    fn record_filter_false_positive(&self, cache: &str);

    fn record_latency(&self, cache: &str, level: HitLevel, nanos: u64);

    fn record_key_access(&self, cache: &str, key: &str);

    fn record_refill(&self, _cache: &str, _success: bool) {}

    /// A membership filter grew a new slice
    fn record_filter_resize(&self, _cache: &str, _old_capacity: u64, _new_capacity: u64) {}
}

#[derive(Default)]
struct CacheCounters {
    l1_hits: AtomicU64,
    l2_hits: AtomicU64,
    misses: AtomicU64,
    filter_filtered: AtomicU64,
    filter_false_positives: AtomicU64,
    refill_successes: AtomicU64,
    refill_failures: AtomicU64,
    filter_resizes: AtomicU64,
    l1_lookups: AtomicU64,
    l1_latency_nanos: AtomicU64,
    l2_lookups: AtomicU64,
    l2_latency_nanos: AtomicU64,
}

/// Point-in-time copy of one cache's counters
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricsSnapshot {
    pub l1_hits: u64,
    pub l2_hits: u64,
    pub misses: u64,
    pub filter_filtered: u64,
    pub filter_false_positives: u64,
    pub refill_successes: u64,
    pub refill_failures: u64,
    pub filter_resizes: u64,
    pub l1_lookups: u64,
    pub l1_latency_nanos: u64,
    pub l2_lookups: u64,
    pub l2_latency_nanos: u64,
}

impl MetricsSnapshot {
    /// Hits over total lookups, 0.0 when nothing was looked up
    pub fn hit_rate(&self) -> f64 {
        let hits = (self.l1_hits + self.l2_hits) as f64;
        let total = hits + self.misses as f64;
        if total == 0.0 { 0.0 } else { hits / total }
    }

    pub fn average_latency_nanos(&self, level: HitLevel) -> u64 {
        let (lookups, total) = match level {
            HitLevel::L1 => (self.l1_lookups, self.l1_latency_nanos),
            HitLevel::L2 => (self.l2_lookups, self.l2_latency_nanos),
        };
        total.checked_div(lookups).unwrap_or(0)
    }
}

/// In-process counters keyed by cache name.
///
/// Per-key access counts stop admitting new keys once `max_tracked_keys`
/// distinct keys are tracked for a cache; existing keys keep counting.
pub struct AtomicCacheMetrics {
    caches: DashMap<String, CacheCounters>,
    key_accesses: DashMap<String, DashMap<String, AtomicU64>>,
    max_tracked_keys: usize,
}

impl Default for AtomicCacheMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl AtomicCacheMetrics {
    pub fn new() -> Self {
        Self::with_max_tracked_keys(10_000)
    }

    pub fn with_max_tracked_keys(max_tracked_keys: usize) -> Self {
        Self {
            caches: DashMap::new(),
            key_accesses: DashMap::new(),
            max_tracked_keys,
        }
    }

    fn with_counters(&self, cache: &str, f: impl FnOnce(&CacheCounters)) {
        if let Some(counters) = self.caches.get(cache) {
            f(&counters);
            return;
        }
        let counters = self.caches.entry(cache.to_owned()).or_default();
        f(&counters);
    }

    pub fn snapshot(&self, cache: &str) -> MetricsSnapshot {
        let Some(c) = self.caches.get(cache) else {
            return MetricsSnapshot::default();
        };
        MetricsSnapshot {
            l1_hits: c.l1_hits.load(Ordering::Relaxed),
            l2_hits: c.l2_hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            filter_filtered: c.filter_filtered.load(Ordering::Relaxed),
            filter_false_positives: c.filter_false_positives.load(Ordering::Relaxed),
            refill_successes: c.refill_successes.load(Ordering::Relaxed),
            refill_failures: c.refill_failures.load(Ordering::Relaxed),
            filter_resizes: c.filter_resizes.load(Ordering::Relaxed),
            l1_lookups: c.l1_lookups.load(Ordering::Relaxed),
            l1_latency_nanos: c.l1_latency_nanos.load(Ordering::Relaxed),
            l2_lookups: c.l2_lookups.load(Ordering::Relaxed),
            l2_latency_nanos: c.l2_latency_nanos.load(Ordering::Relaxed),
        }
    }

    pub fn hit_rate(&self, cache: &str) -> f64 {
        self.snapshot(cache).hit_rate()
    }

    /// Access count for one key
    pub fn key_accesses(&self, cache: &str, key: &str) -> u64 {
        self.key_accesses
            .get(cache)
            .and_then(|keys| keys.get(key).map(|n| n.load(Ordering::Relaxed)))
            .unwrap_or(0)
    }

    /// The `n` most accessed keys, most accessed first
    pub fn hot_keys(&self, cache: &str, n: usize) -> Vec<(String, u64)> {
        let Some(keys) = self.key_accesses.get(cache) else {
            return Vec::new();
        };
        let mut counts: Vec<(String, u64)> = keys
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().load(Ordering::Relaxed)))
            .collect();
        counts.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        counts.truncate(n);
        counts
    }

    /// Snapshots of every cache seen so far
    pub fn snapshot_all(&self) -> HashMap<String, MetricsSnapshot> {
        let names: Vec<String> = self.caches.iter().map(|e| e.key().clone()).collect();
        names
            .into_iter()
            .map(|name| {
                let snapshot = self.snapshot(&name);
                (name, snapshot)
            })
            .collect()
    }
}

impl CacheMetrics for AtomicCacheMetrics {
    fn record_hit(&self, cache: &str, level: HitLevel) {
        self.with_counters(cache, |c| {
            match level {
                HitLevel::L1 => c.l1_hits.fetch_add(1, Ordering::Relaxed),
                HitLevel::L2 => c.l2_hits.fetch_add(1, Ordering::Relaxed),
            };
        });
    }

    fn record_miss(&self, cache: &str) {
        self.with_counters(cache, |c| {
            c.misses.fetch_add(1, Ordering::Relaxed);
        });
    }

    fn record_filter_filtered(&self, cache: &str) {
        self.with_counters(cache, |c| {
            c.filter_filtered.fetch_add(1, Ordering::Relaxed);
        });
    }

    fn record_filter_false_positive(&self, cache: &str) {
        self.with_counters(cache, |c| {
            c.filter_false_positives.fetch_add(1, Ordering::Relaxed);
        });
    }

    fn record_latency(&self, cache: &str, level: HitLevel, nanos: u64) {
        self.with_counters(cache, |c| {
            let (lookups, total) = match level {
                HitLevel::L1 => (&c.l1_lookups, &c.l1_latency_nanos),
                HitLevel::L2 => (&c.l2_lookups, &c.l2_latency_nanos),
            };
            lookups.fetch_add(1, Ordering::Relaxed);
            total.fetch_add(nanos, Ordering::Relaxed);
        });
    }

    fn record_key_access(&self, cache: &str, key: &str) {
        let keys = self.key_accesses.entry(cache.to_owned()).or_default();
        if let Some(count) = keys.get(key) {
            count.fetch_add(1, Ordering::Relaxed);
            return;
        }
        if keys.len() < self.max_tracked_keys {
            keys.entry(key.to_owned())
                .or_default()
                .fetch_add(1, Ordering::Relaxed);
        }
    }

    fn record_refill(&self, cache: &str, success: bool) {
        self.with_counters(cache, |c| {
            if success {
                c.refill_successes.fetch_add(1, Ordering::Relaxed);
            } else {
                c.refill_failures.fetch_add(1, Ordering::Relaxed);
            }
        });
    }

    fn record_filter_resize(&self, cache: &str, _old_capacity: u64, _new_capacity: u64) {
        self.with_counters(cache, |c| {
            c.filter_resizes.fetch_add(1, Ordering::Relaxed);
        });
    }
}

/// Forwards to the global `metrics` recorder.
///
/// Per-key accesses are counted per cache only, so key names never become
/// label values.
#[derive(Debug, Clone, Default)]
pub struct RecorderMetrics;

impl CacheMetrics for RecorderMetrics {
    fn record_hit(&self, cache: &str, level: HitLevel) {
        metrics::counter!("cache_hits_total", "cache" => cache.to_owned(), "level" => level.as_str())
            .increment(1);
    }

    fn record_miss(&self, cache: &str) {
        metrics::counter!("cache_misses_total", "cache" => cache.to_owned()).increment(1);
    }

    fn record_filter_filtered(&self, cache: &str) {
        metrics::counter!("cache_bloom_filtered_total", "cache" => cache.to_owned()).increment(1);
    }

    fn record_filter_false_positive(&self, cache: &str) {
        metrics::counter!("cache_bloom_false_positives_total", "cache" => cache.to_owned())
            .increment(1);
    }

    fn record_latency(&self, cache: &str, level: HitLevel, nanos: u64) {
        metrics::histogram!(
            "cache_lookup_duration_seconds",
            "cache" => cache.to_owned(),
            "level" => level.as_str()
        )
        .record(nanos as f64 / 1e9);
    }

    fn record_key_access(&self, cache: &str, _key: &str) {
        metrics::counter!("cache_key_accesses_total", "cache" => cache.to_owned()).increment(1);
    }

    fn record_refill(&self, cache: &str, success: bool) {
        let outcome = if success { "success" } else { "failure" };
        metrics::counter!("cache_refills_total", "cache" => cache.to_owned(), "outcome" => outcome)
            .increment(1);
    }

    fn record_filter_resize(&self, cache: &str, _old_capacity: u64, new_capacity: u64) {
        metrics::counter!("cache_bloom_resizes_total", "cache" => cache.to_owned()).increment(1);
        metrics::gauge!("cache_bloom_capacity", "cache" => cache.to_owned()).set(new_capacity as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_are_per_cache() {
        let metrics = AtomicCacheMetrics::new();
        metrics.record_hit("users", HitLevel::L1);
        metrics.record_hit("users", HitLevel::L2);
        metrics.record_miss("users");
        metrics.record_miss("orders");

        let users = metrics.snapshot("users");
        assert_eq!(users.l1_hits, 1);
        assert_eq!(users.l2_hits, 1);
        assert_eq!(users.misses, 1);
        assert!((users.hit_rate() - 2.0 / 3.0).abs() < 1e-9);

        assert_eq!(metrics.snapshot("orders").misses, 1);
        assert_eq!(metrics.hit_rate("unknown"), 0.0);
        assert_eq!(metrics.snapshot_all().len(), 2);
    }

    #[test]
    fn test_latency_average() {
        let metrics = AtomicCacheMetrics::new();
        metrics.record_latency("c", HitLevel::L2, 100);
        metrics.record_latency("c", HitLevel::L2, 300);

        let snapshot = metrics.snapshot("c");
        assert_eq!(snapshot.average_latency_nanos(HitLevel::L2), 200);
        assert_eq!(snapshot.average_latency_nanos(HitLevel::L1), 0);
    }

    #[test]
    fn test_hot_keys_and_tracking_limit() {
        let metrics = AtomicCacheMetrics::with_max_tracked_keys(2);
        for _ in 0..3 {
            metrics.record_key_access("c", "a");
        }
        metrics.record_key_access("c", "b");
        // not admitted, limit reached
        metrics.record_key_access("c", "z");

        assert_eq!(
            metrics.hot_keys("c", 10),
            vec![("a".to_owned(), 3), ("b".to_owned(), 1)]
        );
        assert_eq!(metrics.key_accesses("c", "z"), 0);
        assert_eq!(metrics.hot_keys("c", 1).len(), 1);
    }

    #[test]
    fn test_refill_and_resize_counters() {
        let metrics = AtomicCacheMetrics::new();
        metrics.record_refill("c", true);
        metrics.record_refill("c", false);
        metrics.record_filter_resize("c", 100, 200);
        metrics.record_filter_filtered("c");
        metrics.record_filter_false_positive("c");

        let snapshot = metrics.snapshot("c");
        assert_eq!(snapshot.refill_successes, 1);
        assert_eq!(snapshot.refill_failures, 1);
        assert_eq!(snapshot.filter_resizes, 1);
        assert_eq!(snapshot.filter_filtered, 1);
        assert_eq!(snapshot.filter_false_positives, 1);
    }

    #[test]
    fn test_recorder_metrics_without_recorder_is_noop() {
        let metrics = RecorderMetrics;
        metrics.record_hit("c", HitLevel::L1);
        metrics.record_latency("c", HitLevel::L2, 1_000);
        metrics.record_filter_resize("c", 1, 2);
    }
}
