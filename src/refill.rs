//! Asynchronous L1 repopulation after L2 hits
//!
//! A refill is queued on the [`BackgroundQueue`] and never awaited by the
//! reader. Concurrent L2 hits for the same cold key collapse into one job:
//! a pending marker per `(cache, key)` lives from submission until the job
//! finishes or is dropped by backpressure.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashSet;
use tracing::{debug, trace, warn};

use crate::{BackgroundQueue, CacheMetrics, CacheStore, CachedValue, Cacheable, Result};

type PendingSet = Arc<DashSet<(String, String)>>;

/// Clears the pending marker however the job ends
struct PendingRefill {
    pending: PendingSet,
    id: (String, String),
}

impl Drop for PendingRefill {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

pub struct RefillCoordinator {
    pending: PendingSet,
    queue: Arc<BackgroundQueue>,
    metrics: Option<Arc<dyn CacheMetrics>>,
}

impl RefillCoordinator {
    pub fn new(queue: Arc<BackgroundQueue>, metrics: Option<Arc<dyn CacheMetrics>>) -> Self {
        Self {
            pending: Arc::new(DashSet::new()),
            queue,
            metrics,
        }
    }

    /// Queue a write of `value` into `l1` with `local_ttl`.
    ///
    /// Returns `Ok(false)` when an identical refill is already pending or
    /// the queue dropped the job.
    pub async fn refill<V: Cacheable>(
        &self,
        cache: &str,
        key: &str,
        value: CachedValue<V>,
        l1: Arc<dyn CacheStore<V>>,
        local_ttl: Duration,
    ) -> Result<bool> {
        let id = (cache.to_owned(), key.to_owned());
        if !self.pending.insert(id.clone()) {
            trace!("Refill already pending for cache {} key {}", cache, key);
            return Ok(false);
        }
        let marker = PendingRefill {
            pending: Arc::clone(&self.pending),
            id,
        };

        let metrics = self.metrics.clone();
        let label = format!("refill {cache}::{key}");
        let (cache, key) = (cache.to_owned(), key.to_owned());

        self.queue
            .submit(&label, async move {
                let _marker = marker;
                let success = match l1.put(&key, value, local_ttl).await {
                    Ok(()) => {
                        debug!("Refilled L1 for cache {} key {}", cache, key);
                        true
                    }
                    Err(e) => {
                        warn!("L1 refill failed for cache {} key {}: {}", cache, key, e);
                        false
                    }
                };
                if let Some(metrics) = &metrics {
                    metrics.record_refill(&cache, success);
                }
            })
            .await
    }

    /// Number of refills queued or running
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::mock::MockStore;
    use crate::{AtomicCacheMetrics, Backpressure};
    use tokio::sync::Semaphore;

    fn setup(
        capacity: usize,
        backpressure: Backpressure,
    ) -> (Arc<BackgroundQueue>, Arc<AtomicCacheMetrics>, RefillCoordinator) {
        let queue = Arc::new(BackgroundQueue::new(capacity, 1, backpressure));
        let metrics = Arc::new(AtomicCacheMetrics::new());
        let refill = RefillCoordinator::new(
            Arc::clone(&queue),
            Some(metrics.clone() as Arc<dyn CacheMetrics>),
        );
        (queue, metrics, refill)
    }

    fn mock_l1<V: Cacheable>() -> (Arc<MockStore<V>>, Arc<dyn CacheStore<V>>) {
        let store = Arc::new(MockStore::new("L1"));
        let handle: Arc<dyn CacheStore<V>> = store.clone();
        (store, handle)
    }

    /// Park the single worker until the returned semaphore gets a permit
    async fn occupy_worker(queue: &BackgroundQueue) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        let held = Arc::clone(&gate);
        queue
            .submit("gate", async move {
                let _ = held.acquire().await;
            })
            .await
            .unwrap();
        // let the dispatcher pick the gate job up
        tokio::time::sleep(Duration::from_millis(20)).await;
        gate
    }

    #[tokio::test]
    async fn test_refill_writes_l1_with_local_ttl() {
        let (queue, metrics, refill) = setup(16, Backpressure::Block);
        let (l1, handle) = mock_l1::<String>();

        let queued = refill
            .refill(
                "users",
                "u1",
                CachedValue::Present("Ada".to_owned()),
                handle,
                Duration::from_secs(30),
            )
            .await
            .unwrap();
        assert!(queued);

        queue.shutdown().await;
        assert_eq!(l1.peek("u1"), Some(CachedValue::Present("Ada".to_owned())));
        assert_eq!(l1.ttl_of("u1"), Some(Duration::from_secs(30)));
        assert_eq!(metrics.snapshot("users").refill_successes, 1);
        assert_eq!(refill.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_refills_for_same_key_collapse() {
        let (queue, _metrics, refill) = setup(16, Backpressure::DropAndLog);
        let gate = occupy_worker(&queue).await;
        let (l1, handle) = mock_l1::<i32>();

        let mut queued = 0;
        for _ in 0..5 {
            if refill
                .refill("c", "cold", CachedValue::Present(1), handle.clone(), Duration::from_secs(5))
                .await
                .unwrap()
            {
                queued += 1;
            }
        }
        // a different key is not collapsed
        assert!(
            refill
                .refill("c", "other", CachedValue::Present(2), handle.clone(), Duration::from_secs(5))
                .await
                .unwrap()
        );
        assert_eq!(queued, 1);
        assert_eq!(refill.pending_count(), 2);

        gate.add_permits(1);
        queue.shutdown().await;
        assert_eq!(l1.put_count(), 2);
        assert_eq!(refill.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_refill_is_recorded() {
        let (queue, metrics, refill) = setup(16, Backpressure::Block);
        let (l1, handle) = mock_l1::<i32>();
        l1.fail_writes(true);

        refill
            .refill("c", "k", CachedValue::Present(1), handle.clone(), Duration::from_secs(5))
            .await
            .unwrap();
        queue.shutdown().await;

        let snapshot = metrics.snapshot("c");
        assert_eq!(snapshot.refill_failures, 1);
        assert_eq!(snapshot.refill_successes, 0);
    }

    #[tokio::test]
    async fn test_dropped_refill_clears_pending_marker() {
        let (queue, _metrics, refill) = setup(1, Backpressure::DropAndLog);
        let gate = occupy_worker(&queue).await;
        let (l1, handle) = mock_l1::<i32>();

        // fills the single queue slot
        assert!(
            refill
                .refill("c", "a", CachedValue::Present(1), handle.clone(), Duration::from_secs(5))
                .await
                .unwrap()
        );
        // dropped by backpressure
        assert!(
            !refill
                .refill("c", "b", CachedValue::Present(2), handle.clone(), Duration::from_secs(5))
                .await
                .unwrap()
        );
        assert_eq!(refill.pending_count(), 1);

        gate.add_permits(1);
        queue.shutdown().await;
        assert_eq!(l1.peek("a"), Some(CachedValue::Present(1)));
        assert_eq!(l1.peek("b"), None);
        assert_eq!(refill.pending_count(), 0);
    }
}
