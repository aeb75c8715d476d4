use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tiercache::{
    AtomicCacheMetrics, CacheError, CacheManager, CacheSpecification, CacheStore, CachedValue,
    Cacheable, ConsistencyLevel, InvalidationMessage, MokaLocalCache, OrchestratorConfig, Result,
    async_trait,
};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Shared store standing in for Redis, with an outage switch
struct SharedStore<V> {
    entries: Mutex<HashMap<String, CachedValue<V>>>,
    down: AtomicBool,
}

impl<V> SharedStore<V> {
    fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            down: AtomicBool::new(false),
        }
    }

    fn check(&self, operation: &'static str) -> Result<()> {
        if self.down.load(Ordering::SeqCst) {
            return Err(CacheError::backend("L2", operation, "connection reset by peer"));
        }
        Ok(())
    }
}

#[async_trait]
impl<V: Cacheable> CacheStore<V> for SharedStore<V> {
    fn layer(&self) -> &'static str {
        "L2"
    }

    async fn get(&self, key: &str) -> Result<Option<CachedValue<V>>> {
        self.check("get")?;
        Ok(self.entries.lock().unwrap().get(key).cloned())
    }

    async fn put(&self, key: &str, value: CachedValue<V>, _ttl: Duration) -> Result<()> {
        self.check("put")?;
        self.entries.lock().unwrap().insert(key.to_owned(), value);
        Ok(())
    }

    async fn evict(&self, key: &str) -> Result<()> {
        self.check("evict")?;
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.check("clear")?;
        self.entries.lock().unwrap().clear();
        Ok(())
    }
}

fn spec() -> CacheSpecification {
    CacheSpecification::new(Duration::from_secs(60))
        .with_local_ttl(Duration::from_secs(10))
        .with_bloom_filter(true)
        .with_bloom_sizing(1_000, 0.01)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_nodes_share_l2_and_invalidate_l1() {
    init_tracing();
    let shared = Arc::new(SharedStore::<String>::new());

    let node_a = CacheManager::new(OrchestratorConfig::default().with_node_id("node-a"));
    let metrics_b = Arc::new(AtomicCacheMetrics::new());
    let node_b = CacheManager::with_metrics(
        OrchestratorConfig::default().with_node_id("node-b"),
        metrics_b.clone(),
    );
    let cache_a = node_a
        .register::<String>("users", spec(), Arc::new(MokaLocalCache::<String>::new(100)), shared.clone())
        .unwrap();
    let cache_b = node_b
        .register::<String>("users", spec(), Arc::new(MokaLocalCache::<String>::new(100)), shared.clone())
        .unwrap();

    cache_a
        .put_default("u1", CachedValue::Present("Ada".to_owned()))
        .await
        .unwrap();
    // node b reads through L2 and keeps a local copy
    assert_eq!(
        cache_b.get("u1").await.unwrap(),
        Some(CachedValue::Present("Ada".to_owned()))
    );
    for _ in 0..100 {
        if metrics_b.snapshot("users").refill_successes == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(metrics_b.snapshot("users").refill_successes, 1);

    cache_a
        .put("u1", CachedValue::Present("Ada L.".to_owned()), Duration::from_secs(60), ConsistencyLevel::Strong)
        .await
        .unwrap();
    node_b
        .apply_invalidation(&InvalidationMessage::key("users", "u1", "node-a"))
        .await;
    assert_eq!(
        cache_b.get("u1").await.unwrap(),
        Some(CachedValue::Present("Ada L.".to_owned()))
    );

    node_a.shutdown().await;
    node_b.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_read_through_survives_l2_outage() {
    init_tracing();
    let shared = Arc::new(SharedStore::<u64>::new());
    let metrics = Arc::new(AtomicCacheMetrics::new());
    let manager = CacheManager::with_metrics(OrchestratorConfig::default(), metrics.clone());
    let cache = manager
        .register::<u64>("scores", spec(), Arc::new(MokaLocalCache::<u64>::new(100)), shared.clone())
        .unwrap();

    let loads = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::new();
    for _ in 0..16 {
        let cache = cache.clone();
        let loads = Arc::clone(&loads);
        handles.push(tokio::spawn(async move {
            cache
                .get_with("top", move || async move {
                    loads.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok::<_, CacheError>(Some(9000))
                })
                .await
        }));
    }
    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap(), Some(9000));
    }
    assert_eq!(loads.load(Ordering::SeqCst), 1);

    shared.down.store(true, Ordering::SeqCst);
    assert_eq!(cache.get("top").await.unwrap(), Some(CachedValue::Present(9000)));
    cache
        .put_default("new", CachedValue::Present(1))
        .await
        .unwrap();
    assert_eq!(cache.get("new").await.unwrap(), Some(CachedValue::Present(1)));

    let snapshot = metrics.snapshot("scores");
    assert!(snapshot.l1_hits >= 2);
    manager.shutdown().await;
}
