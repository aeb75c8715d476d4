//! Duplicate-suppressing loader
//!
//! Concurrent callers asking for the same key share one in-flight load: the
//! first caller (the leader) runs the loader, everyone else waits on a
//! `watch` channel for its outcome. The per-key record lives exactly as long
//! as one load; failures are handed to every waiter and never cached, so the
//! next call runs the loader again.

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::watch;
use tracing::{debug, trace};

use crate::{CacheError, Result};

type Outcome<T> = Option<Result<T>>;
type InFlightLoad<T> = watch::Receiver<Outcome<T>>;
type InFlightSender<T> = watch::Sender<Outcome<T>>;
type InFlightMap<T> = Arc<DashMap<String, InFlightLoad<T>>>;

/// Guard that ensures in-flight entries are cleaned up even on panic/cancel.
///
/// When dropped without [`complete`](Self::complete), waiters are told the
/// load was aborted.
struct InFlightGuard<T: Clone> {
    key: String,
    in_flight: InFlightMap<T>,
    tx: Option<InFlightSender<T>>,
}

impl<T: Clone> InFlightGuard<T> {
    fn new(key: String, in_flight: InFlightMap<T>, tx: InFlightSender<T>) -> Self {
        Self {
            key,
            in_flight,
            tx: Some(tx),
        }
    }

    /// Publish the result to waiters, consuming the guard.
    fn complete(mut self, result: Result<T>) {
        if let Some(tx) = self.tx.take() {
            self.finish(tx, result);
        }
    }

    fn finish(&self, tx: InFlightSender<T>, result: Result<T>) {
        // Unregister before notifying so a late caller starts a fresh load
        // instead of reading a finished record
        let rx = tx.subscribe();
        self.in_flight
            .remove_if(&self.key, |_, existing| existing.same_channel(&rx));
        let _ = tx.send(Some(result));
    }
}

impl<T: Clone> Drop for InFlightGuard<T> {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            debug!("In-flight load for key {} was cancelled or panicked", self.key);
            self.finish(tx, Err(CacheError::LoadAborted(self.key.clone())));
        }
    }
}

/// Per-key duplicate suppression for loader-based reads
pub struct SingleFlightLoader<T> {
    in_flight: InFlightMap<T>,
}

impl<T> Default for SingleFlightLoader<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SingleFlightLoader<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            in_flight: Arc::new(DashMap::new()),
        }
    }

    /// Run `loader` for `key` unless a load for the same key is already in
    /// flight, in which case wait for and return that load's outcome.
    pub async fn load<F, Fut>(&self, key: &str, loader: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if key.is_empty() {
            return Err(CacheError::invalid("key must not be empty"));
        }

        let (tx, rx) = watch::channel(None);
        let existing = match self.in_flight.entry(key.to_owned()) {
            Entry::Occupied(entry) => Some(entry.get().clone()),
            Entry::Vacant(entry) => {
                entry.insert(rx);
                None
            }
        };

        if let Some(rx) = existing {
            trace!("Waiting for in-flight load for key: {}", key);
            return Self::wait(key, rx).await;
        }

        let guard = InFlightGuard::new(key.to_owned(), Arc::clone(&self.in_flight), tx);
        let result = loader().await;
        guard.complete(result.clone());
        result
    }

    async fn wait(key: &str, mut rx: InFlightLoad<T>) -> Result<T> {
        loop {
            if let Some(result) = rx.borrow_and_update().as_ref() {
                return result.clone();
            }
            if rx.changed().await.is_err() {
                // Sender dropped without sending
                return Err(CacheError::LoadAborted(key.to_owned()));
            }
        }
    }

    /// Number of keys with a load currently in flight
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};
    use tokio::task::JoinSet;

    #[tokio::test]
    async fn test_concurrent_callers_share_one_load() {
        let loader = Arc::new(SingleFlightLoader::<i32>::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let started = Instant::now();

        let mut join_set = JoinSet::new();
        for _ in 0..50 {
            let loader = Arc::clone(&loader);
            let calls = Arc::clone(&calls);
            join_set.spawn(async move {
                loader
                    .load("hot", || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Ok(42)
                    })
                    .await
            });
        }

        while let Some(result) = join_set.join_next().await {
            assert_eq!(result.unwrap().unwrap(), 42);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(loader.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn test_error_is_shared_and_not_cached() {
        let loader = Arc::new(SingleFlightLoader::<i32>::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut join_set = JoinSet::new();
        for _ in 0..10 {
            let loader = Arc::clone(&loader);
            let calls = Arc::clone(&calls);
            join_set.spawn(async move {
                loader
                    .load("k", || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Err(CacheError::loader("backing store down"))
                    })
                    .await
            });
        }

        while let Some(result) = join_set.join_next().await {
            let err = result.unwrap().unwrap_err();
            assert_eq!(err.to_string(), "Loader error: backing store down");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // the failure is not remembered
        let value = loader.load("k", || async { Ok(7) }).await.unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_distinct_keys_load_independently() {
        let loader = Arc::new(SingleFlightLoader::<String>::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut join_set = JoinSet::new();
        for i in 0..5 {
            let loader = Arc::clone(&loader);
            let calls = Arc::clone(&calls);
            join_set.spawn(async move {
                let key = format!("k{i}");
                loader
                    .load(&key, || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok(format!("v{i}"))
                    })
                    .await
            });
        }
        while join_set.join_next().await.is_some() {}
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_cancelled_leader_releases_waiters() {
        let loader = Arc::new(SingleFlightLoader::<i32>::new());

        let leader = {
            let loader = Arc::clone(&loader);
            tokio::spawn(async move {
                loader
                    .load("slow", || async {
                        tokio::time::sleep(Duration::from_secs(30)).await;
                        Ok(1)
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let waiter = {
            let loader = Arc::clone(&loader);
            tokio::spawn(async move { loader.load("slow", || async { Ok(2) }).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        leader.abort();
        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, CacheError::LoadAborted(ref k) if k == "slow"));
        assert_eq!(loader.in_flight_count(), 0);

        // next caller becomes a new leader
        assert_eq!(loader.load("slow", || async { Ok(3) }).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_empty_key_rejected() {
        let loader = SingleFlightLoader::<i32>::new();
        let err = loader.load("", || async { Ok(1) }).await.unwrap_err();
        assert!(err.is_argument_error());
    }
}
