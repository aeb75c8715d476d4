//! Bounded executor for fire-and-forget side effects
//!
//! Refills and bloom-filter insertions are submitted here instead of being
//! spawned ad hoc. Jobs go through a bounded queue drained by one
//! dispatcher task; each job runs on its own task under a semaphore that
//! caps how many run at once. What happens when the queue is full is
//! decided by [`Backpressure`].

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{Mutex, Semaphore, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, warn};

use crate::{Backpressure, CacheError, Result};

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Counters describing queue activity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub submitted: u64,
    pub dropped: u64,
    pub completed: u64,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    dropped: AtomicU64,
    completed: AtomicU64,
}

/// Bounded background queue; cheap to share behind an `Arc`
pub struct BackgroundQueue {
    tx: std::sync::Mutex<Option<mpsc::Sender<Job>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    backpressure: Backpressure,
    counters: Arc<Counters>,
}

impl BackgroundQueue {
    /// Start the dispatcher on the current Tokio runtime
    pub fn new(capacity: usize, concurrency: usize, backpressure: Backpressure) -> Self {
        let (tx, rx) = mpsc::channel::<Job>(capacity.max(1));
        let counters = Arc::new(Counters::default());
        let dispatcher = tokio::spawn(Self::dispatch(
            rx,
            Arc::new(Semaphore::new(concurrency.max(1))),
            Arc::clone(&counters),
        ));

        Self {
            tx: std::sync::Mutex::new(Some(tx)),
            dispatcher: Mutex::new(Some(dispatcher)),
            backpressure,
            counters,
        }
    }

    async fn dispatch(mut rx: mpsc::Receiver<Job>, permits: Arc<Semaphore>, counters: Arc<Counters>) {
        let mut running = JoinSet::new();
        while let Some(job) = rx.recv().await {
            // Reap finished jobs so the set does not grow without bound
            while running.try_join_next().is_some() {}

            let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                break;
            };
            let counters = Arc::clone(&counters);
            running.spawn(async move {
                job.await;
                counters.completed.fetch_add(1, Ordering::Relaxed);
                drop(permit);
            });
        }

        // Queue closed: let the jobs already started finish
        while let Some(joined) = running.join_next().await {
            if let Err(e) = joined {
                warn!("Background job panicked: {}", e);
            }
        }
        debug!("Background dispatcher stopped");
    }

    fn sender(&self) -> Option<mpsc::Sender<Job>> {
        match self.tx.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Queue a job. Under [`Backpressure::DropAndLog`] a full queue drops
    /// the job and returns `Ok(false)`; under [`Backpressure::Block`] this
    /// waits for room. Fails only after [`shutdown`](Self::shutdown).
    pub async fn submit<F>(&self, label: &str, job: F) -> Result<bool>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Some(tx) = self.sender() else {
            return Err(CacheError::ShutDown);
        };
        let job: Job = Box::pin(job);

        let accepted = match self.backpressure {
            Backpressure::DropAndLog => match tx.try_send(job) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!("Background queue full, dropping job: {}", label);
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => return Err(CacheError::ShutDown),
            },
            Backpressure::Block => {
                tx.send(job).await.map_err(|_| CacheError::ShutDown)?;
                true
            }
        };

        if accepted {
            self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        }
        Ok(accepted)
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
        }
    }

    /// Stop accepting jobs and wait until every queued job has run
    pub async fn shutdown(&self) {
        let tx = match self.tx.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        drop(tx);

        if let Some(handle) = self.dispatcher.lock().await.take()
            && let Err(e) = handle.await
        {
            warn!("Background dispatcher failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test]
    async fn test_jobs_run_and_shutdown_drains() {
        let queue = BackgroundQueue::new(16, 4, Backpressure::DropAndLog);
        let done = Arc::new(AtomicUsize::new(0));

        for _ in 0..10 {
            let done = Arc::clone(&done);
            let accepted = queue
                .submit("count", async move {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    done.fetch_add(1, Ordering::SeqCst);
                })
                .await
                .unwrap();
            assert!(accepted);
        }

        queue.shutdown().await;
        assert_eq!(done.load(Ordering::SeqCst), 10);
        assert_eq!(queue.stats().completed, 10);
        assert!(matches!(
            queue.submit("late", async {}).await,
            Err(CacheError::ShutDown)
        ));
    }

    #[tokio::test]
    async fn test_full_queue_drops_and_logs() {
        let queue = BackgroundQueue::new(1, 1, Backpressure::DropAndLog);
        let gate = Arc::new(Semaphore::new(0));

        // Occupy the single worker, then fill the single queue slot
        let mut accepted = 0;
        for _ in 0..10 {
            let gate = Arc::clone(&gate);
            if queue
                .submit("blocked", async move {
                    let _ = gate.acquire().await;
                })
                .await
                .unwrap()
            {
                accepted += 1;
            }
        }

        let stats = queue.stats();
        assert!(stats.dropped > 0);
        assert_eq!(stats.submitted, accepted);
        assert_eq!(stats.submitted + stats.dropped, 10);

        gate.add_permits(100);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_block_policy_waits_for_room() {
        let queue = Arc::new(BackgroundQueue::new(1, 1, Backpressure::Block));
        let done = Arc::new(AtomicUsize::new(0));

        for _ in 0..5 {
            let done = Arc::clone(&done);
            let accepted = queue
                .submit("slow", async move {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    done.fetch_add(1, Ordering::SeqCst);
                })
                .await
                .unwrap();
            assert!(accepted);
        }

        queue.shutdown().await;
        assert_eq!(done.load(Ordering::SeqCst), 5);
        assert_eq!(queue.stats().dropped, 0);
    }
}
