//! Bounded background work.
//!
//! Shadow comparisons run off the request path. When the pool is saturated
//! new work is dropped and counted instead of queued, so background load
//! can never delay a caller.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Semaphore;
use tokio_util::task::TaskTracker;
use tracing::warn;

/// Tracked pool of background tasks
#[derive(Debug, Clone)]
pub struct BackgroundPool {
    tracker: TaskTracker,
    permits: Arc<Semaphore>,
    capacity: usize,
    dropped: Arc<AtomicU64>,
}

impl BackgroundPool {
    /// Create a pool that admits at most `capacity` bounded tasks at once
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            tracker: TaskTracker::new(),
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Spawn if a slot is free; returns `false` and counts a drop otherwise
    pub fn try_spawn<F>(&self, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Ok(permit) = self.permits.clone().try_acquire_owned() else {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(capacity = self.capacity, dropped, "background pool saturated, task dropped");
            return false;
        };
        self.tracker.spawn(async move {
            task.await;
            drop(permit);
        });
        true
    }

    /// Spawn without taking a slot; still awaited by [`Self::drain`]
    pub fn spawn_tracked<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tracker.spawn(task);
    }

    /// Wait for every task spawned so far
    pub async fn drain(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    /// Tasks still running
    #[must_use]
    pub fn pending(&self) -> usize {
        self.tracker.len()
    }

    /// Tasks rejected because the pool was full
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Maximum concurrent bounded tasks
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_drain_waits_for_tasks() {
        let pool = BackgroundPool::new(4);
        let done = Arc::new(AtomicU64::new(0));
        for _ in 0..4 {
            let done = done.clone();
            assert!(pool.try_spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                done.fetch_add(1, Ordering::SeqCst);
            }));
        }
        pool.drain().await;
        assert_eq!(done.load(Ordering::SeqCst), 4);
        assert_eq!(pool.pending(), 0);
    }

    #[tokio::test]
    async fn test_saturation_drops() {
        let pool = BackgroundPool::new(2);
        let gate = Arc::new(Semaphore::new(0));
        for _ in 0..2 {
            let gate = gate.clone();
            assert!(pool.try_spawn(async move {
                let _ = gate.acquire().await;
            }));
        }
        assert!(!pool.try_spawn(async {}));
        assert_eq!(pool.dropped(), 1);

        gate.add_permits(2);
        pool.drain().await;
        assert!(pool.try_spawn(async {}));
        pool.drain().await;
    }

    #[tokio::test]
    async fn test_spawn_tracked_ignores_capacity() {
        let pool = BackgroundPool::new(1);
        let gate = Arc::new(Semaphore::new(0));
        let g = gate.clone();
        assert!(pool.try_spawn(async move {
            let _ = g.acquire().await;
        }));
        let ran = Arc::new(AtomicU64::new(0));
        let r = ran.clone();
        pool.spawn_tracked(async move {
            r.fetch_add(1, Ordering::SeqCst);
        });
        gate.add_permits(1);
        pool.drain().await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(pool.dropped(), 0);
    }
}
