//! Per-request fetch worker pool.
//!
//! A [`FetchPool`] resolves the items of one multi-item request in parallel,
//! with at most `workers` items in flight. Each item's result is reported
//! against the item itself, in request order, and one item failing does not
//! affect its siblings.
//!
//! Dropping the future returned by [`FetchPool::run`] aborts every worker
//! that has not finished yet.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::{Error, Result};

/// Aborts the wrapped tasks when dropped.
struct Workers<T>(Vec<JoinHandle<T>>);

impl<T> Drop for Workers<T> {
    fn drop(&mut self) {
        for handle in &self.0 {
            handle.abort();
        }
    }
}

/// Bounded fan-out for the items of one request.
#[derive(Debug, Clone, Copy)]
pub struct FetchPool {
    workers: usize,
}

impl FetchPool {
    /// Creates a pool running at most `workers` items at once (at least one).
    #[must_use]
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
        }
    }

    /// Maximum number of items in flight.
    #[must_use]
    pub const fn workers(&self) -> usize {
        self.workers
    }

    /// Resolves every item with `resolve` and returns `(item, result)` pairs
    /// in the order the items were given.
    pub async fn run<I, T, F, Fut>(&self, items: Vec<I>, resolve: F) -> Vec<(I, Result<T>)>
    where
        I: Clone + Send + 'static,
        T: Send + 'static,
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        debug!(items = items.len(), workers = self.workers, "Starting fetch workers");

        let semaphore = Arc::new(Semaphore::new(self.workers));
        let resolve = Arc::new(resolve);

        let mut workers = Workers(Vec::with_capacity(items.len()));
        for item in &items {
            let semaphore = Arc::clone(&semaphore);
            let resolve = Arc::clone(&resolve);
            let item = item.clone();
            workers.0.push(tokio::spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|e| Error::Worker(e.to_string()))?;
                resolve(item).await
            }));
        }

        let mut results = Vec::with_capacity(items.len());
        for (item, handle) in items.into_iter().zip(workers.0.iter_mut()) {
            let result = match handle.await {
                Ok(result) => result,
                Err(e) => Err(Error::Worker(e.to_string())),
            };
            results.push((item, result));
        }
        results
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_results_follow_request_order() {
        let pool = FetchPool::new(4);
        let results = pool
            .run(vec![30_u64, 10, 20], |delay| async move {
                tokio::time::sleep(Duration::from_millis(delay)).await;
                Ok(delay * 2)
            })
            .await;

        let items: Vec<_> = results.iter().map(|(item, _)| *item).collect();
        assert_eq!(items, vec![30, 10, 20]);
        assert_eq!(*results[1].1.as_ref().unwrap(), 20);
    }

    #[tokio::test]
    async fn test_failure_does_not_cancel_siblings() {
        let pool = FetchPool::new(2);
        let results = pool
            .run(vec!["a", "bad", "c"], |id| async move {
                if id == "bad" {
                    Err(Error::NoStore(id.to_string()))
                } else {
                    Ok(id.to_uppercase())
                }
            })
            .await;

        assert_eq!(results[0].1.as_ref().unwrap(), "A");
        assert!(matches!(results[1].1, Err(Error::NoStore(_))));
        assert_eq!(results[2].1.as_ref().unwrap(), "C");
    }

    #[tokio::test]
    async fn test_panicking_item_is_reported() {
        let pool = FetchPool::new(2);
        let results = pool
            .run(vec![1, 2], |n| async move {
                assert!(n != 2, "boom");
                Ok(n)
            })
            .await;

        assert_eq!(*results[0].1.as_ref().unwrap(), 1);
        assert!(matches!(results[1].1, Err(Error::Worker(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_is_bounded() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let pool = FetchPool::new(3);
        let results = {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            pool.run((0..12).collect(), move |n: u32| {
                let running = Arc::clone(&running);
                let peak = Arc::clone(&peak);
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(n)
                }
            })
            .await
        };

        assert_eq!(results.len(), 12);
        assert_eq!(peak.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_request_aborts_workers() {
        let finished = Arc::new(AtomicUsize::new(0));
        let pool = FetchPool::new(2);

        let request = {
            let finished = Arc::clone(&finished);
            pool.run(vec![1, 2, 3, 4], move |n: u32| {
                let finished = Arc::clone(&finished);
                async move {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    finished.fetch_add(1, Ordering::SeqCst);
                    Ok(n)
                }
            })
        };

        let timed_out = tokio::time::timeout(Duration::from_secs(1), request).await;
        assert!(timed_out.is_err());

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(finished.load(Ordering::SeqCst), 0);
    }
}
