//! Shared message builder pool.
//!
//! One [`MessageBuilder`] serves every fetch request of a backend. Build jobs
//! go through a bounded queue drained by a fixed number of workers, so the
//! number of literals built at once never exceeds the worker count no matter
//! how many fetch requests are in flight. A full queue makes submitters wait.

use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use mailgate_core::{Store, StoreResult};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::error::{Error, Result};

struct Job {
    store: Arc<dyn Store>,
    id: String,
    reply: oneshot::Sender<StoreResult<Bytes>>,
}

type JobQueue = Arc<tokio::sync::Mutex<mpsc::Receiver<Job>>>;

/// Bounded pool building message literals.
pub struct MessageBuilder {
    jobs: mpsc::Sender<Job>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    worker_count: usize,
}

impl std::fmt::Debug for MessageBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBuilder")
            .field("workers", &self.worker_count)
            .field("queue_capacity", &self.jobs.max_capacity())
            .finish()
    }
}

impl MessageBuilder {
    /// Starts `workers` build workers (at least one).
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn new(workers: usize) -> Self {
        let worker_count = workers.max(1);
        let (jobs, rx) = mpsc::channel(worker_count * 2);
        let queue: JobQueue = Arc::new(tokio::sync::Mutex::new(rx));

        let handles = (0..worker_count)
            .map(|worker| tokio::spawn(run_worker(worker, Arc::clone(&queue))))
            .collect();

        debug!(workers = worker_count, "Message builder started");
        Self {
            jobs,
            workers: Mutex::new(handles),
            worker_count,
        }
    }

    /// Number of build workers.
    #[must_use]
    pub const fn workers(&self) -> usize {
        self.worker_count
    }

    /// Number of jobs the queue holds before submitters wait.
    #[must_use]
    pub fn queue_capacity(&self) -> usize {
        self.jobs.max_capacity()
    }

    /// Builds the literal of message `id` from `store`.
    ///
    /// Waits for queue space, then for a worker to finish the job.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BuilderClosed`] if the builder shut down before the
    /// job completed, or the store's error if the build failed.
    pub async fn build(&self, store: Arc<dyn Store>, id: &str) -> Result<Bytes> {
        let (reply, result) = oneshot::channel();
        self.jobs
            .send(Job {
                store,
                id: id.to_string(),
                reply,
            })
            .await
            .map_err(|_| Error::BuilderClosed)?;

        let literal = result.await.map_err(|_| Error::BuilderClosed)??;
        Ok(literal)
    }

    /// Stops all workers. Queued and running jobs fail with
    /// [`Error::BuilderClosed`].
    pub fn shutdown(&self) {
        let workers: Vec<_> = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        if workers.is_empty() {
            return;
        }
        for handle in &workers {
            handle.abort();
        }
        debug!("Message builder stopped");
    }
}

impl Drop for MessageBuilder {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn run_worker(worker: usize, queue: JobQueue) {
    loop {
        let job = queue.lock().await.recv().await;
        let Some(job) = job else {
            break;
        };

        if job.reply.is_closed() {
            trace!(worker, id = %job.id, "Skipping abandoned build job");
            continue;
        }

        trace!(worker, id = %job.id, "Building message");
        let result = job.store.build_literal(&job.id).await;
        if job.reply.send(result).is_err() {
            trace!(worker, "Build requester went away");
        }
    }
    trace!(worker, "Build worker exiting");
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use mailgate_core::StoreError;
    use mailgate_core::testing::MemoryStore;
    use std::time::Duration;
    use tokio_test::{assert_pending, assert_ready, task};

    fn store() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::default());
        store.insert_message("m1", &["\\Seen"], "Subject: one\r\n\r\nbody");
        store.insert_message("m2", &[], "Subject: two\r\n\r\nbody");
        store
    }

    #[tokio::test]
    async fn test_build_returns_literal() {
        let builder = MessageBuilder::new(2);
        let literal = builder.build(store(), "m1").await.unwrap();
        assert!(literal.starts_with(b"Subject: one"));
        assert_eq!(builder.queue_capacity(), 4);
    }

    #[tokio::test]
    async fn test_build_error_is_reported() {
        let builder = MessageBuilder::new(1);
        let store = store();
        store.break_message("m2");

        let err = builder.build(store.clone(), "m2").await.unwrap_err();
        assert!(matches!(err, Error::Store(StoreError::Build { .. })));

        builder.build(store, "m1").await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_builds_are_capped() {
        let builder = Arc::new(MessageBuilder::new(2));
        let store = store();
        store.set_build_delay(Duration::from_millis(50));

        let mut requests = tokio::task::JoinSet::new();
        for i in 0..10 {
            let builder = Arc::clone(&builder);
            let store: Arc<dyn Store> = store.clone();
            let id = if i % 2 == 0 { "m1" } else { "m2" };
            requests.spawn(async move { builder.build(store, id).await });
        }

        while let Some(result) = requests.join_next().await {
            result.unwrap().unwrap();
        }
        assert_eq!(store.build_count(), 10);
        assert_eq!(store.max_concurrent_builds(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_requester_waits_for_job() {
        let builder = MessageBuilder::new(1);
        let store = store();
        store.set_build_delay(Duration::from_secs(1));

        let mut request = task::spawn(builder.build(store.clone(), "m1"));
        assert_pending!(request.poll());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(request.is_woken());
        let literal = assert_ready!(request.poll()).unwrap();
        assert!(literal.starts_with(b"Subject: one"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_jobs_are_skipped() {
        let builder = MessageBuilder::new(1);
        let store = store();
        store.set_build_delay(Duration::from_secs(1));

        let mut first = task::spawn(builder.build(store.clone(), "m1"));
        assert_pending!(first.poll());
        tokio::task::yield_now().await;

        let mut abandoned = task::spawn(builder.build(store.clone(), "m2"));
        assert_pending!(abandoned.poll());
        drop(abandoned);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_ready!(first.poll()).unwrap();
        assert_eq!(store.build_count(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_fails_pending_requests() {
        let builder = MessageBuilder::new(1);
        builder.shutdown();
        tokio::task::yield_now().await;

        let err = builder.build(store(), "m1").await.unwrap_err();
        assert!(matches!(err, Error::BuilderClosed));
    }
}
