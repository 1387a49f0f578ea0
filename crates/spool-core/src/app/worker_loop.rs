//! WorkerLoop - fetch -> handle -> remove/requeue
//!
//! # フロー
//! 1. JobFetcher::fetch_next() で lease を取る（空なら semaphore で待つ）
//! 2. JobHandler 実行
//! 3. 成功なら remove_from_queue、失敗なら requeue
//!
//! リトライ回数や dead-letter の判断はここではしない（handler 側の責務）。

use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::fetcher::{FetchedJob, JobFetcher};
use crate::domain::{FetchError, QueueName};

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Work done for one leased job.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &FetchedJob) -> Result<(), HandlerError>;
}

/// Worker group handle.
/// - `request_shutdown()` で新しい lease の取得を止める
/// - `shutdown_and_join()` で全ワーカーの終了を待てる
pub struct WorkerGroup {
    cancel: CancellationToken,
    joins: Vec<JoinHandle<()>>,
}

impl WorkerGroup {
    /// Spawn `n` workers fetching from `queues`, in priority order.
    pub fn spawn(
        n: usize,
        fetcher: Arc<JobFetcher>,
        queues: Vec<QueueName>,
        handler: Arc<dyn JobHandler>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let queues: Arc<[QueueName]> = queues.into();

        let mut joins = Vec::with_capacity(n);
        for worker_id in 0..n {
            let join = tokio::spawn(worker_loop(
                worker_id,
                Arc::clone(&fetcher),
                Arc::clone(&queues),
                Arc::clone(&handler),
                cancel.clone(),
            ));
            joins.push(join);
        }

        Self { cancel, joins }
    }

    pub fn len(&self) -> usize {
        self.joins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.joins.is_empty()
    }

    /// Request shutdown for all workers.
    /// In-flight handlers run to completion; only new fetches stop.
    pub fn request_shutdown(&self) {
        self.cancel.cancel();
    }

    /// Shutdown and wait for all workers.
    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for j in self.joins {
            let _ = j.await;
        }
    }
}

async fn worker_loop(
    worker_id: usize,
    fetcher: Arc<JobFetcher>,
    queues: Arc<[QueueName]>,
    handler: Arc<dyn JobHandler>,
    cancel: CancellationToken,
) {
    debug!(worker_id, "worker started");
    loop {
        let job = match fetcher.fetch_next(&queues, &cancel).await {
            Ok(job) => job,
            Err(FetchError::Cancelled) => break,
            Err(e @ FetchError::NoQueues) => {
                error!(worker_id, error = %e, "worker has nothing to fetch from");
                break;
            }
        };

        let job_id = job.job_id();
        match handler.handle(&job).await {
            Ok(()) => {
                if let Err(e) = job.remove_from_queue().await {
                    // lease は invisibility timeout 後に回収される
                    warn!(worker_id, %job_id, error = %e, "remove failed");
                }
            }
            Err(err) => {
                info!(worker_id, %job_id, error = %err, "handler failed; requeueing");
                if let Err(e) = job.requeue().await {
                    warn!(worker_id, %job_id, error = %e, "requeue failed");
                }
            }
        }
    }
    debug!(worker_id, "worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::semaphore::JobQueueSemaphore;
    use crate::domain::JobId;
    use crate::impls::InMemoryLeaseStore;
    use crate::ports::{LeaseStore, SystemClock};
    use std::collections::HashSet;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::Instant;

    #[derive(Default)]
    struct Recording {
        seen: Mutex<Vec<JobId>>,
    }

    #[async_trait]
    impl JobHandler for Recording {
        async fn handle(&self, job: &FetchedJob) -> Result<(), HandlerError> {
            self.seen.lock().unwrap().push(job.job_id());
            Ok(())
        }
    }

    /// Fails the first attempt of every job.
    #[derive(Default)]
    struct FailOnce {
        failed: Mutex<HashSet<JobId>>,
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl JobHandler for FailOnce {
        async fn handle(&self, job: &FetchedJob) -> Result<(), HandlerError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.failed.lock().unwrap().insert(job.job_id()) {
                return Err("first attempt".into());
            }
            Ok(())
        }
    }

    fn setup() -> (Arc<InMemoryLeaseStore>, Arc<JobQueueSemaphore>, Arc<JobFetcher>) {
        let store = Arc::new(InMemoryLeaseStore::new(Arc::new(SystemClock)));
        let sem = Arc::new(JobQueueSemaphore::new());
        let fetcher = Arc::new(JobFetcher::new(
            store.clone(),
            Arc::clone(&sem),
            Duration::from_secs(60),
            Duration::from_millis(100),
        ));
        (store, sem, fetcher)
    }

    async fn wait_until_empty(store: &InMemoryLeaseStore, queue: &QueueName) {
        let deadline = Instant::now() + Duration::from_secs(3);
        while store.queue_len(queue).await > 0 {
            assert!(Instant::now() < deadline, "queue never drained");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn workers_process_each_job_once() {
        let (store, sem, fetcher) = setup();
        let queue = QueueName::new("default");
        let handler = Arc::new(Recording::default());
        let group = WorkerGroup::spawn(3, fetcher, vec![queue.clone()], handler.clone());

        let mut ids = HashSet::new();
        for _ in 0..20 {
            ids.insert(store.enqueue(&queue).await.unwrap());
            sem.release(&queue);
        }
        wait_until_empty(&store, &queue).await;
        group.shutdown_and_join().await;

        let seen = handler.seen.lock().unwrap();
        assert_eq!(seen.len(), 20);
        assert_eq!(seen.iter().copied().collect::<HashSet<_>>(), ids);
    }

    #[tokio::test]
    async fn failed_jobs_are_requeued_and_retried() {
        let (store, sem, fetcher) = setup();
        let queue = QueueName::new("default");
        let handler = Arc::new(FailOnce::default());
        let group = WorkerGroup::spawn(1, fetcher, vec![queue.clone()], handler.clone());

        store.enqueue(&queue).await.unwrap();
        sem.release(&queue);
        wait_until_empty(&store, &queue).await;
        group.shutdown_and_join().await;

        assert_eq!(handler.attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn shutdown_stops_idle_workers() {
        let (_store, _sem, fetcher) = setup();
        let group = WorkerGroup::spawn(
            2,
            fetcher,
            vec![QueueName::new("default")],
            Arc::new(Recording::default()),
        );
        assert_eq!(group.len(), 2);

        tokio::time::timeout(Duration::from_secs(1), group.shutdown_and_join())
            .await
            .unwrap();
    }
}
