//! CoordinatorBuilder - コーディネーション層の構築とワイヤリング
//!
//! # 方針
//! - Builder パターン（ports を差し込む）
//! - 起動時検証（Fail-fast 設計）
//! - 同一プロセス内の全 fetcher は一つの semaphore を共有する

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::bootstrap;
use super::config::{ConfigError, CoordinationConfig};
use super::fetcher::{FetchedJob, JobFetcher};
use super::lock::DistributedLock;
use super::observer::{ObserverHandle, QueueObserver};
use super::semaphore::JobQueueSemaphore;
use crate::domain::{BootstrapError, FetchError, JobId, QueueName, StoreError};
use crate::impls::{InMemoryLeaseStore, InMemoryLockStore, InMemoryNotificationLog};
use crate::ports::{Clock, LeaseStore, LockStore, NotificationLog, SchemaMigrator};

/// CoordinatorBuilder は Coordinator を構築
///
/// # 使用例
/// ```ignore
/// let coordinator = Coordinator::builder()
///     .lease_store(leases)
///     .notification_log(log)
///     .lock_store(locks)
///     .queues(&["default", "mail"])
///     .build()?;
/// ```
///
/// # Fail-fast 設計
/// - 三つの store が全て揃っていること
/// - config が validate() を通ること
/// - queue が一つ以上あること
pub struct CoordinatorBuilder {
    lease_store: Option<Arc<dyn LeaseStore>>,
    notification_log: Option<Arc<dyn NotificationLog>>,
    lock_store: Option<Arc<dyn LockStore>>,
    in_memory: Option<Arc<dyn Clock>>,
    config: CoordinationConfig,
    queues: Vec<QueueName>,
}

/// BuildError は構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("missing component: {0}. Set it on the builder or use in_memory().")]
    MissingComponent(&'static str),

    #[error(transparent)]
    InvalidConfig(#[from] ConfigError),

    #[error("no queues configured")]
    NoQueues,
}

impl CoordinatorBuilder {
    pub fn new() -> Self {
        Self {
            lease_store: None,
            notification_log: None,
            lock_store: None,
            in_memory: None,
            config: CoordinationConfig::default(),
            queues: Vec::new(),
        }
    }

    pub fn lease_store(mut self, store: Arc<dyn LeaseStore>) -> Self {
        self.lease_store = Some(store);
        self
    }

    pub fn notification_log(mut self, log: Arc<dyn NotificationLog>) -> Self {
        self.notification_log = Some(log);
        self
    }

    pub fn lock_store(mut self, store: Arc<dyn LockStore>) -> Self {
        self.lock_store = Some(store);
        self
    }

    /// 未設定の store を in-memory 実装で埋める（単一プロセス・テスト用）
    pub fn in_memory(mut self, clock: Arc<dyn Clock>) -> Self {
        self.in_memory = Some(clock);
        self
    }

    pub fn config(mut self, config: CoordinationConfig) -> Self {
        self.config = config;
        self
    }

    /// Queues this process serves, in fetch priority order.
    pub fn queues(mut self, names: &[&str]) -> Self {
        for &name in names {
            let queue = QueueName::new(name);
            if !self.queues.contains(&queue) {
                self.queues.push(queue);
            }
        }
        self
    }

    pub fn build(self) -> Result<Coordinator, BuildError> {
        self.config.validate()?;
        if self.queues.is_empty() {
            return Err(BuildError::NoQueues);
        }

        let config = self.config;
        let clock = self.in_memory;

        let lease_store: Arc<dyn LeaseStore> = match (self.lease_store, &clock) {
            (Some(store), _) => store,
            (None, Some(clock)) => Arc::new(InMemoryLeaseStore::new(Arc::clone(clock))),
            (None, None) => return Err(BuildError::MissingComponent("lease_store")),
        };
        let notification_log: Arc<dyn NotificationLog> = match (self.notification_log, &clock) {
            (Some(log), _) => log,
            (None, Some(_)) => Arc::new(InMemoryNotificationLog::new(
                config.notification_log_capacity,
            )),
            (None, None) => return Err(BuildError::MissingComponent("notification_log")),
        };
        let lock_store: Arc<dyn LockStore> = match (self.lock_store, &clock) {
            (Some(store), _) => store,
            (None, Some(clock)) => Arc::new(InMemoryLockStore::new(Arc::clone(clock))),
            (None, None) => return Err(BuildError::MissingComponent("lock_store")),
        };

        let semaphore = Arc::new(JobQueueSemaphore::with_max_pending(
            config.semaphore_max_pending,
        ));
        let fetcher = Arc::new(JobFetcher::new(
            Arc::clone(&lease_store),
            Arc::clone(&semaphore),
            config.invisibility_timeout(),
            config.poll_interval(),
        ));
        let lock = DistributedLock::new(lock_store, config.lock_ttl());

        debug!(queues = ?self.queues, "coordinator built");
        Ok(Coordinator {
            config,
            queues: self.queues,
            lease_store,
            notification_log,
            semaphore,
            fetcher,
            lock,
        })
    }
}

impl Default for CoordinatorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Coordinator はプロセス内のコーディネーション部品をまとめたもの
///
/// - producer: `enqueue()`
/// - consumer: `fetcher()` / `fetch_next()` + `start_observer()`
/// - 起動時: `initialize()`
pub struct Coordinator {
    config: CoordinationConfig,
    queues: Vec<QueueName>,
    lease_store: Arc<dyn LeaseStore>,
    notification_log: Arc<dyn NotificationLog>,
    semaphore: Arc<JobQueueSemaphore>,
    fetcher: Arc<JobFetcher>,
    lock: DistributedLock,
}

impl Coordinator {
    pub fn builder() -> CoordinatorBuilder {
        CoordinatorBuilder::new()
    }

    pub fn config(&self) -> &CoordinationConfig {
        &self.config
    }

    pub fn queues(&self) -> &[QueueName] {
        &self.queues
    }

    pub fn semaphore(&self) -> Arc<JobQueueSemaphore> {
        Arc::clone(&self.semaphore)
    }

    pub fn fetcher(&self) -> Arc<JobFetcher> {
        Arc::clone(&self.fetcher)
    }

    pub fn lock(&self) -> &DistributedLock {
        &self.lock
    }

    /// Schema setup under the bootstrap lock. Call once per process at startup.
    pub async fn initialize(&self, migrator: &dyn SchemaMigrator) -> Result<(), BootstrapError> {
        bootstrap::initialize(&self.lock, migrator, self.config.lock_acquire_timeout()).await
    }

    /// Start the observer for the configured queues.
    pub fn start_observer(&self) -> ObserverHandle {
        QueueObserver::new(
            Arc::clone(&self.notification_log),
            Arc::clone(&self.semaphore),
            self.queues.iter().cloned(),
        )
        .with_fallback_wake_interval(self.config.fallback_wake_interval())
        .with_backoff(self.config.reconnect_backoff())
        .start()
    }

    /// Insert a job, then append its notification.
    ///
    /// The job is durable once the first step succeeds. A failed append only
    /// delays pickup until the next poll or fallback wake, so it is logged
    /// and not returned.
    pub async fn enqueue(&self, queue: &QueueName) -> Result<JobId, StoreError> {
        let job_id = self.lease_store.enqueue(queue).await?;
        match self.notification_log.append(queue).await {
            Ok(position) => debug!(%job_id, queue = %queue, %position, "job enqueued"),
            Err(e) => {
                warn!(%job_id, queue = %queue, error = %e, "job enqueued but notification append failed");
            }
        }
        Ok(job_id)
    }

    /// `fetch_next` over the configured queues.
    pub async fn fetch_next(&self, cancel: &CancellationToken) -> Result<FetchedJob, FetchError> {
        self.fetcher.fetch_next(&self.queues, cancel).await
    }
}
