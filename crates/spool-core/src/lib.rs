//! spool-core
//!
//! Coordination layer for a database-backed job queue: many worker
//! processes share one store, and this crate decides which process runs
//! which job, wakes idle workers when work arrives, and serializes
//! one-time setup across processes.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, queue, lease, notification, lock, errors）
//! - **ports**: 抽象化レイヤー（LeaseStore, NotificationLog, LockStore, SchemaMigrator, Clock）
//! - **app**: アプリケーションロジック（semaphore, observer, fetcher, lock, builder, worker_loop）
//! - **impls**: 実装（in-memory の store 群、開発・テスト用）

pub mod app;
pub mod domain;
pub mod impls;
pub mod ports;

pub use app::{
    Coordinator, CoordinatorBuilder, CoordinationConfig, DistributedLock, FetchedJob, JobFetcher,
    JobHandler, JobQueueSemaphore, LockHandle, ObserverHandle, ObserverState, QueueObserver,
    WorkerGroup,
};
pub use domain::{BootstrapError, FetchError, JobId, LockError, OwnerId, QueueName, StoreError};
