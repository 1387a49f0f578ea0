//! App - コーディネーション層
//!
//! ports を組み合わせてプロセス内の振る舞いを実装する。
//!
//! # 主要コンポーネント
//! - **JobQueueSemaphore**: キューごとの起床シグナル（プロセス内）
//! - **QueueObserver**: notification log を tail して semaphore を release
//! - **JobFetcher**: lease の取得（空なら semaphore で待つ）
//! - **DistributedLock**: heartbeat 付きの名前付き排他
//! - **Coordinator**: 上記のワイヤリング（builder）
//! - **WorkerGroup**: fetch -> handle -> remove/requeue ループ

pub mod backoff;
pub mod bootstrap;
pub mod builder;
pub mod config;
pub mod fetcher;
pub mod lock;
pub mod observer;
pub mod semaphore;
pub mod worker_loop;

// 主要な型を再エクスポート
pub use self::backoff::BackoffPolicy;
pub use self::builder::{BuildError, Coordinator, CoordinatorBuilder};
pub use self::config::{ConfigError, CoordinationConfig};
pub use self::fetcher::{FetchedJob, JobFetcher};
pub use self::lock::{BOOTSTRAP_RESOURCE, DistributedLock, LockHandle};
pub use self::observer::{ObserverHandle, ObserverState, QueueObserver};
pub use self::semaphore::JobQueueSemaphore;
pub use self::worker_loop::{HandlerError, JobHandler, WorkerGroup};
