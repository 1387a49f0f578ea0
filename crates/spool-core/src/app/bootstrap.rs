//! Bootstrap - one-time schema setup serialized across processes.
//!
//! 全プロセスが起動時に呼ぶ。`spool:bootstrap` ロックで直列化されるので、
//! migrator は同時に二つ走らない（冪等であること）。

use std::time::Duration;

use tracing::{info, warn};

use super::lock::{BOOTSTRAP_RESOURCE, DistributedLock};
use crate::domain::BootstrapError;
use crate::ports::SchemaMigrator;

/// Run `migrator` while holding the bootstrap lock.
///
/// If the lock cannot be taken within `timeout` the migrator does not run
/// and the lock error is returned.
pub async fn initialize(
    lock: &DistributedLock,
    migrator: &dyn SchemaMigrator,
    timeout: Duration,
) -> Result<(), BootstrapError> {
    let handle = lock.acquire(BOOTSTRAP_RESOURCE, timeout).await?;
    info!(owner = %handle.owner(), "running schema setup");

    let migrated = migrator.migrate().await;

    if !handle.is_held() {
        warn!("bootstrap lock was lost while schema setup ran");
    }
    // release 失敗は致命的ではない（ttl で消える）
    if let Err(e) = handle.release().await {
        warn!(error = %e, "bootstrap lock release failed");
    }

    migrated.map_err(BootstrapError::Migration)?;
    info!("schema setup complete");
    Ok(())
}
