//! SchemaMigrator port - one-time schema setup, run under the bootstrap lock.

use async_trait::async_trait;

use crate::domain::StoreError;

/// Must be idempotent: every process runs it once at startup, serialized by
/// the distributed lock, so all but the first run should be no-ops.
#[async_trait]
pub trait SchemaMigrator: Send + Sync {
    async fn migrate(&self) -> Result<(), StoreError>;
}

/// Migrator for stores that need no schema.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMigrator;

#[async_trait]
impl SchemaMigrator for NoopMigrator {
    async fn migrate(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
