//! LockStore port - lock documents kept in the shared durable store.

use std::time::Duration;

use async_trait::async_trait;

use crate::domain::{LockDocument, OwnerId, StoreError};

#[async_trait]
pub trait LockStore: Send + Sync {
    /// Atomically insert `{resource, owner, now + ttl}` if no document exists
    /// for `resource` or the existing one has expired. Returns whether `owner`
    /// now holds the lock.
    async fn try_acquire(
        &self,
        resource: &str,
        owner: OwnerId,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// Push `expires_at` to `now + ttl` if `owner` still holds the document.
    async fn refresh(&self, resource: &str, owner: OwnerId, ttl: Duration)
    -> Result<bool, StoreError>;

    /// Compare-and-delete by owner.
    async fn release(&self, resource: &str, owner: OwnerId) -> Result<bool, StoreError>;

    async fn current(&self, resource: &str) -> Result<Option<LockDocument>, StoreError>;
}
