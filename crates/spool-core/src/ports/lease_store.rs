//! LeaseStore port - the durable source of truth for job leases.

use std::time::Duration;

use async_trait::async_trait;

use crate::domain::{ClaimedLease, JobId, LeaseToken, QueueName, StoreError};

/// Durable job records plus their fetch state.
///
/// `try_claim_oldest` must be a single atomic operation: two concurrent
/// callers can never both receive the same job. Everything else in the
/// coordination layer is a latency optimization on top of it.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Insert a new unclaimed job (producer path).
    async fn enqueue(&self, queue: &QueueName) -> Result<JobId, StoreError>;

    /// Atomically lease the oldest job in `queue` that is unclaimed, or whose
    /// lease is older than `invisibility_timeout`.
    async fn try_claim_oldest(
        &self,
        queue: &QueueName,
        invisibility_timeout: Duration,
    ) -> Result<Option<ClaimedLease>, StoreError>;

    /// Delete the job if `token` still holds its lease. Returns whether it did.
    async fn mark_removed(&self, token: &LeaseToken) -> Result<bool, StoreError>;

    /// Return the job to the unclaimed pool if `token` still holds its lease.
    async fn requeue(&self, token: &LeaseToken) -> Result<bool, StoreError>;
}
