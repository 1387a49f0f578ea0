//! JobFetcher - claim the next job from a list of queues, waiting on the
//! semaphore when every queue is empty.
//!
//! The store claim is the only correctness mechanism. The semaphore decides
//! when to try again, and `poll_interval` caps how long a missed signal can
//! delay a claim.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::semaphore::JobQueueSemaphore;
use crate::domain::{FetchError, JobId, LeaseToken, QueueName, StoreError};
use crate::ports::LeaseStore;

pub struct JobFetcher {
    store: Arc<dyn LeaseStore>,
    semaphore: Arc<JobQueueSemaphore>,
    invisibility_timeout: Duration,
    poll_interval: Duration,
}

impl JobFetcher {
    pub fn new(
        store: Arc<dyn LeaseStore>,
        semaphore: Arc<JobQueueSemaphore>,
        invisibility_timeout: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            store,
            semaphore,
            invisibility_timeout,
            poll_interval,
        }
    }

    /// Block until a job from `queues` is leased to this caller, or `cancel`
    /// fires.
    ///
    /// Queues are tried in the given order on every pass, so earlier queues
    /// win when several have work. While the store is unreachable this keeps
    /// retrying every `poll_interval` (or on signals) instead of failing.
    pub async fn fetch_next(
        &self,
        queues: &[QueueName],
        cancel: &CancellationToken,
    ) -> Result<FetchedJob, FetchError> {
        if queues.is_empty() {
            return Err(FetchError::NoQueues);
        }

        loop {
            if cancel.is_cancelled() {
                return Err(FetchError::Cancelled);
            }
            if let Some(job) = self.try_fetch(queues).await {
                return Ok(job);
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                woken = self.semaphore.wait_any(queues, self.poll_interval) => match woken {
                    Some(queue) => trace!(queue = %queue, "woken by signal"),
                    None => trace!("poll interval elapsed"),
                },
            }
        }
    }

    /// One pass over `queues` without waiting.
    pub async fn try_fetch(&self, queues: &[QueueName]) -> Option<FetchedJob> {
        for queue in queues {
            match self
                .store
                .try_claim_oldest(queue, self.invisibility_timeout)
                .await
            {
                Ok(Some(claimed)) => {
                    let token = claimed.token;
                    if claimed.reclaimed {
                        info!(job_id = %token.job_id, queue = %token.queue, "stale lease reclaimed");
                    } else {
                        debug!(job_id = %token.job_id, queue = %token.queue, "job leased");
                    }
                    return Some(FetchedJob {
                        token,
                        store: Arc::clone(&self.store),
                        semaphore: Arc::clone(&self.semaphore),
                        settled: false,
                    });
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(queue = %queue, error = %e, "claim failed; retrying on next poll");
                }
            }
        }
        None
    }
}

/// A job leased to this process.
///
/// Finish it with [`FetchedJob::remove_from_queue`] or give it back with
/// [`FetchedJob::requeue`]. Dropping an unsettled handle requeues it in the
/// background; if that cannot happen either, the lease is reclaimed after
/// the invisibility timeout.
pub struct FetchedJob {
    token: LeaseToken,
    store: Arc<dyn LeaseStore>,
    semaphore: Arc<JobQueueSemaphore>,
    settled: bool,
}

impl FetchedJob {
    pub fn job_id(&self) -> JobId {
        self.token.job_id
    }

    pub fn queue(&self) -> &QueueName {
        &self.token.queue
    }

    /// Delete the job. Returns false when the lease had already expired and
    /// been reclaimed by someone else, in which case nothing was removed.
    pub async fn remove_from_queue(mut self) -> Result<bool, StoreError> {
        self.settled = true;
        let removed = self.store.mark_removed(&self.token).await?;
        if removed {
            debug!(job_id = %self.token.job_id, queue = %self.token.queue, "job removed");
        } else {
            warn!(job_id = %self.token.job_id, queue = %self.token.queue, "lease lost before removal");
        }
        Ok(removed)
    }

    /// Return the job to its queue and wake a local fetcher for it.
    pub async fn requeue(mut self) -> Result<bool, StoreError> {
        self.settled = true;
        let requeued = self.store.requeue(&self.token).await?;
        if requeued {
            self.semaphore.release(&self.token.queue);
            debug!(job_id = %self.token.job_id, queue = %self.token.queue, "job requeued");
        } else {
            warn!(job_id = %self.token.job_id, queue = %self.token.queue, "lease lost before requeue");
        }
        Ok(requeued)
    }
}

impl std::fmt::Debug for FetchedJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchedJob")
            .field("token", &self.token)
            .field("settled", &self.settled)
            .finish()
    }
}

impl Drop for FetchedJob {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        self.settled = true;

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        warn!(job_id = %self.token.job_id, queue = %self.token.queue, "fetched job dropped unsettled; requeueing");
        let store = Arc::clone(&self.store);
        let semaphore = Arc::clone(&self.semaphore);
        let token = self.token.clone();
        runtime.spawn(async move {
            match store.requeue(&token).await {
                Ok(true) => semaphore.release(&token.queue),
                Ok(false) => {}
                Err(e) => {
                    warn!(job_id = %token.job_id, error = %e, "background requeue failed; lease will expire");
                }
            }
        });
    }
}
