//! DistributedLock - named mutual exclusion with heartbeat-based expiry.
//!
//! Acquire inserts a lock document if none exists or the existing one has
//! expired, in one atomic store operation. While the handle lives, a
//! heartbeat pushes `expires_at` forward every `ttl / 3`. A crashed holder
//! stops heartbeating and its document becomes reclaimable after `ttl`.
//!
//! The lock is not reentrant: acquiring a resource the same section already
//! holds waits for the full timeout and fails.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::backoff::BackoffPolicy;
use crate::domain::{LockError, OwnerId, StoreError};
use crate::ports::{IdGenerator, LockStore, SystemClock, UlidGenerator};

/// Resource name guarding one-time schema setup.
pub const BOOTSTRAP_RESOURCE: &str = "spool:bootstrap";

pub struct DistributedLock {
    store: Arc<dyn LockStore>,
    ids: Arc<dyn IdGenerator>,
    ttl: Duration,
    retry: BackoffPolicy,
}

impl DistributedLock {
    pub fn new(store: Arc<dyn LockStore>, ttl: Duration) -> Self {
        Self {
            store,
            ids: Arc::new(UlidGenerator::new(SystemClock)),
            ttl,
            retry: BackoffPolicy::lock_retry(),
        }
    }

    pub fn with_retry(mut self, retry: BackoffPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Acquire `resource`, retrying with a short randomized backoff until
    /// `timeout` has elapsed.
    ///
    /// Fails with `LockError::StoreUnavailable` when the last attempt could
    /// not reach the store, `LockError::Timeout` otherwise.
    pub async fn acquire(&self, resource: &str, timeout: Duration) -> Result<LockHandle, LockError> {
        let owner = self.ids.generate_owner_id();
        let deadline = Instant::now() + timeout;
        let mut attempts: u32 = 0;

        loop {
            attempts = attempts.saturating_add(1);
            let attempt =
                tokio::time::timeout_at(deadline, self.store.try_acquire(resource, owner, self.ttl))
                    .await;
            let last_error = match attempt {
                Err(_) => {
                    // The store may still apply the insert; owner ids are
                    // never reused, so a release cannot hit anyone else.
                    self.release_in_background(resource, owner);
                    None
                }
                Ok(Ok(true)) => {
                    debug!(resource, %owner, attempts, "lock acquired");
                    return Ok(LockHandle::start(
                        Arc::clone(&self.store),
                        resource.to_string(),
                        owner,
                        self.ttl,
                    ));
                }
                Ok(Ok(false)) => None,
                Ok(Err(e)) => {
                    debug!(resource, error = %e, "lock store unreachable during acquire");
                    Some(e)
                }
            };

            let now = Instant::now();
            if now >= deadline {
                warn!(resource, ?timeout, attempts, "giving up on lock");
                return Err(match last_error {
                    Some(source) => LockError::StoreUnavailable {
                        resource: resource.to_string(),
                        source,
                    },
                    None => LockError::Timeout {
                        resource: resource.to_string(),
                        timeout,
                    },
                });
            }
            let delay = self.retry.jittered_delay(attempts).min(deadline - now);
            tokio::time::sleep(delay).await;
        }
    }

    fn release_in_background(&self, resource: &str, owner: OwnerId) {
        let store = Arc::clone(&self.store);
        let resource = resource.to_string();
        tokio::spawn(async move {
            if let Err(e) = store.release(&resource, owner).await {
                debug!(resource = %resource, error = %e, "cleanup of timed-out acquire failed");
            }
        });
    }
}

/// A held lock. Release explicitly with [`LockHandle::release`]; dropping the
/// handle stops the heartbeat and releases in the background.
pub struct LockHandle {
    resource: String,
    owner: OwnerId,
    store: Arc<dyn LockStore>,
    ttl: Duration,
    lost: Arc<AtomicBool>,
    cancel: CancellationToken,
    heartbeat: Option<JoinHandle<()>>,
    released: bool,
}

impl LockHandle {
    fn start(store: Arc<dyn LockStore>, resource: String, owner: OwnerId, ttl: Duration) -> Self {
        let lost = Arc::new(AtomicBool::new(false));
        let cancel = CancellationToken::new();
        let heartbeat = tokio::spawn(heartbeat(
            Arc::clone(&store),
            resource.clone(),
            owner,
            ttl,
            Arc::clone(&lost),
            cancel.clone(),
        ));
        Self {
            resource,
            owner,
            store,
            ttl,
            lost,
            cancel,
            heartbeat: Some(heartbeat),
            released: false,
        }
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn owner(&self) -> OwnerId {
        self.owner
    }

    /// False once the heartbeat saw the lock taken over, or could not reach
    /// the store for a whole ttl. Cheap; check it inside long critical sections.
    pub fn is_held(&self) -> bool {
        !self.lost.load(Ordering::SeqCst)
    }

    /// Re-check ownership against the store (and extend it). Call before
    /// committing irreversible effects.
    pub async fn verify(&self) -> Result<bool, StoreError> {
        let held = self.store.refresh(&self.resource, self.owner, self.ttl).await?;
        if !held {
            self.lost.store(true, Ordering::SeqCst);
        }
        Ok(held)
    }

    /// Stop the heartbeat and delete the document if this handle still owns it.
    pub async fn release(mut self) -> Result<(), StoreError> {
        self.released = true;
        self.cancel.cancel();
        if let Some(heartbeat) = self.heartbeat.take() {
            let _ = heartbeat.await;
        }
        match self.store.release(&self.resource, self.owner).await {
            Ok(true) => {
                debug!(resource = %self.resource, owner = %self.owner, "lock released");
                Ok(())
            }
            Ok(false) => {
                warn!(resource = %self.resource, owner = %self.owner, "lock was no longer held at release");
                Ok(())
            }
            Err(e) => {
                warn!(resource = %self.resource, error = %e, "lock release failed; it will expire");
                Err(e)
            }
        }
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.cancel.cancel();

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let store = Arc::clone(&self.store);
        let resource = std::mem::take(&mut self.resource);
        let owner = self.owner;
        runtime.spawn(async move {
            if let Err(e) = store.release(&resource, owner).await {
                warn!(resource = %resource, error = %e, "background lock release failed; it will expire");
            }
        });
    }
}

async fn heartbeat(
    store: Arc<dyn LockStore>,
    resource: String,
    owner: OwnerId,
    ttl: Duration,
    lost: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    let period = (ttl / 3).max(Duration::from_millis(1));
    // The document expires `ttl` after the last good refresh; report the
    // loss one tick before that can happen.
    let lost_after = ttl.saturating_sub(period);
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_ok = Instant::now();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let refreshed = match tokio::time::timeout(period, store.refresh(&resource, owner, ttl)).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::unavailable("lock refresh timed out")),
        };
        match refreshed {
            Ok(true) => {
                last_ok = Instant::now();
                lost.store(false, Ordering::SeqCst);
            }
            Ok(false) => {
                error!(resource = %resource, %owner, "lock taken over by another owner");
                lost.store(true, Ordering::SeqCst);
                return;
            }
            Err(e) => {
                let silent_for = last_ok.elapsed();
                if silent_for >= lost_after {
                    error!(resource = %resource, error = %e, ?silent_for, "lock heartbeat failing; lock may be lost");
                    lost.store(true, Ordering::SeqCst);
                } else {
                    warn!(resource = %resource, error = %e, "lock heartbeat failed");
                }
            }
        }
    }
}
