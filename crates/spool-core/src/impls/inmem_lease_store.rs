//! In-memory lease store.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::{Claimability, ClaimedLease, JobId, Lease, LeaseToken, QueueName, StoreError};
use crate::ports::{Clock, IdGenerator, LeaseStore, UlidGenerator};

struct InMemoryLeaseState {
    /// Single source of truth for lease records.
    leases: HashMap<JobId, Lease>,

    /// Job ids per queue, oldest first.
    queues: HashMap<QueueName, VecDeque<JobId>>,
}

impl InMemoryLeaseState {
    fn new() -> Self {
        Self {
            leases: HashMap::new(),
            queues: HashMap::new(),
        }
    }

    fn remove(&mut self, job_id: JobId, queue: &QueueName) {
        self.leases.remove(&job_id);
        if let Some(ids) = self.queues.get_mut(queue) {
            ids.retain(|id| *id != job_id);
        }
    }
}

/// Lease store held in process memory.
///
/// Every operation runs under one lock, which makes claim a single atomic
/// step. `set_available(false)` makes every call fail with
/// `StoreError::Unavailable`, for exercising degraded paths.
pub struct InMemoryLeaseStore {
    state: Mutex<InMemoryLeaseState>,
    clock: Arc<dyn Clock>,
    ids: UlidGenerator<Arc<dyn Clock>>,
    available: AtomicBool,
}

impl InMemoryLeaseStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(InMemoryLeaseState::new()),
            ids: UlidGenerator::new(Arc::clone(&clock)),
            clock,
            available: AtomicBool::new(true),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Snapshot of one record.
    pub async fn get(&self, job_id: JobId) -> Option<Lease> {
        self.state.lock().await.leases.get(&job_id).cloned()
    }

    /// Number of records (claimed or not) in `queue`.
    pub async fn queue_len(&self, queue: &QueueName) -> usize {
        let state = self.state.lock().await;
        state.queues.get(queue).map_or(0, VecDeque::len)
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::unavailable("in-memory lease store is offline"))
        }
    }
}

#[async_trait]
impl LeaseStore for InMemoryLeaseStore {
    async fn enqueue(&self, queue: &QueueName) -> Result<JobId, StoreError> {
        self.check_available()?;
        let job_id = self.ids.generate_job_id();
        let lease = Lease::new(job_id, queue.clone(), self.clock.now());

        let mut state = self.state.lock().await;
        state.leases.insert(job_id, lease);
        state.queues.entry(queue.clone()).or_default().push_back(job_id);
        Ok(job_id)
    }

    async fn try_claim_oldest(
        &self,
        queue: &QueueName,
        invisibility_timeout: Duration,
    ) -> Result<Option<ClaimedLease>, StoreError> {
        self.check_available()?;
        let now = self.clock.now();

        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let Some(ids) = state.queues.get(queue) else {
            return Ok(None);
        };

        for job_id in ids {
            let Some(lease) = state.leases.get_mut(job_id) else {
                continue;
            };
            if let Some(claimability) = lease.claimability(now, invisibility_timeout) {
                let token = lease.claim(now);
                return Ok(Some(ClaimedLease {
                    token,
                    reclaimed: claimability == Claimability::Abandoned,
                }));
            }
        }
        Ok(None)
    }

    async fn mark_removed(&self, token: &LeaseToken) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        let held = state
            .leases
            .get(&token.job_id)
            .is_some_and(|lease| lease.is_held_by(token));
        if held {
            state.remove(token.job_id, &token.queue);
        }
        Ok(held)
    }

    async fn requeue(&self, token: &LeaseToken) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut state = self.state.lock().await;
        match state.leases.get_mut(&token.job_id) {
            Some(lease) if lease.is_held_by(token) => {
                lease.requeue();
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
