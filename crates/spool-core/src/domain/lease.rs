//! Lease record: the fetch state of one job in the lease store.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::JobId;
use super::queue::QueueName;
use crate::ports::clock::to_time_delta;

/// Lease state.
///
/// Transitions:
/// - Unclaimed -> Leased (claim)
/// - Leased -> Leased (reclaim after the invisibility timeout)
/// - Leased -> Unclaimed (requeue)
/// - Leased -> (deleted) (remove from queue)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LeaseState {
    Unclaimed,
    Leased,
}

/// How a claimable record became claimable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claimability {
    /// Never fetched, or requeued.
    Fresh,
    /// Leased, but the holder has been silent for longer than the invisibility timeout.
    Abandoned,
}

/// One job record as seen by the coordination layer.
///
/// Only the lease store mutates this; workers only ever hold a [`LeaseToken`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub job_id: JobId,
    pub queue: QueueName,
    pub state: LeaseState,
    pub fetched_at: Option<DateTime<Utc>>,
    pub enqueued_at: DateTime<Utc>,
}

impl Lease {
    pub fn new(job_id: JobId, queue: QueueName, now: DateTime<Utc>) -> Self {
        Self {
            job_id,
            queue,
            state: LeaseState::Unclaimed,
            fetched_at: None,
            enqueued_at: now,
        }
    }

    /// Can this record be claimed at `now`?
    pub fn claimability(
        &self,
        now: DateTime<Utc>,
        invisibility_timeout: Duration,
    ) -> Option<Claimability> {
        match (self.state, self.fetched_at) {
            (LeaseState::Unclaimed, _) => Some(Claimability::Fresh),
            (LeaseState::Leased, Some(fetched_at))
                if now - fetched_at >= to_time_delta(invisibility_timeout) =>
            {
                Some(Claimability::Abandoned)
            }
            // A leased record without a timestamp can only come from a corrupt
            // store; treat it as abandoned rather than losing the job forever.
            (LeaseState::Leased, None) => Some(Claimability::Abandoned),
            (LeaseState::Leased, Some(_)) => None,
        }
    }

    pub fn claim(&mut self, now: DateTime<Utc>) -> LeaseToken {
        self.state = LeaseState::Leased;
        self.fetched_at = Some(now);
        LeaseToken {
            job_id: self.job_id,
            queue: self.queue.clone(),
            fetched_at: now,
        }
    }

    pub fn requeue(&mut self) {
        self.state = LeaseState::Unclaimed;
        self.fetched_at = None;
    }

    /// Is the lease still the one described by `token`?
    ///
    /// A reclaim overwrites `fetched_at`, so a stale holder can no longer
    /// remove or requeue the job once someone else owns it.
    pub fn is_held_by(&self, token: &LeaseToken) -> bool {
        self.job_id == token.job_id
            && self.state == LeaseState::Leased
            && self.fetched_at == Some(token.fetched_at)
    }
}

/// Proof of a claim, handed to the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseToken {
    pub job_id: JobId,
    pub queue: QueueName,
    pub fetched_at: DateTime<Utc>,
}

/// Result of a successful atomic claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedLease {
    pub token: LeaseToken,
    /// The job had been leased by someone else whose lease expired.
    pub reclaimed: bool,
}
