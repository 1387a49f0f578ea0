//! Error taxonomy of the coordination layer.
//!
//! Only [`LockError`] and [`FetchError::Cancelled`] are terminal outcomes a
//! caller has to handle. [`StoreError`] is transient: the observer and the
//! lock heartbeat absorb it with backoff, and the fetcher degrades to
//! polling.

use std::time::Duration;

use thiserror::Error;

use super::notification::LogPosition;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The requested log position was discarded by the bounded log.
    #[error("notification log position {0} has been evicted")]
    PositionEvicted(LogPosition),

    #[error("notification stream disconnected")]
    Disconnected,
}

impl StoreError {
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }
}

#[derive(Debug, Error)]
pub enum LockError {
    /// Acquire did not succeed within its budget. The guarded operation must not run.
    #[error("timed out after {timeout:?} acquiring lock '{resource}'")]
    Timeout { resource: String, timeout: Duration },

    /// The store stayed unreachable for the whole acquire budget.
    #[error("store unavailable while acquiring lock '{resource}'")]
    StoreUnavailable {
        resource: String,
        #[source]
        source: StoreError,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// Caller-initiated; not a failure.
    #[error("fetch cancelled")]
    Cancelled,

    #[error("no queues given to fetch from")]
    NoQueues,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("schema migration failed")]
    Migration(#[source] StoreError),
}
