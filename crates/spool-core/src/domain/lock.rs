//! Lock document stored by the distributed lock.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::OwnerId;

/// At most one live document exists per `resource` at any instant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockDocument {
    pub resource: String,
    pub owner: OwnerId,
    pub expires_at: DateTime<Utc>,
}

impl LockDocument {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}
