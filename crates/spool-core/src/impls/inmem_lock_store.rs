//! In-memory lock store.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::{LockDocument, OwnerId, StoreError};
use crate::ports::clock::to_time_delta;
use crate::ports::{Clock, LockStore};

/// Lock documents keyed by resource name (the uniqueness constraint).
pub struct InMemoryLockStore {
    documents: Mutex<HashMap<String, LockDocument>>,
    clock: Arc<dyn Clock>,
    available: AtomicBool,
}

impl InMemoryLockStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            documents: Mutex::new(HashMap::new()),
            clock,
            available: AtomicBool::new(true),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::unavailable("in-memory lock store is offline"))
        }
    }
}

#[async_trait]
impl LockStore for InMemoryLockStore {
    async fn try_acquire(
        &self,
        resource: &str,
        owner: OwnerId,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        self.check_available()?;
        let now = self.clock.now();
        let mut documents = self.documents.lock().await;

        if let Some(existing) = documents.get(resource)
            && !existing.is_expired(now)
        {
            return Ok(false);
        }
        documents.insert(
            resource.to_string(),
            LockDocument {
                resource: resource.to_string(),
                owner,
                expires_at: now + to_time_delta(ttl),
            },
        );
        Ok(true)
    }

    async fn refresh(
        &self,
        resource: &str,
        owner: OwnerId,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        self.check_available()?;
        let now = self.clock.now();
        let mut documents = self.documents.lock().await;
        match documents.get_mut(resource) {
            Some(doc) if doc.owner == owner => {
                doc.expires_at = now + to_time_delta(ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, resource: &str, owner: OwnerId) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut documents = self.documents.lock().await;
        if documents.get(resource).is_some_and(|doc| doc.owner == owner) {
            documents.remove(resource);
            return Ok(true);
        }
        Ok(false)
    }

    async fn current(&self, resource: &str) -> Result<Option<LockDocument>, StoreError> {
        self.check_available()?;
        Ok(self.documents.lock().await.get(resource).cloned())
    }
}
