//! In-memory implementations of the ports.
//!
//! They run every store operation under a single lock, which gives the same
//! atomicity a real shared store provides with conditional updates. Useful
//! for tests and single-process deployments.

pub mod inmem_lease_store;
pub mod inmem_lock_store;
pub mod inmem_notification_log;

pub use self::inmem_lease_store::InMemoryLeaseStore;
pub use self::inmem_lock_store::InMemoryLockStore;
pub use self::inmem_notification_log::InMemoryNotificationLog;
