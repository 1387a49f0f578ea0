//! Ports - interfaces to the shared durable store.
//!
//! The lease store is the source of truth. The notification log is only a
//! low-latency hint; losing it makes workers slower, never incorrect.

pub mod clock;
pub mod id_generator;
pub mod lease_store;
pub mod lock_store;
pub mod notification_log;
pub mod schema_migrator;

pub use self::clock::{Clock, ManualClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::lease_store::LeaseStore;
pub use self::lock_store::LockStore;
pub use self::notification_log::{NotificationLog, TailCursor};
pub use self::schema_migrator::{NoopMigrator, SchemaMigrator};
