//! Domain model: ids, queue names, leases, notifications, lock documents, errors.

pub mod errors;
pub mod ids;
pub mod lease;
pub mod lock;
pub mod notification;
pub mod queue;

pub use self::errors::{BootstrapError, FetchError, LockError, StoreError};
pub use self::ids::{JobId, OwnerId};
pub use self::lease::{ClaimedLease, Claimability, Lease, LeaseState, LeaseToken};
pub use self::lock::LockDocument;
pub use self::notification::{LogPosition, NotificationRecord, TailFrom};
pub use self::queue::{QueueName, queue_names};
