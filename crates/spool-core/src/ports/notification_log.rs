//! NotificationLog port - bounded, tailable "queue X has work" signal log.

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::domain::{LogPosition, NotificationRecord, QueueName, StoreError, TailFrom};

/// Stream of records delivered to a tailing reader.
///
/// Yields `Err(StoreError::PositionEvicted)` when the reader fell behind the
/// log's capacity, and `Err(StoreError::Disconnected)` (or ends) when the
/// underlying connection is lost. Either way the cursor is finished.
pub type TailCursor = BoxStream<'static, Result<NotificationRecord, StoreError>>;

#[async_trait]
pub trait NotificationLog: Send + Sync {
    /// Append one record; visible to live cursors as soon as possible.
    async fn append(&self, queue: &QueueName) -> Result<LogPosition, StoreError>;

    /// Open a tailing cursor. Fails with `PositionEvicted` when `from` points
    /// at a record the log has already discarded.
    async fn open_tail(&self, from: TailFrom) -> Result<TailCursor, StoreError>;
}
