//! In-memory notification log.
//!
//! A bounded ring of records with any number of tailing cursors. Readers
//! park on a `watch` channel that is bumped on every append, so a record
//! appended between "nothing to read" and "wait" is never missed.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream;
use tokio::sync::watch;

use crate::domain::{LogPosition, NotificationRecord, QueueName, StoreError, TailFrom};
use crate::ports::{NotificationLog, TailCursor};

struct LogState {
    records: VecDeque<NotificationRecord>,

    /// Position the next append receives.
    next: LogPosition,

    /// Bumped by `disconnect_all`; cursors opened under an older epoch die.
    epoch: u64,
}

impl LogState {
    fn oldest(&self) -> LogPosition {
        self.records.front().map_or(self.next, |r| r.position)
    }
}

enum ReadOutcome {
    Record(NotificationRecord),
    Empty,
    Evicted,
    Disconnected,
}

struct LogShared {
    state: Mutex<LogState>,
    capacity: usize,
    changed: watch::Sender<u64>,
    available: AtomicBool,
}

impl LogShared {
    fn read_at(&self, position: LogPosition, epoch: u64) -> ReadOutcome {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.epoch != epoch {
            return ReadOutcome::Disconnected;
        }
        let oldest = state.oldest();
        if position < oldest {
            return ReadOutcome::Evicted;
        }
        if position >= state.next {
            return ReadOutcome::Empty;
        }
        let index = (position.get() - oldest.get()) as usize;
        match state.records.get(index) {
            Some(record) => ReadOutcome::Record(record.clone()),
            None => ReadOutcome::Empty,
        }
    }

    fn bump(&self) {
        self.changed.send_modify(|v| *v = v.wrapping_add(1));
    }
}

struct CursorState {
    shared: Arc<LogShared>,
    next: LogPosition,
    epoch: u64,
    rx: watch::Receiver<u64>,
    finished: bool,
}

/// Bounded in-memory [`NotificationLog`].
///
/// Fault injection for tests and demos:
/// - `disconnect_all()` kills every open cursor with `StoreError::Disconnected`.
/// - `set_available(false)` makes `append` and `open_tail` fail.
#[derive(Clone)]
pub struct InMemoryNotificationLog {
    shared: Arc<LogShared>,
}

impl InMemoryNotificationLog {
    pub fn new(capacity: usize) -> Self {
        let (changed, _) = watch::channel(0);
        Self {
            shared: Arc::new(LogShared {
                state: Mutex::new(LogState {
                    records: VecDeque::with_capacity(capacity.min(1024)),
                    next: LogPosition::new(1),
                    epoch: 0,
                }),
                capacity: capacity.max(1),
                changed,
                available: AtomicBool::new(true),
            }),
        }
    }

    pub fn disconnect_all(&self) {
        {
            let mut state = self.shared.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.epoch += 1;
        }
        self.shared.bump();
    }

    pub fn set_available(&self, available: bool) {
        self.shared.available.store(available, Ordering::SeqCst);
    }

    /// Number of retained records.
    pub fn len(&self) -> usize {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .records
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.shared.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::unavailable("in-memory notification log is offline"))
        }
    }
}

#[async_trait]
impl NotificationLog for InMemoryNotificationLog {
    async fn append(&self, queue: &QueueName) -> Result<LogPosition, StoreError> {
        self.check_available()?;
        let position = {
            let mut state = self.shared.state.lock().unwrap_or_else(PoisonError::into_inner);
            let position = state.next;
            state.next = position.next();
            state.records.push_back(NotificationRecord {
                queue: queue.clone(),
                position,
            });
            while state.records.len() > self.shared.capacity {
                state.records.pop_front();
            }
            position
        };
        self.shared.bump();
        Ok(position)
    }

    async fn open_tail(&self, from: TailFrom) -> Result<TailCursor, StoreError> {
        self.check_available()?;

        // Subscribe before reading the state so no append slips between.
        let rx = self.shared.changed.subscribe();
        let (next, epoch) = {
            let state = self.shared.state.lock().unwrap_or_else(PoisonError::into_inner);
            let next = match from {
                TailFrom::End => state.next,
                TailFrom::After(position) => {
                    if position.next() < state.oldest() {
                        return Err(StoreError::PositionEvicted(position));
                    }
                    position.next()
                }
            };
            (next, state.epoch)
        };

        let cursor = CursorState {
            shared: Arc::clone(&self.shared),
            next,
            epoch,
            rx,
            finished: false,
        };

        let stream = stream::unfold(cursor, |mut cursor| async move {
            if cursor.finished {
                return None;
            }
            loop {
                cursor.rx.borrow_and_update();
                match cursor.shared.read_at(cursor.next, cursor.epoch) {
                    ReadOutcome::Record(record) => {
                        cursor.next = record.position.next();
                        return Some((Ok(record), cursor));
                    }
                    ReadOutcome::Evicted => {
                        cursor.finished = true;
                        let lost = cursor.next;
                        return Some((Err(StoreError::PositionEvicted(lost)), cursor));
                    }
                    ReadOutcome::Disconnected => {
                        cursor.finished = true;
                        return Some((Err(StoreError::Disconnected), cursor));
                    }
                    ReadOutcome::Empty => {}
                }
                if cursor.rx.changed().await.is_err() {
                    return None;
                }
            }
        });

        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn q(name: &str) -> QueueName {
        QueueName::new(name)
    }

    #[tokio::test]
    async fn tail_from_end_sees_only_new_records() {
        let log = InMemoryNotificationLog::new(16);
        log.append(&q("old")).await.unwrap();

        let mut cursor = log.open_tail(TailFrom::End).await.unwrap();
        log.append(&q("new")).await.unwrap();

        let record = cursor.next().await.unwrap().unwrap();
        assert_eq!(record.queue, q("new"));
    }

    #[tokio::test]
    async fn tail_after_position_resumes() {
        let log = InMemoryNotificationLog::new(16);
        let first = log.append(&q("a")).await.unwrap();
        log.append(&q("b")).await.unwrap();

        let mut cursor = log.open_tail(TailFrom::After(first)).await.unwrap();
        let record = cursor.next().await.unwrap().unwrap();
        assert_eq!(record.queue, q("b"));
    }

    #[tokio::test]
    async fn waiting_cursor_wakes_on_append() {
        let log = InMemoryNotificationLog::new(16);
        let mut cursor = log.open_tail(TailFrom::End).await.unwrap();

        let reader = tokio::spawn(async move { cursor.next().await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        log.append(&q("default")).await.unwrap();

        let record = tokio::time::timeout(Duration::from_secs(1), reader)
            .await
            .unwrap()
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(record.queue, q("default"));
    }

    #[tokio::test]
    async fn overflow_evicts_oldest_records() {
        let log = InMemoryNotificationLog::new(2);
        let first = log.append(&q("a")).await.unwrap();
        log.append(&q("b")).await.unwrap();
        log.append(&q("c")).await.unwrap();
        log.append(&q("d")).await.unwrap();

        assert_eq!(log.len(), 2);
        let err = log.open_tail(TailFrom::After(first)).await.err().unwrap();
        assert!(matches!(err, StoreError::PositionEvicted(p) if p == first));
    }

    #[tokio::test]
    async fn lagging_cursor_reports_eviction() {
        let log = InMemoryNotificationLog::new(2);
        let mut cursor = log.open_tail(TailFrom::End).await.unwrap();
        for name in ["a", "b", "c"] {
            log.append(&q(name)).await.unwrap();
        }

        let err = cursor.next().await.unwrap().unwrap_err();
        assert!(matches!(err, StoreError::PositionEvicted(_)));
        assert!(cursor.next().await.is_none());
    }

    #[tokio::test]
    async fn disconnect_kills_open_cursors() {
        let log = InMemoryNotificationLog::new(16);
        let mut cursor = log.open_tail(TailFrom::End).await.unwrap();
        log.disconnect_all();

        let err = cursor.next().await.unwrap().unwrap_err();
        assert_eq!(err, StoreError::Disconnected);

        // A fresh cursor works again.
        let mut fresh = log.open_tail(TailFrom::End).await.unwrap();
        log.append(&q("default")).await.unwrap();
        assert!(fresh.next().await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn offline_log_refuses_cursors() {
        let log = InMemoryNotificationLog::new(16);
        log.set_available(false);

        assert!(matches!(
            log.open_tail(TailFrom::End).await.err().unwrap(),
            StoreError::Unavailable(_)
        ));
    }
}
