//! QueueObserver - turns notification log records into semaphore releases.
//!
//! State machine: `Starting -> Streaming -> Backoff -> Streaming ... -> Stopped`.
//!
//! The observer resumes after the last record it processed. When it cannot
//! (fresh cursor after a failure, or the position was evicted from the
//! bounded log) it wakes every known queue once, since it cannot tell what
//! it missed. Independently it wakes every known queue on a slow fixed
//! interval, which bounds wake latency even with no notifications at all.
//! Stream failures are never fatal.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::backoff::BackoffPolicy;
use super::semaphore::JobQueueSemaphore;
use crate::domain::{LogPosition, QueueName, StoreError, TailFrom};
use crate::ports::{NotificationLog, TailCursor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObserverState {
    Starting,
    Streaming,
    Backoff,
    Stopped,
}

pub struct QueueObserver {
    log: Arc<dyn NotificationLog>,
    semaphore: Arc<JobQueueSemaphore>,
    known_queues: BTreeSet<QueueName>,
    fallback_wake_interval: Duration,
    backoff: BackoffPolicy,
}

impl QueueObserver {
    pub fn new(
        log: Arc<dyn NotificationLog>,
        semaphore: Arc<JobQueueSemaphore>,
        known_queues: impl IntoIterator<Item = QueueName>,
    ) -> Self {
        Self {
            log,
            semaphore,
            known_queues: known_queues.into_iter().collect(),
            fallback_wake_interval: Duration::from_secs(60),
            backoff: BackoffPolicy::reconnect(),
        }
    }

    pub fn with_fallback_wake_interval(mut self, interval: Duration) -> Self {
        self.fallback_wake_interval = interval;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Spawn the observer loop. Must be called inside a tokio runtime.
    pub fn start(self) -> ObserverHandle {
        let cancel = CancellationToken::new();
        let (state_tx, state_rx) = watch::channel(ObserverState::Starting);

        let period = self.fallback_wake_interval.max(Duration::from_millis(1));
        let mut fallback = tokio::time::interval_at(Instant::now() + period, period);
        fallback.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let run = ObserverLoop {
            log: self.log,
            semaphore: self.semaphore,
            known: self.known_queues,
            backoff: self.backoff,
            fallback,
            state: state_tx,
            last: None,
            failures: 0,
            catch_up: false,
        };
        let join = tokio::spawn(run.run(cancel.clone()));

        ObserverHandle {
            cancel,
            state: state_rx,
            join: Some(join),
        }
    }
}

/// Lifecycle handle of a running observer. Dropping it stops the loop.
pub struct ObserverHandle {
    cancel: CancellationToken,
    state: watch::Receiver<ObserverState>,
    join: Option<JoinHandle<()>>,
}

impl ObserverHandle {
    pub fn state(&self) -> ObserverState {
        *self.state.borrow()
    }

    /// Wait until the observer is in `wanted`. Returns false on timeout.
    pub async fn wait_for_state(&self, wanted: ObserverState, timeout: Duration) -> bool {
        let mut rx = self.state.clone();
        let reached = tokio::time::timeout(timeout, rx.wait_for(|s| *s == wanted)).await;
        matches!(reached, Ok(Ok(_)))
    }

    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(join) = self.join.take() {
            let _ = join.await;
        }
    }
}

impl Drop for ObserverHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

enum StreamEnd {
    Cancelled,
    Evicted(LogPosition),
    Failed(StoreError),
}

struct ObserverLoop {
    log: Arc<dyn NotificationLog>,
    semaphore: Arc<JobQueueSemaphore>,
    known: BTreeSet<QueueName>,
    backoff: BackoffPolicy,
    fallback: Interval,
    state: watch::Sender<ObserverState>,

    /// Last record released; the next cursor starts right after it.
    last: Option<LogPosition>,

    /// Consecutive failures without a delivered record.
    failures: u32,

    /// Next successful open must wake everything, because records may have
    /// been appended while no cursor was open and we have no position.
    catch_up: bool,
}

impl ObserverLoop {
    async fn run(mut self, cancel: CancellationToken) {
        info!(queues = self.known.len(), "queue observer starting");
        loop {
            let from = self.last.map_or(TailFrom::End, TailFrom::After);
            let Some(opened) = self.open(from, &cancel).await else {
                break;
            };

            let end = match opened {
                Ok(mut cursor) => {
                    self.state.send_replace(ObserverState::Streaming);
                    debug!(?from, "notification stream open");
                    if std::mem::take(&mut self.catch_up) {
                        self.wake_all("catch-up after reconnect");
                    }
                    self.stream(&mut cursor, &cancel).await
                }
                Err(StoreError::PositionEvicted(position)) => StreamEnd::Evicted(position),
                Err(e) => StreamEnd::Failed(e),
            };

            match end {
                StreamEnd::Cancelled => break,
                StreamEnd::Evicted(position) => {
                    warn!(%position, "resume position evicted from notification log");
                    // Reopen at the end immediately, then wake everything.
                    self.last = None;
                    self.catch_up = true;
                }
                StreamEnd::Failed(e) => {
                    self.failures = self.failures.saturating_add(1);
                    if self.last.is_none() {
                        self.catch_up = true;
                    }
                    let delay = self.backoff.next_delay(self.failures);
                    self.state.send_replace(ObserverState::Backoff);
                    warn!(error = %e, failures = self.failures, ?delay, "notification stream failed; backing off");
                    if !self.sleep(delay, &cancel).await {
                        break;
                    }
                }
            }
        }
        self.state.send_replace(ObserverState::Stopped);
        info!("queue observer stopped");
    }

    /// Open a cursor, still serving fallback wakes while the store is slow
    /// to answer. Returns None when cancelled.
    async fn open(
        &mut self,
        from: TailFrom,
        cancel: &CancellationToken,
    ) -> Option<Result<TailCursor, StoreError>> {
        let log = Arc::clone(&self.log);
        let mut opening = log.open_tail(from);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return None,
                opened = &mut opening => return Some(opened),
                _ = self.fallback.tick() => self.wake_all("fallback interval"),
            }
        }
    }

    async fn stream(&mut self, cursor: &mut TailCursor, cancel: &CancellationToken) -> StreamEnd {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return StreamEnd::Cancelled,
                _ = self.fallback.tick() => self.wake_all("fallback interval"),
                item = cursor.next() => match item {
                    Some(Ok(record)) => {
                        self.failures = 0;
                        self.semaphore.release(&record.queue);
                        self.known.insert(record.queue);
                        self.last = Some(record.position);
                    }
                    Some(Err(StoreError::PositionEvicted(position))) => {
                        return StreamEnd::Evicted(position);
                    }
                    Some(Err(e)) => return StreamEnd::Failed(e),
                    None => return StreamEnd::Failed(StoreError::Disconnected),
                },
            }
        }
    }

    /// Sleep through a backoff delay, still serving fallback wakes.
    /// Returns false when cancelled.
    async fn sleep(&mut self, delay: Duration, cancel: &CancellationToken) -> bool {
        let deadline = Instant::now() + delay;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep_until(deadline) => return true,
                _ = self.fallback.tick() => self.wake_all("fallback interval"),
            }
        }
    }

    fn wake_all(&self, reason: &'static str) {
        debug!(reason, queues = self.known.len(), "waking all known queues");
        self.semaphore.release_all(&self.known);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::InMemoryNotificationLog;

    const WAIT: Duration = Duration::from_secs(2);

    fn q(name: &str) -> QueueName {
        QueueName::new(name)
    }

    fn observer(log: &InMemoryNotificationLog, sem: &Arc<JobQueueSemaphore>) -> QueueObserver {
        QueueObserver::new(Arc::new(log.clone()), Arc::clone(sem), [q("default")])
            .with_fallback_wake_interval(Duration::from_secs(3600))
            .with_backoff(BackoffPolicy::new(
                Duration::from_millis(300),
                Duration::from_millis(600),
            ))
    }

    async fn eventually(mut check: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + WAIT;
        while Instant::now() < deadline {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        check()
    }

    #[tokio::test]
    async fn each_record_releases_its_queue() {
        let log = InMemoryNotificationLog::new(100);
        let sem = Arc::new(JobQueueSemaphore::new());
        let handle = observer(&log, &sem).start();
        assert!(handle.wait_for_state(ObserverState::Streaming, WAIT).await);

        log.append(&q("default")).await.unwrap();
        log.append(&q("default")).await.unwrap();
        log.append(&q("mail")).await.unwrap();

        assert!(eventually(|| sem.pending(&q("default")) == 2 && sem.pending(&q("mail")) == 1).await);
        handle.stop().await;
    }

    #[tokio::test]
    async fn reconnects_after_disconnect_without_losing_records() {
        let log = InMemoryNotificationLog::new(100);
        let sem = Arc::new(JobQueueSemaphore::new());
        let handle = observer(&log, &sem).start();
        assert!(handle.wait_for_state(ObserverState::Streaming, WAIT).await);

        // Give the observer a resume position.
        log.append(&q("warmup")).await.unwrap();
        assert!(eventually(|| sem.pending(&q("warmup")) == 1).await);

        log.disconnect_all();
        assert!(handle.wait_for_state(ObserverState::Backoff, WAIT).await);

        // Appended while disconnected: delivered after the resume.
        log.append(&q("default")).await.unwrap();
        assert!(handle.wait_for_state(ObserverState::Streaming, Duration::from_millis(900)).await);
        log.append(&q("default")).await.unwrap();
        log.append(&q("default")).await.unwrap();

        assert!(eventually(|| sem.pending(&q("default")) == 3).await);
        handle.stop().await;
    }

    #[tokio::test]
    async fn evicted_resume_position_wakes_every_known_queue() {
        let log = InMemoryNotificationLog::new(2);
        let sem = Arc::new(JobQueueSemaphore::new());
        let handle = observer(&log, &sem).start();
        assert!(handle.wait_for_state(ObserverState::Streaming, WAIT).await);

        log.append(&q("warmup")).await.unwrap();
        assert!(eventually(|| sem.pending(&q("warmup")) == 1).await);

        log.disconnect_all();
        assert!(handle.wait_for_state(ObserverState::Backoff, WAIT).await);
        for _ in 0..3 {
            log.append(&q("other")).await.unwrap();
        }

        // "default" never got a record, so only the compensating wake reaches it.
        assert!(eventually(|| sem.pending(&q("default")) == 1).await);
        assert!(eventually(|| sem.pending(&q("warmup")) == 2).await);
        handle.stop().await;
    }

    #[tokio::test]
    async fn fallback_interval_wakes_without_notifications() {
        let log = InMemoryNotificationLog::new(100);
        let sem = Arc::new(JobQueueSemaphore::new());
        let handle = observer(&log, &sem)
            .with_fallback_wake_interval(Duration::from_millis(50))
            .start();

        assert!(eventually(|| sem.pending(&q("default")) >= 1).await);
        handle.stop().await;
    }

    #[tokio::test]
    async fn unavailable_log_keeps_retrying_and_fallback_still_fires() {
        let log = InMemoryNotificationLog::new(100);
        log.set_available(false);
        let sem = Arc::new(JobQueueSemaphore::new());
        let handle = observer(&log, &sem)
            .with_fallback_wake_interval(Duration::from_millis(50))
            .start();

        assert!(handle.wait_for_state(ObserverState::Backoff, WAIT).await);
        assert!(eventually(|| sem.pending(&q("default")) >= 1).await);

        log.set_available(true);
        assert!(handle.wait_for_state(ObserverState::Streaming, WAIT).await);
        handle.stop().await;
    }

    /// A log whose connect never completes.
    struct StalledLog;

    #[async_trait::async_trait]
    impl NotificationLog for StalledLog {
        async fn append(&self, _queue: &QueueName) -> Result<LogPosition, StoreError> {
            Ok(LogPosition::new(1))
        }

        async fn open_tail(&self, _from: TailFrom) -> Result<TailCursor, StoreError> {
            futures::future::pending().await
        }
    }

    #[tokio::test]
    async fn fallback_fires_while_open_is_stalled() {
        let sem = Arc::new(JobQueueSemaphore::new());
        let handle = QueueObserver::new(Arc::new(StalledLog), Arc::clone(&sem), [q("default")])
            .with_fallback_wake_interval(Duration::from_millis(50))
            .start();

        assert!(eventually(|| sem.pending(&q("default")) >= 2).await);
        assert_eq!(handle.state(), ObserverState::Starting);
        handle.stop().await;
    }

    #[tokio::test]
    async fn stop_ends_in_stopped_state() {
        let log = InMemoryNotificationLog::new(100);
        let sem = Arc::new(JobQueueSemaphore::new());
        let handle = observer(&log, &sem).start();
        assert!(handle.wait_for_state(ObserverState::Streaming, WAIT).await);

        let mut state = handle.state.clone();
        handle.stop().await;
        assert_eq!(*state.borrow_and_update(), ObserverState::Stopped);
    }
}
