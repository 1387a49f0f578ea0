//! JobQueueSemaphore - process-local "queue X may have work" wake primitive.
//!
//! `release(queue)` never blocks. It hands the signal to the longest-waiting
//! caller whose `wait_any` list contains `queue`, or banks it in a per-queue
//! counter when nobody is waiting. `wait_any` drains a banked signal before
//! parking, so a release that happens-before the wait is never lost.
//!
//! Nothing here is durable. The lease store is the source of truth, and the
//! semaphore only saves workers from busy-polling it.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;

use crate::domain::QueueName;

struct Waiter {
    id: u64,
    queues: Vec<QueueName>,
    tx: oneshot::Sender<QueueName>,
}

#[derive(Default)]
struct SemaphoreState {
    pending: HashMap<QueueName, u64>,
    waiters: VecDeque<Waiter>,
    next_waiter_id: u64,
}

impl SemaphoreState {
    fn release(&mut self, mut queue: QueueName, max_pending: u64) {
        while let Some(index) = self.waiters.iter().position(|w| w.queues.contains(&queue)) {
            let Some(waiter) = self.waiters.remove(index) else {
                break;
            };
            // A closed receiver means the waiter gave up between timing out
            // and deregistering; try the next one.
            match waiter.tx.send(queue) {
                Ok(()) => return,
                Err(returned) => queue = returned,
            }
        }
        let count = self.pending.entry(queue).or_insert(0);
        if *count < max_pending {
            *count += 1;
        }
    }

    fn take_pending(&mut self, queues: &[QueueName]) -> Option<QueueName> {
        for queue in queues {
            if let Some(count) = self.pending.get_mut(queue) {
                *count -= 1;
                if *count == 0 {
                    self.pending.remove(queue);
                }
                return Some(queue.clone());
            }
        }
        None
    }

    fn remove_waiter(&mut self, id: u64) -> bool {
        match self.waiters.iter().position(|w| w.id == id) {
            Some(index) => {
                self.waiters.remove(index);
                true
            }
            None => false,
        }
    }
}

/// Per-queue counting semaphore with multi-queue waits.
pub struct JobQueueSemaphore {
    state: Mutex<SemaphoreState>,
    max_pending: u64,
}

impl JobQueueSemaphore {
    pub const DEFAULT_MAX_PENDING: u64 = 1024;

    pub fn new() -> Self {
        Self::with_max_pending(Self::DEFAULT_MAX_PENDING)
    }

    /// Banked signals per queue saturate at `max_pending`, so a long idle
    /// period of fallback wakes does not turn into a burst of empty claims.
    pub fn with_max_pending(max_pending: u64) -> Self {
        Self {
            state: Mutex::new(SemaphoreState::default()),
            max_pending: max_pending.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SemaphoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Signal one waiter interested in `queue`.
    pub fn release(&self, queue: &QueueName) {
        self.lock().release(queue.clone(), self.max_pending);
    }

    /// Signal every queue in `queues` once.
    pub fn release_all<'a>(&self, queues: impl IntoIterator<Item = &'a QueueName>) {
        let mut state = self.lock();
        for queue in queues {
            state.release(queue.clone(), self.max_pending);
        }
    }

    /// Wait until one of `queues` is signalled, or `timeout` elapses.
    ///
    /// Banked signals are checked in the order of `queues`. Returns the queue
    /// that fired, or `None` on timeout. Dropping the future before it
    /// completes gives any signal it was handed back to the semaphore.
    pub async fn wait_any(&self, queues: &[QueueName], timeout: Duration) -> Option<QueueName> {
        if queues.is_empty() {
            tokio::time::sleep(timeout).await;
            return None;
        }

        let mut registration = {
            let mut state = self.lock();
            if let Some(queue) = state.take_pending(queues) {
                return Some(queue);
            }
            let (tx, rx) = oneshot::channel();
            let id = state.next_waiter_id;
            state.next_waiter_id = state.next_waiter_id.wrapping_add(1);
            state.waiters.push_back(Waiter {
                id,
                queues: queues.to_vec(),
                tx,
            });
            Registration {
                semaphore: self,
                id,
                rx,
                settled: false,
            }
        };

        let outcome = tokio::time::timeout(timeout, &mut registration.rx).await;
        match outcome {
            Ok(Ok(queue)) => {
                registration.settled = true;
                Some(queue)
            }
            Ok(Err(_)) => {
                registration.settled = true;
                None
            }
            Err(_) => registration.settle(),
        }
    }

    /// Banked, undelivered signals for `queue`.
    pub fn pending(&self, queue: &QueueName) -> u64 {
        self.lock().pending.get(queue).copied().unwrap_or(0)
    }

    /// Callers currently parked in `wait_any`.
    pub fn waiters(&self) -> usize {
        self.lock().waiters.len()
    }
}

impl Default for JobQueueSemaphore {
    fn default() -> Self {
        Self::new()
    }
}

/// A parked `wait_any` call. Deregisters on timeout or drop.
struct Registration<'a> {
    semaphore: &'a JobQueueSemaphore,
    id: u64,
    rx: oneshot::Receiver<QueueName>,
    settled: bool,
}

impl Registration<'_> {
    /// Leave the waiter list. If a release already picked us, the signal is
    /// sitting in the channel (it was sent under the same lock) and is ours.
    fn settle(&mut self) -> Option<QueueName> {
        self.settled = true;
        let mut state = self.semaphore.lock();
        if state.remove_waiter(self.id) {
            return None;
        }
        self.rx.try_recv().ok()
    }
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        self.settled = true;
        let mut state = self.semaphore.lock();
        if state.remove_waiter(self.id) {
            return;
        }
        if let Ok(queue) = self.rx.try_recv() {
            state.release(queue, self.semaphore.max_pending);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::queue_names;
    use std::sync::Arc;
    use tokio::time::Instant;

    fn q(name: &str) -> QueueName {
        QueueName::new(name)
    }

    #[tokio::test]
    async fn release_before_wait_is_not_lost() {
        let sem = JobQueueSemaphore::new();
        sem.release(&q("default"));

        let start = Instant::now();
        let fired = sem.wait_any(&[q("default")], Duration::from_secs(10)).await;

        assert_eq!(fired, Some(q("default")));
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(sem.pending(&q("default")), 0);
    }

    #[tokio::test]
    async fn wait_times_out_without_release() {
        let sem = JobQueueSemaphore::new();

        let start = Instant::now();
        let fired = sem.wait_any(&[q("default")], Duration::from_millis(100)).await;

        assert_eq!(fired, None);
        assert!(start.elapsed() >= Duration::from_millis(100));
        assert_eq!(sem.waiters(), 0);
    }

    #[tokio::test]
    async fn release_wakes_parked_waiter() {
        let sem = Arc::new(JobQueueSemaphore::new());
        let waiter = tokio::spawn({
            let sem = Arc::clone(&sem);
            async move {
                sem.wait_any(&queue_names(&["mail", "default"]), Duration::from_secs(5))
                    .await
            }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        sem.release(&q("default"));

        assert_eq!(waiter.await.unwrap(), Some(q("default")));
        assert_eq!(sem.pending(&q("default")), 0);
    }

    #[tokio::test]
    async fn release_skips_uninterested_waiters() {
        let sem = Arc::new(JobQueueSemaphore::new());
        let mail_waiter = tokio::spawn({
            let sem = Arc::clone(&sem);
            async move { sem.wait_any(&[q("mail")], Duration::from_millis(300)).await }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        sem.release(&q("default"));

        assert_eq!(mail_waiter.await.unwrap(), None);
        assert_eq!(sem.pending(&q("default")), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn one_release_wakes_exactly_one_waiter() {
        let sem = Arc::new(JobQueueSemaphore::new());
        let mut joins = Vec::new();
        for _ in 0..4 {
            let sem = Arc::clone(&sem);
            joins.push(tokio::spawn(async move {
                sem.wait_any(&[q("default")], Duration::from_millis(500)).await
            }));
        }

        while sem.waiters() < 4 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        sem.release(&q("default"));

        let mut woken = 0;
        for join in joins {
            if join.await.unwrap().is_some() {
                woken += 1;
            }
        }
        assert_eq!(woken, 1);
    }

    #[tokio::test]
    async fn banked_signals_respect_caller_order() {
        let sem = JobQueueSemaphore::new();
        sem.release(&q("low"));
        sem.release(&q("high"));

        let order = queue_names(&["high", "low"]);
        assert_eq!(sem.wait_any(&order, Duration::ZERO).await, Some(q("high")));
        assert_eq!(sem.wait_any(&order, Duration::ZERO).await, Some(q("low")));
        assert_eq!(sem.wait_any(&order, Duration::ZERO).await, None);
    }

    #[tokio::test]
    async fn abandoned_wait_does_not_swallow_a_signal() {
        let sem = JobQueueSemaphore::new();
        let queues = [q("default")];

        tokio::select! {
            _ = sem.wait_any(&queues, Duration::from_secs(10)) => unreachable!(),
            _ = tokio::time::sleep(Duration::from_millis(20)) => {}
        }
        assert_eq!(sem.waiters(), 0);

        sem.release(&q("default"));
        assert_eq!(sem.pending(&q("default")), 1);
    }

    #[test]
    fn banked_signals_saturate() {
        let sem = JobQueueSemaphore::with_max_pending(3);
        for _ in 0..10 {
            sem.release(&q("default"));
        }
        assert_eq!(sem.pending(&q("default")), 3);
    }

    #[test]
    fn release_all_signals_each_queue() {
        let sem = JobQueueSemaphore::new();
        let queues = queue_names(&["a", "b"]);
        sem.release_all(&queues);

        assert_eq!(sem.pending(&q("a")), 1);
        assert_eq!(sem.pending(&q("b")), 1);
    }
}
