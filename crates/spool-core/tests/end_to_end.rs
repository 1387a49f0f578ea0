use std::sync::Arc;
use std::time::Duration;

use spool_core::app::BOOTSTRAP_RESOURCE;
use spool_core::impls::{InMemoryLeaseStore, InMemoryLockStore, InMemoryNotificationLog};
use spool_core::ports::{LockStore, NoopMigrator, SystemClock};
use spool_core::{Coordinator, CoordinationConfig, FetchError, ObserverState, QueueName};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const FALLBACK: Duration = Duration::from_millis(500);

fn config() -> CoordinationConfig {
    CoordinationConfig {
        poll_interval_ms: 60_000,
        fallback_wake_interval_ms: FALLBACK.as_millis() as u64,
        lock_ttl_ms: 3_000,
        ..CoordinationConfig::default()
    }
}

#[tokio::test]
async fn blocked_fetcher_picks_up_a_new_job_and_removes_it() {
    let coordinator = Arc::new(
        Coordinator::builder()
            .in_memory(Arc::new(SystemClock))
            .config(config())
            .queues(&["default"])
            .build()
            .unwrap(),
    );
    coordinator.initialize(&NoopMigrator).await.unwrap();
    let observer = coordinator.start_observer();
    assert!(observer.wait_for_state(ObserverState::Streaming, Duration::from_secs(1)).await);

    let fetching = tokio::spawn({
        let coordinator = Arc::clone(&coordinator);
        async move { coordinator.fetch_next(&CancellationToken::new()).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let enqueued_at = Instant::now();
    let job_id = coordinator.enqueue(&QueueName::new("default")).await.unwrap();

    let job = tokio::time::timeout(FALLBACK, fetching)
        .await
        .expect("fetcher should wake before the fallback interval")
        .unwrap()
        .unwrap();
    assert!(enqueued_at.elapsed() < FALLBACK);
    assert_eq!(job.job_id(), job_id);
    assert!(job.remove_from_queue().await.unwrap());

    // Nothing left: a bounded second fetch must come back empty.
    let cancel = CancellationToken::new();
    let canceller = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            cancel.cancel();
        }
    });
    let second = coordinator.fetch_next(&cancel).await;
    assert_eq!(second.unwrap_err(), FetchError::Cancelled);
    canceller.await.unwrap();

    observer.stop().await;
}

#[tokio::test]
async fn lost_notification_is_covered_by_the_fallback_wake() {
    let leases = Arc::new(InMemoryLeaseStore::new(Arc::new(SystemClock)));
    let log = Arc::new(InMemoryNotificationLog::new(100));
    let coordinator = Arc::new(
        Coordinator::builder()
            .lease_store(leases.clone())
            .notification_log(log.clone())
            .lock_store(Arc::new(InMemoryLockStore::new(Arc::new(SystemClock))))
            .config(config())
            .queues(&["default"])
            .build()
            .unwrap(),
    );
    let observer = coordinator.start_observer();
    assert!(observer.wait_for_state(ObserverState::Streaming, Duration::from_secs(1)).await);

    let fetching = tokio::spawn({
        let coordinator = Arc::clone(&coordinator);
        async move { coordinator.fetch_next(&CancellationToken::new()).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Append fails: the job is durable, but no notification is written.
    log.set_available(false);
    coordinator.enqueue(&QueueName::new("default")).await.unwrap();

    let job = tokio::time::timeout(FALLBACK * 3, fetching)
        .await
        .expect("fallback wake should reach the fetcher")
        .unwrap()
        .unwrap();
    assert!(job.remove_from_queue().await.unwrap());
    assert_eq!(leases.queue_len(&QueueName::new("default")).await, 0);

    observer.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn processes_sharing_stores_run_setup_one_at_a_time() {
    let leases = Arc::new(InMemoryLeaseStore::new(Arc::new(SystemClock)));
    let log = Arc::new(InMemoryNotificationLog::new(100));
    let locks = Arc::new(InMemoryLockStore::new(Arc::new(SystemClock)));

    let mut joins = Vec::new();
    for _ in 0..3 {
        let coordinator = Coordinator::builder()
            .lease_store(leases.clone())
            .notification_log(log.clone())
            .lock_store(locks.clone())
            .config(config())
            .queues(&["default"])
            .build()
            .unwrap();
        joins.push(tokio::spawn(async move {
            coordinator.initialize(&NoopMigrator).await
        }));
    }
    for join in joins {
        join.await.unwrap().unwrap();
    }
    assert!(locks.current(BOOTSTRAP_RESOURCE).await.unwrap().is_none());
}
