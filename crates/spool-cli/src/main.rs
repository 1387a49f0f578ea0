use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::time::{Duration, Instant, sleep};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use spool_core::app::HandlerError;
use spool_core::ports::{NoopMigrator, SystemClock};
use spool_core::{Coordinator, CoordinationConfig, FetchedJob, JobHandler, QueueName, WorkerGroup};

/// 最初の n 回は失敗する handler（requeue の確認用）
struct HelloHandler {
    remaining_failures: AtomicU32,
    done: AtomicU32,
}

impl HelloHandler {
    fn new(n: u32) -> Self {
        Self {
            remaining_failures: AtomicU32::new(n),
            done: AtomicU32::new(0),
        }
    }

    /// 残り失敗回数を 1 つ消費する。0 なら None
    fn take_failure(&self) -> Option<u32> {
        self.remaining_failures
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .ok()
    }
}

#[async_trait]
impl JobHandler for HelloHandler {
    async fn handle(&self, job: &FetchedJob) -> Result<(), HandlerError> {
        if let Some(left) = self.take_failure() {
            return Err(format!("intentional failure (left={left})").into());
        }

        info!(job_id = %job.job_id(), queue = %job.queue(), "hello from job");
        self.done.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

fn load_config() -> Result<CoordinationConfig, Box<dyn std::error::Error>> {
    match std::env::args().nth(1) {
        Some(path) => {
            let raw = std::fs::read_to_string(&path)?;
            Ok(CoordinationConfig::from_json_str(&raw)?)
        }
        None => Ok(CoordinationConfig {
            poll_interval_ms: 2_000,
            fallback_wake_interval_ms: 5_000,
            ..CoordinationConfig::default()
        }),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // (A) in-memory の store で Coordinator を組み立てる
    let coordinator = Coordinator::builder()
        .in_memory(Arc::new(SystemClock))
        .config(load_config()?)
        .queues(&["critical", "default"])
        .build()?;
    coordinator.initialize(&NoopMigrator).await?;

    // (B) observer と worker を起動
    let observer = coordinator.start_observer();
    let handler = Arc::new(HelloHandler::new(2));
    let workers = WorkerGroup::spawn(
        2,
        coordinator.fetcher(),
        coordinator.queues().to_vec(),
        handler.clone(),
    );

    // (C) job 投入
    let total = 6;
    for i in 0..total {
        let queue = if i % 3 == 0 { "critical" } else { "default" };
        coordinator.enqueue(&QueueName::new(queue)).await?;
    }

    // (D) 全部終わるか ctrl-c / timeout まで待つ
    let deadline = Instant::now() + Duration::from_secs(30);
    loop {
        if handler.done.load(Ordering::Relaxed) >= total {
            break;
        }
        if Instant::now() >= deadline {
            warn!("timed out waiting for jobs");
            break;
        }
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
            _ = sleep(Duration::from_millis(100)) => {}
        }
    }

    workers.shutdown_and_join().await;
    observer.stop().await;

    let summary = serde_json::json!({
        "enqueued": total,
        "completed": handler.done.load(Ordering::Relaxed),
    });
    println!("{summary}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concurrent_workers_never_overdraw_failures() {
        let handler = Arc::new(HelloHandler::new(2));
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let handler = Arc::clone(&handler);
                std::thread::spawn(move || handler.take_failure())
            })
            .collect();

        let taken = threads
            .into_iter()
            .filter_map(|t| t.join().unwrap())
            .count();
        assert_eq!(taken, 2);
        assert_eq!(handler.remaining_failures.load(Ordering::Relaxed), 0);
    }
}
