//! Download worker pool
//!
//! `concurrency` tasks claim parts from the queue and hand them to a shared
//! [`PartRunner`]. A promoter task moves delayed parts whose retry wait has
//! elapsed back to waiting. Paused parts have no wake time and are left
//! alone until resumed.

pub mod http;
pub mod runner;

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::queue::store::now_ms;
use crate::queue::{JobQueue, PART_QUEUE};

pub use http::{DownloadError, HttpClient, HttpConfig};
pub use runner::{PartOutcome, PartRunner, TaskError};

pub struct WorkerPool {
    runner: Arc<PartRunner>,
    concurrency: usize,
    poll_interval: Duration,
}

impl WorkerPool {
    pub fn new(runner: Arc<PartRunner>, concurrency: usize, poll_interval: Duration) -> Self {
        Self {
            runner,
            concurrency,
            poll_interval,
        }
    }

    /// Start the workers and the promoter. They stop when `shutdown` fires.
    pub fn spawn(self, shutdown: CancellationToken) -> WorkerHandle {
        let mut tasks = JoinSet::new();

        for worker_id in 0..self.concurrency {
            tasks.spawn(work(
                worker_id,
                self.runner.clone(),
                self.poll_interval,
                shutdown.clone(),
            ));
        }
        tasks.spawn(promote(
            self.runner.queue().clone(),
            self.poll_interval,
            shutdown.clone(),
        ));

        info!(concurrency = self.concurrency, "Worker pool started");
        WorkerHandle { tasks, shutdown }
    }
}

pub struct WorkerHandle {
    tasks: JoinSet<()>,
    shutdown: CancellationToken,
}

impl WorkerHandle {
    /// Stop all tasks and wait for them
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        while let Some(result) = self.tasks.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "Worker task panicked");
            }
        }
        info!("Worker pool stopped");
    }
}

async fn work(
    worker_id: usize,
    runner: Arc<PartRunner>,
    poll_interval: Duration,
    shutdown: CancellationToken,
) {
    debug!(worker_id, "Worker started");

    loop {
        let claimed = tokio::select! {
            _ = shutdown.cancelled() => break,
            claimed = runner.queue().claim(PART_QUEUE) => claimed,
        };

        match claimed {
            Ok(Some(job)) => {
                let job_id = job.id;
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        // Still active in the queue; requeued on the next start
                        warn!(worker_id, job_id = %job_id, "Shutdown interrupted a running part");
                        break;
                    }
                    _ = runner.process(job) => {}
                }
            }
            Ok(None) => {
                if idle(&shutdown, poll_interval).await {
                    break;
                }
            }
            Err(e) => {
                error!(worker_id, error = %e, "Failed to claim part");
                if idle(&shutdown, poll_interval).await {
                    break;
                }
            }
        }
    }

    debug!(worker_id, "Worker stopped");
}

/// Sleep for one poll interval. True when shutdown fired meanwhile.
async fn idle(shutdown: &CancellationToken, poll_interval: Duration) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => true,
        _ = tokio::time::sleep(poll_interval) => false,
    }
}

async fn promote(queue: Arc<dyn JobQueue>, interval: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        match queue.promote_due(PART_QUEUE, now_ms()).await {
            Ok(ids) if !ids.is_empty() => debug!(count = ids.len(), "Retry waits elapsed, parts requeued"),
            Ok(_) => {}
            Err(e) => error!(error = %e, "Failed to promote delayed parts"),
        }
    }
}
