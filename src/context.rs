//! Process-lifetime wiring
//!
//! One [`Runtime`] per process owns the queue handle, the control bus and
//! its inbox, the progress pipeline and the shared rate limiter. The HTTP
//! surface and the worker pool are both built from it, so everything in the
//! process shares one bandwidth budget and one set of hubs.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::Config;
use crate::control::{ControlBus, ControlInbox, JobControl};
use crate::flow::FlowBuilder;
use crate::observability::Metrics;
use crate::progress::ProgressPipeline;
use crate::provider::{HostingClient, LinkResolver, ProviderError, SessionManager};
use crate::queue::{FjallQueue, JobQueue, PART_QUEUE, PruneStats, QueueError, RetryPolicy};
use crate::rate_limiter::{LimiterError, RateLimiter};
use crate::storage::LocalStorage;
use crate::worker::{DownloadError, HttpClient, HttpConfig, PartRunner, WorkerPool};

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Rate limiter error: {0}")]
    Limiter(#[from] LimiterError),

    #[error("HTTP client error: {0}")]
    Http(#[from] DownloadError),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),
}

#[derive(Clone)]
pub struct Runtime {
    pub config: Arc<Config>,
    pub queue: Arc<FjallQueue>,
    pub bus: ControlBus,
    pub inbox: Arc<ControlInbox>,
    pub flow: FlowBuilder,
    pub pipeline: ProgressPipeline,
    pub control: JobControl,
    pub limiter: RateLimiter,
    pub metrics: Arc<Metrics>,
}

impl Runtime {
    /// Open the queue at `server.queue_path` and wire everything around it
    pub fn open(config: Config) -> Result<Self, RuntimeError> {
        let queue = FjallQueue::open(
            &config.server.queue_path,
            RetryPolicy::from(&config.queue),
        )?;
        Self::with_queue(config, Arc::new(queue))
    }

    pub fn with_queue(config: Config, queue: Arc<FjallQueue>) -> Result<Self, RuntimeError> {
        let limiter = RateLimiter::new(config.limiter.rate_budget.as_u64())?;

        let shared: Arc<dyn JobQueue> = queue.clone();
        let flow = FlowBuilder::new(shared.clone());
        let pipeline = ProgressPipeline::new(flow.clone());
        let bus = ControlBus::default();
        let inbox = ControlInbox::attach(&bus);
        let storage = LocalStorage::new(config.storage.download_dir.clone());
        let control = JobControl::new(shared, bus.clone(), pipeline.clone(), storage);

        Ok(Self {
            config: Arc::new(config),
            queue,
            bus,
            inbox,
            flow,
            pipeline,
            control,
            limiter,
            metrics: Arc::new(Metrics::new()),
        })
    }

    /// Parts left active by a crashed or killed process start over
    pub async fn recover(&self) -> Result<(), RuntimeError> {
        let requeued = self.queue.requeue_active(PART_QUEUE).await?;
        if !requeued.is_empty() {
            warn!(count = requeued.len(), "Parts interrupted by the previous run were requeued");
        }
        Ok(())
    }

    /// Delete jobs finished longer than `retention` ago along with their samples
    pub async fn purge(&self, retention: Duration) -> Result<PruneStats, RuntimeError> {
        let stats = self.queue.purge_terminal(retention).await?;
        let aggregator = self.pipeline.aggregator();
        for id in &stats.part_ids {
            aggregator.forget(*id);
        }
        Ok(stats)
    }

    pub fn link_resolver(&self) -> Result<LinkResolver, RuntimeError> {
        let provider = &self.config.provider;
        let Some(base_url) = provider.base_url.as_deref() else {
            return Ok(LinkResolver::direct());
        };

        let session = match (&provider.username, &provider.password) {
            (Some(username), Some(password)) => {
                let host = HostingClient::new(
                    base_url,
                    self.config.worker.connect_timeout(),
                    &self.config.worker.user_agent,
                )?;
                info!(base_url, "Provider links enabled");
                Some(Arc::new(SessionManager::new(
                    Arc::new(host),
                    username.clone(),
                    password.clone(),
                )))
            }
            _ => {
                // Provider links fail with MissingCredentials until configured
                warn!("Provider credentials not set, provider links cannot be resolved");
                None
            }
        };

        Ok(LinkResolver::new(provider.link_hosts.clone(), session))
    }

    pub fn part_runner(&self) -> Result<PartRunner, RuntimeError> {
        let worker = &self.config.worker;
        let http = HttpClient::new(HttpConfig::from(worker))?;

        Ok(PartRunner::builder()
            .queue(self.queue.clone())
            .pipeline(self.pipeline.clone())
            .inbox(self.inbox.clone())
            .limiter(self.limiter.clone())
            .http(Arc::new(http))
            .resolver(self.link_resolver()?)
            .storage(LocalStorage::new(self.config.storage.download_dir.clone()))
            .metrics(self.metrics.clone())
            .progress_interval(worker.progress_interval())
            .checkpoint_interval(worker.checkpoint_interval())
            .stall_timeout(worker.stall_timeout())
            .build())
    }

    pub fn worker_pool(&self) -> Result<WorkerPool, RuntimeError> {
        let worker = &self.config.worker;
        Ok(WorkerPool::new(
            Arc::new(self.part_runner()?),
            worker.concurrency,
            worker.poll_interval(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::ProgressSample;
    use tempfile::TempDir;

    fn runtime(dir: &TempDir) -> Runtime {
        let mut config = Config::default();
        config.server.queue_path = dir.path().join("queue");
        config.storage.download_dir = dir.path().join("downloads");
        Runtime::open(config).unwrap()
    }

    #[tokio::test]
    async fn test_purge_forgets_samples_of_pruned_parts() {
        let dir = TempDir::new().unwrap();
        let runtime = runtime(&dir);
        let ids = runtime
            .flow
            .create_bundle("X", &["http://a/1".to_string()])
            .await
            .unwrap();
        let part = ids.children[0];

        runtime.queue.claim(PART_QUEUE).await.unwrap().unwrap();
        runtime.pipeline.aggregator().ingest(ProgressSample {
            job_id: part,
            transferred: 10,
            length: 10,
            speed: 0,
            timestamp_ms: 0,
        });
        runtime.queue.complete(part).await.unwrap();
        runtime.pipeline.settle_bundle(ids.parent).await.unwrap();
        assert_eq!(runtime.pipeline.aggregator().tracked(), 1);

        let stats = runtime.purge(Duration::ZERO).await.unwrap();
        assert_eq!(stats.part_ids, vec![part]);
        assert!(runtime.pipeline.aggregator().sample(part).is_none());
        assert_eq!(runtime.pipeline.aggregator().tracked(), 0);
    }
}
