//! Progress aggregation and event fan-out.
//!
//! Workers hand samples and lifecycle transitions to the
//! [`ProgressPipeline`]. It keeps the latest sample per part, rolls samples
//! up into bundle aggregates and publishes both on two hubs: `parts` carries
//! per-part events, `bundles` carries bundle aggregates and bundle lifecycle.

pub mod aggregator;
pub mod cadence;
pub mod hub;
pub mod sample;

use std::sync::Arc;
use tracing::trace;

use crate::flow::{Bundle, FlowBuilder, FlowError, PartSummary};
use crate::queue::{JobId, QueueJob};

pub use aggregator::ProgressAggregator;
pub use cadence::{SampleCadence, SpeedMeter};
pub use hub::{EventData, FanoutHub, HubEvent, Subscription, Topic};
pub use sample::{BundleProgress, ProgressSample, SampleReport, monotonic_ms};

#[derive(Clone)]
pub struct ProgressPipeline {
    aggregator: Arc<ProgressAggregator>,
    parts: FanoutHub,
    bundles: FanoutHub,
    flow: FlowBuilder,
}

impl ProgressPipeline {
    pub fn new(flow: FlowBuilder) -> Self {
        Self {
            aggregator: Arc::new(ProgressAggregator::new()),
            parts: FanoutHub::new("parts"),
            bundles: FanoutHub::new("bundles"),
            flow,
        }
    }

    pub fn parts_hub(&self) -> &FanoutHub {
        &self.parts
    }

    pub fn bundles_hub(&self) -> &FanoutHub {
        &self.bundles
    }

    pub fn aggregator(&self) -> &ProgressAggregator {
        &self.aggregator
    }

    /// Record a sample and push it plus the refreshed bundle aggregate
    pub async fn ingest(
        &self,
        sample: ProgressSample,
        bundle_id: Option<JobId>,
    ) -> Result<(), FlowError> {
        self.aggregator.ingest(sample);
        self.parts.publish(HubEvent::sample(sample.report()));

        if let Some(bundle_id) = bundle_id {
            let progress = self.bundle_progress(bundle_id).await?;
            trace!(bundle_id = %bundle_id, transferred = progress.transferred, "Bundle progress");
            self.bundles.publish(HubEvent::bundle_progress(progress));
        }
        Ok(())
    }

    /// Aggregate recomputed from the latest samples of the bundle's parts
    ///
    /// Membership comes from the queue on every call.
    pub async fn bundle_progress(&self, bundle_id: JobId) -> Result<BundleProgress, FlowError> {
        let deps = self.flow.outstanding_children(bundle_id).await?;
        let part_ids = deps.all().copied().collect();
        Ok(self.aggregator.bundle_progress(bundle_id, &part_ids))
    }

    /// Publish a part lifecycle transition on the parts hub
    pub fn part_event(&self, topic: Topic, summary: PartSummary) {
        self.parts.publish(HubEvent::part(topic, summary));
    }

    /// Publish a bundle lifecycle transition on the bundles hub
    pub fn bundle_event(&self, topic: Topic, bundle: Bundle) {
        self.bundles.publish(HubEvent::bundle(topic, bundle));
    }

    /// Snapshot of one part for clients recovering after a reconnect
    pub async fn part_summary(&self, part_id: JobId) -> Result<Option<PartSummary>, FlowError> {
        let job = self.flow.queue().get_job(part_id).await?;
        Ok(job.filter(QueueJob::is_part).map(|job| {
            let sample = self.aggregator.sample(part_id);
            PartSummary::from_job(&job, sample.as_ref())
        }))
    }

    /// Settle the bundle and announce it when this completed it
    pub async fn settle_bundle(&self, bundle_id: JobId) -> Result<(), FlowError> {
        if let Some(bundle) = self.flow.settle_bundle(bundle_id).await? {
            self.bundle_event(Topic::Completed, bundle);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{FjallQueue, JobQueue, PART_QUEUE, RetryPolicy};
    use tempfile::TempDir;

    fn pipeline(dir: &TempDir) -> ProgressPipeline {
        let queue = FjallQueue::open(dir.path(), RetryPolicy::default()).unwrap();
        ProgressPipeline::new(FlowBuilder::new(Arc::new(queue)))
    }

    fn sample(job: JobId, transferred: u64) -> ProgressSample {
        ProgressSample {
            job_id: job,
            transferred,
            length: 1000,
            speed: 10,
            timestamp_ms: monotonic_ms(),
        }
    }

    #[tokio::test]
    async fn test_ingest_publishes_part_and_bundle_progress() {
        let temp_dir = TempDir::new().unwrap();
        let pipeline = pipeline(&temp_dir);
        let urls = vec!["http://a/1".to_string(), "http://a/2".to_string()];
        let ids = pipeline.flow.create_bundle("X", &urls).await.unwrap();

        let mut parts = pipeline.parts_hub().subscribe(&[Topic::Progress]);
        let mut bundles = pipeline.bundles_hub().subscribe(&[]);

        pipeline
            .ingest(sample(ids.children[0], 250), Some(ids.parent))
            .await
            .unwrap();
        pipeline
            .ingest(sample(ids.children[1], 750), Some(ids.parent))
            .await
            .unwrap();

        assert_eq!(parts.recv().await.unwrap().subject_id(), ids.children[0]);
        assert_eq!(parts.recv().await.unwrap().subject_id(), ids.children[1]);

        let _first = bundles.recv().await.unwrap();
        let second = bundles.recv().await.unwrap();
        match second.data {
            EventData::BundleProgress(progress) => {
                assert_eq!(progress.transferred, 1000);
                assert_eq!(progress.length, 2000);
                assert_eq!(progress.percentage, 50.0);
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_part_summary_includes_latest_sample() {
        let temp_dir = TempDir::new().unwrap();
        let pipeline = pipeline(&temp_dir);
        let ids = pipeline
            .flow
            .create_bundle("X", &["http://a/1".to_string()])
            .await
            .unwrap();

        pipeline
            .ingest(sample(ids.children[0], 400), Some(ids.parent))
            .await
            .unwrap();

        let summary = pipeline.part_summary(ids.children[0]).await.unwrap().unwrap();
        assert_eq!(summary.bundle_id, Some(ids.parent));
        assert_eq!(summary.progress.unwrap().transferred, 400);
        assert!(pipeline.part_summary(JobId(404)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_settle_announces_completion_once() {
        let temp_dir = TempDir::new().unwrap();
        let pipeline = pipeline(&temp_dir);
        let ids = pipeline
            .flow
            .create_bundle("X", &["http://a/1".to_string()])
            .await
            .unwrap();
        let mut bundles = pipeline.bundles_hub().subscribe(&[Topic::Completed]);

        let queue = pipeline.flow.queue().clone();
        queue.claim(PART_QUEUE).await.unwrap();
        queue.complete(ids.children[0]).await.unwrap();

        pipeline.settle_bundle(ids.parent).await.unwrap();
        pipeline.settle_bundle(ids.parent).await.unwrap();

        assert_eq!(bundles.recv().await.unwrap().subject_id(), ids.parent);
        assert!(bundles.try_recv().is_none());
    }
}
