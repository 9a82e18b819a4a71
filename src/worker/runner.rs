//! Part runner: one claimed part from link resolution to a finished file
//!
//! The runner owns the part for the duration of the attempt. Pause and
//! cancel reach it only through its [`ControlWatch`], which it checks once
//! per chunk, whenever no data arrived for a checkpoint interval, and while
//! waiting on the bandwidth budget.

use bon::Builder;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{Instant, timeout};
use tracing::{debug, error, info, warn};

use super::http::{DownloadError, DownloadStream, HttpClient};
use crate::control::{ControlInbox, ControlKind, ControlWatch};
use crate::flow::{FlowError, PartSummary};
use crate::observability::Metrics;
use crate::progress::{
    ProgressPipeline, ProgressSample, SampleCadence, SpeedMeter, Topic, monotonic_ms,
};
use crate::provider::{LinkResolver, ProviderError};
use crate::queue::{
    CANCELLED_REASON, DownloadPayload, FailOutcome, JobId, JobQueue, JobState, QueueJob,
};
use crate::rate_limiter::RateLimiter;
use crate::storage::{LocalStorage, PartFile, StorageError};

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("Link resolution failed: {0}")]
    Provider(#[from] ProviderError),

    #[error("Download failed: {0}")]
    Download(#[from] DownloadError),

    #[error("Storage failed: {0}")]
    Storage(#[from] StorageError),

    #[error("No data received for {0:?}")]
    Stalled(Duration),

    #[error("Body ended after {received} of {expected} bytes")]
    ShortBody { expected: u64, received: u64 },
}

pub type Result<T> = std::result::Result<T, TaskError>;

/// How an attempt ended when it did not fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartOutcome {
    Completed { bytes: u64 },
    Paused { bytes: u64 },
    /// `wrote` is whether any byte reached the part file
    Cancelled { wrote: bool },
}

impl PartOutcome {
    fn stopped(kind: ControlKind, bytes: u64) -> Self {
        match kind {
            ControlKind::Pause => PartOutcome::Paused { bytes },
            ControlKind::Cancel => PartOutcome::Cancelled { wrote: bytes > 0 },
        }
    }
}

/// Byte count, speed and sample pacing of one attempt
struct Tracker {
    part_id: JobId,
    bundle_id: Option<JobId>,
    length: u64,
    transferred: u64,
    cadence: SampleCadence,
    meter: SpeedMeter,
}

impl Tracker {
    /// Count a chunk; true when a sample is due
    fn advance(&mut self, now: Instant, bytes: u64) -> bool {
        self.transferred += bytes;
        self.meter.record(now, self.transferred);
        self.cadence.should_emit(now)
    }

    fn sample(&self, speed: u64) -> ProgressSample {
        ProgressSample {
            job_id: self.part_id,
            transferred: self.transferred,
            length: self.length,
            speed,
            timestamp_ms: monotonic_ms(),
        }
    }

    fn current(&self) -> ProgressSample {
        self.sample(self.meter.bytes_per_sec())
    }

    /// Last sample of the attempt, sent regardless of cadence
    fn last(&mut self, completed: bool) -> ProgressSample {
        self.cadence.force_emit(Instant::now());
        if completed {
            // Unknown length is known now
            if self.length == 0 {
                self.length = self.transferred;
            }
            self.current()
        } else {
            self.sample(0)
        }
    }
}

#[derive(Builder)]
pub struct PartRunner {
    queue: Arc<dyn JobQueue>,
    pipeline: ProgressPipeline,
    inbox: Arc<ControlInbox>,
    limiter: RateLimiter,
    http: Arc<HttpClient>,
    resolver: LinkResolver,
    storage: LocalStorage,
    metrics: Arc<Metrics>,
    #[builder(default = Duration::from_millis(100))]
    progress_interval: Duration,
    #[builder(default = Duration::from_millis(250))]
    checkpoint_interval: Duration,
    #[builder(default = Duration::from_secs(60))]
    stall_timeout: Duration,
}

impl PartRunner {
    pub fn queue(&self) -> &Arc<dyn JobQueue> {
        &self.queue
    }

    /// Run one claimed part and record how it ended in the queue
    pub async fn process(&self, job: QueueJob) {
        let part_id = job.id;
        let Some(payload) = job.download().cloned() else {
            warn!(job_id = %part_id, job_name = job.payload.job_name(), "Unexpected job in part queue, discarding");
            if let Err(e) = self.queue.discard(part_id, "not a download job").await {
                error!(job_id = %part_id, error = %e, "Failed to discard job");
            }
            return;
        };

        let mut watch = self.inbox.register(part_id);
        info!(job_id = %part_id, bundle_id = ?job.parent_id, attempt = job.attempts_made, url = %payload.url, "Part started");

        // Every attempt starts from byte 0
        self.publish(self.tracker(&job).sample(0), job.parent_id).await;
        if let Err(e) = self.announce(part_id, Topic::Active).await {
            warn!(job_id = %part_id, error = %e, "Failed to announce part start");
        }

        let result = self.transfer(&job, &payload, &mut watch).await;
        if let Err(e) = self.record(&job, &payload, result).await {
            error!(job_id = %part_id, error = %e, "Failed to record part outcome");
        }
    }

    async fn transfer(
        &self,
        job: &QueueJob,
        payload: &DownloadPayload,
        watch: &mut ControlWatch,
    ) -> Result<PartOutcome> {
        // A command may have arrived between claim and registration
        if let Some(kind) = watch.pending() {
            return Ok(PartOutcome::stopped(kind, 0));
        }

        let url = tokio::select! {
            kind = watch.changed() => return Ok(PartOutcome::stopped(kind, 0)),
            url = self.resolver.resolve(&payload.url) => url?,
        };
        if url != payload.url {
            debug!(job_id = %job.id, "Download link resolved through provider");
        }

        let opened = tokio::select! {
            kind = watch.changed() => return Ok(PartOutcome::stopped(kind, 0)),
            opened = timeout(self.stall_timeout, self.http.open(&url)) => opened,
        };
        let stream = opened.map_err(|_| TaskError::Stalled(self.stall_timeout))??;

        let file = self
            .storage
            .create(job.parent_id, job.id, &payload.name)
            .await?;

        let mut tracker = self.tracker(job);
        tracker.length = stream.content_length().unwrap_or(0);
        self.stream_into(stream, file, &mut tracker, watch).await
    }

    async fn stream_into(
        &self,
        mut stream: DownloadStream,
        mut file: PartFile,
        tracker: &mut Tracker,
        watch: &mut ControlWatch,
    ) -> Result<PartOutcome> {
        let mut last_data = Instant::now();

        loop {
            if let Some(kind) = watch.pending() {
                return Ok(self.stop(kind, file, tracker).await);
            }

            let chunk = match timeout(self.checkpoint_interval, stream.next_chunk()).await {
                Err(_) => {
                    if last_data.elapsed() >= self.stall_timeout {
                        discard_quietly(file).await;
                        return Err(TaskError::Stalled(self.stall_timeout));
                    }
                    continue;
                }
                Ok(None) => break,
                Ok(Some(Err(err))) => {
                    discard_quietly(file).await;
                    return Err(err.into());
                }
                Ok(Some(Ok(chunk))) => chunk,
            };

            let now = Instant::now();

            let written = file.write(&chunk).await;
            if let Err(err) = written {
                discard_quietly(file).await;
                return Err(err.into());
            }

            let bytes = chunk.len() as u64;
            self.metrics.bytes_downloaded(bytes);
            if tracker.advance(now, bytes) {
                self.publish(tracker.current(), tracker.bundle_id).await;
            }

            // Charge the chunk before reading the next one
            tokio::select! {
                biased;
                kind = watch.changed() => return Ok(self.stop(kind, file, tracker).await),
                _ = self.limiter.acquire(bytes) => {}
            }
            // Waiting on the budget is not a stall
            last_data = Instant::now();
        }

        if tracker.length > 0 && tracker.transferred < tracker.length {
            discard_quietly(file).await;
            return Err(TaskError::ShortBody {
                expected: tracker.length,
                received: tracker.transferred,
            });
        }

        let path = file.close().await?;
        debug!(job_id = %tracker.part_id, path = %path.display(), "Part file written");

        self.publish(tracker.last(true), tracker.bundle_id).await;
        Ok(PartOutcome::Completed {
            bytes: tracker.transferred,
        })
    }

    /// Honor a control command at a checkpoint
    async fn stop(&self, kind: ControlKind, file: PartFile, tracker: &mut Tracker) -> PartOutcome {
        let bytes = file.written();
        match kind {
            ControlKind::Pause => {
                if let Err(e) = file.close().await {
                    warn!(job_id = %tracker.part_id, error = %e, "Failed to flush paused part file");
                }
                self.publish(tracker.last(false), tracker.bundle_id).await;
            }
            ControlKind::Cancel => discard_quietly(file).await,
        }
        debug!(job_id = %tracker.part_id, %kind, bytes, "Control command honored");
        PartOutcome::stopped(kind, bytes)
    }

    async fn record(
        &self,
        job: &QueueJob,
        payload: &DownloadPayload,
        result: Result<PartOutcome>,
    ) -> std::result::Result<(), FlowError> {
        let id = job.id;
        match result {
            Ok(PartOutcome::Completed { bytes }) => {
                self.queue.complete(id).await?;
                self.metrics.part_completed();
                info!(job_id = %id, bytes, "Part completed");
                self.announce(id, Topic::Completed).await?;
                self.settle_bundle(job).await?;
            }
            Ok(PartOutcome::Paused { bytes }) => {
                self.queue.delay(id, None, JobState::Active).await?;
                self.metrics.part_paused();
                info!(job_id = %id, bytes, "Part paused");
                self.announce(id, Topic::Paused).await?;
            }
            Ok(PartOutcome::Cancelled { wrote: false }) => {
                self.queue.remove_claimed(id).await?;
                self.metrics.part_cancelled();
                info!(job_id = %id, "Part cancelled before any output, removed");
                self.pipeline.aggregator().forget(id);
                self.pipeline.part_event(
                    Topic::Removed,
                    PartSummary::removed(id, job.parent_id, payload.name.clone(), payload.url.clone()),
                );
                self.settle_bundle(job).await?;
            }
            Ok(PartOutcome::Cancelled { wrote: true }) => {
                self.queue.discard(id, CANCELLED_REASON).await?;
                self.metrics.part_cancelled();
                info!(job_id = %id, "Part cancelled");
                self.announce(id, Topic::Cancelled).await?;
                self.settle_bundle(job).await?;
            }
            Err(err) => {
                let reason = err.to_string();
                let outcome = self.queue.fail(id, &reason).await?;
                match outcome {
                    FailOutcome::Retrying {
                        attempts_made,
                        wake_at_ms,
                    } => {
                        warn!(job_id = %id, attempt = attempts_made, wake_at_ms, error = %reason, "Part attempt failed, will retry");
                    }
                    FailOutcome::Failed { attempts_made } => {
                        self.metrics.part_failed();
                        error!(job_id = %id, attempts = attempts_made, error = %reason, "Part failed");
                    }
                }
                self.announce(id, Topic::Failed).await?;
                if outcome.is_final() {
                    self.settle_bundle(job).await?;
                }
            }
        }
        Ok(())
    }

    async fn announce(&self, id: JobId, topic: Topic) -> std::result::Result<(), FlowError> {
        if let Some(summary) = self.pipeline.part_summary(id).await? {
            self.pipeline.part_event(topic, summary);
        }
        Ok(())
    }

    async fn settle_bundle(&self, job: &QueueJob) -> std::result::Result<(), FlowError> {
        match job.parent_id {
            Some(bundle_id) => self.pipeline.settle_bundle(bundle_id).await,
            None => Ok(()),
        }
    }

    async fn publish(&self, sample: ProgressSample, bundle_id: Option<JobId>) {
        let part_id = sample.job_id;
        if let Err(e) = self.pipeline.ingest(sample, bundle_id).await {
            warn!(job_id = %part_id, error = %e, "Failed to publish progress");
        }
    }

    fn tracker(&self, job: &QueueJob) -> Tracker {
        Tracker {
            part_id: job.id,
            bundle_id: job.parent_id,
            length: 0,
            transferred: 0,
            cadence: SampleCadence::new(self.progress_interval),
            meter: SpeedMeter::default(),
        }
    }
}

async fn discard_quietly(file: PartFile) {
    let path = file.path().to_path_buf();
    if let Err(e) = file.discard().await {
        warn!(path = %path.display(), error = %e, "Failed to remove part file");
    }
}
