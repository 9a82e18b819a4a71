use async_trait::async_trait;
use fjall::{Batch, Config, Keyspace, PartitionCreateOptions, PartitionHandle};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::job::{
    Dependencies, FailOutcome, FlowIds, FlowRequest, JobId, JobState, NewJob, QueueJob,
};
use super::keys::{
    DEP_PENDING, DEP_PROCESSED, decode_dep_key, decode_state_key, encode_dep_key,
    encode_dep_prefix, encode_job_key, encode_meta_key, encode_state_key, encode_state_prefix,
};
use super::retry::RetryPolicy;
use super::{JobQueue, QueueError, Result};

const META_NEXT_SEQ: &str = "next_seq";

/// FjallQueue keeps job records, their state index and flow edges in an
/// embedded Fjall keyspace
///
/// Architecture:
/// - `jobs` partition: job key → QueueJob (JSON)
/// - `states` partition: queue/state/id index used for claiming and listing
/// - `deps` partition: parent/child edge → processed marker
/// - `metadata` partition: "next_seq" → u64 (persistent id counter)
///
/// Every transition writes the record and its index entries in one batch.
/// Transitions are serialized by `write_lock`, which is what makes `claim`
/// hand a job to exactly one worker.
pub struct FjallQueue {
    pub(super) keyspace: Keyspace,
    pub(super) jobs: PartitionHandle,
    pub(super) states: PartitionHandle,
    pub(super) deps: PartitionHandle,
    metadata: PartitionHandle,
    seq_counter: AtomicU64,
    retry: RetryPolicy,
    pub(super) write_lock: Mutex<()>,
}

impl FjallQueue {
    /// Open or create a FjallQueue at the specified path
    pub fn open<P: AsRef<Path>>(path: P, retry: RetryPolicy) -> Result<Self> {
        let path = path.as_ref();
        info!("Opening FjallQueue at: {}", path.display());

        let keyspace = Config::new(path).open()?;

        let jobs = keyspace.open_partition("jobs", PartitionCreateOptions::default())?;
        let states = keyspace.open_partition("states", PartitionCreateOptions::default())?;
        let deps = keyspace.open_partition("deps", PartitionCreateOptions::default())?;
        let metadata = keyspace.open_partition("metadata", PartitionCreateOptions::default())?;

        let current_seq = metadata
            .get(encode_meta_key(META_NEXT_SEQ))?
            .map(|bytes| u64::from_be_bytes(bytes.as_ref().try_into().unwrap_or([0u8; 8])))
            .unwrap_or(0);

        info!("FjallQueue opened, current sequence: {}", current_seq);

        Ok(Self {
            keyspace,
            jobs,
            states,
            deps,
            metadata,
            seq_counter: AtomicU64::new(current_seq),
            retry,
            write_lock: Mutex::new(()),
        })
    }

    /// Get current sequence counter value
    pub fn current_seq(&self) -> u64 {
        self.seq_counter.load(Ordering::SeqCst)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Flush all writes to disk
    pub fn flush(&self) -> Result<()> {
        self.keyspace.persist(fjall::PersistMode::SyncAll)?;
        Ok(())
    }

    pub(super) fn load(&self, id: JobId) -> Result<Option<QueueJob>> {
        match self.jobs.get(encode_job_key(id))? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn load_existing(&self, id: JobId) -> Result<QueueJob> {
        self.load(id)?.ok_or(QueueError::JobNotFound(id))
    }

    /// Allocate an id and stage the counter update in `batch`
    fn next_id(&self, batch: &mut Batch) -> JobId {
        let seq = self.seq_counter.fetch_add(1, Ordering::SeqCst);
        batch.insert(
            &self.metadata,
            encode_meta_key(META_NEXT_SEQ),
            (seq + 1).to_be_bytes().to_vec(),
        );
        JobId(seq)
    }

    fn new_record(&self, id: JobId, job: NewJob) -> QueueJob {
        QueueJob {
            id,
            queue: job.queue,
            payload: job.payload,
            state: JobState::Waiting,
            parent_id: job.parent_id,
            attempts_made: 0,
            max_attempts: self.retry.max_attempts,
            delay_until_ms: None,
            failed_reason: None,
            created_at_ms: now_ms(),
            processed_at_ms: None,
            finished_at_ms: None,
        }
    }

    /// Stage a record write, moving its index entry away from `previous`
    pub(super) fn stage_put(
        &self,
        batch: &mut Batch,
        job: &QueueJob,
        previous: Option<JobState>,
    ) -> Result<()> {
        if let Some(previous) = previous {
            batch.remove(&self.states, encode_state_key(&job.queue, previous, job.id));
        }
        batch.insert(&self.jobs, encode_job_key(job.id), serde_json::to_vec(job)?);
        batch.insert(
            &self.states,
            encode_state_key(&job.queue, job.state, job.id),
            Vec::<u8>::new(),
        );
        Ok(())
    }

    pub(super) fn stage_delete(&self, batch: &mut Batch, job: &QueueJob) {
        batch.remove(&self.jobs, encode_job_key(job.id));
        batch.remove(&self.states, encode_state_key(&job.queue, job.state, job.id));
    }

    /// Stage the parent edge of `job` as processed, if it has a parent
    fn stage_processed_edge(&self, batch: &mut Batch, job: &QueueJob) {
        if let Some(parent) = job.parent_id {
            batch.insert(&self.deps, encode_dep_key(parent, job.id), DEP_PROCESSED.to_vec());
        }
    }

    pub(super) fn child_edges(&self, parent: JobId) -> Result<Vec<(JobId, bool)>> {
        let mut edges = Vec::new();
        for item in self.deps.prefix(encode_dep_prefix(parent)) {
            let (key, value) = item?;
            if let Some((_, child)) = decode_dep_key(&key) {
                edges.push((child, value.as_ref() == DEP_PROCESSED));
            }
        }
        Ok(edges)
    }

    fn ids_in_state(&self, queue: &str, state: JobState) -> Result<Vec<JobId>> {
        let mut ids = Vec::new();
        for item in self.states.prefix(encode_state_prefix(queue, state)) {
            let (key, _) = item?;
            if let Some(id) = decode_state_key(&key) {
                ids.push(id);
            }
        }
        Ok(ids)
    }

    fn finish(&self, batch: &mut Batch, job: &mut QueueJob, state: JobState) -> Result<()> {
        let previous = job.state;
        job.state = state;
        job.delay_until_ms = None;
        job.finished_at_ms = Some(now_ms());
        self.stage_put(batch, job, Some(previous))?;
        self.stage_processed_edge(batch, job);
        Ok(())
    }
}

#[async_trait]
impl JobQueue for FjallQueue {
    async fn enqueue(&self, job: NewJob) -> Result<JobId> {
        let _guard = self.write_lock.lock().await;

        if let Some(parent) = job.parent_id {
            self.load_existing(parent)?;
        }

        let mut batch = self.keyspace.batch();
        let id = self.next_id(&mut batch);
        let record = self.new_record(id, job);

        self.stage_put(&mut batch, &record, None)?;
        if let Some(parent) = record.parent_id {
            batch.insert(&self.deps, encode_dep_key(parent, id), DEP_PENDING.to_vec());
        }
        batch.commit()?;

        debug!(job_id = %id, queue = %record.queue, job_name = record.payload.job_name(), "Job enqueued");
        Ok(id)
    }

    async fn add_flow(&self, flow: FlowRequest) -> Result<FlowIds> {
        let _guard = self.write_lock.lock().await;

        let mut batch = self.keyspace.batch();
        let parent = self.next_id(&mut batch);
        let record = self.new_record(parent, flow.parent);
        self.stage_put(&mut batch, &record, None)?;

        let mut children = Vec::with_capacity(flow.children.len());
        for child in flow.children {
            let id = self.next_id(&mut batch);
            let record = self.new_record(id, child.with_parent(parent));
            self.stage_put(&mut batch, &record, None)?;
            batch.insert(&self.deps, encode_dep_key(parent, id), DEP_PENDING.to_vec());
            children.push(id);
        }

        // Ids handed out for a batch that fails to commit are simply skipped.
        batch.commit()?;

        info!(%parent, children = children.len(), "Flow enqueued");
        Ok(FlowIds { parent, children })
    }

    async fn get_job(&self, id: JobId) -> Result<Option<QueueJob>> {
        self.load(id)
    }

    async fn list_by_state(&self, queue: &str, state: JobState) -> Result<Vec<JobId>> {
        self.ids_in_state(queue, state)
    }

    async fn claim(&self, queue: &str) -> Result<Option<QueueJob>> {
        let _guard = self.write_lock.lock().await;

        let Some(id) = self.ids_in_state(queue, JobState::Waiting)?.into_iter().next() else {
            return Ok(None);
        };

        let mut job = self.load_existing(id)?;
        job.state = JobState::Active;
        job.attempts_made += 1;
        job.processed_at_ms = Some(now_ms());

        let mut batch = self.keyspace.batch();
        self.stage_put(&mut batch, &job, Some(JobState::Waiting))?;
        batch.commit()?;

        debug!(job_id = %id, attempt = job.attempts_made, "Job claimed");
        Ok(Some(job))
    }

    async fn complete(&self, id: JobId) -> Result<bool> {
        let _guard = self.write_lock.lock().await;

        let mut job = self.load_existing(id)?;
        match job.state {
            JobState::Completed => return Ok(false),
            JobState::Active | JobState::Waiting => {}
            state => {
                return Err(QueueError::InvalidTransition {
                    id,
                    state,
                    operation: "complete",
                });
            }
        }

        let mut batch = self.keyspace.batch();
        self.finish(&mut batch, &mut job, JobState::Completed)?;
        batch.commit()?;

        debug!(job_id = %id, "Job completed");
        Ok(true)
    }

    async fn fail(&self, id: JobId, reason: &str) -> Result<FailOutcome> {
        let _guard = self.write_lock.lock().await;

        let mut job = self.load_existing(id)?;
        if job.state != JobState::Active {
            return Err(QueueError::InvalidTransition {
                id,
                state: job.state,
                operation: "fail",
            });
        }

        job.failed_reason = Some(reason.to_string());
        let mut batch = self.keyspace.batch();

        let outcome = if self.retry.exhausted(job.attempts_made) {
            self.finish(&mut batch, &mut job, JobState::Failed)?;
            FailOutcome::Failed {
                attempts_made: job.attempts_made,
            }
        } else {
            let backoff = self.retry.backoff(job.attempts_made);
            let wake_at_ms = now_ms() + backoff.as_millis() as i64;
            job.state = JobState::Delayed;
            job.delay_until_ms = Some(wake_at_ms);
            self.stage_put(&mut batch, &job, Some(JobState::Active))?;
            FailOutcome::Retrying {
                attempts_made: job.attempts_made,
                wake_at_ms,
            }
        };
        batch.commit()?;

        debug!(job_id = %id, attempts = job.attempts_made, final_failure = outcome.is_final(), reason, "Job attempt failed");
        Ok(outcome)
    }

    async fn discard(&self, id: JobId, reason: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        let mut job = self.load_existing(id)?;
        if job.state.is_terminal() {
            return Err(QueueError::InvalidTransition {
                id,
                state: job.state,
                operation: "discard",
            });
        }

        job.failed_reason = Some(reason.to_string());
        let mut batch = self.keyspace.batch();
        self.finish(&mut batch, &mut job, JobState::Failed)?;
        batch.commit()?;

        debug!(job_id = %id, reason, "Job discarded");
        Ok(())
    }

    async fn delay(&self, id: JobId, until_ms: Option<i64>, expected: JobState) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        let mut job = self.load_existing(id)?;
        if job.state != expected {
            return Err(QueueError::StateMismatch {
                id,
                expected,
                actual: job.state,
            });
        }
        if expected.is_terminal() {
            return Err(QueueError::InvalidTransition {
                id,
                state: job.state,
                operation: "delay",
            });
        }

        // A pause is not a failed attempt
        if expected == JobState::Active && until_ms.is_none() {
            job.attempts_made = job.attempts_made.saturating_sub(1);
        }
        job.state = JobState::Delayed;
        job.delay_until_ms = until_ms;

        let mut batch = self.keyspace.batch();
        self.stage_put(&mut batch, &job, Some(expected))?;
        batch.commit()?;

        debug!(job_id = %id, until_ms, "Job delayed");
        Ok(())
    }

    async fn promote(&self, id: JobId) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        let mut job = self.load_existing(id)?;
        if job.state != JobState::Delayed {
            return Err(QueueError::InvalidTransition {
                id,
                state: job.state,
                operation: "promote",
            });
        }

        job.state = JobState::Waiting;
        job.delay_until_ms = None;

        let mut batch = self.keyspace.batch();
        self.stage_put(&mut batch, &job, Some(JobState::Delayed))?;
        batch.commit()?;

        debug!(job_id = %id, "Job promoted");
        Ok(())
    }

    async fn promote_due(&self, queue: &str, now_ms: i64) -> Result<Vec<JobId>> {
        let _guard = self.write_lock.lock().await;

        let mut promoted = Vec::new();
        let mut batch = self.keyspace.batch();

        for id in self.ids_in_state(queue, JobState::Delayed)? {
            let Some(mut job) = self.load(id)? else {
                continue;
            };
            // Paused jobs have no wake time and stay put
            match job.delay_until_ms {
                Some(wake_at) if wake_at <= now_ms => {
                    job.state = JobState::Waiting;
                    job.delay_until_ms = None;
                    self.stage_put(&mut batch, &job, Some(JobState::Delayed))?;
                    promoted.push(id);
                }
                _ => {}
            }
        }

        if !promoted.is_empty() {
            batch.commit()?;
            debug!(queue, count = promoted.len(), "Promoted due jobs");
        }
        Ok(promoted)
    }

    async fn remove(&self, id: JobId) -> Result<bool> {
        let _guard = self.write_lock.lock().await;

        let Some(job) = self.load(id)? else {
            return Ok(false);
        };
        if job.state == JobState::Active {
            return Err(QueueError::Leased(id));
        }
        self.delete_with_children(job)
    }

    async fn remove_claimed(&self, id: JobId) -> Result<bool> {
        let _guard = self.write_lock.lock().await;

        let Some(job) = self.load(id)? else {
            return Ok(false);
        };
        if job.state != JobState::Active {
            return Err(QueueError::StateMismatch {
                id,
                expected: JobState::Active,
                actual: job.state,
            });
        }
        self.delete_with_children(job)
    }

    async fn requeue_active(&self, queue: &str) -> Result<Vec<JobId>> {
        let _guard = self.write_lock.lock().await;

        let mut requeued = Vec::new();
        let mut batch = self.keyspace.batch();
        for id in self.ids_in_state(queue, JobState::Active)? {
            if let Some(mut job) = self.load(id)? {
                job.state = JobState::Waiting;
                self.stage_put(&mut batch, &job, Some(JobState::Active))?;
                requeued.push(id);
            }
        }

        if !requeued.is_empty() {
            batch.commit()?;
            info!(queue, count = requeued.len(), "Requeued jobs left active by a previous run");
        }
        Ok(requeued)
    }

    async fn get_dependencies(&self, parent: JobId) -> Result<Dependencies> {
        self.load_existing(parent)?;

        let mut dependencies = Dependencies::default();
        for (child, processed) in self.child_edges(parent)? {
            if processed {
                dependencies.processed.insert(child);
            } else {
                dependencies.unprocessed.insert(child);
            }
        }
        Ok(dependencies)
    }

    async fn health_check(&self) -> Result<()> {
        let _ = self.metadata.get(encode_meta_key(META_NEXT_SEQ))?;
        Ok(())
    }
}

impl FjallQueue {
    /// Delete `job`, its children and their edges. Caller holds `write_lock`.
    fn delete_with_children(&self, job: QueueJob) -> Result<bool> {
        let id = job.id;
        let mut batch = self.keyspace.batch();

        // A removed parent takes its children and edges with it
        for (child_id, _) in self.child_edges(id)? {
            if let Some(child) = self.load(child_id)? {
                if child.state == JobState::Active {
                    return Err(QueueError::Leased(child_id));
                }
                self.stage_delete(&mut batch, &child);
            }
            batch.remove(&self.deps, encode_dep_key(id, child_id));
        }

        self.stage_delete(&mut batch, &job);
        // The edge stays so the parent still accounts for this child
        self.stage_processed_edge(&mut batch, &job);
        batch.commit()?;

        debug!(job_id = %id, "Job removed");
        Ok(true)
    }
}

/// Get current Unix timestamp in milliseconds
pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
