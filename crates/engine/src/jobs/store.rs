//! Job record store: durable jobs, batches and incidents with optimistic locking.
//!
//! All writes go through [`JobRecordStore::commit`], which applies a
//! [`UnitOfWork`] atomically. Every update and delete names the version it was
//! based on; if any record moved, the whole unit is rejected with
//! [`StoreError::Conflict`] and nothing is written. This compare-and-swap is the
//! only coordination between workers and between engine instances.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};

use batchflow_core::{BatchId, ExpectedVersion, IncidentId, JobId};

use super::incident::Incident;
use super::types::{ExecutionFailure, Job, JobKind};
use crate::batch::model::{Batch, CompletedBatch};

/// Reference to a stored record, used in errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordRef {
    Job(JobId),
    Batch(BatchId),
    Incident(IncidentId),
}

impl std::fmt::Display for RecordRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecordRef::Job(id) => write!(f, "job {id}"),
            RecordRef::Batch(id) => write!(f, "batch {id}"),
            RecordRef::Incident(id) => write!(f, "incident {id}"),
        }
    }
}

/// Job store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(RecordRef),
    #[error("{0} already exists")]
    AlreadyExists(RecordRef),
    #[error("optimistic lock conflict on {record}: expected {expected:?}, found version {actual}")]
    Conflict {
        record: RecordRef,
        expected: ExpectedVersion,
        actual: u64,
    },
    #[error("storage error: {0}")]
    Storage(String),
}

impl StoreError {
    /// A lost race: the record changed or vanished since it was read.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. } | StoreError::NotFound(_))
    }

    /// The record the error is about, if any.
    pub fn record(&self) -> Option<RecordRef> {
        match self {
            StoreError::NotFound(r) | StoreError::AlreadyExists(r) => Some(*r),
            StoreError::Conflict { record, .. } => Some(*record),
            StoreError::Storage(_) => None,
        }
    }
}

/// Store trouble inside a handler is retryable.
impl From<StoreError> for ExecutionFailure {
    fn from(err: StoreError) -> Self {
        ExecutionFailure::transient(err.to_string())
    }
}

/// A single staged write.
#[derive(Debug, Clone)]
pub enum WriteOp {
    InsertJob(Job),
    /// Replace the job; `job.version` is the expected current version.
    UpdateJob(Job),
    DeleteJob {
        id: JobId,
        expected: ExpectedVersion,
    },
    InsertBatch(Batch),
    /// Replace the batch; `batch.version` is the expected current version.
    UpdateBatch(Batch),
    DeleteBatch {
        id: BatchId,
        expected: ExpectedVersion,
    },
    InsertIncident(Incident),
    DeleteIncident(IncidentId),
    RecordCompletedBatch(CompletedBatch),
}

/// Writes applied together or not at all.
#[derive(Debug, Clone, Default)]
pub struct UnitOfWork {
    ops: Vec<WriteOp>,
}

impl UnitOfWork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_job(&mut self, job: Job) -> &mut Self {
        self.ops.push(WriteOp::InsertJob(job));
        self
    }

    pub fn update_job(&mut self, job: Job) -> &mut Self {
        self.ops.push(WriteOp::UpdateJob(job));
        self
    }

    pub fn delete_job(&mut self, id: JobId, expected: ExpectedVersion) -> &mut Self {
        self.ops.push(WriteOp::DeleteJob { id, expected });
        self
    }

    pub fn insert_batch(&mut self, batch: Batch) -> &mut Self {
        self.ops.push(WriteOp::InsertBatch(batch));
        self
    }

    pub fn update_batch(&mut self, batch: Batch) -> &mut Self {
        self.ops.push(WriteOp::UpdateBatch(batch));
        self
    }

    pub fn delete_batch(&mut self, id: BatchId, expected: ExpectedVersion) -> &mut Self {
        self.ops.push(WriteOp::DeleteBatch { id, expected });
        self
    }

    pub fn insert_incident(&mut self, incident: Incident) -> &mut Self {
        self.ops.push(WriteOp::InsertIncident(incident));
        self
    }

    pub fn delete_incident(&mut self, id: IncidentId) -> &mut Self {
        self.ops.push(WriteOp::DeleteIncident(id));
        self
    }

    pub fn record_completed_batch(&mut self, completed: CompletedBatch) -> &mut Self {
        self.ops.push(WriteOp::RecordCompletedBatch(completed));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn into_ops(self) -> Vec<WriteOp> {
        self.ops
    }
}

/// Selection of jobs eligible for acquisition.
#[derive(Debug, Clone)]
pub struct DueJobFilter {
    pub now: DateTime<Utc>,
    /// Restrict to these kinds; `None` selects every kind.
    pub kinds: Option<Vec<JobKind>>,
}

impl DueJobFilter {
    pub fn at(now: DateTime<Utc>) -> Self {
        Self { now, kinds: None }
    }

    pub fn with_kinds(mut self, kinds: Vec<JobKind>) -> Self {
        self.kinds = Some(kinds);
        self
    }

    fn admits(&self, job: &Job) -> bool {
        job.is_acquirable(self.now)
            && self
                .kinds
                .as_ref()
                .is_none_or(|kinds| kinds.contains(&job.kind()))
    }
}

#[derive(Debug, Clone, Default)]
pub struct IncidentFilter {
    pub batch_id: Option<BatchId>,
    pub job_id: Option<JobId>,
}

impl IncidentFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn for_batch(batch_id: BatchId) -> Self {
        Self {
            batch_id: Some(batch_id),
            job_id: None,
        }
    }

    pub fn for_job(job_id: JobId) -> Self {
        Self {
            batch_id: None,
            job_id: Some(job_id),
        }
    }

    fn admits(&self, incident: &Incident) -> bool {
        self.batch_id.is_none_or(|b| incident.batch_id == Some(b))
            && self.job_id.is_none_or(|j| incident.job_id == j)
    }
}

/// Durable storage for jobs, batches and incidents.
pub trait JobRecordStore: Send + Sync {
    /// Apply all writes atomically, checking every expected version first.
    fn commit(&self, uow: UnitOfWork) -> Result<(), StoreError>;

    fn get_job(&self, id: JobId) -> Result<Option<Job>, StoreError>;

    fn get_batch(&self, id: BatchId) -> Result<Option<Batch>, StoreError>;

    fn list_batches(&self) -> Result<Vec<Batch>, StoreError>;

    /// Jobs that are due, unlocked (or lock expired), have retries left and do
    /// not belong to a suspended batch; ordered by priority descending, then
    /// due date ascending.
    fn select_due(&self, filter: &DueJobFilter, limit: usize) -> Result<Vec<Job>, StoreError>;

    fn jobs_for_batch(
        &self,
        batch_id: BatchId,
        kind: Option<JobKind>,
    ) -> Result<Vec<Job>, StoreError>;

    fn incidents(&self, filter: &IncidentFilter) -> Result<Vec<Incident>, StoreError>;

    fn completed_batches(&self) -> Result<Vec<CompletedBatch>, StoreError>;

    fn insert_job(&self, job: Job) -> Result<(), StoreError> {
        let mut uow = UnitOfWork::new();
        uow.insert_job(job);
        self.commit(uow)
    }

    /// Compare-and-swap a single job. Returns the stored copy (version bumped).
    fn update_job(&self, job: &Job) -> Result<Job, StoreError> {
        let mut uow = UnitOfWork::new();
        uow.update_job(job.clone());
        self.commit(uow)?;
        let mut stored = job.clone();
        stored.version += 1;
        Ok(stored)
    }

    fn delete_job(&self, id: JobId, expected: ExpectedVersion) -> Result<(), StoreError> {
        let mut uow = UnitOfWork::new();
        uow.delete_job(id, expected);
        self.commit(uow)
    }

    /// Compare-and-swap a single batch. Returns the stored copy (version bumped).
    fn update_batch(&self, batch: &Batch) -> Result<Batch, StoreError> {
        let mut uow = UnitOfWork::new();
        uow.update_batch(batch.clone());
        self.commit(uow)?;
        let mut stored = batch.clone();
        stored.version += 1;
        Ok(stored)
    }
}

impl<S> JobRecordStore for Arc<S>
where
    S: JobRecordStore + ?Sized,
{
    fn commit(&self, uow: UnitOfWork) -> Result<(), StoreError> {
        (**self).commit(uow)
    }

    fn get_job(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        (**self).get_job(id)
    }

    fn get_batch(&self, id: BatchId) -> Result<Option<Batch>, StoreError> {
        (**self).get_batch(id)
    }

    fn list_batches(&self) -> Result<Vec<Batch>, StoreError> {
        (**self).list_batches()
    }

    fn select_due(&self, filter: &DueJobFilter, limit: usize) -> Result<Vec<Job>, StoreError> {
        (**self).select_due(filter, limit)
    }

    fn jobs_for_batch(
        &self,
        batch_id: BatchId,
        kind: Option<JobKind>,
    ) -> Result<Vec<Job>, StoreError> {
        (**self).jobs_for_batch(batch_id, kind)
    }

    fn incidents(&self, filter: &IncidentFilter) -> Result<Vec<Incident>, StoreError> {
        (**self).incidents(filter)
    }

    fn completed_batches(&self) -> Result<Vec<CompletedBatch>, StoreError> {
        (**self).completed_batches()
    }
}

#[derive(Debug, Default)]
struct StoreState {
    jobs: HashMap<JobId, Job>,
    batches: HashMap<BatchId, Batch>,
    incidents: HashMap<IncidentId, Incident>,
    completed: Vec<CompletedBatch>,
}

impl StoreState {
    /// Current version of a record; incidents are immutable and report 1.
    fn version_of(&self, record: RecordRef) -> Option<u64> {
        match record {
            RecordRef::Job(id) => self.jobs.get(&id).map(|j| j.version),
            RecordRef::Batch(id) => self.batches.get(&id).map(|b| b.version),
            RecordRef::Incident(id) => self.incidents.get(&id).map(|_| 1),
        }
    }

    /// Check every op against current state plus the effect of earlier ops
    /// in the same unit.
    fn validate(&self, ops: &[WriteOp]) -> Result<(), StoreError> {
        let mut staged: HashMap<RecordRef, Option<u64>> = HashMap::new();
        let current = |staged: &HashMap<RecordRef, Option<u64>>, record: RecordRef| {
            staged
                .get(&record)
                .copied()
                .unwrap_or_else(|| self.version_of(record))
        };

        for op in ops {
            match op {
                WriteOp::InsertJob(job) => {
                    let record = RecordRef::Job(job.id);
                    if current(&staged, record).is_some() {
                        return Err(StoreError::AlreadyExists(record));
                    }
                    staged.insert(record, Some(job.version));
                }
                WriteOp::InsertBatch(batch) => {
                    let record = RecordRef::Batch(batch.id);
                    if current(&staged, record).is_some() {
                        return Err(StoreError::AlreadyExists(record));
                    }
                    staged.insert(record, Some(batch.version));
                }
                WriteOp::InsertIncident(incident) => {
                    let record = RecordRef::Incident(incident.id);
                    if current(&staged, record).is_some() {
                        return Err(StoreError::AlreadyExists(record));
                    }
                    staged.insert(record, Some(1));
                }
                WriteOp::UpdateJob(job) => {
                    let record = RecordRef::Job(job.id);
                    let actual = check_version(
                        record,
                        current(&staged, record),
                        ExpectedVersion::Exact(job.version),
                    )?;
                    staged.insert(record, Some(actual + 1));
                }
                WriteOp::UpdateBatch(batch) => {
                    let record = RecordRef::Batch(batch.id);
                    let actual = check_version(
                        record,
                        current(&staged, record),
                        ExpectedVersion::Exact(batch.version),
                    )?;
                    staged.insert(record, Some(actual + 1));
                }
                WriteOp::DeleteJob { id, expected } => {
                    let record = RecordRef::Job(*id);
                    check_version(record, current(&staged, record), *expected)?;
                    staged.insert(record, None);
                }
                WriteOp::DeleteBatch { id, expected } => {
                    let record = RecordRef::Batch(*id);
                    check_version(record, current(&staged, record), *expected)?;
                    staged.insert(record, None);
                }
                WriteOp::DeleteIncident(id) => {
                    let record = RecordRef::Incident(*id);
                    check_version(record, current(&staged, record), ExpectedVersion::Any)?;
                    staged.insert(record, None);
                }
                WriteOp::RecordCompletedBatch(_) => {}
            }
        }
        Ok(())
    }

    fn apply(&mut self, ops: Vec<WriteOp>) {
        for op in ops {
            match op {
                WriteOp::InsertJob(job) => {
                    self.jobs.insert(job.id, job);
                }
                WriteOp::UpdateJob(mut job) => {
                    job.version += 1;
                    self.jobs.insert(job.id, job);
                }
                WriteOp::DeleteJob { id, .. } => {
                    self.jobs.remove(&id);
                }
                WriteOp::InsertBatch(batch) => {
                    self.batches.insert(batch.id, batch);
                }
                WriteOp::UpdateBatch(mut batch) => {
                    batch.version += 1;
                    self.batches.insert(batch.id, batch);
                }
                WriteOp::DeleteBatch { id, .. } => {
                    self.batches.remove(&id);
                }
                WriteOp::InsertIncident(incident) => {
                    self.incidents.insert(incident.id, incident);
                }
                WriteOp::DeleteIncident(id) => {
                    self.incidents.remove(&id);
                }
                WriteOp::RecordCompletedBatch(completed) => {
                    self.completed.push(completed);
                }
            }
        }
    }

    fn batch_suspended(&self, batch_id: Option<BatchId>) -> bool {
        batch_id
            .and_then(|id| self.batches.get(&id))
            .is_some_and(|b| b.suspended)
    }
}

fn check_version(
    record: RecordRef,
    current: Option<u64>,
    expected: ExpectedVersion,
) -> Result<u64, StoreError> {
    let actual = current.ok_or(StoreError::NotFound(record))?;
    if expected.matches(actual) {
        Ok(actual)
    } else {
        Err(StoreError::Conflict {
            record,
            expected,
            actual,
        })
    }
}

/// In-memory job record store.
///
/// Intended for tests/dev and single-process embedding. A single lock guards
/// all records, so every commit is trivially atomic.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    state: RwLock<StoreState>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Number of stored jobs (all kinds, failed included).
    pub fn job_count(&self) -> usize {
        self.state.read().map(|s| s.jobs.len()).unwrap_or(0)
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, StoreState>, StoreError> {
        self.state
            .read()
            .map_err(|_| StoreError::Storage("lock poisoned".to_string()))
    }
}

impl JobRecordStore for InMemoryJobStore {
    fn commit(&self, uow: UnitOfWork) -> Result<(), StoreError> {
        if uow.is_empty() {
            return Ok(());
        }
        let mut state = self
            .state
            .write()
            .map_err(|_| StoreError::Storage("lock poisoned".to_string()))?;

        let ops = uow.into_ops();
        state.validate(&ops)?;
        state.apply(ops);
        Ok(())
    }

    fn get_job(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        Ok(self.read()?.jobs.get(&id).cloned())
    }

    fn get_batch(&self, id: BatchId) -> Result<Option<Batch>, StoreError> {
        Ok(self.read()?.batches.get(&id).cloned())
    }

    fn list_batches(&self) -> Result<Vec<Batch>, StoreError> {
        let state = self.read()?;
        let mut batches: Vec<Batch> = state.batches.values().cloned().collect();
        batches.sort_by_key(|b| (b.created_at, b.id));
        Ok(batches)
    }

    fn select_due(&self, filter: &DueJobFilter, limit: usize) -> Result<Vec<Job>, StoreError> {
        let state = self.read()?;
        let mut due: Vec<&Job> = state
            .jobs
            .values()
            .filter(|j| filter.admits(j) && !state.batch_suspended(j.batch_id))
            .collect();

        due.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.due_date.cmp(&b.due_date))
                .then(a.id.cmp(&b.id))
        });

        Ok(due.into_iter().take(limit).cloned().collect())
    }

    fn jobs_for_batch(
        &self,
        batch_id: BatchId,
        kind: Option<JobKind>,
    ) -> Result<Vec<Job>, StoreError> {
        let state = self.read()?;
        let mut jobs: Vec<Job> = state
            .jobs
            .values()
            .filter(|j| j.batch_id == Some(batch_id) && kind.is_none_or(|k| j.kind() == k))
            .cloned()
            .collect();
        jobs.sort_by_key(|j| (j.created_at, j.id));
        Ok(jobs)
    }

    fn incidents(&self, filter: &IncidentFilter) -> Result<Vec<Incident>, StoreError> {
        let state = self.read()?;
        let mut incidents: Vec<Incident> = state
            .incidents
            .values()
            .filter(|i| filter.admits(i))
            .cloned()
            .collect();
        incidents.sort_by_key(|i| (i.created_at, i.id));
        Ok(incidents)
    }

    fn completed_batches(&self) -> Result<Vec<CompletedBatch>, StoreError> {
        Ok(self.read()?.completed.clone())
    }
}
