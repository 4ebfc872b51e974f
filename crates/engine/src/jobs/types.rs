//! Core job types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use batchflow_core::{BatchId, JobId, Versioned};

/// Discriminator selecting the handler that runs a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Creates chunk jobs for a batch, a bounded number per invocation.
    Seed,
    /// Applies the batch operation to one chunk of entity ids.
    Execution,
    /// Polls a batch for completion and finalizes it.
    Monitor,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Seed => "seed",
            JobKind::Execution => "execution",
            JobKind::Monitor => "monitor",
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Full job type: handler kind plus the owning batch's operation type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobType {
    pub kind: JobKind,
    pub operation: String,
}

impl JobType {
    pub fn new(kind: JobKind, operation: impl Into<String>) -> Self {
        Self {
            kind,
            operation: operation.into(),
        }
    }
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind, self.operation)
    }
}

/// Exclusive, time-bounded claim on a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobLock {
    pub owner: String,
    pub expires_at: DateTime<Utc>,
}

impl JobLock {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// A durable unit of asynchronous work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub job_type: JobType,
    /// Owning batch (weak reference, lookup only).
    pub batch_id: Option<BatchId>,
    pub payload: Value,
    /// Not acquirable before this instant.
    pub due_date: DateTime<Utc>,
    /// Remaining attempts; 0 means the job waits for an operator.
    pub retries_left: u32,
    /// Failed attempts so far (drives backoff).
    pub attempts: u32,
    pub lock: Option<JobLock>,
    /// Higher runs first.
    pub priority: i32,
    pub exception_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub version: u64,
}

impl Job {
    /// Create a new job, due immediately.
    pub fn new(job_type: JobType, payload: Value, retries: u32, now: DateTime<Utc>) -> Self {
        Self {
            id: JobId::new(),
            job_type,
            batch_id: None,
            payload,
            due_date: now,
            retries_left: retries,
            attempts: 0,
            lock: None,
            priority: 0,
            exception_message: None,
            created_at: now,
            version: 1,
        }
    }

    pub fn with_batch(mut self, batch_id: BatchId) -> Self {
        self.batch_id = Some(batch_id);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn due_at(mut self, due_date: DateTime<Utc>) -> Self {
        self.due_date = due_date;
        self
    }

    pub fn kind(&self) -> JobKind {
        self.job_type.kind
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.due_date <= now
    }

    /// Whether an unexpired lock is held by anyone.
    pub fn is_locked_at(&self, now: DateTime<Utc>) -> bool {
        self.lock.as_ref().is_some_and(|l| !l.is_expired_at(now))
    }

    /// Whether `owner` holds an unexpired lock.
    pub fn is_locked_by(&self, owner: &str, now: DateTime<Utc>) -> bool {
        self.lock
            .as_ref()
            .is_some_and(|l| l.owner == owner && !l.is_expired_at(now))
    }

    /// Due, unlocked (or lock expired) and with retries left.
    pub fn is_acquirable(&self, now: DateTime<Utc>) -> bool {
        self.retries_left > 0 && self.is_due(now) && !self.is_locked_at(now)
    }

    pub fn has_failed(&self) -> bool {
        self.retries_left == 0
    }

    pub fn lock(&mut self, owner: impl Into<String>, expires_at: DateTime<Utc>) {
        self.lock = Some(JobLock {
            owner: owner.into(),
            expires_at,
        });
    }

    pub fn unlock(&mut self) {
        self.lock = None;
    }
}

impl Versioned for Job {
    type Id = JobId;

    fn id(&self) -> &JobId {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Failure classification returned by handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Retryable: consumes one retry and reschedules with backoff.
    Transient,
    /// Not retryable: exhausts retries and raises an incident immediately.
    Permanent,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::Transient => f.write_str("transient"),
            FailureKind::Permanent => f.write_str("permanent"),
        }
    }
}

/// A classified handler failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} failure: {message}")]
pub struct ExecutionFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl ExecutionFailure {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Permanent,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind == FailureKind::Transient
    }
}

/// Unclassified errors from collaborator code are treated as retryable.
impl From<anyhow::Error> for ExecutionFailure {
    fn from(err: anyhow::Error) -> Self {
        Self::transient(format!("{err:#}"))
    }
}

/// What a handler asks the executor to do with its job after success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// Delete the job.
    Complete,
    /// Keep the job, release the lock and make it due again at the given instant.
    Reschedule(DateTime<Utc>),
}

/// Result of a handler invocation.
pub type HandlerResult = Result<HandlerOutcome, ExecutionFailure>;
