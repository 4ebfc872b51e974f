//! Durable jobs and the executor that runs them.
//!
//! ## Components
//!
//! - `Job`: unit of work with retry budget, due date, lock and version
//! - `JobRecordStore`: persistence with optimistic-lock commits
//! - `JobAcquirer`: selects due jobs and locks them by compare-and-swap
//! - `JobExecutor`: acquisition loop, worker pool, retry/backoff, incidents
//! - `IncidentTracker`: failed jobs waiting for an operator

pub mod acquisition;
pub mod executor;
pub mod incident;
pub mod registry;
pub mod retry;
pub mod store;
pub mod types;

pub use acquisition::{AcquiredJobs, JobAcquirer};
pub use executor::{ExecutionOutcome, ExecutorStats, JobExecutor, JobExecutorHandle};
pub use incident::{Incident, IncidentTracker, IncidentType};
pub use registry::{HandlerContext, HandlerRegistry, JobHandler};
pub use retry::{Backoff, ExponentialBackoff, FixedBackoff, LinearBackoff, RetryPolicy};
pub use store::{
    DueJobFilter, IncidentFilter, InMemoryJobStore, JobRecordStore, RecordRef, StoreError,
    UnitOfWork, WriteOp,
};
pub use types::{
    ExecutionFailure, FailureKind, HandlerOutcome, HandlerResult, Job, JobKind, JobLock, JobType,
};
