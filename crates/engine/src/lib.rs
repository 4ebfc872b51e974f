//! `batchflow-engine`: batch execution and durable job scheduling.
//!
//! A bulk operation is enqueued as a batch, split into chunk jobs by seed
//! jobs, executed concurrently by one or more [`JobExecutor`]s and finalized
//! by a monitor job. All coordination goes through optimistic-lock commits
//! on the [`JobRecordStore`], so executors in separate processes can share
//! one store.

pub mod batch;
pub mod config;
pub mod engine;
pub mod error;
pub mod jobs;
pub mod operations;

pub use batch::{BatchHandle, BatchService, BatchStatus, OperationRegistry};
pub use config::EngineConfig;
pub use engine::Engine;
pub use error::{EngineError, EngineResult};
pub use jobs::{InMemoryJobStore, JobExecutor, JobExecutorHandle, JobRecordStore};
