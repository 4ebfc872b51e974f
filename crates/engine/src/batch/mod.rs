//! Batches: bulk operations split into durable, resumable chunk jobs.
//!
//! Flow: [`BatchService::enqueue_batch`] stores a [`Batch`] plus its seed job.
//! The [`SeedJobHandler`] creates chunk jobs a few at a time, each run by the
//! [`ExecutionJobHandler`]. The final seed invocation creates a monitor job;
//! the [`MonitorJobHandler`] removes the batch once no chunk job is left.

pub mod config;
pub mod execution;
pub mod model;
pub mod monitor;
pub mod operation;
pub mod seed;
pub mod service;

pub use config::BatchConfiguration;
pub use execution::ExecutionJobHandler;
pub use model::{Batch, BatchHandle, BatchStatus, CompletedBatch};
pub use monitor::MonitorJobHandler;
pub use operation::{AuthorizationScope, BatchOperation, OperationAuthorization, OperationRegistry};
pub use seed::SeedJobHandler;
pub use service::BatchService;
