//! Built-in batch operations.

pub mod external_task_retries;

pub use external_task_retries::{
    ExternalTaskError, ExternalTaskService, InMemoryExternalTaskService, SET_EXTERNAL_TASK_RETRIES,
    SetExternalTaskRetries, SetRetriesConfiguration,
};
