//! Errors surfaced by the engine's public operations.

use thiserror::Error;

use batchflow_core::{BatchId, DomainError, JobId};

use crate::jobs::store::StoreError;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Operation parameters failed schema validation; nothing was persisted.
    #[error("malformed configuration: {0}")]
    MalformedConfiguration(String),

    #[error("{subject} lacks permission {permission} on {resource_type} {resource_id}")]
    Unauthorized {
        subject: String,
        permission: String,
        resource_type: String,
        resource_id: String,
    },

    #[error("unknown batch operation: {0}")]
    UnknownOperation(String),

    /// The batch does not exist; it may have completed and been purged.
    #[error("batch {0} not found")]
    BatchNotFound(BatchId),

    #[error("job {0} not found")]
    JobNotFound(JobId),

    /// A worker holds an unexpired lock on the job.
    #[error("job {0} is locked by a running worker")]
    JobLocked(JobId),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl EngineError {
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedConfiguration(msg.into())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        Self::MalformedConfiguration(err.to_string())
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
