//! `set-external-task-retries`: set the retry count of many external tasks.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use batchflow_auth::Permission;

use crate::batch::config::BatchConfiguration;
use crate::batch::operation::{AuthorizationScope, BatchOperation, OperationAuthorization};
use crate::error::EngineError;
use crate::jobs::types::ExecutionFailure;

pub const SET_EXTERNAL_TASK_RETRIES: &str = "set-external-task-retries";

const UPDATE: Permission = Permission::from_static("update");
const EXTERNAL_TASK: &str = "external_task";

/// `{ "externalTaskIds": [string], "retries": integer }`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetRetriesConfiguration {
    pub external_task_ids: Vec<String>,
    pub retries: i32,
}

impl BatchConfiguration for SetRetriesConfiguration {
    const IDS_FIELD: &'static str = "externalTaskIds";

    fn ids(&self) -> &[String] {
        &self.external_task_ids
    }

    fn with_ids(&self, ids: Vec<String>) -> Self {
        Self {
            external_task_ids: ids,
            retries: self.retries,
        }
    }
}

#[derive(Debug, Error)]
pub enum ExternalTaskError {
    #[error("external task {0} not found")]
    NotFound(String),
    /// Concurrent modification by unrelated work; retrying later helps.
    #[error("external task {0} was modified concurrently")]
    Conflict(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<ExternalTaskError> for ExecutionFailure {
    fn from(err: ExternalTaskError) -> Self {
        match err {
            ExternalTaskError::NotFound(_) => ExecutionFailure::permanent(err.to_string()),
            ExternalTaskError::Conflict(_) => ExecutionFailure::transient(err.to_string()),
            ExternalTaskError::Other(inner) => inner.into(),
        }
    }
}

/// Collaborator owning external tasks.
pub trait ExternalTaskService: Send + Sync {
    fn set_retries(&self, task_id: &str, retries: u32) -> Result<(), ExternalTaskError>;
}

impl<T> ExternalTaskService for Arc<T>
where
    T: ExternalTaskService + ?Sized,
{
    fn set_retries(&self, task_id: &str, retries: u32) -> Result<(), ExternalTaskError> {
        (**self).set_retries(task_id, retries)
    }
}

#[derive(Debug, Clone)]
pub struct SetExternalTaskRetries<T> {
    tasks: T,
}

impl<T> SetExternalTaskRetries<T> {
    pub fn new(tasks: T) -> Self {
        Self { tasks }
    }
}

impl<T> BatchOperation for SetExternalTaskRetries<T>
where
    T: ExternalTaskService + 'static,
{
    const TYPE: &'static str = SET_EXTERNAL_TASK_RETRIES;

    type Config = SetRetriesConfiguration;

    fn authorization(&self) -> OperationAuthorization {
        OperationAuthorization {
            permission: UPDATE,
            resource_type: EXTERNAL_TASK,
            scope: AuthorizationScope::PerEntity,
        }
    }

    fn validate(&self, config: &SetRetriesConfiguration) -> Result<(), EngineError> {
        if config.retries < 0 {
            return Err(EngineError::malformed(format!(
                "retries must not be negative, got {}",
                config.retries
            )));
        }
        Ok(())
    }

    /// Setting an absolute value is idempotent, so a re-run chunk is harmless.
    fn execute(&self, chunk: &SetRetriesConfiguration) -> Result<(), ExecutionFailure> {
        let retries = u32::try_from(chunk.retries)
            .map_err(|_| ExecutionFailure::permanent(format!("invalid retries {}", chunk.retries)))?;
        for task_id in &chunk.external_task_ids {
            self.tasks.set_retries(task_id, retries)?;
        }
        debug!(tasks = chunk.external_task_ids.len(), retries, "external task retries set");
        Ok(())
    }
}

/// External tasks held in memory.
#[derive(Debug, Default)]
pub struct InMemoryExternalTaskService {
    retries: RwLock<HashMap<String, u32>>,
    contended: RwLock<Vec<String>>,
    calls: AtomicU64,
}

impl InMemoryExternalTaskService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Service holding `ids`, each with zero retries.
    pub fn with_tasks<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let service = Self::new();
        for id in ids {
            service.insert(id, 0);
        }
        service
    }

    pub fn insert(&self, id: impl Into<String>, retries: u32) {
        if let Ok(mut map) = self.retries.write() {
            map.insert(id.into(), retries);
        }
    }

    /// Make every update of `id` fail with a conflict until cleared.
    pub fn set_contended(&self, id: impl Into<String>, contended: bool) {
        let id = id.into();
        if let Ok(mut list) = self.contended.write() {
            list.retain(|c| *c != id);
            if contended {
                list.push(id);
            }
        }
    }

    pub fn retries_of(&self, id: &str) -> Option<u32> {
        self.retries.read().ok()?.get(id).copied()
    }

    /// Number of `set_retries` calls received, failed ones included.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ExternalTaskService for InMemoryExternalTaskService {
    fn set_retries(&self, task_id: &str, retries: u32) -> Result<(), ExternalTaskError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let contended = self
            .contended
            .read()
            .map_err(|_| anyhow::anyhow!("external task registry poisoned"))?
            .iter()
            .any(|c| c == task_id);
        if contended {
            return Err(ExternalTaskError::Conflict(task_id.to_string()));
        }

        let mut map = self
            .retries
            .write()
            .map_err(|_| anyhow::anyhow!("external task registry poisoned"))?;
        match map.get_mut(task_id) {
            Some(current) => {
                *current = retries;
                Ok(())
            }
            None => Err(ExternalTaskError::NotFound(task_id.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_retries_are_rejected() {
        let op = SetExternalTaskRetries::new(InMemoryExternalTaskService::new());
        let config = SetRetriesConfiguration {
            external_task_ids: vec!["t1".into()],
            retries: -2,
        };
        assert!(matches!(
            op.validate(&config),
            Err(EngineError::MalformedConfiguration(_))
        ));
    }

    #[test]
    fn failures_are_classified() {
        let tasks = InMemoryExternalTaskService::with_tasks(["busy"]);
        tasks.set_contended("busy", true);
        let op = SetExternalTaskRetries::new(tasks);

        let busy = op
            .execute(&SetRetriesConfiguration {
                external_task_ids: vec!["busy".into()],
                retries: 1,
            })
            .unwrap_err();
        assert!(busy.is_transient());

        let missing = op
            .execute(&SetRetriesConfiguration {
                external_task_ids: vec!["missing".into()],
                retries: 1,
            })
            .unwrap_err();
        assert!(!missing.is_transient());
    }

    #[test]
    fn re_running_a_chunk_gives_the_same_result() {
        let tasks = Arc::new(InMemoryExternalTaskService::with_tasks(["a", "b"]));
        let op = SetExternalTaskRetries::new(tasks.clone());
        let chunk = SetRetriesConfiguration {
            external_task_ids: vec!["a".into(), "b".into()],
            retries: 4,
        };

        op.execute(&chunk).unwrap();
        op.execute(&chunk).unwrap();

        assert_eq!(tasks.retries_of("a"), Some(4));
        assert_eq!(tasks.retries_of("b"), Some(4));
        assert_eq!(tasks.calls(), 4);
    }
}
