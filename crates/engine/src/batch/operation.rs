//! Batch operation plug-ins.
//!
//! An operation is written against its typed [`BatchConfiguration`] and
//! registered once. The engine only sees the type-erased form, keyed by the
//! operation's type string, so handlers stay generic.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;

use batchflow_auth::Permission;

use super::config::{self, BatchConfiguration};
use crate::error::EngineError;
use crate::jobs::types::ExecutionFailure;

/// Whether authorization is checked once per entity id or once for the batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthorizationScope {
    PerEntity,
    WholeSet,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationAuthorization {
    pub permission: Permission,
    pub resource_type: &'static str,
    pub scope: AuthorizationScope,
}

/// Business logic of one bulk operation.
pub trait BatchOperation: Send + Sync + 'static {
    /// Batch type discriminator, e.g. `set-external-task-retries`.
    const TYPE: &'static str;

    type Config: BatchConfiguration;

    fn authorization(&self) -> OperationAuthorization;

    /// Reject configurations that parse but make no sense.
    fn validate(&self, _config: &Self::Config) -> Result<(), EngineError> {
        Ok(())
    }

    /// Apply the operation to every id in `chunk`.
    ///
    /// May run more than once for the same chunk (retry after a crash), so it
    /// must be idempotent.
    fn execute(&self, chunk: &Self::Config) -> Result<(), ExecutionFailure>;
}

/// Chunks split off a batch configuration by one seed invocation.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct TakenChunks {
    /// One encoded configuration per chunk job.
    pub chunks: Vec<Value>,
    /// The configuration with the taken ids removed.
    pub remaining: Value,
}

pub(crate) trait ErasedOperation: Send + Sync {
    fn operation_type(&self) -> &'static str;

    fn authorization(&self) -> OperationAuthorization;

    /// Decode and validate the parameters; returns the encoded batch configuration.
    fn prepare(&self, ids: Vec<String>, parameters: Value) -> Result<Value, EngineError>;

    fn take_chunks(
        &self,
        configuration: &Value,
        chunk_size: u32,
        max_chunks: u32,
    ) -> Result<TakenChunks, ExecutionFailure>;

    fn execute(&self, chunk: &Value) -> Result<(), ExecutionFailure>;
}

struct Registered<O>(O);

/// A stored configuration that no longer decodes will not decode on retry either.
fn undecodable(err: EngineError) -> ExecutionFailure {
    ExecutionFailure::permanent(err.to_string())
}

impl<O: BatchOperation> ErasedOperation for Registered<O> {
    fn operation_type(&self) -> &'static str {
        O::TYPE
    }

    fn authorization(&self) -> OperationAuthorization {
        self.0.authorization()
    }

    fn prepare(&self, ids: Vec<String>, parameters: Value) -> Result<Value, EngineError> {
        let parsed: O::Config = config::assemble(ids, parameters)?;
        self.0.validate(&parsed)?;
        config::encode(&parsed)
    }

    fn take_chunks(
        &self,
        configuration: &Value,
        chunk_size: u32,
        max_chunks: u32,
    ) -> Result<TakenChunks, ExecutionFailure> {
        let parsed: O::Config = config::decode(configuration).map_err(undecodable)?;
        let (taken, rest) = config::split_chunks(parsed.ids(), chunk_size, max_chunks);

        let chunks = taken
            .into_iter()
            .map(|ids| config::encode(&parsed.with_ids(ids)))
            .collect::<Result<Vec<_>, _>>()
            .map_err(undecodable)?;
        let remaining = config::encode(&parsed.with_ids(rest)).map_err(undecodable)?;
        Ok(TakenChunks { chunks, remaining })
    }

    fn execute(&self, chunk: &Value) -> Result<(), ExecutionFailure> {
        let parsed: O::Config = config::decode(chunk).map_err(undecodable)?;
        self.0.execute(&parsed)
    }
}

/// Operations known to this engine, keyed by type.
#[derive(Clone, Default)]
pub struct OperationRegistry {
    operations: BTreeMap<&'static str, Arc<dyn ErasedOperation>>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<O: BatchOperation>(&mut self, operation: O) -> &mut Self {
        self.operations.insert(O::TYPE, Arc::new(Registered(operation)));
        self
    }

    pub fn with<O: BatchOperation>(mut self, operation: O) -> Self {
        self.register(operation);
        self
    }

    pub(crate) fn get(&self, operation_type: &str) -> Option<&Arc<dyn ErasedOperation>> {
        self.operations.get(operation_type)
    }

    pub fn contains(&self, operation_type: &str) -> bool {
        self.operations.contains_key(operation_type)
    }

    pub fn operation_types(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.operations.keys().copied()
    }

    pub fn authorization(&self, operation_type: &str) -> Option<OperationAuthorization> {
        self.get(operation_type).map(|op| op.authorization())
    }
}

impl std::fmt::Debug for OperationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationRegistry")
            .field("operations", &self.operations.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operations::{
        InMemoryExternalTaskService, SET_EXTERNAL_TASK_RETRIES, SetExternalTaskRetries,
    };
    use serde_json::json;

    fn registry() -> (OperationRegistry, Arc<InMemoryExternalTaskService>) {
        let tasks = Arc::new(InMemoryExternalTaskService::with_tasks(["t1", "t2", "t3"]));
        let registry = OperationRegistry::new().with(SetExternalTaskRetries::new(tasks.clone()));
        (registry, tasks)
    }

    #[test]
    fn registered_operation_is_found_by_type() {
        let (registry, _) = registry();
        assert!(registry.contains(SET_EXTERNAL_TASK_RETRIES));
        assert!(!registry.contains("delete-everything"));
        assert_eq!(
            registry.operation_types().collect::<Vec<_>>(),
            vec![SET_EXTERNAL_TASK_RETRIES]
        );
        let auth = registry.authorization(SET_EXTERNAL_TASK_RETRIES).unwrap();
        assert_eq!(auth.scope, AuthorizationScope::PerEntity);
    }

    #[test]
    fn take_chunks_shrinks_the_configuration() {
        let (registry, _) = registry();
        let op = registry.get(SET_EXTERNAL_TASK_RETRIES).unwrap();
        let configuration = op
            .prepare(vec!["t1".into(), "t2".into(), "t3".into()], json!({ "retries": 4 }))
            .unwrap();

        let taken = op.take_chunks(&configuration, 2, 1).unwrap();

        assert_eq!(taken.chunks, vec![json!({ "externalTaskIds": ["t1", "t2"], "retries": 4 })]);
        assert_eq!(taken.remaining, json!({ "externalTaskIds": ["t3"], "retries": 4 }));
    }

    #[test]
    fn executing_a_chunk_applies_the_operation() {
        let (registry, tasks) = registry();
        let op = registry.get(SET_EXTERNAL_TASK_RETRIES).unwrap();

        op.execute(&json!({ "externalTaskIds": ["t1", "t3"], "retries": 7 }))
            .unwrap();

        assert_eq!(tasks.retries_of("t1"), Some(7));
        assert_eq!(tasks.retries_of("t2"), Some(0));
        assert_eq!(tasks.retries_of("t3"), Some(7));
    }

    #[test]
    fn corrupt_chunk_payload_fails_permanently() {
        let (registry, _) = registry();
        let op = registry.get(SET_EXTERNAL_TASK_RETRIES).unwrap();

        let failure = op.execute(&json!({ "retries": 1 })).unwrap_err();
        assert!(!failure.is_transient());
    }
}
