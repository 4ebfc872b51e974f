//! Handler registry: maps a job kind to the code that runs it.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::store::{JobRecordStore, UnitOfWork};
use super::types::{HandlerResult, Job, JobKind};
use crate::batch::{ExecutionJobHandler, MonitorJobHandler, SeedJobHandler};
use crate::batch::operation::OperationRegistry;
use crate::config::EngineConfig;

/// Everything a handler may consult while running one job.
pub struct HandlerContext<'a> {
    pub store: &'a dyn JobRecordStore,
    pub config: &'a EngineConfig,
    pub operations: &'a OperationRegistry,
    pub now: DateTime<Utc>,
}

/// Runs jobs of one kind.
///
/// Handlers stage their writes in `uow`; the executor commits them together
/// with the job's own deletion or update, so either everything lands or
/// nothing does.
pub trait JobHandler: Send + Sync {
    fn kind(&self) -> JobKind;

    fn handle(&self, ctx: &HandlerContext<'_>, job: &Job, uow: &mut UnitOfWork) -> HandlerResult;
}

#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<JobKind, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the seed, execution and monitor handlers.
    pub fn with_batch_handlers() -> Self {
        let mut registry = Self::new();
        registry.register(SeedJobHandler);
        registry.register(ExecutionJobHandler);
        registry.register(MonitorJobHandler);
        registry
    }

    /// Register a handler, replacing any previous one for the same kind.
    pub fn register(&mut self, handler: impl JobHandler + 'static) -> &mut Self {
        self.handlers.insert(handler.kind(), Arc::new(handler));
        self
    }

    pub fn get(&self, kind: JobKind) -> Option<&Arc<dyn JobHandler>> {
        self.handlers.get(&kind)
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("kinds", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}
