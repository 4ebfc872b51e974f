//! Engine context: one store, one configuration and the registries, shared by
//! the batch service, the incident tracker and any number of executors.

use std::sync::Arc;

use batchflow_auth::Authorizer;
use batchflow_core::JobId;

use crate::batch::operation::OperationRegistry;
use crate::batch::service::BatchService;
use crate::config::EngineConfig;
use crate::error::EngineResult;
use crate::jobs::executor::JobExecutor;
use crate::jobs::incident::IncidentTracker;
use crate::jobs::registry::HandlerRegistry;
use crate::jobs::store::JobRecordStore;
use crate::jobs::types::Job;

pub struct Engine<S, A> {
    store: S,
    config: Arc<EngineConfig>,
    operations: Arc<OperationRegistry>,
    handlers: Arc<HandlerRegistry>,
    batches: BatchService<S, A>,
    incidents: IncidentTracker<S>,
}

impl<S, A> Engine<S, A>
where
    S: JobRecordStore + Clone + 'static,
    A: Authorizer,
{
    /// Engine with the seed, execution and monitor handlers registered.
    pub fn new(store: S, authorizer: A, operations: OperationRegistry, config: EngineConfig) -> Self {
        Self::with_handlers(
            store,
            authorizer,
            operations,
            HandlerRegistry::with_batch_handlers(),
            config,
        )
    }

    pub fn with_handlers(
        store: S,
        authorizer: A,
        operations: OperationRegistry,
        handlers: HandlerRegistry,
        config: EngineConfig,
    ) -> Self {
        let config = Arc::new(config);
        let operations = Arc::new(operations);
        Self {
            batches: BatchService::new(store.clone(), authorizer, operations.clone(), config.clone()),
            incidents: IncidentTracker::new(store.clone()),
            handlers: Arc::new(handlers),
            store,
            config,
            operations,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn batches(&self) -> &BatchService<S, A> {
        &self.batches
    }

    pub fn incidents(&self) -> &IncidentTracker<S> {
        &self.incidents
    }

    /// Operator reset of a failed job; see [`IncidentTracker::set_job_retries`].
    pub fn set_job_retries(&self, job_id: JobId, retries: u32) -> EngineResult<Job> {
        self.incidents.set_job_retries(job_id, retries)
    }

    /// A new executor sharing this engine's store, registries and configuration.
    pub fn executor(&self) -> JobExecutor<S> {
        JobExecutor::new(
            self.store.clone(),
            self.config.clone(),
            self.handlers.clone(),
            self.operations.clone(),
        )
    }
}
