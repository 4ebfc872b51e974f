//! Batch service: the entry point for clients.
//!
//! Enqueueing validates and authorizes the whole request before writing
//! anything, then stores the batch and its seed job in one unit of work.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::{info, instrument, warn};

use batchflow_auth::{ANY_RESOURCE, Authorizer, PrincipalId};
use batchflow_core::{BatchId, ExpectedVersion, Versioned};

use super::model::{chunk_count, Batch, BatchHandle, BatchJobPayload, BatchStatus, CompletedBatch};
use super::operation::{AuthorizationScope, OperationAuthorization, OperationRegistry};
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::jobs::incident::Incident;
use crate::jobs::store::{IncidentFilter, JobRecordStore, UnitOfWork};
use crate::jobs::types::{Job, JobKind, JobType};

const MAX_UPDATE_ATTEMPTS: usize = 3;

pub struct BatchService<S, A> {
    store: S,
    authorizer: A,
    operations: Arc<OperationRegistry>,
    config: Arc<EngineConfig>,
}

impl<S, A> BatchService<S, A>
where
    S: JobRecordStore,
    A: Authorizer,
{
    pub fn new(
        store: S,
        authorizer: A,
        operations: Arc<OperationRegistry>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            store,
            authorizer,
            operations,
            config,
        }
    }

    /// Create a batch for `operation_type` over `entity_ids`.
    ///
    /// Fails with `MalformedConfiguration` or `Unauthorized` without
    /// persisting anything.
    #[instrument(
        skip(self, subject, entity_ids, parameters),
        fields(subject = %subject, entities = entity_ids.len())
    )]
    pub fn enqueue_batch(
        &self,
        subject: &PrincipalId,
        operation_type: &str,
        entity_ids: Vec<String>,
        parameters: Value,
    ) -> EngineResult<BatchHandle> {
        let operation = self
            .operations
            .get(operation_type)
            .ok_or_else(|| EngineError::UnknownOperation(operation_type.to_string()))?;

        let configuration = operation.prepare(entity_ids.clone(), parameters)?;
        self.authorize(subject, &operation.authorization(), &entity_ids)?;

        let now = Utc::now();
        let total_jobs = chunk_count(entity_ids.len(), self.config.chunk_size);
        let mut batch = Batch::new(
            operation_type,
            total_jobs,
            self.config.jobs_per_seed,
            self.config.chunk_size,
            configuration,
            now,
        );
        let seed = Job::new(
            JobType::new(JobKind::Seed, operation_type),
            BatchJobPayload { batch_id: batch.id }.to_value(),
            self.config.retry.max_retries,
            now,
        )
        .with_batch(batch.id);
        batch.seed_job_id = Some(seed.id);

        let handle = BatchHandle {
            id: batch.id,
            total_jobs,
        };

        let mut uow = UnitOfWork::new();
        uow.insert_batch(batch).insert_job(seed);
        self.store.commit(uow)?;

        info!(batch_id = %handle.id, total_jobs, "batch enqueued");
        Ok(handle)
    }

    fn authorize(
        &self,
        subject: &PrincipalId,
        auth: &OperationAuthorization,
        entity_ids: &[String],
    ) -> EngineResult<()> {
        let denied = |resource_id: &str| {
            warn!(
                subject = %subject,
                permission = %auth.permission,
                resource_type = auth.resource_type,
                resource_id,
                "batch operation not authorized"
            );
            EngineError::Unauthorized {
                subject: subject.to_string(),
                permission: auth.permission.to_string(),
                resource_type: auth.resource_type.to_string(),
                resource_id: resource_id.to_string(),
            }
        };

        match auth.scope {
            AuthorizationScope::WholeSet => {
                if !self
                    .authorizer
                    .check(subject, &auth.permission, auth.resource_type, ANY_RESOURCE)
                {
                    return Err(denied(ANY_RESOURCE));
                }
            }
            AuthorizationScope::PerEntity => {
                if let Some(id) = entity_ids.iter().find(|id| {
                    !self
                        .authorizer
                        .check(subject, &auth.permission, auth.resource_type, id)
                }) {
                    return Err(denied(id));
                }
            }
        }
        Ok(())
    }

    /// Runtime status; `BatchNotFound` once the batch completed and was purged.
    #[instrument(skip(self))]
    pub fn get_batch_status(&self, id: BatchId) -> EngineResult<BatchStatus> {
        let batch = self
            .store
            .get_batch(id)?
            .ok_or(EngineError::BatchNotFound(id))?;
        let chunks = self.store.jobs_for_batch(id, Some(JobKind::Execution))?;
        let incidents = self.store.incidents(&IncidentFilter::for_batch(id))?;

        let existing = u32::try_from(chunks.len()).unwrap_or(u32::MAX);
        let failed = chunks.iter().filter(|j| j.has_failed()).count();

        Ok(BatchStatus {
            id,
            batch_type: batch.batch_type.clone(),
            total_jobs: batch.total_jobs,
            jobs_created: batch.jobs_created,
            jobs_remaining: batch.jobs_to_create().saturating_add(existing),
            failed_jobs: u32::try_from(failed).unwrap_or(u32::MAX),
            incidents: u32::try_from(incidents.len()).unwrap_or(u32::MAX),
            suspended: batch.suspended,
        })
    }

    pub fn list_batches(&self) -> EngineResult<Vec<Batch>> {
        Ok(self.store.list_batches()?)
    }

    /// Stop acquisition of the batch's jobs. In-flight executions finish.
    #[instrument(skip(self))]
    pub fn suspend_batch(&self, id: BatchId) -> EngineResult<()> {
        self.set_suspended(id, true)
    }

    #[instrument(skip(self))]
    pub fn activate_batch(&self, id: BatchId) -> EngineResult<()> {
        self.set_suspended(id, false)
    }

    fn set_suspended(&self, id: BatchId, suspended: bool) -> EngineResult<()> {
        self.retry_on_conflict(id, |store| {
            let mut batch = store.get_batch(id)?.ok_or(EngineError::BatchNotFound(id))?;
            if batch.suspended == suspended {
                return Ok(None);
            }
            batch.suspended = suspended;
            let mut uow = UnitOfWork::new();
            uow.update_batch(batch);
            Ok(Some(uow))
        })?;
        info!(batch_id = %id, suspended, "batch suspension changed");
        Ok(())
    }

    /// Remove the batch together with all of its jobs and their incidents.
    #[instrument(skip(self))]
    pub fn delete_batch(&self, id: BatchId) -> EngineResult<()> {
        let mut removed_jobs = 0;
        self.retry_on_conflict(id, |store| {
            let batch = store.get_batch(id)?.ok_or(EngineError::BatchNotFound(id))?;
            let jobs = store.jobs_for_batch(id, None)?;
            let incidents = store.incidents(&IncidentFilter::for_batch(id))?;

            let mut uow = UnitOfWork::new();
            uow.delete_batch(id, batch.expected_version());
            for job in &jobs {
                uow.delete_job(job.id, ExpectedVersion::Any);
            }
            for incident in &incidents {
                uow.delete_incident(incident.id);
            }
            removed_jobs = jobs.len();
            Ok(Some(uow))
        })?;
        info!(batch_id = %id, removed_jobs, "batch deleted");
        Ok(())
    }

    /// Read, build a unit of work and commit; re-read and retry when a
    /// concurrent writer got there first.
    fn retry_on_conflict(
        &self,
        id: BatchId,
        mut build: impl FnMut(&S) -> EngineResult<Option<UnitOfWork>>,
    ) -> EngineResult<()> {
        let mut last = None;
        for _ in 0..MAX_UPDATE_ATTEMPTS {
            let Some(uow) = build(&self.store)? else {
                return Ok(());
            };
            match self.store.commit(uow) {
                Ok(()) => return Ok(()),
                Err(err) if err.is_conflict() => last = Some(err),
                Err(err) => return Err(err.into()),
            }
        }
        Err(last.map_or(EngineError::BatchNotFound(id), EngineError::from))
    }

    pub fn incidents(&self, id: BatchId) -> EngineResult<Vec<Incident>> {
        Ok(self.store.incidents(&IncidentFilter::for_batch(id))?)
    }

    pub fn completed_batches(&self) -> EngineResult<Vec<CompletedBatch>> {
        Ok(self.store.completed_batches()?)
    }
}
