//! Incidents: durable records of jobs that need an operator.
//!
//! A job whose retries are exhausted (or that failed permanently) keeps its
//! row with `retries_left == 0` and gets one incident. The executor never
//! acquires it again until [`IncidentTracker::set_job_retries`] resets it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use batchflow_core::{BatchId, IncidentId, JobId};

use super::store::{IncidentFilter, JobRecordStore, StoreError, UnitOfWork};
use super::types::{ExecutionFailure, Job};
use crate::error::EngineError;

const MAX_RESET_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum IncidentType {
    FailedJob,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Incident {
    pub id: IncidentId,
    pub incident_type: IncidentType,
    pub job_id: JobId,
    pub batch_id: Option<BatchId>,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

impl Incident {
    pub fn failed_job(job: &Job, failure: &ExecutionFailure, now: DateTime<Utc>) -> Self {
        Self {
            id: IncidentId::new(),
            incident_type: IncidentType::FailedJob,
            job_id: job.id,
            batch_id: job.batch_id,
            message: failure.to_string(),
            created_at: now,
        }
    }
}

/// Records and resolves incidents.
#[derive(Debug, Clone)]
pub struct IncidentTracker<S> {
    store: S,
}

impl<S: JobRecordStore> IncidentTracker<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Stage an incident for `job` in the caller's unit of work.
    pub fn record(
        uow: &mut UnitOfWork,
        job: &Job,
        failure: &ExecutionFailure,
        now: DateTime<Utc>,
    ) -> IncidentId {
        let incident = Incident::failed_job(job, failure, now);
        let id = incident.id;
        warn!(
            job_id = %job.id,
            incident_id = %id,
            error = %failure,
            "job failed permanently; incident created"
        );
        uow.insert_incident(incident);
        id
    }

    pub fn list(&self, filter: &IncidentFilter) -> Result<Vec<Incident>, StoreError> {
        self.store.incidents(filter)
    }

    pub fn for_batch(&self, batch_id: BatchId) -> Result<Vec<Incident>, StoreError> {
        self.list(&IncidentFilter::for_batch(batch_id))
    }

    pub fn for_job(&self, job_id: JobId) -> Result<Vec<Incident>, StoreError> {
        self.list(&IncidentFilter::for_job(job_id))
    }

    /// Operator reset: give the job `retries` new attempts, make it due now
    /// and resolve (delete) its incidents, all in one write.
    ///
    /// Refused with [`EngineError::JobLocked`] while a worker holds the lock.
    pub fn set_job_retries(&self, job_id: JobId, retries: u32) -> Result<Job, EngineError> {
        if retries == 0 {
            return Err(EngineError::InvalidArgument(
                "retries must be at least 1".to_string(),
            ));
        }

        let mut last_conflict = None;
        for _ in 0..MAX_RESET_ATTEMPTS {
            let mut job = self
                .store
                .get_job(job_id)?
                .ok_or(EngineError::JobNotFound(job_id))?;
            let incidents = self.for_job(job_id)?;

            let now = Utc::now();
            if job.is_locked_at(now) {
                return Err(EngineError::JobLocked(job_id));
            }
            job.retries_left = retries;
            job.attempts = 0;
            job.due_date = now;
            job.exception_message = None;
            job.unlock();

            let mut uow = UnitOfWork::new();
            uow.update_job(job.clone());
            for incident in &incidents {
                uow.delete_incident(incident.id);
            }

            match self.store.commit(uow) {
                Ok(()) => {
                    info!(
                        job_id = %job_id,
                        retries,
                        resolved = incidents.len(),
                        "job retries reset"
                    );
                    job.version += 1;
                    return Ok(job);
                }
                Err(err) if err.is_conflict() => last_conflict = Some(err),
                Err(err) => return Err(err.into()),
            }
        }

        Err(last_conflict
            .map(EngineError::from)
            .unwrap_or(EngineError::JobNotFound(job_id)))
    }
}
