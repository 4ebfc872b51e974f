//! Seed handler: turns a batch's id list into chunk jobs, a bounded number
//! per invocation, and finally hands the batch over to a monitor job.

use tracing::{debug, info};

use batchflow_core::Versioned;

use super::model::BatchJobPayload;
use crate::jobs::registry::{HandlerContext, JobHandler};
use crate::jobs::store::UnitOfWork;
use crate::jobs::types::{ExecutionFailure, HandlerOutcome, HandlerResult, Job, JobKind, JobType};

#[derive(Debug, Clone, Copy, Default)]
pub struct SeedJobHandler;

impl JobHandler for SeedJobHandler {
    fn kind(&self) -> JobKind {
        JobKind::Seed
    }

    fn handle(&self, ctx: &HandlerContext<'_>, job: &Job, uow: &mut UnitOfWork) -> HandlerResult {
        let payload = BatchJobPayload::from_value(&job.payload)
            .map_err(|e| ExecutionFailure::permanent(format!("invalid seed payload: {e}")))?;

        let Some(mut batch) = ctx.store.get_batch(payload.batch_id)? else {
            debug!(job_id = %job.id, batch_id = %payload.batch_id, "batch gone; seed job done");
            return Ok(HandlerOutcome::Complete);
        };

        let operation = ctx.operations.get(&batch.batch_type).ok_or_else(|| {
            ExecutionFailure::permanent(format!("unknown batch operation {}", batch.batch_type))
        })?;

        let max_chunks = batch.jobs_per_seed.min(batch.jobs_to_create());
        let taken = operation.take_chunks(&batch.configuration, batch.chunk_size, max_chunks)?;
        let created = u32::try_from(taken.chunks.len()).unwrap_or(u32::MAX);

        if created == 0 && !batch.is_fully_seeded() {
            return Err(ExecutionFailure::permanent(format!(
                "batch {} expects {} more jobs but has no ids left",
                batch.id,
                batch.jobs_to_create()
            )));
        }

        // Counter and configuration move together under the batch version,
        // so a concurrent seed of the same batch conflicts instead of duplicating.
        batch
            .record_jobs_created(created)
            .map_err(|e| ExecutionFailure::permanent(e.to_string()))?;
        batch.configuration = taken.remaining;

        let retries = ctx.config.retry.max_retries;
        for chunk in taken.chunks {
            let chunk_job = Job::new(
                JobType::new(JobKind::Execution, batch.batch_type.clone()),
                chunk,
                retries,
                ctx.now,
            )
            .with_batch(batch.id)
            .with_priority(job.priority);
            uow.insert_job(chunk_job);
        }

        debug!(
            batch_id = %batch.id,
            created,
            jobs_created = batch.jobs_created,
            total_jobs = batch.total_jobs,
            version = batch.version(),
            "seeded chunk jobs"
        );

        if !batch.is_fully_seeded() {
            uow.update_batch(batch);
            return Ok(HandlerOutcome::Reschedule(ctx.now));
        }

        let monitor = Job::new(
            JobType::new(JobKind::Monitor, batch.batch_type.clone()),
            BatchJobPayload { batch_id: batch.id }.to_value(),
            retries,
            ctx.now,
        )
        .with_batch(batch.id)
        .with_priority(job.priority);

        info!(
            batch_id = %batch.id,
            total_jobs = batch.total_jobs,
            monitor_job_id = %monitor.id,
            "batch fully seeded"
        );

        batch.seed_job_id = None;
        batch.monitor_job_id = Some(monitor.id);
        uow.insert_job(monitor);
        uow.update_batch(batch);
        Ok(HandlerOutcome::Complete)
    }
}
