//! Monitor handler: polls a batch until every chunk job is gone, then
//! removes the batch and records it in the completed-batch history.

use tracing::{debug, info};

use batchflow_core::Versioned;

use super::model::{BatchJobPayload, CompletedBatch};
use crate::jobs::registry::{HandlerContext, JobHandler};
use crate::jobs::store::UnitOfWork;
use crate::jobs::types::{ExecutionFailure, HandlerOutcome, HandlerResult, Job, JobKind};

#[derive(Debug, Clone, Copy, Default)]
pub struct MonitorJobHandler;

impl JobHandler for MonitorJobHandler {
    fn kind(&self) -> JobKind {
        JobKind::Monitor
    }

    fn handle(&self, ctx: &HandlerContext<'_>, job: &Job, uow: &mut UnitOfWork) -> HandlerResult {
        let payload = BatchJobPayload::from_value(&job.payload)
            .map_err(|e| ExecutionFailure::permanent(format!("invalid monitor payload: {e}")))?;

        // The monitor may be the last thing referencing a batch deleted by an operator.
        let Some(batch) = ctx.store.get_batch(payload.batch_id)? else {
            debug!(job_id = %job.id, batch_id = %payload.batch_id, "batch gone; monitor job done");
            return Ok(HandlerOutcome::Complete);
        };

        let pending = if batch.is_fully_seeded() {
            ctx.store
                .jobs_for_batch(batch.id, Some(JobKind::Execution))?
                .len()
        } else {
            batch.jobs_to_create() as usize
        };

        if pending > 0 {
            debug!(
                batch_id = %batch.id,
                jobs_created = batch.jobs_created,
                total_jobs = batch.total_jobs,
                pending,
                "batch not finished yet"
            );
            return Ok(HandlerOutcome::Reschedule(
                ctx.now + ctx.config.monitor_interval_chrono(),
            ));
        }

        // Deleting under the read version guarantees no seed slipped new chunk jobs in.
        uow.delete_batch(batch.id, batch.expected_version());
        uow.record_completed_batch(CompletedBatch::from_batch(&batch, ctx.now));

        info!(
            batch_id = %batch.id,
            batch_type = %batch.batch_type,
            total_jobs = batch.total_jobs,
            "batch completed"
        );
        Ok(HandlerOutcome::Complete)
    }
}
