//! Execution handler: applies the batch operation to one chunk of ids.

use tracing::debug;

use crate::jobs::registry::{HandlerContext, JobHandler};
use crate::jobs::store::UnitOfWork;
use crate::jobs::types::{ExecutionFailure, HandlerOutcome, HandlerResult, Job, JobKind};

#[derive(Debug, Clone, Copy, Default)]
pub struct ExecutionJobHandler;

impl JobHandler for ExecutionJobHandler {
    fn kind(&self) -> JobKind {
        JobKind::Execution
    }

    fn handle(&self, ctx: &HandlerContext<'_>, job: &Job, _uow: &mut UnitOfWork) -> HandlerResult {
        let operation_type = &job.job_type.operation;
        let operation = ctx.operations.get(operation_type).ok_or_else(|| {
            ExecutionFailure::permanent(format!("unknown batch operation {operation_type}"))
        })?;

        operation.execute(&job.payload)?;

        debug!(job_id = %job.id, batch_id = ?job.batch_id, operation = %operation_type, "chunk executed");
        Ok(HandlerOutcome::Complete)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::operation::OperationRegistry;
    use crate::config::EngineConfig;
    use crate::jobs::store::InMemoryJobStore;
    use crate::jobs::types::JobType;
    use crate::operations::{InMemoryExternalTaskService, SET_EXTERNAL_TASK_RETRIES, SetExternalTaskRetries};
    use chrono::Utc;
    use serde_json::json;
    use std::sync::Arc;

    fn run(tasks: Arc<InMemoryExternalTaskService>, job: &Job) -> HandlerResult {
        let store = InMemoryJobStore::new();
        let config = EngineConfig::default();
        let operations = OperationRegistry::new().with(SetExternalTaskRetries::new(tasks));
        let ctx = HandlerContext {
            store: &store,
            config: &config,
            operations: &operations,
            now: Utc::now(),
        };
        ExecutionJobHandler.handle(&ctx, job, &mut UnitOfWork::new())
    }

    fn chunk_job(operation: &str, ids: &[&str]) -> Job {
        Job::new(
            JobType::new(JobKind::Execution, operation),
            json!({ "externalTaskIds": ids, "retries": 2 }),
            3,
            Utc::now(),
        )
    }

    #[test]
    fn chunk_is_applied_and_job_completes() {
        let tasks = Arc::new(InMemoryExternalTaskService::with_tasks(["a", "b"]));
        let result = run(tasks.clone(), &chunk_job(SET_EXTERNAL_TASK_RETRIES, &["a", "b"]));

        assert_eq!(result, Ok(HandlerOutcome::Complete));
        assert_eq!(tasks.retries_of("a"), Some(2));
        assert_eq!(tasks.retries_of("b"), Some(2));
    }

    #[test]
    fn missing_entity_is_permanent() {
        let tasks = Arc::new(InMemoryExternalTaskService::with_tasks(["a"]));
        let failure = run(tasks, &chunk_job(SET_EXTERNAL_TASK_RETRIES, &["a", "ghost"])).unwrap_err();
        assert!(!failure.is_transient());
        assert!(failure.message.contains("ghost"));
    }

    #[test]
    fn unknown_operation_is_permanent() {
        let tasks = Arc::new(InMemoryExternalTaskService::new());
        let failure = run(tasks, &chunk_job("rename-everything", &["a"])).unwrap_err();
        assert!(!failure.is_transient());
    }
}
