//! `batchflow`: run an in-process engine against the in-memory store and
//! drive one `set-external-task-retries` batch to completion.
//!
//! Usage: `batchflow [TASKS] [RETRIES]` (defaults: 250 tasks, 3 retries).
//! Engine settings come from `BATCHFLOW_*` environment variables;
//! `BATCHFLOW_LOG_FORMAT=pretty` switches from JSON to compact logs.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, bail};
use serde_json::json;

use batchflow_auth::{AllowAll, PrincipalId};
use batchflow_engine::error::EngineError;
use batchflow_engine::operations::{
    InMemoryExternalTaskService, SET_EXTERNAL_TASK_RETRIES, SetExternalTaskRetries,
};
use batchflow_engine::{Engine, EngineConfig, InMemoryJobStore, OperationRegistry};

const DEFAULT_TASKS: usize = 250;
const DEFAULT_RETRIES: i32 = 3;
const TIMEOUT: Duration = Duration::from_secs(120);

fn main() -> anyhow::Result<()> {
    if std::env::var("BATCHFLOW_LOG_FORMAT").is_ok_and(|f| f == "pretty") {
        batchflow_observability::init_pretty();
    } else {
        batchflow_observability::init();
    }

    let mut args = std::env::args().skip(1);
    let task_count = match args.next() {
        Some(raw) => raw.parse().with_context(|| format!("invalid task count {raw:?}"))?,
        None => DEFAULT_TASKS,
    };
    let retries = match args.next() {
        Some(raw) => raw.parse().with_context(|| format!("invalid retries {raw:?}"))?,
        None => DEFAULT_RETRIES,
    };

    let config = EngineConfig::from_env();
    tracing::info!(
        lock_owner = %config.lock_owner,
        chunk_size = config.chunk_size,
        jobs_per_seed = config.jobs_per_seed,
        workers = config.workers,
        "starting batchflow"
    );

    let task_ids: Vec<String> = (0..task_count).map(|i| format!("task-{i}")).collect();
    let tasks = Arc::new(InMemoryExternalTaskService::with_tasks(task_ids.clone()));
    let operations = OperationRegistry::new().with(SetExternalTaskRetries::new(tasks.clone()));
    let engine = Engine::new(InMemoryJobStore::arc(), AllowAll, operations, config);

    let handle = engine.batches().enqueue_batch(
        &PrincipalId::new(),
        SET_EXTERNAL_TASK_RETRIES,
        task_ids.clone(),
        json!({ "retries": retries }),
    )?;
    tracing::info!(batch_id = %handle.id, total_jobs = handle.total_jobs, "batch enqueued");

    let running = engine.executor().spawn().context("failed to start job executor")?;
    let started = Instant::now();
    let mut last_remaining = None;

    let outcome = loop {
        match engine.batches().get_batch_status(handle.id) {
            Ok(status) => {
                if last_remaining != Some(status.jobs_remaining) {
                    tracing::info!(
                        batch_id = %handle.id,
                        jobs_created = status.jobs_created,
                        jobs_remaining = status.jobs_remaining,
                        failed_jobs = status.failed_jobs,
                        "batch progress"
                    );
                    last_remaining = Some(status.jobs_remaining);
                }
                if status.failed_jobs > 0 && status.failed_jobs == status.jobs_remaining {
                    break Err(anyhow::anyhow!(
                        "{} chunk job(s) failed; see incidents",
                        status.failed_jobs
                    ));
                }
            }
            Err(EngineError::BatchNotFound(_)) => break Ok(()),
            Err(err) => break Err(err.into()),
        }
        if started.elapsed() > TIMEOUT {
            break Err(anyhow::anyhow!("batch did not finish within {TIMEOUT:?}"));
        }
        thread::sleep(Duration::from_millis(50));
    };

    let stats = running.shutdown();
    println!("{}", serde_json::to_string_pretty(&stats)?);

    for incident in engine.batches().incidents(handle.id)? {
        tracing::warn!(job_id = %incident.job_id, message = %incident.message, "incident");
    }
    outcome?;

    let updated = task_ids
        .iter()
        .filter(|id| tasks.retries_of(id) == u32::try_from(retries).ok())
        .count();
    if updated != task_ids.len() {
        bail!("only {updated} of {} tasks were updated", task_ids.len());
    }

    for completed in engine.batches().completed_batches()? {
        println!("{}", serde_json::to_string_pretty(&completed)?);
    }
    Ok(())
}
