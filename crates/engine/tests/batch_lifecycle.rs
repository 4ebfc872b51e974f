//! End-to-end batch lifecycle against the in-memory store.
//!
//! enqueue -> seed -> chunk jobs -> monitor -> batch gone

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use serde_json::json;

use batchflow_auth::{AllowAll, PrincipalId};
use batchflow_engine::error::EngineError;
use batchflow_engine::jobs::{ExecutionOutcome, JobKind, RetryPolicy};
use batchflow_engine::operations::{
    InMemoryExternalTaskService, SET_EXTERNAL_TASK_RETRIES, SetExternalTaskRetries,
};
use batchflow_engine::{Engine, EngineConfig, InMemoryJobStore, JobRecordStore, OperationRegistry};

type TestEngine = Engine<Arc<InMemoryJobStore>, AllowAll>;

fn task_ids(n: usize) -> Vec<String> {
    (1..=n).map(|i| format!("t{i}")).collect()
}

fn engine_on(
    store: Arc<InMemoryJobStore>,
    tasks: Arc<InMemoryExternalTaskService>,
    config: EngineConfig,
) -> TestEngine {
    let operations = OperationRegistry::new().with(SetExternalTaskRetries::new(tasks));
    Engine::new(store, AllowAll, operations, config)
}

fn test_config(owner: &str) -> EngineConfig {
    EngineConfig::default()
        .with_lock_owner(owner)
        .with_chunk_size(2)
        .with_retry_policy(RetryPolicy::immediate(3))
        .with_monitor_interval(Duration::ZERO)
}

fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    done()
}

#[test]
fn three_tasks_in_chunks_of_two_complete_and_disappear() {
    let _ = batchflow_observability::init();
    let store = InMemoryJobStore::arc();
    let tasks = Arc::new(InMemoryExternalTaskService::with_tasks(task_ids(3)));
    let engine = engine_on(store.clone(), tasks.clone(), test_config("node-a"));
    let executor = engine.executor();

    let handle = engine
        .batches()
        .enqueue_batch(&PrincipalId::new(), SET_EXTERNAL_TASK_RETRIES, task_ids(3), json!({ "retries": 5 }))
        .unwrap();
    assert_eq!(handle.total_jobs, 2);

    // First cycle only finds the seed job.
    assert_eq!(executor.run_once().unwrap(), vec![ExecutionOutcome::Completed]);

    let mut sizes: Vec<usize> = store
        .jobs_for_batch(handle.id, Some(JobKind::Execution))
        .unwrap()
        .iter()
        .map(|j| j.payload["externalTaskIds"].as_array().unwrap().len())
        .collect();
    sizes.sort();
    assert_eq!(sizes, vec![1, 2]);

    let status = engine.batches().get_batch_status(handle.id).unwrap();
    assert_eq!(status.total_jobs, 2);
    assert_eq!(status.jobs_created, 2);
    assert_eq!(status.jobs_remaining, 2);

    executor.run_until_idle(20).unwrap();

    assert!(matches!(
        engine.batches().get_batch_status(handle.id),
        Err(EngineError::BatchNotFound(id)) if id == handle.id
    ));
    assert_eq!(store.job_count(), 0);
    for id in task_ids(3) {
        assert_eq!(tasks.retries_of(&id), Some(5));
    }
    let history = engine.batches().completed_batches().unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].total_jobs, 2);
}

#[test]
fn always_transient_chunk_runs_three_times_then_raises_incident() {
    let store = InMemoryJobStore::arc();
    let tasks = Arc::new(InMemoryExternalTaskService::with_tasks(["t1"]));
    tasks.set_contended("t1", true);
    let config = test_config("node-a").with_monitor_interval(Duration::from_secs(3600));
    let engine = engine_on(store.clone(), tasks.clone(), config);
    let executor = engine.executor();

    let handle = engine
        .batches()
        .enqueue_batch(&PrincipalId::new(), SET_EXTERNAL_TASK_RETRIES, vec!["t1".into()], json!({ "retries": 9 }))
        .unwrap();
    executor.run_until_idle(20).unwrap();

    assert_eq!(tasks.calls(), 3);
    let chunks = store.jobs_for_batch(handle.id, Some(JobKind::Execution)).unwrap();
    assert_eq!(chunks.len(), 1);
    let failed = &chunks[0];
    assert_eq!(failed.retries_left, 0);
    assert!(failed.lock.is_none());

    let incidents = engine.batches().incidents(handle.id).unwrap();
    assert_eq!(incidents.len(), 1);
    assert_eq!(incidents[0].job_id, failed.id);

    let status = engine.batches().get_batch_status(handle.id).unwrap();
    assert_eq!(status.failed_jobs, 1);
    assert_eq!(status.incidents, 1);
    assert_eq!(status.jobs_remaining, 1);

    // Nothing is retried automatically any more.
    assert_eq!(executor.run_until_idle(5).unwrap(), 0);
    assert_eq!(tasks.calls(), 3);

    // Operator fixes the cause and resets the job.
    tasks.set_contended("t1", false);
    engine.set_job_retries(failed.id, 1).unwrap();
    assert!(engine.batches().incidents(handle.id).unwrap().is_empty());

    executor.run_until_idle(5).unwrap();
    assert_eq!(tasks.retries_of("t1"), Some(9));
    assert!(store.jobs_for_batch(handle.id, Some(JobKind::Execution)).unwrap().is_empty());
}

#[test]
fn suspended_batch_makes_no_progress_until_activated() {
    let store = InMemoryJobStore::arc();
    let tasks = Arc::new(InMemoryExternalTaskService::with_tasks(task_ids(4)));
    let engine = engine_on(store.clone(), tasks.clone(), test_config("node-a"));
    let executor = engine.executor();

    let handle = engine
        .batches()
        .enqueue_batch(&PrincipalId::new(), SET_EXTERNAL_TASK_RETRIES, task_ids(4), json!({ "retries": 1 }))
        .unwrap();
    engine.batches().suspend_batch(handle.id).unwrap();

    assert!(executor.run_once().unwrap().is_empty());

    engine.batches().activate_batch(handle.id).unwrap();
    executor.run_until_idle(20).unwrap();
    assert!(engine.batches().get_batch_status(handle.id).is_err());
}

#[test]
fn crashed_worker_lock_expires_and_another_instance_finishes() {
    let store = InMemoryJobStore::arc();
    let tasks = Arc::new(InMemoryExternalTaskService::with_tasks(task_ids(3)));
    let crashed = engine_on(
        store.clone(),
        tasks.clone(),
        test_config("crashed").with_lock_duration(Duration::from_millis(250)),
    );
    let survivor = engine_on(store.clone(), tasks.clone(), test_config("survivor"));

    let handle = crashed
        .batches()
        .enqueue_batch(&PrincipalId::new(), SET_EXTERNAL_TASK_RETRIES, task_ids(3), json!({ "retries": 2 }))
        .unwrap();

    // Lock the seed job and never run it.
    let locked = crashed.executor().acquire(10).unwrap();
    assert_eq!(locked.len(), 1);
    assert!(survivor.executor().run_once().unwrap().is_empty());

    thread::sleep(Duration::from_millis(400));
    survivor.executor().run_until_idle(20).unwrap();

    assert!(survivor.batches().get_batch_status(handle.id).is_err());
    assert_eq!(tasks.retries_of("t3"), Some(2));

    // The crashed instance waking up must not write anything.
    let late = crashed.executor().execute(locked.into_iter().next().unwrap());
    assert_eq!(late, ExecutionOutcome::LockLost);
}

#[test]
fn spawned_executors_on_two_instances_share_the_work() {
    let store = InMemoryJobStore::arc();
    let tasks = Arc::new(InMemoryExternalTaskService::with_tasks(task_ids(40)));
    let config = |owner: &str| {
        test_config(owner)
            .with_jobs_per_seed(3)
            .with_workers(3)
            .with_acquisition_interval(Duration::from_millis(5))
            .with_monitor_interval(Duration::from_millis(5))
    };
    let a = engine_on(store.clone(), tasks.clone(), config("node-a"));
    let b = engine_on(store.clone(), tasks.clone(), config("node-b"));

    let handle = a
        .batches()
        .enqueue_batch(&PrincipalId::new(), SET_EXTERNAL_TASK_RETRIES, task_ids(40), json!({ "retries": 3 }))
        .unwrap();
    assert_eq!(handle.total_jobs, 20);

    let running_a = a.executor().spawn().unwrap();
    let running_b = b.executor().spawn().unwrap();

    let finished = wait_until(Duration::from_secs(20), || {
        !a.batches().completed_batches().unwrap().is_empty()
    });
    let stats_a = running_a.shutdown();
    let stats_b = running_b.shutdown();

    assert!(finished, "batch did not complete in time");
    assert_eq!(store.job_count(), 0);
    // Exclusive locks: every task updated exactly once.
    assert_eq!(tasks.calls(), 40);
    for id in task_ids(40) {
        assert_eq!(tasks.retries_of(&id), Some(3));
    }
    assert_eq!(stats_a.lock_lost + stats_b.lock_lost, 0);
    assert_eq!(stats_a.incidents + stats_b.incidents, 0);
}
