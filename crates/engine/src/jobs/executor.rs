//! Job executor: acquisition loop, worker pool and the failure policy.
//!
//! Per job: `Pending -> Locked -> Completed (deleted) | Pending (retry) | Incident`.
//!
//! The executor holds no authority of its own. Every state change is a
//! version-checked commit against the store, so several executors (threads or
//! processes) can share one store safely.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use batchflow_core::{IncidentId, Versioned};

use super::acquisition::JobAcquirer;
use super::incident::IncidentTracker;
use super::registry::{HandlerContext, HandlerRegistry};
use super::store::{JobRecordStore, RecordRef, StoreError, UnitOfWork};
use super::types::{ExecutionFailure, HandlerOutcome, Job};
use crate::batch::operation::OperationRegistry;
use crate::config::{to_chrono, EngineConfig};

/// Attempts at committing a handler's writes when a non-job record
/// (typically the batch counter) changed underneath it.
const MAX_COMMIT_ATTEMPTS: usize = 3;

/// What happened to one executed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// Handler succeeded and the job was deleted.
    Completed,
    /// Handler asked to run the job again later.
    Rescheduled(DateTime<Utc>),
    /// Transient failure; one retry consumed.
    RetryScheduled {
        retries_left: u32,
        due_date: DateTime<Utc>,
    },
    /// Retries exhausted or permanent failure.
    IncidentCreated(IncidentId),
    /// The lock expired or was taken over; nothing was written.
    LockLost,
    /// The store refused the final write for a non-concurrency reason.
    WriteFailed(String),
}

/// Executor runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct ExecutorStats {
    pub acquired: u64,
    pub lost_races: u64,
    pub processed: u64,
    pub completed: u64,
    pub rescheduled: u64,
    pub retried: u64,
    pub incidents: u64,
    pub lock_lost: u64,
    pub write_failures: u64,
}

impl ExecutorStats {
    fn record(&mut self, outcome: &ExecutionOutcome) {
        self.processed += 1;
        match outcome {
            ExecutionOutcome::Completed => self.completed += 1,
            ExecutionOutcome::Rescheduled(_) => self.rescheduled += 1,
            ExecutionOutcome::RetryScheduled { .. } => self.retried += 1,
            ExecutionOutcome::IncidentCreated(_) => self.incidents += 1,
            ExecutionOutcome::LockLost => self.lock_lost += 1,
            ExecutionOutcome::WriteFailed(_) => self.write_failures += 1,
        }
    }
}

/// Handle to control a running executor.
#[derive(Debug)]
pub struct JobExecutorHandle {
    shutdown: mpsc::Sender<()>,
    acquisition: Option<thread::JoinHandle<()>>,
    workers: Vec<thread::JoinHandle<()>>,
    stats: Arc<Mutex<ExecutorStats>>,
}

impl JobExecutorHandle {
    /// Stop acquiring, let workers drain already-locked jobs, then join.
    /// Returns the final statistics.
    pub fn shutdown(mut self) -> ExecutorStats {
        let _ = self.shutdown.send(());
        if let Some(acquisition) = self.acquisition.take() {
            let _ = acquisition.join();
        }
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
        snapshot(&self.stats)
    }

    pub fn stats(&self) -> ExecutorStats {
        snapshot(&self.stats)
    }
}

fn snapshot(stats: &Mutex<ExecutorStats>) -> ExecutorStats {
    match stats.lock() {
        Ok(s) => s.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    }
}

/// Runs jobs from a [`JobRecordStore`] through the registered handlers.
pub struct JobExecutor<S> {
    store: S,
    acquirer: JobAcquirer<S>,
    handlers: Arc<HandlerRegistry>,
    operations: Arc<OperationRegistry>,
    config: Arc<EngineConfig>,
    stats: Arc<Mutex<ExecutorStats>>,
}

impl<S> JobExecutor<S>
where
    S: JobRecordStore + Clone + 'static,
{
    pub fn new(
        store: S,
        config: Arc<EngineConfig>,
        handlers: Arc<HandlerRegistry>,
        operations: Arc<OperationRegistry>,
    ) -> Self {
        let acquirer = JobAcquirer::new(store.clone(), config.lock_owner.clone(), config.lock_duration);
        Self {
            store,
            acquirer,
            handlers,
            operations,
            config,
            stats: Arc::new(Mutex::new(ExecutorStats::default())),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn stats(&self) -> ExecutorStats {
        snapshot(&self.stats)
    }

    fn with_stats(&self, f: impl FnOnce(&mut ExecutorStats)) {
        let mut guard = match self.stats.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard);
    }

    /// Lock up to `limit` due jobs for this executor.
    pub fn acquire(&self, limit: usize) -> Result<Vec<Job>, StoreError> {
        let acquired = self.acquirer.acquire(limit)?;
        self.with_stats(|s| {
            s.acquired += acquired.jobs.len() as u64;
            s.lost_races += acquired.lost_races as u64;
        });
        Ok(acquired.jobs)
    }

    /// Run a locked job to one of its outcomes.
    pub fn execute(&self, job: Job) -> ExecutionOutcome {
        let job_id = job.id;
        let job_type = job.job_type.to_string();
        let outcome = self.run_handler(job);

        match &outcome {
            ExecutionOutcome::Completed => {
                debug!(executor = %self.config.lock_owner, job_id = %job_id, job_type = %job_type, "job completed")
            }
            ExecutionOutcome::Rescheduled(at) => {
                debug!(executor = %self.config.lock_owner, job_id = %job_id, due = %at, "job rescheduled")
            }
            ExecutionOutcome::RetryScheduled { retries_left, due_date } => info!(
                executor = %self.config.lock_owner,
                job_id = %job_id,
                retries_left,
                due = %due_date,
                "job failed; retry scheduled"
            ),
            ExecutionOutcome::IncidentCreated(_) => {}
            ExecutionOutcome::LockLost => warn!(
                executor = %self.config.lock_owner,
                job_id = %job_id,
                "job lock lost; result discarded"
            ),
            ExecutionOutcome::WriteFailed(err) => error!(
                executor = %self.config.lock_owner,
                job_id = %job_id,
                error = %err,
                "failed to persist job result"
            ),
        }

        self.with_stats(|s| s.record(&outcome));
        outcome
    }

    fn run_handler(&self, job: Job) -> ExecutionOutcome {
        let Some(handler) = self.handlers.get(job.kind()).cloned() else {
            let failure =
                ExecutionFailure::permanent(format!("no handler registered for {}", job.job_type));
            return self.fail(job, failure);
        };

        for attempt in 1..=MAX_COMMIT_ATTEMPTS {
            let ctx = HandlerContext {
                store: &self.store,
                config: &self.config,
                operations: &self.operations,
                now: Utc::now(),
            };
            let mut uow = UnitOfWork::new();

            let result = panic::catch_unwind(AssertUnwindSafe(|| handler.handle(&ctx, &job, &mut uow)))
                .unwrap_or_else(|payload| {
                    Err(ExecutionFailure::permanent(format!(
                        "handler panicked: {}",
                        panic_message(&*payload)
                    )))
                });

            let outcome = match result {
                Ok(HandlerOutcome::Complete) => {
                    uow.delete_job(job.id, job.expected_version());
                    ExecutionOutcome::Completed
                }
                Ok(HandlerOutcome::Reschedule(at)) => {
                    let mut next = job.clone();
                    next.unlock();
                    next.due_date = at;
                    uow.update_job(next);
                    ExecutionOutcome::Rescheduled(at)
                }
                Err(failure) => return self.fail(job, failure),
            };

            if !self.owns_lock(&job, Utc::now()) {
                return ExecutionOutcome::LockLost;
            }

            match self.store.commit(uow) {
                Ok(()) => return outcome,
                Err(err) => match self.classify_commit_error(&job, err) {
                    CommitError::Retry(err) => debug!(
                        job_id = %job.id,
                        attempt,
                        error = %err,
                        "concurrent update; re-running handler"
                    ),
                    CommitError::Abandon(outcome) => return outcome,
                },
            }
        }

        self.fail(
            job,
            ExecutionFailure::transient("records kept changing concurrently; giving up this attempt"),
        )
    }

    /// Apply the failure policy: consume a retry with backoff, or raise an incident.
    fn fail(&self, job: Job, failure: ExecutionFailure) -> ExecutionOutcome {
        let now = Utc::now();
        if !self.owns_lock(&job, now) {
            return ExecutionOutcome::LockLost;
        }

        let mut next = job.clone();
        next.unlock();
        next.attempts = next.attempts.saturating_add(1);
        next.exception_message = Some(failure.message.clone());

        let mut uow = UnitOfWork::new();
        let outcome = if failure.is_transient() && job.retries_left > 1 {
            next.retries_left = job.retries_left - 1;
            next.due_date = now + to_chrono(self.config.retry.delay_for_attempt(next.attempts));
            ExecutionOutcome::RetryScheduled {
                retries_left: next.retries_left,
                due_date: next.due_date,
            }
        } else {
            next.retries_left = 0;
            ExecutionOutcome::IncidentCreated(IncidentTracker::<S>::record(
                &mut uow, &job, &failure, now,
            ))
        };
        uow.update_job(next);

        match self.store.commit(uow) {
            Ok(()) => outcome,
            Err(err) => match self.classify_commit_error(&job, err) {
                CommitError::Retry(err) => ExecutionOutcome::WriteFailed(err.to_string()),
                CommitError::Abandon(outcome) => outcome,
            },
        }
    }

    fn classify_commit_error(&self, job: &Job, err: StoreError) -> CommitError {
        if err.is_conflict() && err.record() == Some(RecordRef::Job(job.id)) {
            CommitError::Abandon(ExecutionOutcome::LockLost)
        } else if err.is_conflict() {
            CommitError::Retry(err)
        } else {
            CommitError::Abandon(ExecutionOutcome::WriteFailed(err.to_string()))
        }
    }

    /// Whether this executor still holds an unexpired lock on `job`.
    pub fn owns_lock(&self, job: &Job, now: DateTime<Utc>) -> bool {
        job.is_locked_by(&self.config.lock_owner, now)
    }

    /// One synchronous cycle: acquire up to the configured limit, then run
    /// every acquired job on the calling thread.
    pub fn run_once(&self) -> Result<Vec<ExecutionOutcome>, StoreError> {
        let jobs = self.acquire(self.config.acquisition_limit)?;
        Ok(jobs.into_iter().map(|job| self.execute(job)).collect())
    }

    /// Repeat [`run_once`](Self::run_once) until a cycle finds nothing to do
    /// or `max_cycles` is reached. Returns the number of jobs executed.
    pub fn run_until_idle(&self, max_cycles: usize) -> Result<usize, StoreError> {
        let mut executed = 0;
        for _ in 0..max_cycles {
            let outcomes = self.run_once()?;
            if outcomes.is_empty() {
                break;
            }
            executed += outcomes.len();
        }
        Ok(executed)
    }

    /// Start the acquisition thread and the worker pool.
    pub fn spawn(self) -> std::io::Result<JobExecutorHandle> {
        let workers = self.config.workers.max(1);
        let name = self.config.lock_owner.clone();
        let stats = self.stats.clone();
        let executor = Arc::new(self);

        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let (job_tx, job_rx) = mpsc::sync_channel::<Job>(workers);
        let job_rx = Arc::new(Mutex::new(job_rx));
        let in_flight = Arc::new(AtomicUsize::new(0));

        let mut worker_handles = Vec::with_capacity(workers);
        for i in 0..workers {
            let executor = executor.clone();
            let job_rx = job_rx.clone();
            let in_flight = in_flight.clone();
            let handle = thread::Builder::new()
                .name(format!("{name}-worker-{i}"))
                .spawn(move || worker_loop(&executor, &job_rx, &in_flight))?;
            worker_handles.push(handle);
        }

        let acquisition = thread::Builder::new()
            .name(format!("{name}-acquisition"))
            .spawn(move || acquisition_loop(&executor, job_tx, &shutdown_rx, &in_flight, workers))?;

        Ok(JobExecutorHandle {
            shutdown: shutdown_tx,
            acquisition: Some(acquisition),
            workers: worker_handles,
            stats,
        })
    }
}

enum CommitError {
    Retry(StoreError),
    Abandon(ExecutionOutcome),
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg
    } else {
        "non-string panic payload"
    }
}

/// Frees a worker slot when dropped, including during unwinding.
struct InFlightSlot<'a>(&'a AtomicUsize);

impl Drop for InFlightSlot<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn acquisition_loop<S>(
    executor: &JobExecutor<S>,
    job_tx: mpsc::SyncSender<Job>,
    shutdown_rx: &mpsc::Receiver<()>,
    in_flight: &AtomicUsize,
    workers: usize,
) where
    S: JobRecordStore + Clone + 'static,
{
    let owner = &executor.config.lock_owner;
    info!(executor = %owner, workers, "job executor started");

    'outer: loop {
        let free = workers.saturating_sub(in_flight.load(Ordering::SeqCst));
        let limit = free.min(executor.config.acquisition_limit);

        if limit > 0 {
            match executor.acquire(limit) {
                Ok(jobs) => {
                    for job in jobs {
                        in_flight.fetch_add(1, Ordering::SeqCst);
                        debug!(executor = %owner, job_id = %job.id, "dispatching job");
                        if job_tx.send(job).is_err() {
                            break 'outer;
                        }
                    }
                }
                Err(err) => error!(executor = %owner, error = %err, "job acquisition failed"),
            }
        }

        match shutdown_rx.recv_timeout(executor.config.acquisition_interval) {
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    // Dropping the sender lets workers drain what is queued and exit.
    drop(job_tx);
    info!(executor = %owner, "job executor stopped");
}

fn worker_loop<S>(
    executor: &JobExecutor<S>,
    job_rx: &Mutex<mpsc::Receiver<Job>>,
    in_flight: &AtomicUsize,
) where
    S: JobRecordStore + Clone + 'static,
{
    loop {
        let next = match job_rx.lock() {
            Ok(rx) => rx.recv(),
            Err(_) => break,
        };
        let Ok(job) = next else { break };

        let _slot = InFlightSlot(in_flight);
        let job_id = job.id;
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| executor.execute(job))) {
            error!(
                executor = %executor.config.lock_owner,
                job_id = %job_id,
                panic = panic_message(&*payload),
                "job execution panicked; lock left to expire"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::registry::JobHandler;
    use crate::jobs::retry::RetryPolicy;
    use crate::jobs::store::{IncidentFilter, InMemoryJobStore};
    use crate::jobs::types::{HandlerResult, JobKind, JobType};
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    struct Scripted {
        calls: Arc<AtomicU32>,
        result: fn(u32) -> HandlerResult,
    }

    impl JobHandler for Scripted {
        fn kind(&self) -> JobKind {
            JobKind::Execution
        }

        fn handle(&self, _ctx: &HandlerContext<'_>, _job: &Job, _uow: &mut UnitOfWork) -> HandlerResult {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            (self.result)(call)
        }
    }

    fn executor_with(
        store: Arc<InMemoryJobStore>,
        result: fn(u32) -> HandlerResult,
    ) -> (JobExecutor<Arc<InMemoryJobStore>>, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        let mut handlers = HandlerRegistry::new();
        handlers.register(Scripted {
            calls: calls.clone(),
            result,
        });
        let config = EngineConfig::default()
            .with_lock_owner("test-executor")
            .with_retry_policy(RetryPolicy::immediate(3));
        let executor = JobExecutor::new(
            store,
            Arc::new(config),
            Arc::new(handlers),
            Arc::new(OperationRegistry::new()),
        );
        (executor, calls)
    }

    fn enqueue(store: &InMemoryJobStore, kind: JobKind, retries: u32) -> Job {
        let job = Job::new(JobType::new(kind, "test"), serde_json::json!({}), retries, Utc::now());
        store.insert_job(job.clone()).unwrap();
        job
    }

    #[test]
    fn successful_job_is_deleted() {
        let store = InMemoryJobStore::arc();
        let (executor, calls) = executor_with(store.clone(), |_| Ok(HandlerOutcome::Complete));
        let job = enqueue(&store, JobKind::Execution, 3);

        let outcomes = executor.run_once().unwrap();

        assert_eq!(outcomes, vec![ExecutionOutcome::Completed]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(store.get_job(job.id).unwrap().is_none());
        assert_eq!(executor.stats().completed, 1);
    }

    #[test]
    fn transient_failures_exhaust_retries_then_raise_incident() {
        let store = InMemoryJobStore::arc();
        let (executor, calls) =
            executor_with(store.clone(), |_| Err(ExecutionFailure::transient("busy")));
        let job = enqueue(&store, JobKind::Execution, 3);

        executor.run_until_idle(10).unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let stored = store.get_job(job.id).unwrap().unwrap();
        assert_eq!(stored.retries_left, 0);
        assert_eq!(stored.attempts, 3);
        assert!(stored.lock.is_none());
        assert_eq!(store.incidents(&IncidentFilter::for_job(job.id)).unwrap().len(), 1);

        let stats = executor.stats();
        assert_eq!(stats.retried, 2);
        assert_eq!(stats.incidents, 1);
    }

    #[test]
    fn permanent_failure_skips_remaining_retries() {
        let store = InMemoryJobStore::arc();
        let (executor, calls) =
            executor_with(store.clone(), |_| Err(ExecutionFailure::permanent("gone")));
        let job = enqueue(&store, JobKind::Execution, 5);

        let executed = executor.run_until_idle(10).unwrap();

        assert_eq!(executed, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let stored = store.get_job(job.id).unwrap().unwrap();
        assert_eq!(stored.retries_left, 0);
        assert_eq!(stored.exception_message.as_deref(), Some("gone"));
    }

    #[test]
    fn retry_applies_backoff_delay() {
        let store = InMemoryJobStore::arc();
        let calls = Arc::new(AtomicU32::new(0));
        let mut handlers = HandlerRegistry::new();
        handlers.register(Scripted {
            calls,
            result: |_| Err(ExecutionFailure::transient("busy")),
        });
        let config = EngineConfig::default()
            .with_lock_owner("test-executor")
            .with_retry_policy(RetryPolicy::fixed(3, Duration::from_secs(60)));
        let executor = JobExecutor::new(
            store.clone(),
            Arc::new(config),
            Arc::new(handlers),
            Arc::new(OperationRegistry::new()),
        );
        let job = enqueue(&store, JobKind::Execution, 3);

        let before = Utc::now();
        let outcomes = executor.run_once().unwrap();
        let ExecutionOutcome::RetryScheduled { retries_left, due_date } = outcomes[0] else {
            panic!("expected retry, got {:?}", outcomes[0]);
        };
        assert_eq!(retries_left, 2);
        assert!(due_date >= before + chrono::Duration::seconds(60));

        // Not due yet, so nothing else runs.
        assert!(executor.run_once().unwrap().is_empty());
        assert_eq!(store.get_job(job.id).unwrap().unwrap().retries_left, 2);
    }

    #[test]
    fn missing_handler_is_a_permanent_failure() {
        let store = InMemoryJobStore::arc();
        let (executor, _) = executor_with(store.clone(), |_| Ok(HandlerOutcome::Complete));
        let job = enqueue(&store, JobKind::Monitor, 3);

        let outcomes = executor.run_once().unwrap();

        assert!(matches!(outcomes[0], ExecutionOutcome::IncidentCreated(_)));
        assert_eq!(store.get_job(job.id).unwrap().unwrap().retries_left, 0);
    }

    #[test]
    fn taken_over_job_is_not_written() {
        let store = InMemoryJobStore::arc();
        let (executor, _) = executor_with(store.clone(), |_| Ok(HandlerOutcome::Complete));
        enqueue(&store, JobKind::Execution, 3);

        let mut locked = executor.acquire(1).unwrap();
        let job = locked.remove(0);

        // Another instance steals the job after our lock "expired".
        let mut stolen = store.get_job(job.id).unwrap().unwrap();
        stolen.lock("other-node", Utc::now() + chrono::Duration::seconds(60));
        store.update_job(&stolen).unwrap();

        assert_eq!(executor.execute(job.clone()), ExecutionOutcome::LockLost);
        let stored = store.get_job(job.id).unwrap().unwrap();
        assert!(stored.is_locked_by("other-node", Utc::now()));
    }

    #[test]
    fn expired_lock_abandons_final_write() {
        let store = InMemoryJobStore::arc();
        let (executor, _) = executor_with(store.clone(), |_| Ok(HandlerOutcome::Complete));
        enqueue(&store, JobKind::Execution, 3);

        let mut job = executor.acquire(1).unwrap().remove(0);
        if let Some(lock) = job.lock.as_mut() {
            lock.expires_at = Utc::now() - chrono::Duration::seconds(1);
        }

        assert_eq!(executor.execute(job.clone()), ExecutionOutcome::LockLost);
        assert!(store.get_job(job.id).unwrap().is_some());
    }

    #[test]
    fn reschedule_keeps_job_and_releases_lock() {
        let store = InMemoryJobStore::arc();
        let (executor, _) = executor_with(store.clone(), |_| {
            Ok(HandlerOutcome::Reschedule(Utc::now() + chrono::Duration::seconds(30)))
        });
        let job = enqueue(&store, JobKind::Execution, 3);

        let outcomes = executor.run_once().unwrap();

        assert!(matches!(outcomes[0], ExecutionOutcome::Rescheduled(_)));
        let stored = store.get_job(job.id).unwrap().unwrap();
        assert!(stored.lock.is_none());
        assert_eq!(stored.retries_left, 3);
        assert!(!stored.is_due(Utc::now()));
    }

    #[test]
    fn panicking_handler_raises_incident() {
        let store = InMemoryJobStore::arc();
        let (executor, _) = executor_with(store.clone(), |_| panic!("corrupt entity"));
        let job = enqueue(&store, JobKind::Execution, 3);

        let outcomes = executor.run_once().unwrap();

        assert!(matches!(outcomes[0], ExecutionOutcome::IncidentCreated(_)));
        let stored = store.get_job(job.id).unwrap().unwrap();
        assert_eq!(stored.retries_left, 0);
        assert!(stored.lock.is_none());
        let incidents = store.incidents(&IncidentFilter::for_job(job.id)).unwrap();
        assert!(incidents[0].message.contains("corrupt entity"));
    }

    #[test]
    fn spawned_executor_survives_a_panicking_job() {
        let store = InMemoryJobStore::arc();
        let calls = Arc::new(AtomicU32::new(0));
        let mut handlers = HandlerRegistry::new();
        handlers.register(Scripted {
            calls: calls.clone(),
            result: |call| {
                if call == 1 {
                    panic!("plug-in bug");
                }
                Ok(HandlerOutcome::Complete)
            },
        });
        let config = EngineConfig::default()
            .with_lock_owner("single-worker")
            .with_workers(1)
            .with_acquisition_interval(Duration::from_millis(5))
            .with_retry_policy(RetryPolicy::immediate(3));
        let executor = JobExecutor::new(
            store.clone(),
            Arc::new(config),
            Arc::new(handlers),
            Arc::new(OperationRegistry::new()),
        );

        // Highest priority, so the single worker gets it first.
        let bad = Job::new(JobType::new(JobKind::Execution, "test"), serde_json::json!({}), 3, Utc::now())
            .with_priority(10);
        store.insert_job(bad.clone()).unwrap();
        for _ in 0..3 {
            enqueue(&store, JobKind::Execution, 3);
        }

        let handle = executor.spawn().unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        while store.job_count() > 1 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        let stats = handle.shutdown();

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(stats.completed, 3);
        assert_eq!(stats.incidents, 1);
        assert_eq!(store.job_count(), 1);
        assert_eq!(store.get_job(bad.id).unwrap().unwrap().retries_left, 0);
    }

    #[test]
    fn spawned_executor_drains_queue() {
        let store = InMemoryJobStore::arc();
        let (executor, calls) = executor_with(store.clone(), |_| Ok(HandlerOutcome::Complete));
        for _ in 0..6 {
            enqueue(&store, JobKind::Execution, 3);
        }

        let handle = executor.spawn().unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        while store.job_count() > 0 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        let stats = handle.shutdown();

        assert_eq!(store.job_count(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 6);
        assert_eq!(stats.completed, 6);
    }
}
