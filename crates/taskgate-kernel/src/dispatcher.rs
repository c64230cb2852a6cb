//! [`Dispatcher`] – claims one task, runs its worker, records the outcome.
//!
//! One [`Dispatcher::run_next_task`] pass is three steps:
//!
//! 1. **Claim.**  A write transaction moves the best eligible `pending` task
//!    to `claimed` and appends `task_claimed`.  A lost race
//!    ([`StoreError::Conflict`]) re-runs selection, up to
//!    [`MAX_CLAIM_ATTEMPTS`] times.
//! 2. **Execute.**  The worker runs with no transaction open.  Panics are
//!    caught and count as a failed attempt.  A scoped thread renews the
//!    claim lease (`tasks.heartbeat_at`) every heartbeat interval meanwhile.
//! 3. **Resolve.**  A second write transaction appends `worker_executed`,
//!    moves the task to `completed`, back to `pending` or to `failed`, and
//!    appends the matching receipt.
//!
//! Several dispatchers (threads or processes) may share one database; the
//! conditional claim guarantees no task is executed by two at once.
//!
//! # Stale claims
//!
//! [`Dispatcher::reap_stale_claims`] only reaps a claim whose lease has not
//! been renewed within the threshold, so a worker that is slow but alive
//! keeps its task.  Tasks this dispatcher is executing are never reaped by
//! it, whatever the threshold.  Across processes the threshold must exceed
//! the heartbeat interval.

use std::any::Any;
use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use rusqlite::Connection;
use serde_json::{Value, json};
use taskgate_store::receipt_ledger::{self, NewReceipt};
use taskgate_store::{Database, StoreError, task_store};
use taskgate_types::{
    Actor, DispatchOutcome, KernelError, ReceiptAction, Task, TaskOutcome, TaskStatus,
    format_timestamp, now,
};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::retry_policy::RetryPolicy;
use crate::worker_registry::{WorkerError, WorkerRegistry};

/// Selection retries after a lost claim race before reporting idle.
pub const MAX_CLAIM_ATTEMPTS: usize = 5;

/// Lease renewal period while a worker runs.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// `error` recorded when no worker is registered for the task type.
pub const UNKNOWN_TASK_TYPE: &str = "unknown_task_type";
/// `error` recorded when a claim lease outlives the reaper threshold.
pub const CLAIM_TIMEOUT: &str = "claim_timeout";

/// Why an attempt did not complete.
struct Failure {
    error: String,
    retryable: bool,
    /// Whether the attempt counts against `max_retries`.
    attempted: bool,
    /// Worker run time, when a worker result was observed.
    duration_ms: Option<u64>,
}

impl Failure {
    fn unknown_task_type() -> Self {
        Self {
            error: UNKNOWN_TASK_TYPE.to_string(),
            retryable: false,
            attempted: false,
            duration_ms: None,
        }
    }

    /// The holder stopped renewing its lease; whether its worker ran is
    /// unknown, so no `worker_executed` is recorded.
    fn claim_timeout() -> Self {
        Self {
            error: CLAIM_TIMEOUT.to_string(),
            retryable: true,
            attempted: true,
            duration_ms: None,
        }
    }

    fn from_worker(err: &WorkerError, duration_ms: u64) -> Self {
        Self {
            error: err.receipt_error(),
            retryable: err.is_retryable(),
            attempted: true,
            duration_ms: Some(duration_ms),
        }
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("worker panicked: {message}")
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("worker panicked: {message}")
    } else {
        "worker panicked".to_string()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Dispatcher
// ─────────────────────────────────────────────────────────────────────────────

/// Removes a task from the in-flight set when dropped.
struct InFlight<'a> {
    set: &'a Mutex<HashSet<Uuid>>,
    task_id: Uuid,
}

impl<'a> InFlight<'a> {
    fn enter(set: &'a Mutex<HashSet<Uuid>>, task_id: Uuid) -> Self {
        lock_set(set).insert(task_id);
        Self { set, task_id }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        lock_set(self.set).remove(&self.task_id);
    }
}

// A panic while holding the set cannot leave it half-updated.
fn lock_set(set: &Mutex<HashSet<Uuid>>) -> MutexGuard<'_, HashSet<Uuid>> {
    set.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct Dispatcher {
    db: Arc<Database>,
    registry: Arc<WorkerRegistry>,
    retry: RetryPolicy,
    heartbeat_interval: Duration,
    /// Tasks claimed by this dispatcher and not yet resolved.
    in_flight: Mutex<HashSet<Uuid>>,
}

impl Dispatcher {
    pub fn new(db: Arc<Database>, registry: Arc<WorkerRegistry>, retry: RetryPolicy) -> Self {
        Self {
            db,
            registry,
            retry,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Renew the claim lease every `interval` (at least 1 ms) while a worker
    /// runs.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval.max(Duration::from_millis(1));
        self
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    pub fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Claim and process the next eligible task of any client.
    pub fn run_next_task(&self) -> Result<DispatchOutcome, KernelError> {
        self.run_next_task_for(None)
    }

    /// Claim and process the next eligible task, optionally for one client.
    ///
    /// Worker failures are recorded and reported through the outcome; only
    /// storage failures surface as `Err`.
    #[instrument(skip(self), fields(task_id = tracing::field::Empty))]
    pub fn run_next_task_for(
        &self,
        client_id: Option<&str>,
    ) -> Result<DispatchOutcome, KernelError> {
        let Some((task, _in_flight)) = self.claim(client_id)? else {
            return Ok(DispatchOutcome::Idle);
        };
        tracing::Span::current().record("task_id", tracing::field::display(task.task_id));

        let task_id = task.task_id;
        let resolved = match self.registry.get(&task.task_type) {
            None => {
                warn!(%task_id, task_type = %task.task_type, "no worker registered");
                self.db
                    .write(|tx| self.record_failure(tx, &task, Failure::unknown_task_type()))
            }
            Some(worker) => {
                let started = Instant::now();
                let result = self.with_lease(&task, || {
                    panic::catch_unwind(AssertUnwindSafe(|| worker.execute(&task.payload)))
                        .unwrap_or_else(|panic| Err(WorkerError::Failed(panic_message(panic))))
                });
                let duration_ms = started.elapsed().as_millis() as u64;
                self.db
                    .write(|tx| self.resolve(tx, &task, result, duration_ms))
            }
        };

        match resolved {
            Ok(outcome) => Ok(DispatchOutcome::Resolved { task_id, outcome }),
            Err(StoreError::Conflict(_)) => {
                // The claim was lost while the worker ran; its result is void.
                warn!(%task_id, "claim no longer held; discarding worker result");
                Ok(DispatchOutcome::Idle)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// The in-flight entry is made under the connection lock, before the
    /// claim commits, so the reaper never sees the claim without it.
    fn claim(&self, client_id: Option<&str>) -> Result<Option<(Task, InFlight<'_>)>, KernelError> {
        for attempt in 1..=MAX_CLAIM_ATTEMPTS {
            let claimed = self.db.write(|tx| {
                let Some(task) = task_store::claim_next(tx, client_id, now())? else {
                    return Ok(None);
                };
                receipt_ledger::append(
                    tx,
                    NewReceipt::new(&task.client_id, ReceiptAction::TaskClaimed, Actor::System)
                        .task(task.task_id)
                        .payload(json!({
                            "task_type": task.task_type,
                            "attempt": task.retry_count + 1,
                        })),
                )?;
                let in_flight = InFlight::enter(&self.in_flight, task.task_id);
                Ok(Some((task, in_flight)))
            });
            match claimed {
                Ok(task) => return Ok(task),
                Err(StoreError::Conflict(task_id)) => {
                    debug!(%task_id, attempt, "lost claim race; reselecting");
                }
                Err(err) => return Err(err.into()),
            }
        }
        debug!("claim attempts exhausted");
        Ok(None)
    }

    /// Run `work` while a scoped thread renews `task`'s lease.
    fn with_lease<T>(&self, task: &Task, work: impl FnOnce() -> T) -> T {
        let (done, finished) = mpsc::channel::<()>();
        thread::scope(|scope| {
            scope.spawn(move || self.keep_lease(task, &finished));
            let value = work();
            drop(done);
            value
        })
    }

    /// Renew until the sender side of `finished` is dropped or the claim is lost.
    fn keep_lease(&self, task: &Task, finished: &Receiver<()>) {
        while let Err(RecvTimeoutError::Timeout) = finished.recv_timeout(self.heartbeat_interval) {
            match self.db.write(|tx| task_store::renew_claim(tx, task, now())) {
                Ok(true) => debug!(task_id = %task.task_id, "claim lease renewed"),
                Ok(false) => {
                    warn!(task_id = %task.task_id, "claim lost while worker runs");
                    return;
                }
                Err(err) => warn!(task_id = %task.task_id, error = %err, "lease renewal failed"),
            }
        }
    }

    fn resolve(
        &self,
        conn: &Connection,
        task: &Task,
        result: Result<Value, WorkerError>,
        duration_ms: u64,
    ) -> Result<TaskOutcome, StoreError> {
        let output = match result {
            Ok(output) => output,
            Err(err) => {
                let kernel_err = KernelError::WorkerExecution(err.to_string());
                warn!(task_id = %task.task_id, error = %kernel_err, "worker attempt failed");
                return self.record_failure(conn, task, Failure::from_worker(&err, duration_ms));
            }
        };

        let attempt = task.retry_count + 1;
        self.append(
            conn,
            task,
            ReceiptAction::WorkerExecuted,
            json!({ "success": true, "duration_ms": duration_ms, "attempt": attempt }),
        )?;
        let completed = Task {
            status: TaskStatus::Completed,
            completed_at: Some(now()),
            ..task.clone()
        };
        task_store::apply_transition(conn, task, &completed)?;
        self.append(
            conn,
            task,
            ReceiptAction::TaskCompleted,
            json!({ "result": output, "attempt": attempt }),
        )?;
        info!(task_id = %task.task_id, task_type = %task.task_type, duration_ms, "task completed");
        Ok(TaskOutcome::Completed)
    }

    /// Record a failed attempt and move the task back to `pending` or to
    /// `failed`, depending on the retry rule for its type.
    fn record_failure(
        &self,
        conn: &Connection,
        task: &Task,
        failure: Failure,
    ) -> Result<TaskOutcome, StoreError> {
        let rule = self.retry.rule_for(&task.task_type);
        let retry_count = if failure.attempted {
            task.retry_count + 1
        } else {
            task.retry_count
        };
        let will_retry = failure.retryable && rule.should_retry(retry_count);

        if let Some(duration_ms) = failure.duration_ms {
            self.append(
                conn,
                task,
                ReceiptAction::WorkerExecuted,
                json!({
                    "success": false,
                    "duration_ms": duration_ms,
                    "error": failure.error,
                    "will_retry": will_retry,
                    "attempt": retry_count,
                }),
            )?;
        }

        let ts = now();
        if will_retry {
            let backoff = rule.backoff_for(retry_count);
            let available_at = if backoff.is_zero() {
                None
            } else {
                chrono::Duration::from_std(backoff)
                    .ok()
                    .and_then(|delay| ts.checked_add_signed(delay))
            };
            let retried = Task {
                status: TaskStatus::Pending,
                retry_count,
                claimed_at: None,
                available_at,
                ..task.clone()
            };
            task_store::apply_transition(conn, task, &retried)?;
            self.append(
                conn,
                task,
                ReceiptAction::TaskFailed,
                json!({
                    "error": failure.error,
                    "will_retry": true,
                    "retry_count": retry_count,
                    "available_at": available_at.as_ref().map(format_timestamp),
                }),
            )?;
            info!(
                task_id = %task.task_id,
                retry_count,
                error = %failure.error,
                "task scheduled for retry"
            );
            Ok(TaskOutcome::Retrying {
                retry_count,
                error: failure.error,
            })
        } else {
            let failed = Task {
                status: TaskStatus::Failed,
                retry_count,
                completed_at: Some(ts),
                ..task.clone()
            };
            task_store::apply_transition(conn, task, &failed)?;
            self.append(
                conn,
                task,
                ReceiptAction::TaskFailed,
                json!({
                    "error": failure.error,
                    "will_retry": false,
                    "retry_count": retry_count,
                }),
            )?;
            warn!(task_id = %task.task_id, retry_count, error = %failure.error, "task failed");
            Ok(TaskOutcome::Failed {
                error: failure.error,
            })
        }
    }

    fn append(
        &self,
        conn: &Connection,
        task: &Task,
        action: ReceiptAction,
        payload: Value,
    ) -> Result<(), StoreError> {
        receipt_ledger::append(
            conn,
            NewReceipt::new(&task.client_id, action, Actor::System)
                .task(task.task_id)
                .payload(payload),
        )?;
        Ok(())
    }

    /// Resolve every claim whose lease is older than `older_than` as a failed
    /// attempt with `error = "claim_timeout"`, through the normal retry path.
    ///
    /// Tasks this dispatcher is executing are skipped.  Each candidate is
    /// re-checked inside its write transaction, so a renewal or resolution
    /// that lands after selection keeps the task.  Returns the number of
    /// claims reaped.
    #[instrument(skip(self))]
    pub fn reap_stale_claims(&self, older_than: Duration) -> Result<usize, KernelError> {
        let Some(cutoff) = chrono::Duration::from_std(older_than)
            .ok()
            .and_then(|age| now().checked_sub_signed(age))
        else {
            return Ok(0);
        };
        let candidates = self.db.read(|conn| task_store::stale_claims(conn, cutoff))?;

        let mut reaped = 0;
        for candidate in candidates {
            let task_id = candidate.task_id;
            let result = self.db.write(|tx| {
                if lock_set(&self.in_flight).contains(&task_id) {
                    return Ok(None);
                }
                match task_store::stale_claim(tx, task_id, cutoff)? {
                    Some(task) => self
                        .record_failure(tx, &task, Failure::claim_timeout())
                        .map(Some),
                    None => Ok(None),
                }
            });
            match result {
                Ok(Some(_)) => reaped += 1,
                Ok(None) => debug!(%task_id, "claim is live; not reaped"),
                Err(StoreError::Conflict(_)) => {}
                Err(err) => return Err(err.into()),
            }
        }
        if reaped > 0 {
            info!(reaped, "stale claims reaped");
        }
        Ok(reaped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry_policy::RetryRule;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use taskgate_types::{NewTask, ReceiptFilter};

    fn make_dispatcher(registry: WorkerRegistry, rule: RetryRule) -> (Arc<Database>, Dispatcher) {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let dispatcher = Dispatcher::new(db.clone(), Arc::new(registry), RetryPolicy::new(rule));
        (db, dispatcher)
    }

    fn enqueue(db: &Database, task_type: &str) -> Task {
        db.write(|tx| task_store::insert_task(tx, &NewTask::new("c1", task_type, json!({}), 5)))
            .unwrap()
    }

    fn stored(db: &Database, task: &Task) -> Task {
        db.read(|conn| task_store::get_task(conn, task.task_id))
            .unwrap()
            .unwrap()
    }

    fn receipts(db: &Database, task: &Task) -> Vec<taskgate_types::Receipt> {
        let mut all = db
            .read(|conn| {
                let filter = ReceiptFilter::default().for_task(task.task_id);
                receipt_ledger::list_receipts(conn, "c1", &filter)
            })
            .unwrap();
        all.reverse();
        all
    }

    #[test]
    fn idle_when_queue_is_empty() {
        let (_db, dispatcher) = make_dispatcher(WorkerRegistry::new(), RetryRule::default());
        assert!(dispatcher.run_next_task().unwrap().is_idle());
    }

    #[test]
    fn successful_worker_completes_task() {
        let mut registry = WorkerRegistry::new();
        registry.register_fn("noop", |_: &Value| Ok(json!({"ok": true})));
        let (db, dispatcher) = make_dispatcher(registry, RetryRule::default());
        let task = enqueue(&db, "noop");

        let outcome = dispatcher.run_next_task().unwrap();
        assert_eq!(
            outcome,
            DispatchOutcome::Resolved {
                task_id: task.task_id,
                outcome: TaskOutcome::Completed
            }
        );
        let done = stored(&db, &task);
        assert_eq!(done.status, TaskStatus::Completed);
        assert!(done.completed_at.is_some());

        let actions: Vec<_> = receipts(&db, &task).into_iter().map(|r| r.action).collect();
        assert_eq!(
            actions,
            vec![
                ReceiptAction::TaskClaimed,
                ReceiptAction::WorkerExecuted,
                ReceiptAction::TaskCompleted
            ]
        );
    }

    #[test]
    fn unknown_task_type_fails_without_retry() {
        let (db, dispatcher) = make_dispatcher(WorkerRegistry::new(), RetryRule::new(5));
        let task = enqueue(&db, "mystery");

        let outcome = dispatcher.run_next_task().unwrap();
        assert!(matches!(
            outcome,
            DispatchOutcome::Resolved {
                outcome: TaskOutcome::Failed { ref error },
                ..
            } if error == UNKNOWN_TASK_TYPE
        ));
        assert_eq!(stored(&db, &task).status, TaskStatus::Failed);

        let log = receipts(&db, &task);
        assert!(log.iter().all(|r| r.action != ReceiptAction::WorkerExecuted));
        let failed = log.last().unwrap();
        assert_eq!(failed.action, ReceiptAction::TaskFailed);
        assert_eq!(failed.payload["error"], UNKNOWN_TASK_TYPE);
        assert_eq!(failed.payload["will_retry"], false);
    }

    #[test]
    fn failing_worker_is_retried_then_failed() {
        let mut registry = WorkerRegistry::new();
        registry.register_fn("flaky", |_: &Value| Err(WorkerError::failed("upstream 503")));
        let (db, dispatcher) = make_dispatcher(registry, RetryRule::new(2));
        let task = enqueue(&db, "flaky");

        let first = dispatcher.run_next_task().unwrap();
        assert!(matches!(
            first,
            DispatchOutcome::Resolved { outcome: TaskOutcome::Retrying { retry_count: 1, .. }, .. }
        ));
        assert_eq!(stored(&db, &task).status, TaskStatus::Pending);

        let second = dispatcher.run_next_task().unwrap();
        assert!(matches!(
            second,
            DispatchOutcome::Resolved { outcome: TaskOutcome::Failed { .. }, .. }
        ));
        let final_state = stored(&db, &task);
        assert_eq!(final_state.status, TaskStatus::Failed);
        assert_eq!(final_state.retry_count, 2);
        assert!(dispatcher.run_next_task().unwrap().is_idle());
    }

    #[test]
    fn invalid_payload_is_not_retried() {
        let mut registry = WorkerRegistry::new();
        registry.register_fn("strict", |_: &Value| {
            Err(WorkerError::InvalidPayload("missing field".into()))
        });
        let (db, dispatcher) = make_dispatcher(registry, RetryRule::new(5));
        let task = enqueue(&db, "strict");

        let outcome = dispatcher.run_next_task().unwrap();
        assert!(matches!(
            outcome,
            DispatchOutcome::Resolved {
                outcome: TaskOutcome::Failed { ref error },
                ..
            } if error == "invalid_payload"
        ));
        assert_eq!(stored(&db, &task).retry_count, 1);
    }

    #[test]
    fn panicking_worker_counts_as_failure() {
        let mut registry = WorkerRegistry::new();
        registry.register_fn("boom", |_: &Value| -> Result<Value, WorkerError> {
            panic!("kaboom")
        });
        let (db, dispatcher) = make_dispatcher(registry, RetryRule::new(1));
        let task = enqueue(&db, "boom");

        let outcome = dispatcher.run_next_task().unwrap();
        match outcome {
            DispatchOutcome::Resolved {
                outcome: TaskOutcome::Failed { error },
                ..
            } => assert!(error.contains("kaboom")),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(stored(&db, &task).status, TaskStatus::Failed);
    }

    #[test]
    fn backoff_delays_next_claim() {
        let mut registry = WorkerRegistry::new();
        registry.register_fn("flaky", |_: &Value| Err(WorkerError::failed("later")));
        let rule =
            RetryRule::new(3).with_backoff(Duration::from_secs(60), Duration::from_secs(600));
        let (db, dispatcher) = make_dispatcher(registry, rule);
        let task = enqueue(&db, "flaky");

        dispatcher.run_next_task().unwrap();
        let retried = stored(&db, &task);
        assert_eq!(retried.status, TaskStatus::Pending);
        assert!(retried.available_at.unwrap() > now());
        assert!(dispatcher.run_next_task().unwrap().is_idle());
    }

    #[test]
    fn stale_claims_are_reaped_through_retry_path() {
        let (db, dispatcher) = make_dispatcher(WorkerRegistry::new(), RetryRule::new(2));
        let task = enqueue(&db, "slow");
        db.write(|tx| task_store::claim_next(tx, None, now())).unwrap();
        std::thread::sleep(Duration::from_millis(5));

        assert_eq!(dispatcher.reap_stale_claims(Duration::from_secs(3600)).unwrap(), 0);
        assert_eq!(dispatcher.reap_stale_claims(Duration::ZERO).unwrap(), 1);

        let reaped = stored(&db, &task);
        assert_eq!(reaped.status, TaskStatus::Pending);
        assert_eq!(reaped.retry_count, 1);
        let mut log = receipts(&db, &task);
        assert!(log.iter().all(|r| r.action != ReceiptAction::WorkerExecuted));
        let failed = log.pop().unwrap();
        assert_eq!(failed.action, ReceiptAction::TaskFailed);
        assert_eq!(failed.payload["error"], CLAIM_TIMEOUT);
    }

    /// Counts runs of a slow worker and the most that overlapped.
    #[derive(Default)]
    struct RunTracker {
        running: AtomicUsize,
        peak: AtomicUsize,
        runs: AtomicUsize,
    }

    impl RunTracker {
        fn register(self: &Arc<Self>, registry: &mut WorkerRegistry, run_for: Duration) {
            let tracker = self.clone();
            registry.register_fn("slow", move |_: &Value| {
                tracker.runs.fetch_add(1, Ordering::SeqCst);
                let running = tracker.running.fetch_add(1, Ordering::SeqCst) + 1;
                tracker.peak.fetch_max(running, Ordering::SeqCst);
                thread::sleep(run_for);
                tracker.running.fetch_sub(1, Ordering::SeqCst);
                Ok(json!({ "slept_ms": run_for.as_millis() as u64 }))
            });
        }

        fn runs(&self) -> usize {
            self.runs.load(Ordering::SeqCst)
        }

        fn peak(&self) -> usize {
            self.peak.load(Ordering::SeqCst)
        }
    }

    fn chain_is_valid(db: &Database) -> bool {
        db.read(|conn| receipt_ledger::verify_chain(conn, "c1", 100))
            .unwrap()
            .valid
    }

    #[test]
    fn reaper_skips_task_its_dispatcher_is_running() {
        let tracker = Arc::new(RunTracker::default());
        let mut registry = WorkerRegistry::new();
        tracker.register(&mut registry, Duration::from_millis(400));
        let (db, dispatcher) = make_dispatcher(registry, RetryRule::new(3));
        let task = enqueue(&db, "slow");

        let first = thread::scope(|scope| {
            let first = scope.spawn(|| dispatcher.run_next_task().unwrap());
            thread::sleep(Duration::from_millis(100));
            assert_eq!(dispatcher.reap_stale_claims(Duration::from_millis(20)).unwrap(), 0);
            assert!(dispatcher.run_next_task().unwrap().is_idle());
            first.join().unwrap()
        });

        assert_eq!(
            first,
            DispatchOutcome::Resolved {
                task_id: task.task_id,
                outcome: TaskOutcome::Completed
            }
        );
        assert_eq!(tracker.runs(), 1);
        assert_eq!(tracker.peak(), 1);
        assert_eq!(stored(&db, &task).retry_count, 0);
    }

    #[test]
    fn renewed_lease_survives_another_dispatchers_reaper() {
        let tracker = Arc::new(RunTracker::default());
        let mut registry = WorkerRegistry::new();
        tracker.register(&mut registry, Duration::from_millis(400));
        let db = Arc::new(Database::open_in_memory().unwrap());
        let policy = RetryPolicy::new(RetryRule::new(3));
        let runner = Dispatcher::new(db.clone(), Arc::new(registry), policy.clone())
            .with_heartbeat_interval(Duration::from_millis(10));
        let reaper = Dispatcher::new(db.clone(), Arc::new(WorkerRegistry::new()), policy);
        let task = enqueue(&db, "slow");

        let outcome = thread::scope(|scope| {
            let running = scope.spawn(|| runner.run_next_task().unwrap());
            thread::sleep(Duration::from_millis(200));
            assert_eq!(reaper.reap_stale_claims(Duration::from_millis(100)).unwrap(), 0);
            assert!(reaper.run_next_task().unwrap().is_idle());
            running.join().unwrap()
        });

        assert!(matches!(
            outcome,
            DispatchOutcome::Resolved {
                outcome: TaskOutcome::Completed,
                ..
            }
        ));
        assert_eq!(tracker.runs(), 1);
        assert_eq!(tracker.peak(), 1);
        assert!(chain_is_valid(&db));
    }

    #[test]
    fn result_of_a_lost_claim_is_discarded() {
        let tracker = Arc::new(RunTracker::default());
        let mut registry = WorkerRegistry::new();
        tracker.register(&mut registry, Duration::from_millis(300));
        let db = Arc::new(Database::open_in_memory().unwrap());
        let policy = RetryPolicy::new(
            RetryRule::new(3).with_backoff(Duration::from_secs(60), Duration::from_secs(60)),
        );
        // Default heartbeat: no renewal lands while the worker runs.
        let runner = Dispatcher::new(db.clone(), Arc::new(registry), policy.clone());
        let reaper = Dispatcher::new(db.clone(), Arc::new(WorkerRegistry::new()), policy);
        let task = enqueue(&db, "slow");

        let outcome = thread::scope(|scope| {
            let running = scope.spawn(|| runner.run_next_task().unwrap());
            thread::sleep(Duration::from_millis(100));
            assert_eq!(reaper.reap_stale_claims(Duration::from_millis(20)).unwrap(), 1);
            running.join().unwrap()
        });

        assert!(outcome.is_idle());
        assert_eq!(tracker.runs(), 1);
        let requeued = stored(&db, &task);
        assert_eq!(requeued.status, TaskStatus::Pending);
        assert_eq!(requeued.retry_count, 1);

        let actions: Vec<_> = receipts(&db, &task).into_iter().map(|r| r.action).collect();
        assert_eq!(
            actions,
            vec![ReceiptAction::TaskClaimed, ReceiptAction::TaskFailed]
        );
        assert!(chain_is_valid(&db));
    }
}
