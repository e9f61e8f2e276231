//! Priority task processor with bounded concurrency
//!
//! ## Task State Machine
//!
//! ```text
//! Pending ──dispatch──► Running ──ok──────────────► Completed
//!    ▲                     │
//!    └──retry (prio - 1)───┤ error, retries left
//!                          ├──error, exhausted────► Failed
//! Pending/Running ──cancel─┴──────────────────────► Cancelled
//! ```
//!
//! A single scheduling loop moves tasks from the queue onto the runtime. It
//! never awaits a handler: every attempt runs in its own task and a watcher
//! reports the outcome back. Timeouts are enforced by the health check pass.

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{Mutex, Notify, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, trace, warn};
use uuid::Uuid;

use crate::balancer::LoadBalancer;
use crate::config::ProcessingConfig;
use crate::error::{ScalingError, ScalingResult, TaskError};
use crate::monitors::memory::MemoryManager;
use crate::supervisor::{DEFAULT_BACKOFF, spawn_supervised};
use crate::util::format_bytes;

use super::queue::TaskQueue;
use super::rate_limit::RateLimiter;
use super::task::{Task, TaskCallback, TaskHandler, TaskId, TaskSpec, TaskStatus};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProcessingStats {
    pub queued: usize,
    pub running: usize,
    pub max_concurrent: usize,
    /// Tasks currently held, terminal ones included
    pub tracked: usize,
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub retried: u64,
    pub timed_out: u64,
    pub rejected: u64,
    pub average_execution_ms: f64,
    pub accepting: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HealthReport {
    pub timed_out: Vec<TaskId>,
    pub pruned: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ShutdownReport {
    /// Queued tasks cancelled before they started
    pub cancelled_pending: usize,
    /// Running tasks still active when the timeout expired
    pub force_cancelled: usize,
}

#[derive(Debug, Default)]
struct Counters {
    submitted: u64,
    completed: u64,
    failed: u64,
    cancelled: u64,
    retried: u64,
    timed_out: u64,
    rejected: u64,
    total_execution: Duration,
    executions: u64,
}

struct TaskRecord {
    task: Task,
    handler: TaskHandler,
    callback: Option<TaskCallback>,
}

struct ActiveTask {
    attempt: u32,
    abort: AbortHandle,
    started: Instant,
    timeout: Duration,
    pool: String,
    worker: Option<String>,
}

impl ActiveTask {
    fn placement(&self) -> Option<(String, String)> {
        self.worker
            .as_ref()
            .map(|worker| (self.pool.clone(), worker.clone()))
    }
}

/// A terminal task whose callback still has to run
struct Finished {
    task: Task,
    callback: Option<TaskCallback>,
}

struct Release {
    task_id: TaskId,
    pool: String,
    worker: String,
    success: bool,
}

#[derive(Default)]
struct ProcessorState {
    tasks: HashMap<TaskId, TaskRecord>,
    queue: TaskQueue,
    active: HashMap<TaskId, ActiveTask>,
    /// Terminal task ids, oldest first
    finished: VecDeque<TaskId>,
    rate_limiter: Option<RateLimiter>,
    counters: Counters,
}

impl ProcessorState {
    /// Settle one attempt; `None` when the task went back to the queue
    fn settle(
        &mut self,
        task_id: &str,
        outcome: Result<Value, TaskError>,
        elapsed: Duration,
        allow_retry: bool,
    ) -> Option<Finished> {
        let record = self.tasks.get_mut(task_id)?;
        let task = &mut record.task;
        task.execution_time = Some(elapsed);

        match outcome {
            Ok(value) => {
                task.transition(TaskStatus::Completed);
                task.result = Some(value);
                task.error = None;
                self.counters.completed += 1;
                self.counters.total_execution += elapsed;
                self.counters.executions += 1;
            }
            Err(error) => {
                if error.is_timeout() {
                    self.counters.timed_out += 1;
                }

                if allow_retry && task.retry_count < task.max_retries {
                    task.transition(TaskStatus::Pending);
                    task.retry_count += 1;
                    task.priority = task.priority.lower();
                    task.worker = None;
                    debug!(
                        "task {task_id} failed ({error}), retry {}/{} at {:?}",
                        task.retry_count, task.max_retries, task.priority
                    );
                    task.error = Some(error);
                    self.queue.push(task_id.to_string(), task.priority);
                    self.counters.retried += 1;
                    return None;
                }

                warn!("task {task_id} failed permanently: {error}");
                task.transition(TaskStatus::Failed);
                task.error = Some(error);
                self.counters.failed += 1;
            }
        }

        task.completed_at = Some(Utc::now());
        self.finished.push_back(task_id.to_string());
        Some(Finished {
            task: record.task.clone(),
            callback: record.callback.clone(),
        })
    }

    fn mark_cancelled(&mut self, task_id: &str) {
        if let Some(record) = self.tasks.get_mut(task_id) {
            if record.task.transition(TaskStatus::Cancelled) {
                record.task.completed_at = Some(Utc::now());
                self.counters.cancelled += 1;
                self.finished.push_back(task_id.to_string());
            }
        }
    }

    /// Drop terminal tasks beyond the most recent `limit`
    fn prune(&mut self, limit: usize) -> usize {
        let mut pruned = 0;
        while self.finished.len() > limit {
            let Some(task_id) = self.finished.pop_front() else {
                break;
            };
            let terminal = self
                .tasks
                .get(&task_id)
                .is_some_and(|record| record.task.status.is_terminal());
            if terminal {
                self.tasks.remove(&task_id);
                pruned += 1;
            }
        }
        pruned
    }
}

struct Inner {
    config: ProcessingConfig,
    instance_name: String,
    memory: Arc<MemoryManager>,
    balancer: Option<Arc<LoadBalancer>>,
    state: Mutex<ProcessorState>,
    wake: Notify,
    accepting: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

/// Executes submitted tasks with retries, timeouts and cancellation
#[derive(Clone)]
pub struct ConcurrentProcessor {
    inner: Arc<Inner>,
}

impl ConcurrentProcessor {
    pub fn new(
        config: ProcessingConfig,
        instance_name: impl Into<String>,
        memory: Arc<MemoryManager>,
        balancer: Option<Arc<LoadBalancer>>,
    ) -> Self {
        let rate_limiter = config
            .rate_limit
            .as_ref()
            .map(|limit| RateLimiter::new(limit.max_per_second, limit.burst));
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            inner: Arc::new(Inner {
                config,
                instance_name: instance_name.into(),
                memory,
                balancer,
                state: Mutex::new(ProcessorState {
                    rate_limiter,
                    ..Default::default()
                }),
                wake: Notify::new(),
                accepting: AtomicBool::new(true),
                shutdown_tx,
                loops: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Spawn the scheduling and health check loops
    pub async fn start(&self) {
        let mut loops = self.inner.loops.lock().await;
        if !loops.is_empty() {
            return;
        }

        let inner = Arc::clone(&self.inner);
        let shutdown = self.inner.shutdown_tx.subscribe();
        loops.push(spawn_supervised(
            "task dispatch",
            self.inner.shutdown_tx.subscribe(),
            DEFAULT_BACKOFF,
            move || {
                let inner = Arc::clone(&inner);
                let shutdown = shutdown.clone();
                async move { inner.run_scheduler(shutdown).await }
            },
        ));

        let inner = Arc::clone(&self.inner);
        let shutdown = self.inner.shutdown_tx.subscribe();
        loops.push(spawn_supervised(
            "task health check",
            self.inner.shutdown_tx.subscribe(),
            DEFAULT_BACKOFF,
            move || {
                let inner = Arc::clone(&inner);
                let shutdown = shutdown.clone();
                async move { inner.run_health_checks(shutdown).await }
            },
        ));

        debug!(
            "processor started with {} concurrent slots",
            self.inner.config.max_concurrent_tasks
        );
    }

    /// Queue a task for execution
    ///
    /// Rejected with `ResourceExhausted` when memory stays short after a
    /// cleanup attempt or the queue is full.
    #[instrument(skip(self, spec), fields(kind = %spec.kind))]
    pub async fn submit(&self, spec: TaskSpec) -> ScalingResult<TaskId> {
        let inner = &self.inner;
        if !inner.accepting.load(Ordering::SeqCst) {
            return Err(ScalingError::ShuttingDown);
        }

        if let Some(balancer) = &inner.balancer {
            if !balancer.has_pool(&spec.pool).await {
                return Err(ScalingError::UnknownPool(spec.pool));
            }
        }

        let memory_limit = spec
            .memory_limit
            .unwrap_or(inner.config.default_memory_limit_mb * 1024 * 1024);
        if memory_limit > 0 {
            if let Err(e) = inner.ensure_memory(memory_limit).await {
                inner.state.lock().await.counters.rejected += 1;
                return Err(e);
            }
        }

        let task_id = Uuid::new_v4().to_string();
        let task = Task {
            id: task_id.clone(),
            owner_instance: spec
                .owner_instance
                .unwrap_or_else(|| inner.instance_name.clone()),
            kind: spec.kind,
            pool: spec.pool,
            priority: spec.priority,
            payload: spec.payload,
            max_retries: spec.max_retries.unwrap_or(inner.config.default_max_retries),
            timeout: spec
                .timeout
                .unwrap_or(Duration::from_secs(inner.config.default_timeout_secs)),
            memory_limit,
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            retry_count: 0,
            attempts: 0,
            execution_time: None,
            result: None,
            error: None,
            worker: None,
        };

        {
            let mut state = inner.state.lock().await;
            if state.queue.len() >= inner.config.max_queue_size {
                state.counters.rejected += 1;
                return Err(ScalingError::ResourceExhausted(format!(
                    "task queue full ({} queued)",
                    state.queue.len()
                )));
            }
            state.queue.push(task_id.clone(), task.priority);
            state.tasks.insert(
                task_id.clone(),
                TaskRecord {
                    task,
                    handler: spec.handler,
                    callback: spec.callback,
                },
            );
            state.counters.submitted += 1;
        }

        inner.wake.notify_one();
        trace!("task {task_id} queued");
        Ok(task_id)
    }

    pub async fn get_task_status(&self, task_id: &str) -> Option<Task> {
        self.inner
            .state
            .lock()
            .await
            .tasks
            .get(task_id)
            .map(|record| record.task.clone())
    }

    /// Wait until a task is terminal and turn it into its result
    pub async fn wait_for(&self, task_id: &str, timeout: Duration) -> ScalingResult<Value> {
        let deadline = Instant::now() + timeout;
        loop {
            let task = self
                .get_task_status(task_id)
                .await
                .ok_or_else(|| ScalingError::UnknownTask(task_id.to_string()))?;

            match task.status {
                TaskStatus::Completed => return Ok(task.result.unwrap_or(Value::Null)),
                TaskStatus::Failed => {
                    return Err(match task.error {
                        Some(TaskError::Timeout(ms)) => ScalingError::TaskTimeout {
                            task_id: task.id,
                            timeout: Duration::from_millis(ms),
                        },
                        Some(error) => ScalingError::TaskFailure(error.to_string()),
                        None => ScalingError::TaskFailure("unknown failure".to_string()),
                    });
                }
                TaskStatus::Cancelled => {
                    return Err(ScalingError::TaskFailure(format!(
                        "task {task_id} was cancelled"
                    )));
                }
                TaskStatus::Pending | TaskStatus::Running => {}
            }

            if Instant::now() >= deadline {
                return Err(ScalingError::TaskTimeout {
                    task_id: task_id.to_string(),
                    timeout,
                });
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Cancel a pending or running task; its callback is not run
    pub async fn cancel(&self, task_id: &str) -> bool {
        self.inner.cancel(task_id).await
    }

    pub async fn health_check(&self) -> HealthReport {
        self.inner.health_check().await
    }

    pub async fn get_stats(&self) -> ProcessingStats {
        let state = self.inner.state.lock().await;
        let counters = &state.counters;
        let average_execution_ms = if counters.executions == 0 {
            0.0
        } else {
            counters.total_execution.as_secs_f64() * 1000.0 / counters.executions as f64
        };

        ProcessingStats {
            queued: state.queue.len(),
            running: state.active.len(),
            max_concurrent: self.inner.config.max_concurrent_tasks,
            tracked: state.tasks.len(),
            submitted: counters.submitted,
            completed: counters.completed,
            failed: counters.failed,
            cancelled: counters.cancelled,
            retried: counters.retried,
            timed_out: counters.timed_out,
            rejected: counters.rejected,
            average_execution_ms,
            accepting: self.inner.accepting.load(Ordering::SeqCst),
        }
    }

    /// Stop accepting work, drain and stop the loops
    ///
    /// Queued tasks are cancelled immediately; running tasks get up to
    /// `timeout` to finish before they are cancelled too.
    #[instrument(skip(self))]
    pub async fn shutdown(&self, timeout: Duration) -> ShutdownReport {
        let inner = &self.inner;
        inner.accepting.store(false, Ordering::SeqCst);
        info!("processor shutting down");

        let cancelled_pending = {
            let mut guard = inner.state.lock().await;
            let state = &mut *guard;
            let queued = state.queue.drain();
            for task_id in &queued {
                state.mark_cancelled(task_id);
            }
            queued.len()
        };

        let deadline = Instant::now() + timeout;
        loop {
            let running = inner.state.lock().await.active.len();
            if running == 0 || Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let stragglers: Vec<TaskId> = inner.state.lock().await.active.keys().cloned().collect();
        for task_id in &stragglers {
            warn!("force cancelling task {task_id}");
            inner.cancel(task_id).await;
        }

        let _ = inner.shutdown_tx.send(true);
        let loops = std::mem::take(&mut *inner.loops.lock().await);
        for handle in loops {
            let _ = handle.await;
        }

        info!(
            "processor stopped ({cancelled_pending} queued cancelled, {} forced)",
            stragglers.len()
        );
        ShutdownReport {
            cancelled_pending,
            force_cancelled: stragglers.len(),
        }
    }
}

impl Inner {
    async fn ensure_memory(&self, required: u64) -> ScalingResult<()> {
        let available = match self.memory.check_memory_usage() {
            Ok(stats) => stats.available,
            Err(e) => {
                warn!("cannot verify memory headroom, accepting task: {e}");
                return Ok(());
            }
        };
        if available >= required {
            return Ok(());
        }

        let cleanup = self.memory.cleanup_if_needed().await;
        debug!(
            "memory short for submission, cleanup performed: {}",
            cleanup.performed
        );

        let available = match self.memory.check_memory_usage() {
            Ok(stats) => stats.available,
            Err(e) => {
                return Err(ScalingError::ResourceExhausted(format!(
                    "{} required, headroom unknown after cleanup: {e}",
                    format_bytes(required)
                )));
            }
        };
        if available >= required {
            return Ok(());
        }

        Err(ScalingError::ResourceExhausted(format!(
            "{} available, {} required",
            format_bytes(available),
            format_bytes(required)
        )))
    }

    async fn run_scheduler(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        debug!("starting task dispatch loop");
        loop {
            if *shutdown.borrow() {
                break;
            }
            let retry = self.dispatch_ready().await;

            tokio::select! {
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(retry.unwrap_or_default()), if retry.is_some() => {}
                _ = shutdown.changed() => break,
            }
        }
        debug!("task dispatch loop stopped");
    }

    /// Start queued tasks while slots are free
    ///
    /// Returns a delay when dispatch was deferred by the rate limiter or by
    /// a pool without free workers. A rate limit token is only spent once the
    /// task has a worker.
    ///
    /// The state lock is held across placement, so `cancel` and `shutdown`
    /// never see a task that owns a worker slot while still `Pending`. The
    /// balancer only takes its own pool locks, never this one.
    async fn dispatch_ready(self: &Arc<Self>) -> Option<Duration> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        loop {
            if !self.accepting.load(Ordering::SeqCst)
                || state.active.len() >= self.config.max_concurrent_tasks
            {
                return None;
            }

            let entry = state.queue.pop()?;
            let pool = match state.tasks.get(&entry.task_id) {
                Some(record) if record.task.status == TaskStatus::Pending => {
                    record.task.pool.clone()
                }
                _ => continue,
            };

            if let Some(limiter) = state.rate_limiter.as_mut() {
                let wait = limiter.time_until_available();
                if !wait.is_zero() {
                    let wait = wait.max(Duration::from_millis(1));
                    state.queue.requeue(entry);
                    trace!("dispatch rate limited for {wait:?}");
                    return Some(wait);
                }
            }

            let worker = match &self.balancer {
                None => None,
                Some(balancer) => match balancer.assign(&pool, &entry.task_id).await {
                    Ok(Some(worker)) => Some(worker),
                    Ok(None) => {
                        state.queue.requeue(entry);
                        return Some(self.config.dispatch_retry());
                    }
                    Err(e) => {
                        warn!("cannot place task {}: {e}", entry.task_id);
                        state.queue.requeue(entry);
                        return Some(self.config.dispatch_retry());
                    }
                },
            };

            if let Some(limiter) = state.rate_limiter.as_mut() {
                // a token was available above and tokens only refill meanwhile
                limiter.try_acquire();
            }
            self.start_attempt(state, entry.task_id, pool, worker);
        }
    }

    fn start_attempt(
        self: &Arc<Self>,
        state: &mut ProcessorState,
        task_id: TaskId,
        pool: String,
        worker: Option<String>,
    ) {
        let Some(record) = state.tasks.get_mut(&task_id) else {
            return;
        };
        if !record.task.transition(TaskStatus::Running) {
            return;
        }
        record.task.started_at = Some(Utc::now());
        record.task.attempts += 1;
        record.task.worker = worker.clone();

        let attempt = record.task.attempts;
        let timeout = record.task.timeout;
        let work = tokio::spawn(execute(record.handler.clone(), record.task.payload.clone()));

        state.active.insert(
            task_id.clone(),
            ActiveTask {
                attempt,
                abort: work.abort_handle(),
                started: Instant::now(),
                timeout,
                pool,
                worker,
            },
        );
        trace!("task {task_id} started (attempt {attempt})");

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = match work.await {
                Ok(outcome) => outcome,
                Err(e) if e.is_panic() => Err(TaskError::Panicked(panic_message(e.into_panic()))),
                // aborted by cancel or timeout, already settled
                Err(_) => return,
            };
            inner.finish_attempt(&task_id, attempt, outcome).await;
        });
    }

    async fn finish_attempt(&self, task_id: &str, attempt: u32, outcome: Result<Value, TaskError>) {
        let allow_retry = self.accepting.load(Ordering::SeqCst);
        let success = outcome.is_ok();

        let (finished, release) = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;

            // a timed out or cancelled attempt may still report back
            let current = state
                .active
                .get(task_id)
                .is_some_and(|active| active.attempt == attempt);
            if !current {
                return;
            }
            let Some(active) = state.active.remove(task_id) else {
                return;
            };

            let finished = state.settle(task_id, outcome, active.started.elapsed(), allow_retry);
            let release = active.placement().map(|(pool, worker)| Release {
                task_id: task_id.to_string(),
                pool,
                worker,
                success,
            });
            (finished, release)
        };

        if let Some(release) = release {
            self.release_worker(release).await;
        }
        self.wake.notify_one();
        if let Some(finished) = finished {
            run_callback(finished);
        }
    }

    async fn release_worker(&self, release: Release) {
        let Some(balancer) = &self.balancer else {
            return;
        };
        if let Err(e) = balancer
            .release(&release.pool, &release.worker, &release.task_id, release.success)
            .await
        {
            warn!("failed to release worker {}: {e}", release.worker);
        }
    }

    async fn cancel(&self, task_id: &str) -> bool {
        let release = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            let Some(record) = state.tasks.get(task_id) else {
                return false;
            };

            let release = match record.task.status {
                TaskStatus::Pending => {
                    state.queue.remove(task_id);
                    None
                }
                TaskStatus::Running => {
                    let active = state.active.remove(task_id);
                    active.and_then(|active| {
                        active.abort.abort();
                        active.placement().map(|(pool, worker)| Release {
                            task_id: task_id.to_string(),
                            pool,
                            worker,
                            success: false,
                        })
                    })
                }
                _ => return false,
            };

            state.mark_cancelled(task_id);
            release
        };

        info!("task {task_id} cancelled");
        if let Some(release) = release {
            self.release_worker(release).await;
        }
        self.wake.notify_one();
        true
    }

    async fn health_check(&self) -> HealthReport {
        let allow_retry = self.accepting.load(Ordering::SeqCst);
        let mut releases = vec![];
        let mut finished = vec![];
        let mut timed_out = vec![];

        let pruned = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;

            let expired: Vec<TaskId> = state
                .active
                .iter()
                .filter(|(_, active)| active.started.elapsed() > active.timeout)
                .map(|(task_id, _)| task_id.clone())
                .collect();

            for task_id in expired {
                let Some(active) = state.active.remove(&task_id) else {
                    continue;
                };
                active.abort.abort();
                warn!("task {task_id} exceeded its timeout of {:?}", active.timeout);

                let error = TaskError::Timeout(active.timeout.as_millis() as u64);
                if let Some(done) =
                    state.settle(&task_id, Err(error), active.started.elapsed(), allow_retry)
                {
                    finished.push(done);
                }
                if let Some((pool, worker)) = active.placement() {
                    releases.push(Release {
                        task_id: task_id.clone(),
                        pool,
                        worker,
                        success: false,
                    });
                }
                timed_out.push(task_id);
            }

            state.prune(self.config.history_limit)
        };

        for release in releases {
            self.release_worker(release).await;
        }
        if !timed_out.is_empty() {
            self.wake.notify_one();
        }
        for done in finished {
            run_callback(done);
        }
        if pruned > 0 {
            debug!("pruned {pruned} finished tasks");
        }

        HealthReport { timed_out, pruned }
    }

    async fn run_health_checks(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.health_check_interval());
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.health_check().await;
                    if !report.timed_out.is_empty() {
                        info!("health check timed out {} tasks", report.timed_out.len());
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    }
}

async fn execute(handler: TaskHandler, payload: Value) -> Result<Value, TaskError> {
    match handler {
        TaskHandler::Async(f) => f(payload).await.map_err(TaskError::Failed),
        TaskHandler::Blocking(f) => match tokio::task::spawn_blocking(move || f(payload)).await {
            Ok(result) => result.map_err(TaskError::Failed),
            Err(e) if e.is_panic() => Err(TaskError::Panicked(panic_message(e.into_panic()))),
            Err(e) => Err(TaskError::Failed(e.to_string())),
        },
    }
}

fn run_callback(finished: Finished) {
    let Some(callback) = finished.callback else {
        return;
    };
    let task = finished.task;
    if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(|| callback(&task))) {
        error!(
            "callback for task {} panicked: {}",
            task.id,
            panic_message(panic)
        );
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        return message.to_string();
    }
    if let Some(message) = payload.downcast_ref::<String>() {
        return message.clone();
    }
    "unknown panic".to_string()
}
