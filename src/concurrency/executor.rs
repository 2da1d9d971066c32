//! Elastic Worker Thread Pool
//!
//! The [`Executor`] runs deferred, fire-and-forget tasks on a pool of OS
//! threads. The pool keeps at least `low_watermark` threads alive, grows one
//! thread at a time up to `high_watermark` when every live thread is busy,
//! and sheds surplus threads once they have been idle for `idle_timeout`.
//!
//! ## Worker Lifecycle
//!
//! ```text
//!             spawn (counted busy)
//!                    │
//!                    ▼
//!   ┌──────────> WaitingForWork ──────────────┐
//!   │                │                        │ no task and stopping,
//!   │                │ task available         │ or idle timeout while
//!   │                ▼                        │ above low watermark
//!   └────────── Executing                     ▼
//!     task done  (lock released)          Retiring ──> thread exits
//! ```
//!
//! ## Back-Pressure
//!
//! The task queue is bounded by `max_queue_size`. [`Executor::execute`]
//! never blocks and never buffers past that bound: it fails fast with
//! [`ExecuteError::QueueFull`] so the caller can decide what to do with the
//! work.
//!
//! ## Shutdown
//!
//! [`Executor::stop`] stops admission but lets workers drain the queue.
//! Every worker holds an `Arc` of the pool internals, so the pool outlives
//! each thread it spawns even when the `Executor` handle is dropped first.

use std::any::Any;
use std::collections::VecDeque;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, info_span, trace, warn, Span};

/// A unit of deferred work. Arguments are bound by `move` capture when the
/// task is submitted.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Configuration for an [`Executor`].
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Name used for worker threads and the executor's tracing span
    pub name: String,
    /// Minimum number of live worker threads
    pub low_watermark: usize,
    /// Maximum number of live worker threads
    pub high_watermark: usize,
    /// Maximum number of tasks waiting in the queue
    pub max_queue_size: usize,
    /// How long a thread above the low watermark waits for work before retiring
    pub idle_timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            name: "ember-worker".to_string(),
            low_watermark: 4,
            high_watermark: 16,
            max_queue_size: 1024,
            idle_timeout: Duration::from_secs(2),
        }
    }
}

impl ExecutorConfig {
    /// Creates a configuration with the default name.
    pub fn new(
        low_watermark: usize,
        high_watermark: usize,
        max_queue_size: usize,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            low_watermark,
            high_watermark,
            max_queue_size,
            idle_timeout,
            ..Self::default()
        }
    }

    /// Sets the name used for worker threads and log output.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

/// Lifecycle state of an [`Executor`]. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorState {
    /// Tasks are accepted and executed
    Running,
    /// No new tasks are accepted; queued tasks are still executed
    Stopping,
    /// All worker threads have exited
    Stopped,
}

/// A point-in-time snapshot of the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutorStats {
    pub state: ExecutorState,
    pub live_threads: usize,
    pub busy_threads: usize,
    pub queued_tasks: usize,
    pub tasks_completed: u64,
    pub tasks_panicked: u64,
}

/// Errors returned when building an [`Executor`].
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("invalid watermarks: low {low}, high {high} (need 1 <= low <= high)")]
    InvalidWatermarks { low: usize, high: usize },

    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] io::Error),
}

/// Reasons a task was not admitted. The task is dropped without running.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ExecuteError {
    #[error("executor is not running")]
    Stopped,

    #[error("task queue is full ({capacity} tasks)")]
    QueueFull { capacity: usize },
}

/// State guarded by the pool lock.
struct Pool {
    state: ExecutorState,
    tasks: VecDeque<Task>,
    live_threads: usize,
    busy_threads: usize,
    tasks_completed: u64,
    tasks_panicked: u64,
    next_worker_id: usize,
}

/// Everything the workers share with the handle.
struct Shared {
    config: ExecutorConfig,
    span: Span,
    pool: Mutex<Pool>,
    /// Signalled when a task is queued or the state changes
    work_available: Condvar,
    /// Signalled when the last worker retires
    all_retired: Condvar,
}

impl Shared {
    /// Tasks never run under the lock, so a poisoned lock still guards
    /// consistent counters.
    fn lock(&self) -> MutexGuard<'_, Pool> {
        self.pool.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// An elastic thread pool with a bounded task queue.
///
/// # Example
///
/// ```
/// use emberkv::concurrency::{Executor, ExecutorConfig};
/// use std::sync::mpsc;
/// use std::time::Duration;
///
/// let executor = Executor::new(ExecutorConfig::new(1, 4, 16, Duration::from_millis(100))).unwrap();
///
/// let (tx, rx) = mpsc::channel();
/// executor.execute(move || tx.send(6 * 7).unwrap()).unwrap();
/// assert_eq!(rx.recv().unwrap(), 42);
///
/// executor.stop(true);
/// ```
pub struct Executor {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("name", &self.shared.config.name)
            .field("stats", &self.stats())
            .finish()
    }
}

impl Executor {
    /// Creates the pool and spawns `low_watermark` worker threads.
    pub fn new(config: ExecutorConfig) -> Result<Self, ExecutorError> {
        if config.low_watermark == 0 || config.low_watermark > config.high_watermark {
            return Err(ExecutorError::InvalidWatermarks {
                low: config.low_watermark,
                high: config.high_watermark,
            });
        }

        let span = info_span!("executor", name = %config.name);
        let shared = Arc::new(Shared {
            pool: Mutex::new(Pool {
                state: ExecutorState::Running,
                tasks: VecDeque::with_capacity(config.max_queue_size.min(1024)),
                live_threads: 0,
                busy_threads: 0,
                tasks_completed: 0,
                tasks_panicked: 0,
                next_worker_id: 0,
            }),
            config,
            span,
            work_available: Condvar::new(),
            all_retired: Condvar::new(),
        });

        let executor = Executor { shared };
        executor.spawn_initial_workers()?;

        let config = &executor.shared.config;
        info!(
            parent: &executor.shared.span,
            low_watermark = config.low_watermark,
            high_watermark = config.high_watermark,
            max_queue_size = config.max_queue_size,
            idle_timeout_ms = config.idle_timeout.as_millis() as u64,
            "Executor started"
        );

        Ok(executor)
    }

    fn spawn_initial_workers(&self) -> Result<(), ExecutorError> {
        let result = {
            let mut pool = self.shared.lock();
            (0..self.shared.config.low_watermark)
                .try_for_each(|_| spawn_worker(&self.shared, &mut pool))
        };

        // The handle is dropped on error, which stops the threads that did start.
        result.map_err(ExecutorError::Spawn)
    }

    /// Submits a task for execution on the pool.
    ///
    /// Returns an error without side effects if the executor is not running
    /// or the queue is full. A successfully submitted task runs at most once;
    /// its result and any panic are not observable here.
    pub fn execute<F>(&self, task: F) -> Result<(), ExecuteError>
    where
        F: FnOnce() + Send + 'static,
    {
        let shared = &self.shared;
        let mut pool = shared.lock();

        if pool.state != ExecutorState::Running {
            return Err(ExecuteError::Stopped);
        }

        if pool.tasks.len() >= shared.config.max_queue_size {
            trace!(parent: &shared.span, queued = pool.tasks.len(), "Task rejected, queue full");
            return Err(ExecuteError::QueueFull {
                capacity: shared.config.max_queue_size,
            });
        }

        pool.tasks.push_back(Box::new(task));

        if pool.busy_threads == pool.live_threads
            && pool.live_threads < shared.config.high_watermark
        {
            if let Err(e) = spawn_worker(shared, &mut pool) {
                // The task stays queued; the existing workers will pick it up.
                warn!(parent: &shared.span, error = %e, "Failed to grow worker pool");
            }
        }

        drop(pool);
        shared.work_available.notify_one();
        Ok(())
    }

    /// Stops accepting tasks and wakes every worker.
    ///
    /// Queued tasks are still executed. With `await_termination` the call
    /// blocks until every worker has exited; otherwise it returns at once and
    /// the pool reaches [`ExecutorState::Stopped`] in the background.
    ///
    /// Must not be called with `await_termination` from inside a task: the
    /// calling worker would wait for itself.
    pub fn stop(&self, await_termination: bool) {
        let shared = &self.shared;
        let mut pool = shared.lock();

        if pool.state == ExecutorState::Running {
            pool.state = if pool.live_threads == 0 {
                ExecutorState::Stopped
            } else {
                ExecutorState::Stopping
            };
            info!(
                parent: &shared.span,
                live_threads = pool.live_threads,
                queued = pool.tasks.len(),
                "Executor stopping"
            );
        }

        shared.work_available.notify_all();

        if await_termination {
            while pool.live_threads > 0 {
                pool = shared
                    .all_retired
                    .wait(pool)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        }
    }

    /// Returns the current lifecycle state.
    pub fn state(&self) -> ExecutorState {
        self.shared.lock().state
    }

    /// Returns a snapshot of the pool counters.
    pub fn stats(&self) -> ExecutorStats {
        let pool = self.shared.lock();
        ExecutorStats {
            state: pool.state,
            live_threads: pool.live_threads,
            busy_threads: pool.busy_threads,
            queued_tasks: pool.tasks.len(),
            tasks_completed: pool.tasks_completed,
            tasks_panicked: pool.tasks_panicked,
        }
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        self.stop(true);
    }
}

/// Spawns one worker. Must be called with the pool lock held; the new
/// thread is counted as live and busy until it first waits for work.
fn spawn_worker(shared: &Arc<Shared>, pool: &mut Pool) -> io::Result<()> {
    let id = pool.next_worker_id;
    pool.next_worker_id += 1;

    let worker_shared = Arc::clone(shared);
    thread::Builder::new()
        .name(format!("{}-{}", shared.config.name, id))
        .spawn(move || worker_loop(worker_shared))?;

    pool.live_threads += 1;
    pool.busy_threads += 1;
    Ok(())
}

/// The routine every pool thread runs.
fn worker_loop(shared: Arc<Shared>) {
    let _entered = shared.span.enter();
    debug!("Worker started");

    let idle_timeout = shared.config.idle_timeout;
    let mut pool = shared.lock();

    loop {
        pool.busy_threads -= 1;

        let mut deadline = Instant::now().checked_add(idle_timeout);
        let task = loop {
            if let Some(task) = pool.tasks.pop_front() {
                break Some(task);
            }
            if pool.state != ExecutorState::Running {
                break None;
            }

            match deadline {
                Some(at) => {
                    let now = Instant::now();
                    if now >= at {
                        if pool.live_threads > shared.config.low_watermark {
                            break None;
                        }
                        deadline = now.checked_add(idle_timeout);
                        continue;
                    }
                    let (guard, _) = shared
                        .work_available
                        .wait_timeout(pool, at - now)
                        .unwrap_or_else(PoisonError::into_inner);
                    pool = guard;
                }
                None => {
                    pool = shared
                        .work_available
                        .wait(pool)
                        .unwrap_or_else(PoisonError::into_inner);
                }
            }
        };

        let Some(task) = task else {
            retire(&shared, pool);
            return;
        };

        pool.busy_threads += 1;
        drop(pool);

        let outcome = panic::catch_unwind(AssertUnwindSafe(task));
        if let Err(payload) = &outcome {
            error!(panic = panic_message(payload.as_ref()), "Task panicked");
        }

        pool = shared.lock();
        match outcome {
            Ok(()) => pool.tasks_completed += 1,
            Err(_) => pool.tasks_panicked += 1,
        }
    }
}

/// Removes the calling worker from the pool.
fn retire(shared: &Shared, mut pool: MutexGuard<'_, Pool>) {
    pool.live_threads -= 1;
    let remaining = pool.live_threads;

    if remaining == 0 && pool.state != ExecutorState::Running {
        pool.state = ExecutorState::Stopped;
        shared.all_retired.notify_all();
    }
    drop(pool);

    debug!(remaining, "Worker retired");
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{mpsc, Barrier};

    fn executor(low: usize, high: usize, queue: usize, idle_ms: u64) -> Executor {
        Executor::new(ExecutorConfig::new(
            low,
            high,
            queue,
            Duration::from_millis(idle_ms),
        ))
        .unwrap()
    }

    /// Polls `cond` until it holds or `timeout` elapses.
    fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    #[test]
    fn test_starts_with_low_watermark_threads() {
        for (low, high) in [(1, 1), (2, 4), (3, 8)] {
            let pool = executor(low, high, 8, 1000);
            let stats = pool.stats();
            assert_eq!(stats.live_threads, low);
            assert_eq!(stats.state, ExecutorState::Running);
            pool.stop(true);
        }
    }

    #[test]
    fn test_invalid_watermarks() {
        let zero = Executor::new(ExecutorConfig::new(0, 2, 8, Duration::from_secs(1)));
        assert!(matches!(
            zero,
            Err(ExecutorError::InvalidWatermarks { low: 0, high: 2 })
        ));

        let inverted = Executor::new(ExecutorConfig::new(3, 2, 8, Duration::from_secs(1)));
        assert!(matches!(
            inverted,
            Err(ExecutorError::InvalidWatermarks { low: 3, high: 2 })
        ));
    }

    #[test]
    fn test_executes_all_tasks() {
        let pool = executor(2, 4, 128, 1000);
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..100 {
            let counter = Arc::clone(&counter);
            pool.execute(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }

        pool.stop(true);
        assert_eq!(counter.load(Ordering::SeqCst), 100);
        assert_eq!(pool.stats().tasks_completed, 100);
    }

    #[test]
    fn test_rejects_when_queue_full() {
        let pool = executor(1, 1, 2, 1000);
        let counter = Arc::new(AtomicUsize::new(0));
        let (started_tx, started_rx) = mpsc::channel();
        let (gate_tx, gate_rx) = mpsc::channel::<()>();

        pool.execute(move || {
            started_tx.send(()).unwrap();
            gate_rx.recv().unwrap();
        })
        .unwrap();
        started_rx.recv().unwrap();

        // The only worker is blocked, so these fill the queue.
        for _ in 0..2 {
            let counter = Arc::clone(&counter);
            pool.execute(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }

        let rejected = pool.execute(|| {});
        assert_eq!(rejected, Err(ExecuteError::QueueFull { capacity: 2 }));
        assert_eq!(pool.stats().queued_tasks, 2);

        gate_tx.send(()).unwrap();
        pool.stop(true);

        // Nothing admitted was dropped.
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert_eq!(pool.stats().tasks_completed, 3);
    }

    #[test]
    fn test_zero_capacity_queue_rejects_everything() {
        let pool = executor(1, 2, 0, 1000);
        assert_eq!(
            pool.execute(|| {}),
            Err(ExecuteError::QueueFull { capacity: 0 })
        );
        pool.stop(true);
    }

    #[test]
    fn test_rejects_after_stop() {
        let pool = executor(1, 2, 8, 1000);
        pool.stop(false);
        assert_eq!(pool.execute(|| {}), Err(ExecuteError::Stopped));

        pool.stop(true);
        assert_eq!(pool.state(), ExecutorState::Stopped);
        assert_eq!(pool.execute(|| {}), Err(ExecuteError::Stopped));
    }

    #[test]
    fn test_stop_drains_queued_tasks() {
        let pool = executor(1, 1, 16, 1000);
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..6 {
            let counter = Arc::clone(&counter);
            pool.execute(move || {
                thread::sleep(Duration::from_millis(10));
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }

        pool.stop(true);

        let stats = pool.stats();
        assert_eq!(counter.load(Ordering::SeqCst), 6);
        assert_eq!(stats.live_threads, 0);
        assert_eq!(stats.busy_threads, 0);
        assert_eq!(stats.state, ExecutorState::Stopped);
    }

    #[test]
    fn test_stop_without_waiting_reaches_stopped() {
        let pool = executor(2, 2, 8, 1000);
        pool.execute(|| thread::sleep(Duration::from_millis(20)))
            .unwrap();

        pool.stop(false);
        assert_ne!(pool.state(), ExecutorState::Running);

        assert!(wait_until(Duration::from_secs(2), || {
            pool.state() == ExecutorState::Stopped
        }));
        assert_eq!(pool.stats().live_threads, 0);
    }

    #[test]
    fn test_never_exceeds_high_watermark() {
        let pool = executor(1, 3, 100, 1000);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        for _ in 0..30 {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            pool.execute(move || {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(5));
                running.fetch_sub(1, Ordering::SeqCst);
            })
            .unwrap();
            assert!(pool.stats().live_threads <= 3);
        }

        pool.stop(true);
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(pool.stats().tasks_completed, 30);
    }

    #[test]
    fn test_panicking_task_does_not_kill_pool() {
        let pool = executor(1, 1, 8, 1000);
        let counter = Arc::new(AtomicUsize::new(0));

        pool.execute(|| panic!("boom")).unwrap();

        let counter_clone = Arc::clone(&counter);
        pool.execute(move || {
            counter_clone.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        pool.stop(true);

        let stats = pool.stats();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(stats.tasks_panicked, 1);
        assert_eq!(stats.tasks_completed, 1);
    }

    #[test]
    fn test_idle_threads_retire_to_low_watermark() {
        let pool = executor(1, 3, 8, 30);
        let barrier = Arc::new(Barrier::new(4));
        let (started_tx, started_rx) = mpsc::channel();

        // Submit one at a time so every submission sees all threads busy.
        for _ in 0..3 {
            let barrier = Arc::clone(&barrier);
            let started_tx = started_tx.clone();
            pool.execute(move || {
                started_tx.send(()).unwrap();
                barrier.wait();
            })
            .unwrap();
            started_rx.recv().unwrap();
        }

        assert_eq!(pool.stats().live_threads, 3);
        barrier.wait();

        assert!(wait_until(Duration::from_secs(2), || {
            pool.stats().live_threads == 1
        }));

        // At the low watermark nobody retires.
        thread::sleep(Duration::from_millis(120));
        assert_eq!(pool.stats().live_threads, 1);

        pool.stop(true);
    }

    #[test]
    fn test_burst_grows_then_settles() {
        let pool = executor(2, 4, 2, 50);
        let started = Arc::new(AtomicUsize::new(0));
        let peak_live = Arc::new(AtomicUsize::new(0));

        assert!(wait_until(Duration::from_secs(1), || {
            pool.stats().busy_threads == 0
        }));

        for i in 0..5 {
            let started_task = Arc::clone(&started);
            pool.execute(move || {
                started_task.fetch_add(1, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(20));
            })
            .expect("no submission should be rejected");

            peak_live.fetch_max(pool.stats().live_threads, Ordering::SeqCst);

            // Let the previous task get picked up so growth is driven by busy threads.
            if i < 4 {
                let expected = i + 1;
                assert!(wait_until(Duration::from_secs(1), || {
                    started.load(Ordering::SeqCst) >= expected
                        || pool.stats().live_threads == 4
                }));
            }
        }

        assert!(peak_live.load(Ordering::SeqCst) <= 4);

        assert!(wait_until(Duration::from_secs(2), || {
            let stats = pool.stats();
            stats.tasks_completed == 5 && stats.live_threads == 2
        }));

        pool.stop(true);
    }

    #[test]
    fn test_drop_waits_for_tasks() {
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let pool = executor(2, 2, 16, 1000);
            for _ in 0..8 {
                let counter = Arc::clone(&counter);
                pool.execute(move || {
                    thread::sleep(Duration::from_millis(2));
                    counter.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
            }
        }
        assert_eq!(counter.load(Ordering::SeqCst), 8);
    }
}
