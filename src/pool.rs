//! The worker pool: a fixed set of OS threads executing ready tasks.
//!
//! See the documentation for the [`TaskPool`] type for details.
use crate::loom::sync::{Arc, Condvar, Mutex};
use crate::task::Task;
use core::fmt;
use core::mem;
use std::collections::VecDeque;
use std::sync::RwLock;
// Worker threads are real OS threads even under `cfg(loom)`; the pool is
// exercised by the multi-threaded tests, not by the loom models.
use std::thread;
use tracing::{debug, error, trace, warn};

/// A fixed-size pool of worker threads executing ready [`Task`]s.
///
/// The pool owns a FIFO run queue. Each worker runs a blocking pull loop:
/// wait until the queue is non-empty or shutdown is requested, pop the front
/// task, and execute its callable synchronously on that thread. Tasks that
/// share no dependency edge may run in any relative order, or fully in
/// parallel; there is no guarantee which worker executes which task.
///
/// `TaskPool` is a cheap clonable handle; all clones refer to the same pool.
///
/// # Shutdown
///
/// [`shutdown`](Self::shutdown) stops the pool: once the shutdown flag is
/// set, no new task body begins executing. Workers finish whatever they are
/// currently running and exit; tasks still sitting unexecuted in the queue
/// are dropped and **never** executed (their signals never complete). Callers
/// that need all submitted work to run must wait on each task's handle
/// *before* initiating shutdown.
pub struct TaskPool {
    core: Arc<Core>,
}

/// An error returned by [`TaskPool::submit`].
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
#[non_exhaustive]
pub enum SubmitError {
    /// The pool has been shut down; the task was not enqueued.
    #[error("the task pool has been shut down")]
    Shutdown,
}

struct Core {
    name: String,
    worker_count: usize,
    queue: Mutex<Queue>,
    cv: Condvar,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

struct Queue {
    tasks: VecDeque<Arc<Task>>,
    /// Checked under the same lock as the condvar wait, so a shutdown wakeup
    /// can never be lost.
    shutdown: bool,
}

// === impl TaskPool ===

impl TaskPool {
    /// Returns a new pool with `workers` worker threads, named
    /// `graft-worker-{index}`.
    ///
    /// # Panics
    ///
    /// Panics if `workers` is zero, or if spawning a worker thread fails.
    #[must_use]
    pub fn new(workers: usize) -> Self {
        Self::with_name("graft-worker", workers)
    }

    /// Returns a new pool with `workers` worker threads, named
    /// `{name}-{index}`.
    ///
    /// # Panics
    ///
    /// Panics if `workers` is zero, or if spawning a worker thread fails.
    #[must_use]
    pub fn with_name(name: &str, workers: usize) -> Self {
        assert!(workers > 0, "a task pool requires at least one worker");

        let core = Arc::new(Core {
            name: name.to_owned(),
            worker_count: workers,
            queue: Mutex::new(Queue {
                tasks: VecDeque::new(),
                shutdown: false,
            }),
            cv: Condvar::new(),
            workers: Mutex::new(Vec::new()),
        });

        let handles = (0..workers)
            .map(|index| {
                let thread_name = format!("{name}-{index}");
                let core = core.clone();
                thread::Builder::new()
                    .name(thread_name.clone())
                    .spawn(move || worker(core, index, thread_name))
                    .expect("failed to spawn worker thread")
            })
            .collect();
        *core
            .workers
            .lock()
            .expect("worker handle mutex will not be poisoned") = handles;

        debug!(pool = %name, workers, "started task pool");
        Self { core }
    }

    /// Returns the number of worker threads in this pool.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.core.worker_count
    }

    /// Appends `task` to the tail of the run queue and wakes one worker.
    ///
    /// # Errors
    ///
    /// Returns [`SubmitError::Shutdown`] if [`shutdown`](Self::shutdown) has
    /// already been requested; the task is not enqueued.
    pub fn submit(&self, task: Arc<Task>) -> Result<(), SubmitError> {
        let mut queue = self.core.lock_queue();
        if queue.shutdown {
            return Err(SubmitError::Shutdown);
        }
        trace!(
            pool = %self.core.name,
            task = %task.name(),
            depth = queue.tasks.len() + 1,
            "TaskPool::submit",
        );
        queue.tasks.push_back(task);
        self.core.cv.notify_one();
        Ok(())
    }

    /// Returns `true` if [`shutdown`](Self::shutdown) has been requested.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.core.lock_queue().shutdown
    }

    /// Shuts the pool down, blocking until every worker thread has exited.
    ///
    /// Sets the shutdown flag, wakes all workers, and joins them. Workers
    /// finish their in-flight task bodies before exiting; queued tasks that
    /// have not started are dropped and never executed (a warning is logged
    /// with the count). Idempotent: a second call joins nothing and returns.
    ///
    /// Must not be called from one of this pool's own worker threads, since
    /// a thread cannot join itself.
    pub fn shutdown(&self) {
        let dropped = {
            let mut queue = self.core.lock_queue();
            queue.shutdown = true;
            // Release the queued tasks' references now; they will never run.
            mem::take(&mut queue.tasks).len()
        };
        if dropped > 0 {
            warn!(
                pool = %self.core.name,
                dropped,
                "shutting down with unexecuted queued tasks; they will never run",
            );
        }
        self.core.cv.notify_all();

        let handles = mem::take(
            &mut *self
                .core
                .workers
                .lock()
                .expect("worker handle mutex will not be poisoned"),
        );
        for handle in handles {
            if handle.join().is_err() {
                error!(pool = %self.core.name, "a worker thread panicked");
            }
        }
        debug!(pool = %self.core.name, "task pool shut down");
    }
}

impl Clone for TaskPool {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
        }
    }
}

impl fmt::Debug for TaskPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskPool")
            .field("name", &self.core.name)
            .field("workers", &self.core.worker_count)
            .finish_non_exhaustive()
    }
}

// === impl Core ===

impl Core {
    /// Blocking pop: returns the next ready task, or `None` once shutdown is
    /// requested.
    fn next_task(&self) -> Option<Arc<Task>> {
        let mut queue = self.lock_queue();
        loop {
            // Shutdown is checked before the queue, so that work still queued
            // at shutdown time is dropped, never started.
            if queue.shutdown {
                return None;
            }
            if let Some(task) = queue.tasks.pop_front() {
                return Some(task);
            }
            queue = self
                .cv
                .wait(queue)
                .expect("queue mutex will not be poisoned");
        }
    }

    fn lock_queue(&self) -> crate::loom::sync::MutexGuard<'_, Queue> {
        self.queue
            .lock()
            .expect("queue mutex will not be poisoned")
    }
}

fn worker(core: Arc<Core>, index: usize, thread_name: String) {
    trace!(worker = %thread_name, "worker running");
    while let Some(task) = core.next_task() {
        task.execute(&thread_name, index);
    }
    trace!(worker = %thread_name, "worker exiting");
}

// === default pool ===

static DEFAULT_POOL: RwLock<Option<TaskPool>> = RwLock::new(None);

/// Installs `pool` as the process-wide default pool, used by tasks that do
/// not set one explicitly.
///
/// Lifecycle is explicit and owned by the surrounding application: install
/// the pool once at startup, and pair with [`teardown_default`] (followed by
/// [`TaskPool::shutdown`]) at teardown. There is no lazy initialization.
///
/// # Panics
///
/// Panics if a default pool is already installed.
pub fn init_default(pool: TaskPool) {
    let mut default = DEFAULT_POOL
        .write()
        .expect("default pool lock will not be poisoned");
    assert!(
        default.is_none(),
        "a default task pool is already installed",
    );
    debug!(pool = %pool.core.name, "installed default task pool");
    *default = Some(pool);
}

/// Returns a handle to the default pool, if one is installed.
#[must_use]
pub fn try_default() -> Option<TaskPool> {
    DEFAULT_POOL
        .read()
        .expect("default pool lock will not be poisoned")
        .clone()
}

/// Uninstalls and returns the default pool.
///
/// The caller is responsible for [`shutdown`](TaskPool::shutdown) on the
/// returned handle. Tasks submitted without an explicit pool after this
/// point fail with an error.
pub fn teardown_default() -> Option<TaskPool> {
    DEFAULT_POOL
        .write()
        .expect("default pool lock will not be poisoned")
        .take()
}
