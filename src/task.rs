//! Tasks: named, at-most-once-executed units of work with dependencies.
//!
//! A [`Task`] wraps a callable together with a completion [`Signal`] and a
//! set of dependency counters. Tasks are wired into a graph with
//! [`add_dependency`], kicked off with [`run`], and executed by the worker
//! threads of a [`TaskPool`].
//!
//! [`add_dependency`]: Task::add_dependency
//! [`run`]: Task::run
use crate::loom::sync::{
    atomic::{
        AtomicBool,
        Ordering::{AcqRel, Acquire},
    },
    Arc, Mutex,
};
use crate::pool::{self, TaskPool};
use crate::signal::{Failed, Listener, Signal, SignalId, Status};
use core::fmt;
use std::panic::{self, AssertUnwindSafe};
use tracing::{debug, error, trace_span};

/// The result returned by a task's callable.
pub type TaskResult = Result<(), TaskError>;

/// An error produced by a failing task callable.
///
/// The error's message is logged when the task fails; only the terminal
/// [`Status`] propagates to dependents.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
#[error("{0}")]
pub struct TaskError(String);

/// A unique identifier for a [`Task`].
///
/// Task IDs are guaranteed not to be reused, even after the task they
/// identify has completed and been deallocated.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct TaskId(u64);

type Runnable = Box<dyn FnMut(&TaskContext<'_>) -> TaskResult + Send>;

/// Context passed to a task's callable at execution time.
///
/// Exposes the identity of the executing worker thread and a back-reference
/// to the task itself, for diagnostics.
pub struct TaskContext<'a> {
    worker_name: &'a str,
    worker_index: usize,
    task: &'a Task,
}

/// A named, at-most-once-executed unit of work.
///
/// # Dependencies
///
/// A task may depend on any number of predecessor tasks (or bare signals, via
/// [`add_signal_dependency`]). Edges must be added **before** [`run`] is
/// requested; adding one afterwards is a programming error and panics.
///
/// Calling [`run`] requests execution: the task is submitted to its
/// [`TaskPool`] (or the [default pool](crate::pool::init_default)) as soon as
/// every predecessor has reported success — immediately, if it has no
/// dependencies. The callable executes at most once, on a worker thread, no
/// matter how concurrently completions and `run` race.
///
/// # Failure
///
/// The first predecessor to fail fails this task immediately; the failure
/// cascades to this task's own dependents through its signal, without waiting
/// for the remaining predecessors. The callable never runs in that case: the
/// success count can no longer be satisfied.
///
/// Readiness consults *only* the success count, however. If this task's
/// signal is failed through some other path (a direct
/// [`Signal::set_failed`] on it) while every counted predecessor succeeds,
/// the callable may still execute best-effort, and its outcome no longer
/// changes the already-failed status that dependents observed.
///
/// Failures are terminal and are never retried; observing and reacting to
/// them is the caller's responsibility.
///
/// # Examples
///
/// ```
/// use graft::{Task, TaskPool};
///
/// let pool = TaskPool::new(2);
///
/// let task = Task::builder()
///     .name("hello")
///     .pool(pool.clone())
///     .build(|cx| {
///         println!("hello from {}", cx.worker_name());
///         Ok(())
///     });
///
/// task.run().join().expect("task should succeed");
/// pool.shutdown();
/// ```
pub struct Task {
    name: String,
    id: TaskId,
    signal: Signal<()>,
    runnable: Mutex<Option<Runnable>>,
    /// Set exactly once, under the `deps` lock, so that the readiness checks
    /// in `run` and `notify` are serialized.
    run_requested: AtomicBool,
    deps: Mutex<DepCounts>,
    pool: Option<TaskPool>,
}

/// Builds a new [`Task`] prior to wiring and running it.
///
/// Returned by [`Task::builder`].
#[derive(Debug)]
pub struct Builder {
    name: Option<String>,
    pool: Option<TaskPool>,
}

/// A clonable handle to a running (or pending) [`Task`].
///
/// Returned by [`Task::run`]; used to block for completion.
#[derive(Clone)]
pub struct JoinHandle {
    task: Arc<Task>,
}

#[derive(Default)]
struct DepCounts {
    total: usize,
    succeeded: usize,
    failed: usize,
}

// === impl TaskError ===

impl TaskError {
    /// Returns a new `TaskError` with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

// === impl TaskId ===

impl TaskId {
    pub(crate) fn next() -> Self {
        // Don't use the loom atomics, since this has to go in a static.
        use std::sync::atomic::{AtomicU64, Ordering::Relaxed};

        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        Self(NEXT_ID.fetch_add(1, Relaxed))
    }
}

impl fmt::Debug for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TaskId(")?;
        fmt::Debug::fmt(&self.0, f)?;
        f.write_str(")")
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

// === impl TaskContext ===

impl TaskContext<'_> {
    /// Returns the name of the worker thread executing the task.
    #[must_use]
    pub fn worker_name(&self) -> &str {
        self.worker_name
    }

    /// Returns the index of the executing worker within its pool.
    #[must_use]
    pub fn worker_index(&self) -> usize {
        self.worker_index
    }

    /// Returns a reference to the currently executing task.
    #[must_use]
    pub fn task(&self) -> &Task {
        self.task
    }
}

impl fmt::Debug for TaskContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskContext")
            .field("worker_name", &self.worker_name)
            .field("worker_index", &self.worker_index)
            .field("task", &self.task.name)
            .finish()
    }
}

// === impl Task ===

impl Task {
    /// Returns a new [`Builder`] for configuring a task.
    #[must_use]
    pub fn builder() -> Builder {
        Builder {
            name: None,
            pool: None,
        }
    }

    /// Returns a new task named `name` running `runnable`, bound to the
    /// [default pool](crate::pool::init_default).
    #[must_use]
    pub fn new<F>(name: &str, runnable: F) -> Arc<Self>
    where
        F: FnMut(&TaskContext<'_>) -> TaskResult + Send + 'static,
    {
        Self::builder().name(name).build(runnable)
    }

    /// Returns a new task with no work of its own, to be used purely as a
    /// synchronization point in the graph.
    ///
    /// A sync point depends on other tasks like any task does; its handle
    /// completes once all of its predecessors have succeeded (or fails on the
    /// first predecessor failure), giving callers a single handle to wait on.
    #[must_use]
    pub fn sync_point(name: &str) -> Arc<Self> {
        Self::builder().name(name).sync_point()
    }

    /// Returns this task's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns this task's unique [`TaskId`].
    #[must_use]
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Returns a reference to this task's completion [`Signal`].
    ///
    /// This is the signal other tasks subscribe to when they depend on this
    /// task; it can also back non-task compositions directly.
    #[must_use]
    pub fn signal(&self) -> &Signal<()> {
        &self.signal
    }

    /// Returns the current [`Status`] of this task.
    #[must_use]
    pub fn status(&self) -> Status {
        self.signal.status()
    }

    /// Returns a [`JoinHandle`] to this task.
    #[must_use]
    pub fn handle(self: &Arc<Self>) -> JoinHandle {
        JoinHandle { task: self.clone() }
    }

    /// Registers that this task must wait for `predecessor` to succeed
    /// before it may execute.
    ///
    /// # Panics
    ///
    /// Panics if [`run`](Self::run) has already been requested on this task:
    /// the counters driving readiness must be stable once execution may
    /// start.
    ///
    /// A dependency cycle is not detected; the tasks on the cycle simply
    /// never become ready.
    pub fn add_dependency(self: &Arc<Self>, predecessor: &Arc<Task>) {
        self.add_signal_dependency(&predecessor.signal);
    }

    /// Registers that this task must wait for `signal` to succeed before it
    /// may execute.
    ///
    /// This is the generalization of [`add_dependency`](Self::add_dependency)
    /// to any async operation backed by a [`Signal`], not just tasks.
    ///
    /// # Panics
    ///
    /// Panics if [`run`](Self::run) has already been requested on this task.
    pub fn add_signal_dependency<T>(self: &Arc<Self>, signal: &Signal<T>) {
        assert!(
            !self.run_requested.load(Acquire),
            "dependencies may not be added to task `{}` after `run()` was requested",
            self.name,
        );
        {
            let mut deps = self.lock_deps();
            deps.total += 1;
        }
        // Subscribe outside the counter lock: a signal that has already
        // completed notifies immediately, and that notification re-enters
        // `notify`, which takes the counter lock.
        signal.subscribe(self.clone());
    }

    /// Requests execution of this task, returning a [`JoinHandle`] that can
    /// be used to block for completion.
    ///
    /// If the task has no unmet dependencies it is submitted to its pool
    /// immediately; otherwise it is submitted by the completion of its final
    /// predecessor. Calling `run` more than once is harmless: the task is
    /// submitted (and executed) at most once.
    pub fn run(self: &Arc<Self>) -> JoinHandle {
        let ready = {
            let deps = self.lock_deps();
            if self.run_requested.swap(true, AcqRel) {
                debug!(task = %self.name, id = %self.id, "Task::run -> already requested");
                false
            } else {
                deps.total == 0 || deps.succeeded == deps.total
            }
        };
        if ready {
            self.submit();
        }
        self.handle()
    }

    /// Blocks the calling thread until this task completes, and returns its
    /// terminal [`Status`].
    ///
    /// Safe to call from any thread, including before `run` (it will simply
    /// block longer), and including a worker thread of the same pool — though
    /// a worker blocking on a task that only another worker of an undersized
    /// pool can advance risks starving the pool; sizing for that is the
    /// caller's concern.
    pub fn wait_completed(&self) -> Status {
        let _span =
            trace_span!("Task::wait_completed", task = %self.name, id = %self.id).entered();
        self.signal.wait_completed()
    }

    /// Executes this task's callable on the calling worker thread.
    ///
    /// Called by the worker pool, at most once: the callable is taken out of
    /// its slot under lock, so a second call finds it gone.
    pub(crate) fn execute(self: &Arc<Self>, worker_name: &str, worker_index: usize) {
        let _span = trace_span!(
            "Task::execute",
            task = %self.name,
            id = %self.id,
            worker = worker_name,
        )
        .entered();

        let mut runnable = match self.take_runnable() {
            Some(runnable) => runnable,
            None => {
                debug_assert!(false, "task `{}` executed twice", self.name);
                return;
            }
        };

        let cx = TaskContext {
            worker_name,
            worker_index,
            task: self,
        };
        match panic::catch_unwind(AssertUnwindSafe(|| runnable(&cx))) {
            Ok(Ok(())) => self.signal.set_result(()),
            Ok(Err(error)) => {
                error!(task = %self.name, worker = worker_name, %error, "task failed");
                self.signal.set_failed();
            }
            Err(_) => {
                // A panicking callable must still complete the signal, or
                // every waiter and dependent would block forever.
                error!(task = %self.name, worker = worker_name, "task panicked");
                self.signal.set_failed();
            }
        }
    }

    /// Pushes this task onto its pool's run queue.
    fn submit(self: &Arc<Self>) {
        let pool = match &self.pool {
            Some(pool) => pool.clone(),
            None => match pool::try_default() {
                Some(pool) => pool,
                None => {
                    error!(
                        task = %self.name,
                        "no task pool: none set on the task and the default pool \
                         is not initialized",
                    );
                    self.signal.set_failed();
                    return;
                }
            },
        };
        if let Err(error) = pool.submit(self.clone()) {
            // Submission after shutdown fails the task, so that waiters see
            // an error rather than silently lost work.
            error!(task = %self.name, %error, "failed to submit task");
            self.signal.set_failed();
        }
    }

    fn take_runnable(&self) -> Option<Runnable> {
        self.runnable
            .lock()
            .expect("task runnable mutex will not be poisoned")
            .take()
    }

    fn lock_deps(&self) -> crate::loom::sync::MutexGuard<'_, DepCounts> {
        self.deps
            .lock()
            .expect("task counter mutex will not be poisoned")
    }
}

impl Listener for Task {
    fn notify(self: Arc<Self>, status: Status, from: SignalId) {
        match status {
            Status::Succeeded => {
                let ready = {
                    let mut deps = self.lock_deps();
                    deps.succeeded += 1;
                    debug_assert!(
                        deps.succeeded + deps.failed <= deps.total,
                        "task `{}` notified more times than it has dependencies",
                        self.name,
                    );
                    // Readiness consults only the success count; a task
                    // whose own signal has already been failed elsewhere may
                    // still be submitted here (see the type-level docs on
                    // failure).
                    deps.succeeded == deps.total && self.run_requested.load(Acquire)
                };
                if ready {
                    self.submit();
                }
            }
            Status::Failed => {
                let first_failure = {
                    let mut deps = self.lock_deps();
                    deps.failed += 1;
                    debug_assert!(
                        deps.succeeded + deps.failed <= deps.total,
                        "task `{}` notified more times than it has dependencies",
                        self.name,
                    );
                    deps.failed == 1
                };
                // Only the first failure propagates; the task's signal is
                // single-assignment anyway, but this keeps the cascade from
                // walking the downstream graph once per failed predecessor.
                if first_failure {
                    error!(task = %self.name, dep = %from, "task failed: dependency failed");
                    self.signal.set_failed();
                }
            }
            Status::Pending => unreachable!("listeners are only notified with a terminal status"),
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

// === impl Builder ===

impl Builder {
    /// Sets the name of the task, for diagnostics.
    ///
    /// By default, tasks are named `"task"`.
    #[must_use]
    pub fn name(self, name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..self
        }
    }

    /// Sets the [`TaskPool`] that will execute the task.
    ///
    /// By default, tasks are submitted to the
    /// [default pool](crate::pool::init_default).
    #[must_use]
    pub fn pool(self, pool: TaskPool) -> Self {
        Self {
            pool: Some(pool),
            ..self
        }
    }

    /// Builds the task with `runnable` as its body.
    #[must_use]
    pub fn build<F>(self, runnable: F) -> Arc<Task>
    where
        F: FnMut(&TaskContext<'_>) -> TaskResult + Send + 'static,
    {
        self.build_boxed(Box::new(runnable))
    }

    /// Builds a task with no work of its own; see [`Task::sync_point`].
    #[must_use]
    pub fn sync_point(self) -> Arc<Task> {
        self.build_boxed(Box::new(|_| Ok(())))
    }

    fn build_boxed(self, runnable: Runnable) -> Arc<Task> {
        let task = Arc::new(Task {
            name: self.name.unwrap_or_else(|| "task".to_owned()),
            id: TaskId::next(),
            signal: Signal::new(),
            runnable: Mutex::new(Some(runnable)),
            run_requested: AtomicBool::new(false),
            deps: Mutex::new(DepCounts::default()),
            pool: self.pool,
        });
        debug!(task = %task.name, id = %task.id, "built task");
        task
    }
}

// === impl JoinHandle ===

impl JoinHandle {
    /// Returns a reference to the task this handle joins on.
    #[must_use]
    pub fn task(&self) -> &Arc<Task> {
        &self.task
    }

    /// Returns the current [`Status`] of the task.
    #[must_use]
    pub fn status(&self) -> Status {
        self.task.status()
    }

    /// Blocks until the task completes, and returns its terminal [`Status`].
    pub fn wait_completed(&self) -> Status {
        self.task.wait_completed()
    }

    /// Blocks until the task completes, returning [`Failed`] as an error if
    /// it did not succeed.
    pub fn join(&self) -> Result<(), Failed> {
        match self.task.wait_completed() {
            Status::Succeeded => Ok(()),
            _ => Err(Failed(())),
        }
    }
}

impl fmt::Debug for JoinHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinHandle").field("task", &self.task).finish()
    }
}
