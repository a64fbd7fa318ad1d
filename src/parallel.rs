//! Parallel-for: fan a range of items out over the worker pool.
//!
//! This is a convenience layered on top of [`Task`] and [`Signal`]; it adds
//! no scheduling behavior of its own.
use crate::loom::sync::{
    atomic::{
        AtomicUsize,
        Ordering::{Relaxed, SeqCst},
    },
    Arc,
};
use crate::pool::TaskPool;
use crate::signal::{Handle, Listener, Signal, SignalId, Status};
use crate::task::{Task, TaskContext, TaskResult};
use crate::util::div_up;
use tracing::{debug, error};

type ItemFn = dyn Fn(&TaskContext<'_>, usize, usize) -> TaskResult + Send + Sync;

/// A parallel-for job operating on a range of items.
///
/// [`schedule`](Self::schedule) splits the range into one chunk job per
/// `batch_size` items and submits each as an ordinary [`Task`]. The jobs
/// share the items through a single atomic allocator, so a job that finishes
/// its cheap items early keeps claiming work from slower siblings; each job
/// processes at most `batch_size` items.
///
/// The returned [`Handle`] completes with success when the last job finishes
/// with every item processed, and fails as soon as the first job observes a
/// failing item. Remaining jobs still run their claimed items best-effort
/// after a failure. A chunk job that can never run at all (its submission
/// failed, or its body panicked) also fails the handle; it never stays
/// pending.
///
/// # Examples
///
/// ```
/// use std::sync::atomic::{AtomicUsize, Ordering::Relaxed};
/// use std::sync::Arc;
/// use graft::{ParallelFor, TaskPool};
///
/// let pool = TaskPool::new(4);
/// let sum = Arc::new(AtomicUsize::new(0));
///
/// let job = ParallelFor::new("sum", {
///     let sum = sum.clone();
///     move |_cx, item, _total| {
///         sum.fetch_add(item, Relaxed);
///         Ok(())
///     }
/// })
/// .pool(pool.clone());
///
/// job.schedule(100, 16).join().expect("no item fails");
/// assert_eq!(sum.load(Relaxed), (0..100).sum());
/// pool.shutdown();
/// ```
pub struct ParallelFor {
    name: String,
    pool: Option<TaskPool>,
    runnable: Arc<ItemFn>,
}

/// State shared by the chunk jobs of one scheduled fan-out.
struct FanOut {
    runnable: Arc<ItemFn>,
    signal: Arc<Signal<()>>,
    /// Next unclaimed item index.
    next_item: AtomicUsize,
    jobs_finished: AtomicUsize,
    jobs_failed: AtomicUsize,
    num_elements: usize,
    batch_size: usize,
    num_jobs: usize,
}

/// Forwards a failed terminal status onto another signal; used to fail the
/// aggregate handle when a chunk job can never run its items (failed
/// submission, panicking item) or when a
/// [`schedule_after`](ParallelFor::schedule_after) dependency fails before
/// any item runs.
struct ForwardFailure(Arc<Signal<()>>);

// === impl ParallelFor ===

impl ParallelFor {
    /// Returns a new parallel-for job named `name`, running `runnable` once
    /// per item.
    ///
    /// The callable receives the execution context, the item index, and the
    /// total number of items.
    #[must_use]
    pub fn new<F>(name: &str, runnable: F) -> Self
    where
        F: Fn(&TaskContext<'_>, usize, usize) -> TaskResult + Send + Sync + 'static,
    {
        Self {
            name: name.to_owned(),
            pool: None,
            runnable: Arc::new(runnable),
        }
    }

    /// Sets the [`TaskPool`] that will execute the chunk jobs.
    ///
    /// By default, they are submitted to the
    /// [default pool](crate::pool::init_default).
    #[must_use]
    pub fn pool(mut self, pool: TaskPool) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Kicks off the fan-out over `num_elements` items, `batch_size` items
    /// per job, and returns a handle to the aggregate completion.
    ///
    /// Scheduling zero elements completes the handle immediately with
    /// success.
    pub fn schedule(&self, num_elements: usize, batch_size: usize) -> Handle<()> {
        assert!(batch_size > 0, "batch size must be non-zero");
        let state = self.fan_out(num_elements, batch_size);
        let handle = Handle::new(state.signal.clone());
        self.spawn_jobs(&state);
        handle
    }

    /// Like [`schedule`](Self::schedule), but the fan-out happens only after
    /// `after` completes successfully.
    ///
    /// `after` may be any completion signal, typically a predecessor
    /// [`Task`]'s ([`Task::signal`]) or another handle's
    /// ([`Handle::signal`]). If it fails, no item runs and the returned
    /// handle fails.
    pub fn schedule_after<T>(
        &self,
        num_elements: usize,
        batch_size: usize,
        after: &Signal<T>,
    ) -> Handle<()> {
        assert!(batch_size > 0, "batch size must be non-zero");
        let state = self.fan_out(num_elements, batch_size);
        let handle = Handle::new(state.signal.clone());

        let gate_name = format!("{}-gate", self.name);
        let mut gate = Task::builder().name(&gate_name);
        if let Some(pool) = &self.pool {
            gate = gate.pool(pool.clone());
        }
        let gate = gate.build({
            let this = self.clone();
            move |_cx| {
                this.spawn_jobs(&state);
                Ok(())
            }
        });
        // A failing dependency cascades to the gate task without its body
        // ever running; forward that onto the aggregate handle, which is
        // otherwise only completed by the chunk jobs.
        gate.signal()
            .subscribe(Arc::new(ForwardFailure(handle.signal().clone())));
        gate.add_signal_dependency(after);
        gate.run();
        handle
    }

    fn fan_out(&self, num_elements: usize, batch_size: usize) -> Arc<FanOut> {
        Arc::new(FanOut {
            runnable: self.runnable.clone(),
            signal: Arc::new(Signal::new()),
            next_item: AtomicUsize::new(0),
            jobs_finished: AtomicUsize::new(0),
            jobs_failed: AtomicUsize::new(0),
            num_elements,
            batch_size,
            num_jobs: div_up(num_elements, batch_size),
        })
    }

    fn spawn_jobs(&self, state: &Arc<FanOut>) {
        if state.num_jobs == 0 {
            state.signal.set_result(());
            return;
        }
        debug!(
            name = %self.name,
            jobs = state.num_jobs,
            elements = state.num_elements,
            batch = state.batch_size,
            "parallel-for fan-out",
        );
        for i in 0..state.num_jobs {
            let job_name = format!("{}-{i}", self.name);
            let mut builder = Task::builder().name(&job_name);
            if let Some(pool) = &self.pool {
                builder = builder.pool(pool.clone());
            }
            let job = builder.build({
                let state = state.clone();
                move |cx| {
                    state.run_job(cx);
                    Ok(())
                }
            });
            // A job whose body never runs (failed submission, panicking
            // item) must still resolve the aggregate handle, or waiters
            // would block forever.
            job.signal()
                .subscribe(Arc::new(ForwardFailure(state.signal.clone())));
            job.run();
        }
    }
}

impl Clone for ParallelFor {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            pool: self.pool.clone(),
            runnable: self.runnable.clone(),
        }
    }
}

impl core::fmt::Debug for ParallelFor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ParallelFor")
            .field("name", &self.name)
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

// === impl FanOut ===

impl FanOut {
    /// One chunk job: claim items from the shared allocator until either the
    /// range is exhausted or this job has processed a full batch.
    fn run_job(&self, cx: &TaskContext<'_>) {
        let mut processed = 0;
        let mut failed = false;

        // The batch quota is checked before claiming: a claimed index is
        // always processed, never stranded by a job that exits full.
        while processed < self.batch_size {
            let item = self.next_item.fetch_add(1, Relaxed);
            if item >= self.num_elements {
                break;
            }
            if let Err(error) = (self.runnable)(cx, item, self.num_elements) {
                error!(task = %cx.task().name(), item, %error, "parallel-for item failed");
                failed = true;
            }
            processed += 1;
        }

        if failed {
            // The first failing job fails the aggregate handle.
            if self.jobs_failed.fetch_add(1, SeqCst) == 0 {
                self.signal.set_failed();
            }
        } else if self.jobs_finished.fetch_add(1, SeqCst) + 1 == self.num_jobs {
            // All jobs finished cleanly, so every claimed item is done.
            self.signal.set_result(());
        }
    }
}

// === impl ForwardFailure ===

impl Listener for ForwardFailure {
    fn notify(self: Arc<Self>, status: Status, _: SignalId) {
        if status == Status::Failed {
            self.0.set_failed();
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests;
