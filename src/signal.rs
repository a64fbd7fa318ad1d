//! A single-assignment, thread-safe completion signal.
//!
//! See the documentation for the [`Signal`] type for details.
use crate::loom::sync::{Arc, Condvar, Mutex};
use core::fmt;
use core::mem;
use tracing::{trace, trace_span, warn};

/// The status of an asynchronous operation.
///
/// A [`Signal`] starts out [`Pending`] and transitions exactly once to either
/// [`Succeeded`] or [`Failed`]. Once terminal, the status never changes again.
///
/// [`Pending`]: Status::Pending
/// [`Succeeded`]: Status::Succeeded
/// [`Failed`]: Status::Failed
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Status {
    /// The operation has not completed yet.
    Pending,
    /// The operation completed successfully.
    Succeeded,
    /// The operation failed.
    Failed,
}

/// A unique identifier for a [`Signal`].
///
/// A `SignalId` is an opaque value that uniquely identifies each [`Signal`]
/// created during the lifetime of a program. It is passed to
/// [`Listener::notify`] to identify which predecessor completed, so that the
/// notifying signal need not outlive the call.
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct SignalId(u64);

/// An object that wants to be told when a [`Signal`] completes.
///
/// Listeners are registered with [`Signal::subscribe`] and are notified
/// exactly once, when the signal transitions to a terminal [`Status`] (or
/// immediately, if the signal is already terminal at subscription time).
pub trait Listener: Send + Sync + 'static {
    /// Called when the subscribed-to signal reaches `status`.
    ///
    /// `from` identifies the completing signal. The receiver is an
    /// [`Arc<Self>`] so that the notifying side holds the listener alive only
    /// for the duration of the call.
    fn notify(self: Arc<Self>, status: Status, from: SignalId);
}

/// A single-assignment completion cell.
///
/// A `Signal` decouples *who finishes work* from *who needs to know about
/// it*: any component can publish a terminal [`Status`] (and, optionally, a
/// result payload) through a signal, and any number of [`Listener`]s and
/// blocking waiters can observe it. The [`Task`](crate::task::Task) dependency
/// protocol is built on this type, but it carries no knowledge of tasks or
/// threads itself.
///
/// # Completion
///
/// The status transitions exactly once, via [`set_result`] or [`set_failed`].
/// A second completion is a programming error; it is logged at warn level and
/// otherwise ignored — the first terminal status always wins, and the stored
/// result is never overwritten.
///
/// # Subscription
///
/// [`subscribe`] registers a [`Listener`] to be notified on completion. If
/// the signal is already terminal when `subscribe` is called, the listener is
/// notified immediately from the subscribing thread: the event is never lost
/// to the race between "just completed" and "just subscribed".
///
/// [`set_result`]: Self::set_result
/// [`set_failed`]: Self::set_failed
/// [`subscribe`]: Self::subscribe
pub struct Signal<T> {
    id: SignalId,
    inner: Mutex<Inner<T>>,
    cv: Condvar,
}

/// A clonable handle to a [`Signal`], for callers that only need to observe
/// completion.
///
/// This is the "future handle" side of the signal: it exposes waiting and
/// result access, but not completion or subscription. Handles to a task are
/// usually obtained through [`Task::run`](crate::task::Task::run) (as a
/// [`JoinHandle`](crate::task::JoinHandle)); `Handle` itself backs operations
/// that are not tasks, such as [`ParallelFor`](crate::parallel::ParallelFor)
/// fan-outs.
pub struct Handle<T> {
    signal: Arc<Signal<T>>,
}

/// An error returned by [`Handle::join`] when the underlying operation
/// reached the [`Failed`](Status::Failed) status.
#[derive(Copy, Clone, Debug, Eq, PartialEq, thiserror::Error)]
#[error("the operation failed")]
pub struct Failed(pub(crate) ());

struct Inner<T> {
    status: Status,
    result: Option<T>,
    listeners: Vec<Arc<dyn Listener>>,
}

// === impl Status ===

impl Status {
    /// Returns `true` if this status is [`Succeeded`] or [`Failed`].
    ///
    /// [`Succeeded`]: Status::Succeeded
    /// [`Failed`]: Status::Failed
    #[must_use]
    pub fn is_terminal(self) -> bool {
        self != Status::Pending
    }
}

// === impl SignalId ===

impl SignalId {
    pub(crate) fn next() -> Self {
        // Don't use the loom atomics, since this has to go in a static.
        use std::sync::atomic::{AtomicU64, Ordering::Relaxed};

        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        Self(NEXT_ID.fetch_add(1, Relaxed))
    }
}

impl fmt::Debug for SignalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SignalId(")?;
        fmt::Debug::fmt(&self.0, f)?;
        f.write_str(")")
    }
}

impl fmt::Display for SignalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

// === impl Signal ===

impl<T> Signal<T> {
    /// Returns a new `Signal` in the [`Pending`](Status::Pending) state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: SignalId::next(),
            inner: Mutex::new(Inner {
                status: Status::Pending,
                result: None,
                listeners: Vec::new(),
            }),
            cv: Condvar::new(),
        }
    }

    /// Returns this signal's unique [`SignalId`].
    #[must_use]
    pub fn id(&self) -> SignalId {
        self.id
    }

    /// Returns the current [`Status`] of this signal.
    #[must_use]
    pub fn status(&self) -> Status {
        self.lock().status
    }

    /// Returns `true` if this signal has reached a terminal status.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.status().is_terminal()
    }

    /// Returns `true` if this signal completed successfully.
    #[must_use]
    pub fn is_succeeded(&self) -> bool {
        self.status() == Status::Succeeded
    }

    /// Returns `true` if this signal failed.
    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.status() == Status::Failed
    }

    /// Registers `listener` to be notified when this signal completes.
    ///
    /// If the signal is already terminal, the listener is notified
    /// immediately on the calling thread; otherwise it is appended to the
    /// notify list and called exactly once, on the thread that completes the
    /// signal.
    pub fn subscribe(&self, listener: Arc<dyn Listener>) {
        let status = {
            let mut inner = self.lock();
            if !inner.status.is_terminal() {
                inner.listeners.push(listener);
                return;
            }
            inner.status
        };
        // Already terminal: deliver the event now rather than losing it. The
        // status can no longer change, so notifying outside the lock is safe.
        trace!(signal = %self.id, ?status, "Signal::subscribe -> already completed");
        listener.notify(status, self.id);
    }

    /// Completes this signal with [`Status::Succeeded`] and the given result
    /// payload, notifying all listeners and waking all blocked waiters.
    ///
    /// If the signal has already completed, this is a no-op (logged at warn
    /// level); the stored result is never overwritten.
    pub fn set_result(&self, value: T) {
        self.complete(Status::Succeeded, Some(value));
    }

    /// Completes this signal with [`Status::Failed`], notifying all listeners
    /// and waking all blocked waiters.
    ///
    /// If the signal has already completed, this is a no-op (logged at warn
    /// level).
    pub fn set_failed(&self) {
        self.complete(Status::Failed, None);
    }

    /// Blocks the calling thread until this signal reaches a terminal status,
    /// and returns it.
    ///
    /// Returns immediately if the signal has already completed.
    pub fn wait_completed(&self) -> Status {
        let _span = trace_span!("Signal::wait_completed", signal = %self.id).entered();
        let mut inner = self.lock();
        while !inner.status.is_terminal() {
            inner = self
                .cv
                .wait(inner)
                .expect("signal mutex will not be poisoned");
        }
        inner.status
    }

    fn complete(&self, status: Status, result: Option<T>) {
        let listeners = {
            let mut inner = self.lock();
            if inner.status.is_terminal() {
                // Reachable at runtime: a task whose signal was failed by a
                // cascading predecessor may still execute and try to publish
                // its own result. The first terminal status wins.
                warn!(
                    signal = %self.id,
                    prev = ?inner.status,
                    new = ?status,
                    "signal already completed; ignoring second completion",
                );
                return;
            }
            inner.status = status;
            inner.result = result;
            self.cv.notify_all();
            mem::take(&mut inner.listeners)
        };
        trace!(
            signal = %self.id,
            ?status,
            listeners = listeners.len(),
            "Signal::complete",
        );
        // Invariant: the lock is released before any listener runs. The
        // status is already terminal, so a concurrent subscriber observes it
        // directly; and listeners (which take their own locks) can never
        // deadlock against this signal.
        for listener in listeners {
            listener.notify(status, self.id);
        }
    }

    fn lock(&self) -> crate::loom::sync::MutexGuard<'_, Inner<T>> {
        self.inner
            .lock()
            .expect("signal mutex will not be poisoned")
    }
}

impl<T: Clone> Signal<T> {
    /// Returns a clone of the result payload, if the signal has completed
    /// successfully with one.
    #[must_use]
    pub fn result(&self) -> Option<T> {
        self.lock().result.clone()
    }
}

impl<T> Default for Signal<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Signal<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal")
            .field("id", &self.id)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

// === impl Handle ===

impl<T> Handle<T> {
    /// Returns a new handle observing `signal`.
    #[must_use]
    pub fn new(signal: Arc<Signal<T>>) -> Self {
        Self { signal }
    }

    /// Returns a reference to the underlying [`Signal`].
    #[must_use]
    pub fn signal(&self) -> &Arc<Signal<T>> {
        &self.signal
    }

    /// Returns the current [`Status`] of the operation.
    #[must_use]
    pub fn status(&self) -> Status {
        self.signal.status()
    }

    /// Returns `true` if the operation has reached a terminal status.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.signal.is_completed()
    }

    /// Returns `true` if the operation failed.
    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.signal.is_failed()
    }

    /// Blocks until the operation completes, and returns its terminal
    /// [`Status`].
    pub fn wait_completed(&self) -> Status {
        self.signal.wait_completed()
    }

    /// Blocks until the operation completes, returning [`Failed`] as an error
    /// if it did not succeed.
    pub fn join(&self) -> Result<(), Failed> {
        match self.signal.wait_completed() {
            Status::Succeeded => Ok(()),
            _ => Err(Failed(())),
        }
    }
}

impl<T: Clone> Handle<T> {
    /// Returns a clone of the operation's result payload, if it completed
    /// successfully with one.
    #[must_use]
    pub fn result(&self) -> Option<T> {
        self.signal.result()
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        Self {
            signal: self.signal.clone(),
        }
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle").field("signal", &self.signal).finish()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering::SeqCst};
    use std::thread;

    struct Counter(AtomicUsize);

    impl Listener for Counter {
        fn notify(self: Arc<Self>, status: Status, _: SignalId) {
            assert!(status.is_terminal());
            self.0.fetch_add(1, SeqCst);
        }
    }

    #[test]
    fn set_result_wakes_waiter() {
        let _trace = crate::util::test::trace_init();
        let signal = Arc::new(Signal::new());

        let waiter = thread::spawn({
            let signal = signal.clone();
            move || signal.wait_completed()
        });

        signal.set_result(5);
        assert_eq!(waiter.join().unwrap(), Status::Succeeded);
        assert_eq!(signal.result(), Some(5));
    }

    #[test]
    fn wait_after_completion_returns_immediately() {
        let _trace = crate::util::test::trace_init();
        let signal = Signal::<()>::new();
        signal.set_failed();
        // must not block forever
        assert_eq!(signal.wait_completed(), Status::Failed);
    }

    #[test]
    fn subscribe_before_completion() {
        let _trace = crate::util::test::trace_init();
        let signal = Signal::<()>::new();
        let counter = Arc::new(Counter(AtomicUsize::new(0)));

        signal.subscribe(counter.clone());
        assert_eq!(counter.0.load(SeqCst), 0);

        signal.set_failed();
        assert_eq!(counter.0.load(SeqCst), 1);
        assert!(signal.is_failed());
    }

    #[test]
    fn subscribe_after_completion_notifies_immediately() {
        let _trace = crate::util::test::trace_init();
        let signal = Signal::new();
        signal.set_result(());

        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        signal.subscribe(counter.clone());
        assert_eq!(counter.0.load(SeqCst), 1);
    }

    #[test]
    fn every_listener_notified_once() {
        let _trace = crate::util::test::trace_init();
        let signal = Signal::new();
        let counters: Vec<_> = (0..8)
            .map(|_| Arc::new(Counter(AtomicUsize::new(0))))
            .collect();

        for counter in &counters {
            signal.subscribe(counter.clone());
        }
        signal.set_result(());

        for counter in &counters {
            assert_eq!(counter.0.load(SeqCst), 1);
        }
    }

    #[test]
    fn second_completion_does_not_overwrite() {
        let _trace = crate::util::test::trace_init();
        let signal = Signal::new();
        signal.set_failed();
        signal.set_result(42);
        assert_eq!(signal.status(), Status::Failed);
        assert_eq!(signal.result(), None);
    }

    #[test]
    fn handle_join_maps_failure() {
        let _trace = crate::util::test::trace_init();
        let signal = Arc::new(Signal::<()>::new());
        let handle = Handle::new(signal.clone());
        signal.set_failed();
        assert_eq!(handle.join(), Err(Failed(())));
    }
}

#[cfg(all(loom, test))]
mod loom {
    use super::*;
    use crate::loom::{
        sync::atomic::{AtomicUsize, Ordering::SeqCst},
        thread,
    };

    struct Counter(AtomicUsize);

    impl Listener for Counter {
        fn notify(self: Arc<Self>, _: Status, _: SignalId) {
            self.0.fetch_add(1, SeqCst);
        }
    }

    #[test]
    fn subscribe_vs_complete() {
        crate::loom::model(|| {
            let signal = Arc::new(Signal::new());
            let counter = Arc::new(Counter(AtomicUsize::new(0)));

            let completer = thread::spawn({
                let signal = signal.clone();
                move || signal.set_result(())
            });

            signal.subscribe(counter.clone());

            completer.join().unwrap();
            // whichever side of the race we hit, the event must be delivered
            // exactly once.
            assert_eq!(counter.0.load(SeqCst), 1);
        });
    }

    #[test]
    fn concurrent_completion_is_single_assignment() {
        crate::loom::model(|| {
            let signal = Arc::new(Signal::<u32>::new());

            let ok = thread::spawn({
                let signal = signal.clone();
                move || signal.set_result(1)
            });
            let fail = thread::spawn({
                let signal = signal.clone();
                move || signal.set_failed()
            });

            let status = signal.wait_completed();
            assert!(status.is_terminal());

            ok.join().unwrap();
            fail.join().unwrap();
            // the first completion wins and is never overwritten.
            assert_eq!(signal.status(), status);
            match signal.status() {
                Status::Succeeded => assert_eq!(signal.result(), Some(1)),
                Status::Failed => assert_eq!(signal.result(), None),
                Status::Pending => unreachable!(),
            }
        });
    }
}
