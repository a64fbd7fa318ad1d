//! A dependency-graph task scheduler on a fixed pool of worker threads.
//!
//! `graft` lets independent units of work ([`Task`]s) declare dependencies on
//! one another, submits ready tasks to a fixed pool of worker threads
//! ([`TaskPool`]), and propagates completion and failure through the graph
//! automatically — the caller never sequences anything by hand.
//!
//! Three pieces, leaves first:
//!
//! - [`Signal`]: a reference-counted, single-assignment completion cell that
//!   publishes a terminal [`Status`] to listeners and blocking waiters. It
//!   knows nothing about tasks or threads.
//! - [`Task`]: a named unit of work built on a signal, adding dependency
//!   counting and the decision of *when* to submit itself.
//! - [`TaskPool`]: a fixed set of OS worker threads pulling ready tasks from
//!   a FIFO queue and executing them.
//!
//! Completion fans out without unbounded stack growth: a predecessor's
//! completion *enqueues* newly ready dependents on the pool rather than
//! recursing into their execution.
//!
//! # Examples
//!
//! ```
//! use graft::{Task, TaskPool};
//!
//! let pool = TaskPool::new(4);
//!
//! let fetch = Task::builder()
//!     .name("fetch")
//!     .pool(pool.clone())
//!     .build(|_cx| Ok(()));
//! let process = Task::builder()
//!     .name("process")
//!     .pool(pool.clone())
//!     .build(|_cx| Ok(()));
//!
//! // `process` runs only once `fetch` has succeeded.
//! process.add_dependency(&fetch);
//! let handle = process.run();
//! fetch.run();
//!
//! handle.join().expect("the graph should succeed");
//! pool.shutdown();
//! ```
//!
//! There is no priority scheduling, work stealing, cancellation, or retry:
//! a ready task runs to completion once picked up, failures are terminal,
//! and recovery belongs to the caller that owns the graph.
#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs, missing_debug_implementations)]

pub(crate) mod loom;
pub(crate) mod util;

pub mod parallel;
pub mod pool;
pub mod signal;
pub mod task;

pub use self::parallel::ParallelFor;
pub use self::pool::{SubmitError, TaskPool};
pub use self::signal::{Failed, Handle, Listener, Signal, SignalId, Status};
pub use self::task::{Builder, JoinHandle, Task, TaskContext, TaskError, TaskId, TaskResult};
