//! Lightweight, fine-grained multitasking through a work-stealing thread
//! pool.
//!
//! `finepool` provides low-overhead concurrent scheduling: callers submit
//! short, non-returning closures and a fixed set of worker threads executes
//! them. Load is balanced by work stealing, and tasks spawned by another
//! task within the same pool take a fast scheduling path that bypasses all
//! cross-thread synchronization. Together these avert the majority of
//! per-task scheduling overhead, which makes fine-grained parallelism
//! feasible.
//!
//! ```
//! use finepool::ThreadPool;
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::time::Duration;
//!
//! // Let the implementation pick the number of worker threads.
//! let pool = Arc::new(ThreadPool::new().expect("worker threads must start"));
//! let completed = Arc::new(AtomicUsize::new(0));
//!
//! let pool_in_task = Arc::clone(&pool);
//! let completed_in_task = Arc::clone(&completed);
//! pool.schedule(move || {
//!     // Called from within a worker thread: no synchronization required.
//!     let completed_again = Arc::clone(&completed_in_task);
//!     pool_in_task.schedule(move || {
//!         completed_again.fetch_add(1, Ordering::Relaxed);
//!     });
//!
//!     // Treated as if it were part of the currently running task.
//!     let completed_again = Arc::clone(&completed_in_task);
//!     pool_in_task.schedule_subtask(move || {
//!         completed_again.fetch_add(1, Ordering::Relaxed);
//!     });
//!
//!     // Runs two milliseconds after it is scheduled.
//!     let completed_again = Arc::clone(&completed_in_task);
//!     pool_in_task.schedule_after(Duration::from_millis(2), move || {
//!         completed_again.fetch_add(1, Ordering::Relaxed);
//!     });
//! });
//!
//! while completed.load(Ordering::Relaxed) < 3 {
//!     std::thread::yield_now();
//! }
//! // When the pool is dropped, tasks that never started are forgotten.
//! ```
//!
//! # Scheduling paths
//!
//! Tasks scheduled from within one of a pool's worker threads take the
//! fast path into that worker's own fixed-capacity queue, unless the
//! worker already has [`ThreadPool::worker_capacity`] tasks queued, in
//! which case the task spills to the shared central queue. Tasks scheduled
//! from outside the pool always take the central path. The per-worker
//! queue capacity is selected at build time via
//! [`LOCAL_QUEUE_LOG2_CAPACITY`].
//!
//! # Blocking and deadlock
//!
//! Workers run each task to completion; the pool never preempts. If
//! [`ThreadPool::concurrency`] scheduled tasks block simultaneously, every
//! queued task is blocked behind them. Construct tasks so that at least
//! one active task always makes progress.

mod config;
mod error;
mod pool;
mod scheduler;
mod task;
mod util;

pub use config::{LOCAL_QUEUE_LOG2_CAPACITY, PoolConfig};
pub use error::{Error, ErrorKind, Result};
pub use pool::ThreadPool;
