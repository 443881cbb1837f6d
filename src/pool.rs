//! The thread pool: public operations and shared pool state.

use crate::config::{LOCAL_QUEUE_CAPACITY, PoolConfig};
use crate::error::{Error, Result};
use crate::scheduler::injector::Injector;
use crate::scheduler::ring::{RingQueue, RingStealer};
use crate::scheduler::worker::{Worker, WorkerSlot, WorkerState, timer_loop};
use crate::task::Task;
use parking_lot::{Condvar, Mutex};
use std::cell::RefCell;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::warn;

/// State shared between the pool facade, its workers, and the timer.
pub(crate) struct PoolCore {
    pub(crate) injector: Injector,
    /// Owner handles, cloned only into each ring's owning thread.
    pub(crate) rings: Vec<RingQueue>,
    pub(crate) stealers: Vec<RingStealer>,
    pub(crate) workers: Vec<WorkerSlot>,
    pub(crate) halt_requested: AtomicBool,
    pub(crate) stop: AtomicBool,
    pub(crate) idle_count: AtomicUsize,
    pub(crate) config: PoolConfig,
    spill_warned: AtomicBool,
    quiesce_lock: Mutex<()>,
    quiesce_cvar: Condvar,
}

impl PoolCore {
    fn new(config: PoolConfig, worker_count: usize) -> Self {
        let rings: Vec<RingQueue> = (0..worker_count).map(|_| RingQueue::new()).collect();
        let stealers = rings.iter().map(RingQueue::stealer).collect();
        let workers = (0..worker_count).map(|_| WorkerSlot::new()).collect();
        Self {
            injector: Injector::new(),
            rings,
            stealers,
            workers,
            halt_requested: AtomicBool::new(false),
            stop: AtomicBool::new(false),
            idle_count: AtomicUsize::new(0),
            config,
            spill_warned: AtomicBool::new(false),
            quiesce_lock: Mutex::new(()),
            quiesce_cvar: Condvar::new(),
        }
    }

    /// Number of workers whose threads are currently running.
    pub(crate) fn alive_count(&self) -> usize {
        self.workers
            .iter()
            .filter(|slot| slot.alive.load(Ordering::SeqCst))
            .count()
    }

    /// Unparks one parked worker, if any.
    pub(crate) fn wake_one(&self) {
        for slot in &self.workers {
            if slot.state() == WorkerState::Parked {
                slot.parker.unpark();
                return;
            }
        }
    }

    /// Unparks every worker and the timer.
    pub(crate) fn wake_all(&self) {
        for slot in &self.workers {
            slot.parker.unpark();
        }
        self.injector.notify_timer();
    }

    /// Central submission: enqueue and wake a parked worker.
    pub(crate) fn inject(&self, task: Task) {
        self.injector.push(task);
        self.wake_one();
    }

    pub(crate) fn notify_quiesced(&self) {
        let _guard = self.quiesce_lock.lock();
        self.quiesce_cvar.notify_all();
    }

    fn all_halted_except(&self, skip: Option<usize>) -> bool {
        self.workers.iter().enumerate().all(|(index, slot)| {
            Some(index) == skip
                || !slot.alive.load(Ordering::SeqCst)
                || slot.state() == WorkerState::Halted
        })
    }

    fn note_spill(&self) {
        if cfg!(debug_assertions) && !self.spill_warned.swap(true, Ordering::Relaxed) {
            warn!("worker-local queue full; tasks are spilling to the central queue");
        }
    }
}

thread_local! {
    static CURRENT_WORKER: RefCell<Option<WorkerIdentity>> = const { RefCell::new(None) };
}

/// Identity a worker thread publishes so `schedule` can detect "am I
/// inside this pool?" in O(1) and take the synchronization-free path.
pub(crate) struct WorkerIdentity {
    /// Address of the owning [`PoolCore`], used purely as an identity.
    pool: usize,
    index: usize,
    ring: RingQueue,
}

impl WorkerIdentity {
    /// Installs the identity for the current thread, returning a guard
    /// that restores the previous one on worker exit.
    pub(crate) fn enter(
        core: &Arc<PoolCore>,
        index: usize,
        ring: RingQueue,
    ) -> WorkerIdentityGuard {
        let identity = Self {
            pool: Arc::as_ptr(core) as usize,
            index,
            ring,
        };
        let prev = CURRENT_WORKER.with(|slot| slot.replace(Some(identity)));
        WorkerIdentityGuard { prev }
    }
}

pub(crate) struct WorkerIdentityGuard {
    prev: Option<WorkerIdentity>,
}

impl Drop for WorkerIdentityGuard {
    fn drop(&mut self) {
        let prev = self.prev.take();
        CURRENT_WORKER.with(|slot| {
            *slot.borrow_mut() = prev;
        });
    }
}

/// Fast path: if the current thread is a worker of `core`, push into its
/// own ring. Returns the task back when the slow path must be taken
/// (foreign thread, or local ring full).
fn try_push_local(core: &Arc<PoolCore>, task: Task) -> Option<Task> {
    CURRENT_WORKER.with(|slot| {
        let borrow = slot.borrow();
        let Some(identity) = borrow.as_ref() else {
            return Some(task);
        };
        if identity.pool != Arc::as_ptr(core) as usize {
            return Some(task);
        }

        let was_empty = identity.ring.is_empty();
        match identity.ring.push(task) {
            Ok(()) => {
                // Freshly non-empty ring: give an idle peer a chance to
                // steal instead of letting the work sit behind this task.
                if was_empty {
                    core.wake_one();
                }
                None
            }
            Err(task) => {
                core.note_spill();
                Some(task)
            }
        }
    })
}

fn current_worker_index(core: &Arc<PoolCore>) -> Option<usize> {
    CURRENT_WORKER.with(|slot| {
        slot.borrow()
            .as_ref()
            .filter(|identity| identity.pool == Arc::as_ptr(core) as usize)
            .map(|identity| identity.index)
    })
}

fn spawn_worker(core: &Arc<PoolCore>, index: usize) -> std::io::Result<JoinHandle<()>> {
    let ring = core.rings[index].owner_clone();
    let core_for_thread = Arc::clone(core);
    thread::Builder::new()
        .name(format!("{}-{index}", core.config.thread_name_prefix))
        .stack_size(core.config.thread_stack_size)
        .spawn(move || Worker::new(index, ring, core_for_thread).run())
}

fn spawn_timer(core: &Arc<PoolCore>) -> std::io::Result<JoinHandle<()>> {
    let core_for_thread = Arc::clone(core);
    thread::Builder::new()
        .name(format!("{}-timer", core.config.thread_name_prefix))
        .spawn(move || timer_loop(&core_for_thread))
}

/// A work-stealing pool of worker threads for fine-grained tasks.
///
/// Tasks are nullary closures that run at most once. Scheduling from
/// inside a worker takes a synchronization-free fast path into that
/// worker's own queue; scheduling from any other thread goes through the
/// central queue under its mutex. Execution of a task *synchronizes-with*
/// the call that scheduled it (release-acquire), so everything written
/// before `schedule` is visible to the task body.
///
/// The pool cannot be cloned or copied; dropping it discards any task
/// that has not started.
///
/// # Deadlock warning
///
/// If [`concurrency()`](ThreadPool::concurrency) scheduled tasks block
/// simultaneously, every remaining task in the pool is blocked too. Tasks
/// should be constructed so that at least one active task always makes
/// progress.
///
/// # Example
///
/// ```
/// use finepool::ThreadPool;
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicUsize, Ordering};
///
/// let pool = Arc::new(ThreadPool::new().expect("worker threads must start"));
/// let done = Arc::new(AtomicUsize::new(0));
///
/// let pool_in_task = Arc::clone(&pool);
/// let done_in_task = Arc::clone(&done);
/// pool.schedule(move || {
///     // Runs on a worker: this nested schedule takes the fast path.
///     let done_in_subtask = Arc::clone(&done_in_task);
///     pool_in_task.schedule_subtask(move || {
///         done_in_subtask.fetch_add(1, Ordering::Relaxed);
///     });
///     done_in_task.fetch_add(1, Ordering::Relaxed);
/// });
///
/// while done.load(Ordering::Relaxed) < 2 {
///     std::thread::yield_now();
/// }
/// ```
pub struct ThreadPool {
    core: Arc<PoolCore>,
    threads: Mutex<Vec<Option<JoinHandle<()>>>>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl ThreadPool {
    /// Creates a pool with the default configuration: one worker per
    /// available CPU.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::ThreadStart`](crate::ErrorKind::ThreadStart)
    /// if not a single worker thread could be started. Partial starts are
    /// tolerated; [`concurrency()`](Self::concurrency) reports how many
    /// workers are actually running.
    pub fn new() -> Result<Self> {
        Self::with_config(PoolConfig::default())
    }

    /// Creates a pool with an explicit configuration.
    ///
    /// # Errors
    ///
    /// See [`new`](Self::new).
    pub fn with_config(config: PoolConfig) -> Result<Self> {
        let worker_count = config.resolved_worker_threads();
        let core = Arc::new(PoolCore::new(config, worker_count));

        let mut threads = Vec::with_capacity(worker_count);
        let mut last_start_error = None;
        for index in 0..worker_count {
            match spawn_worker(&core, index) {
                Ok(handle) => threads.push(Some(handle)),
                Err(e) => {
                    warn!(worker = index, error = %e, "failed to start worker thread");
                    core.workers[index].alive.store(false, Ordering::SeqCst);
                    threads.push(None);
                    last_start_error = Some(e);
                }
            }
        }

        let pool = Self {
            core: Arc::clone(&core),
            threads: Mutex::new(threads),
            timer: Mutex::new(None),
        };

        if core.alive_count() == 0 {
            // `pool` drops here and joins nothing; report the failure.
            return Err(Error::thread_start(last_start_error.unwrap_or_else(
                || std::io::Error::other("no worker thread could be started"),
            )));
        }

        match spawn_timer(&core) {
            Ok(handle) => *pool.timer.lock() = Some(handle),
            Err(e) => return Err(Error::thread_start(e)),
        }
        Ok(pool)
    }

    /// Schedules a task to run asynchronously. The task is called at most
    /// once.
    ///
    /// Called from one of this pool's workers, the task goes into that
    /// worker's own queue without cross-thread synchronization, spilling
    /// to the central queue if the local queue is full. Called from any
    /// other thread, it goes through the central queue.
    ///
    /// Execution of the task *synchronizes-with* this call.
    pub fn schedule<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule_task(Task::new(f));
    }

    /// Schedules a task that is treated as part of the currently running
    /// task.
    ///
    /// Placement is the worker's LIFO end, so the owning worker picks the
    /// subtask up next if no peer steals it first; recursive fan-out
    /// therefore executes depth-first and keeps queue occupancy near the
    /// recursion depth rather than the task count.
    ///
    /// Because a subtask is considered part of the task that scheduled
    /// it, it carries no non-starvation guarantee of its own: if the
    /// collective subtasks fail to terminate, the parent task is
    /// considered not to have terminated, and later tasks may not run.
    pub fn schedule_subtask<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule_task(Task::new(f));
    }

    /// Schedules a task to run after a delay on the monotonic clock.
    ///
    /// A zero delay is exactly [`schedule`](Self::schedule). The task
    /// never runs before its deadline; it becomes eligible within one
    /// timer pass after it.
    pub fn schedule_after<F>(&self, delay: Duration, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if delay.is_zero() {
            self.schedule(f);
            return;
        }
        self.core
            .injector
            .push_delayed(Instant::now() + delay, Task::new(f));
    }

    /// Schedules a task to run at (or after) a point on the monotonic
    /// clock. A deadline that already passed degenerates to
    /// [`schedule`](Self::schedule).
    pub fn schedule_at<F>(&self, deadline: Instant, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if deadline <= Instant::now() {
            self.schedule(f);
            return;
        }
        self.core.injector.push_delayed(deadline, Task::new(f));
    }

    fn schedule_task(&self, task: Task) {
        if let Some(task) = try_push_local(&self.core, task) {
            self.core.inject(task);
        }
    }

    /// Number of running worker threads.
    ///
    /// Constant after construction, except that [`resume`](Self::resume)
    /// revives workers whose threads failed to start. If more than
    /// `concurrency()` tasks block simultaneously, the whole pool is
    /// blocked.
    #[must_use]
    pub fn concurrency(&self) -> usize {
        self.core.alive_count()
    }

    /// Number of tasks each worker can hold in its own queue before
    /// scheduling takes the (contended) central path.
    #[must_use]
    pub const fn worker_capacity() -> usize {
        LOCAL_QUEUE_CAPACITY - 1
    }

    /// Returns true if every worker is parked and the central queue and
    /// delay heap are empty.
    ///
    /// Calling this from inside one of the pool's tasks necessarily
    /// returns false. While the pool is halted the value is unspecified.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        let workers = self.core.alive_count();
        workers > 0
            && self.core.idle_count.load(Ordering::SeqCst) == workers
            && self.core.injector.is_empty()
    }

    /// Suspends task execution, blocking until the workers have quiesced.
    ///
    /// Tasks already running complete first; queued tasks stay queued and
    /// run after [`resume`](Self::resume). Called from inside one of the
    /// pool's workers, this waits only for the *other* workers; the
    /// calling worker halts itself after the current task returns.
    pub fn halt(&self) {
        let core = &self.core;
        core.halt_requested.store(true, Ordering::SeqCst);
        core.wake_all();

        let skip = current_worker_index(core);
        let mut guard = core.quiesce_lock.lock();
        while !core.all_halted_except(skip) {
            core.quiesce_cvar.wait(&mut guard);
        }
    }

    /// Resumes execution after [`halt`](Self::halt), and restarts any
    /// worker thread that previously failed to start or has exited.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::ThreadStart`](crate::ErrorKind::ThreadStart)
    /// if afterwards not a single worker thread is alive.
    pub fn resume(&self) -> Result<()> {
        let core = &self.core;
        core.halt_requested.store(false, Ordering::SeqCst);

        let mut threads = self.threads.lock();
        let mut last_start_error = None;
        for (index, slot) in threads.iter_mut().enumerate() {
            let finished = slot.as_ref().is_none_or(JoinHandle::is_finished);
            if !finished {
                continue;
            }
            if let Some(handle) = slot.take() {
                let _ = handle.join();
            }
            core.workers[index].alive.store(true, Ordering::SeqCst);
            core.workers[index].set_state(WorkerState::Running);
            match spawn_worker(core, index) {
                Ok(handle) => *slot = Some(handle),
                Err(e) => {
                    warn!(worker = index, error = %e, "failed to restart worker thread");
                    core.workers[index].alive.store(false, Ordering::SeqCst);
                    last_start_error = Some(e);
                }
            }
        }
        drop(threads);

        core.wake_all();
        if core.alive_count() == 0 {
            return Err(Error::thread_start(last_start_error.unwrap_or_else(
                || std::io::Error::other("no worker thread could be restarted"),
            )));
        }
        Ok(())
    }

    /// Returns true once a halt request has fully quiesced every worker.
    ///
    /// Calling this from inside one of the pool's tasks necessarily
    /// returns false.
    #[must_use]
    pub fn is_halted(&self) -> bool {
        self.core.halt_requested.load(Ordering::SeqCst) && self.core.all_halted_except(None)
    }
}

impl Drop for ThreadPool {
    /// Terminates the workers, discarding any task that has not started.
    ///
    /// Dropping the pool from inside one of its own workers deadlocks on
    /// the join and must be avoided.
    fn drop(&mut self) {
        self.core.stop.store(true, Ordering::SeqCst);
        self.core.wake_all();

        for slot in self.threads.lock().iter_mut() {
            if let Some(handle) = slot.take() {
                let _ = handle.join();
            }
        }
        if let Some(handle) = self.timer.lock().take() {
            let _ = handle.join();
        }
    }
}

impl std::fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadPool")
            .field("concurrency", &self.concurrency())
            .field("halted", &self.is_halted())
            .finish_non_exhaustive()
    }
}
