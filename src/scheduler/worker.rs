//! Worker thread logic and the timer thread.

use crate::pool::PoolCore;
use crate::scheduler::injector::Injector;
use crate::scheduler::ring::RingQueue;
use crate::scheduler::stealing::steal_sweep;
use crate::task::Task;
use crate::util::DetRng;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Instant;
use tracing::{debug, error, trace};

const SPIN_LIMIT: u32 = 64;
const YIELD_LIMIT: u32 = 16;

/// Execution state of a worker, published for the pool's queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum WorkerState {
    Running = 0,
    Stealing = 1,
    Parked = 2,
    Halted = 3,
}

/// Per-worker coordination state owned by the pool.
#[derive(Debug)]
pub(crate) struct WorkerSlot {
    pub(crate) parker: Parker,
    state: AtomicU8,
    /// True while the worker's thread is running (or being started).
    pub(crate) alive: AtomicBool,
}

impl WorkerSlot {
    pub(crate) fn new() -> Self {
        Self {
            parker: Parker::new(),
            state: AtomicU8::new(WorkerState::Running as u8),
            alive: AtomicBool::new(true),
        }
    }

    #[inline]
    pub(crate) fn state(&self) -> WorkerState {
        match self.state.load(Ordering::SeqCst) {
            0 => WorkerState::Running,
            1 => WorkerState::Stealing,
            2 => WorkerState::Parked,
            _ => WorkerState::Halted,
        }
    }

    #[inline]
    pub(crate) fn set_state(&self, state: WorkerState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }
}

/// A worker thread: one ring queue plus the execution loop.
pub(crate) struct Worker {
    index: usize,
    ring: RingQueue,
    core: Arc<PoolCore>,
    rng: DetRng,
}

impl Worker {
    pub(crate) fn new(index: usize, ring: RingQueue, core: Arc<PoolCore>) -> Self {
        Self {
            index,
            ring,
            core,
            rng: DetRng::new(index as u64 + 1),
        }
    }

    #[inline]
    fn slot(&self) -> &WorkerSlot {
        &self.core.workers[self.index]
    }

    /// Runs the worker scheduling loop until the pool is torn down.
    pub(crate) fn run(mut self) {
        let _identity = crate::pool::WorkerIdentity::enter(
            &self.core,
            self.index,
            self.ring.owner_clone(),
        );
        debug!(worker = self.index, "worker started");

        loop {
            if self.core.stop.load(Ordering::Acquire) {
                break;
            }
            if self.core.halt_requested.load(Ordering::Acquire) {
                self.halt_park();
                continue;
            }

            // 1. Local queue, LIFO. Subtasks scheduled by the task we just
            // ran sit at the tail, so recursion unwinds depth-first.
            if let Some(task) = self.ring.pop() {
                self.run_task(task);
                continue;
            }

            // 2. Steal from a randomized sweep of the other workers.
            self.slot().set_state(WorkerState::Stealing);
            if let Some(task) = steal_sweep(&self.core.stealers, self.index, &mut self.rng) {
                self.slot().set_state(WorkerState::Running);
                self.wake_next_if_surplus();
                self.run_task(task);
                continue;
            }

            // 3. Refill from the central queue, amortizing its lock.
            if let Some(task) = self.core.injector.drain_into(&self.ring) {
                self.slot().set_state(WorkerState::Running);
                self.wake_next_if_surplus();
                self.run_task(task);
                continue;
            }

            // 4. Nothing anywhere: back off, then park.
            self.idle_wait();
        }

        self.slot().alive.store(false, Ordering::SeqCst);
        debug!(worker = self.index, "worker stopped");
    }

    fn run_task(&self, task: Task) {
        trace!(worker = self.index, "executing task");
        // A panicking task is discarded; it never takes the worker down.
        if catch_unwind(AssertUnwindSafe(|| task.run())).is_err() {
            error!(worker = self.index, "task panicked; discarding it");
        }
    }

    /// Spin, then yield, then park. Returns as soon as central work is
    /// observable or the pool state changes.
    fn idle_wait(&self) {
        let core = &*self.core;
        let mut backoff = 0u32;
        loop {
            if core.stop.load(Ordering::Acquire) || core.halt_requested.load(Ordering::Acquire) {
                self.slot().set_state(WorkerState::Running);
                return;
            }
            if !core.injector.run_is_empty() {
                self.slot().set_state(WorkerState::Running);
                return;
            }

            if backoff < SPIN_LIMIT {
                std::hint::spin_loop();
                backoff += 1;
            } else if backoff < SPIN_LIMIT + YIELD_LIMIT {
                std::thread::yield_now();
                backoff += 1;
            } else {
                self.park();
                return;
            }
        }
    }

    fn park(&self) {
        let core = &*self.core;
        let slot = self.slot();

        slot.set_state(WorkerState::Parked);
        core.idle_count.fetch_add(1, Ordering::SeqCst);

        // Submitters publish their task before scanning for parked
        // workers; re-checking after publishing Parked closes the
        // lost-wakeup window between the failed sweep and the wait.
        let work_appeared = !core.injector.run_is_empty()
            || self.peers_have_work()
            || core.stop.load(Ordering::Acquire)
            || core.halt_requested.load(Ordering::Acquire);
        if !work_appeared {
            trace!(worker = self.index, "parking");
            slot.parker.park();
        }

        core.idle_count.fetch_sub(1, Ordering::SeqCst);
        slot.set_state(WorkerState::Running);
    }

    /// Wake propagation: a worker that just acquired work while more is
    /// still visible wakes one parked peer. Submissions that raced onto a
    /// single worker's permit thus fan out to as many workers as there is
    /// work, instead of serializing behind this worker's current task.
    fn wake_next_if_surplus(&self) {
        let core = &*self.core;
        if !self.ring.is_empty() || !core.injector.run_is_empty() || self.peers_have_work() {
            core.wake_one();
        }
    }

    fn peers_have_work(&self) -> bool {
        self.core
            .stealers
            .iter()
            .enumerate()
            .any(|(index, stealer)| index != self.index && !stealer.is_empty())
    }

    /// Quiesces under a halt request: publish `Halted`, wake any `halt()`
    /// caller, and sleep until resume or teardown. The task that was
    /// running when the halt was requested has already completed.
    fn halt_park(&self) {
        let core = &*self.core;
        let slot = self.slot();

        debug!(worker = self.index, "worker halted");
        slot.set_state(WorkerState::Halted);
        core.notify_quiesced();

        while core.halt_requested.load(Ordering::Acquire) && !core.stop.load(Ordering::Acquire) {
            slot.parker.park();
        }

        slot.set_state(WorkerState::Running);
        debug!(worker = self.index, "worker resumed");
    }
}

/// The timer thread: waits on the earliest delay-heap deadline and
/// promotes due tasks into the central queue.
///
/// A newly scheduled delayed task with an earlier deadline preempts the
/// current wait ([`Injector::push_delayed`] notifies the condvar), so a
/// due task becomes schedulable no later than one pass after its deadline.
pub(crate) fn timer_loop(core: &Arc<PoolCore>) {
    debug!("timer started");
    loop {
        let mut shared = core.injector.lock_shared();
        if core.stop.load(Ordering::Acquire) {
            break;
        }

        let promoted = core.injector.promote_due_locked(&mut shared, Instant::now());
        if promoted > 0 {
            drop(shared);
            trace!(promoted, "promoted due delayed tasks");
            for _ in 0..promoted {
                core.wake_one();
            }
            continue;
        }

        match Injector::next_deadline_locked(&shared) {
            Some(deadline) => core.injector.timer_wait_until(&mut shared, deadline),
            None => core.injector.timer_wait(&mut shared),
        }
    }
    debug!("timer stopped");
}

#[derive(Debug)]
struct ParkerInner {
    notified: AtomicBool,
    waiting: AtomicUsize,
    mutex: Mutex<()>,
    cvar: Condvar,
}

/// A permit-based mechanism for parking and unparking one worker.
///
/// An `unpark` that arrives before `park` leaves a permit behind, so a
/// wake can never be lost between a worker's decision to sleep and the
/// condvar wait itself.
#[derive(Debug, Clone)]
pub(crate) struct Parker {
    inner: Arc<ParkerInner>,
}

impl Parker {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(ParkerInner {
                notified: AtomicBool::new(false),
                waiting: AtomicUsize::new(0),
                mutex: Mutex::new(()),
                cvar: Condvar::new(),
            }),
        }
    }

    #[inline]
    fn lock_unpoisoned(&self) -> std::sync::MutexGuard<'_, ()> {
        self.inner
            .mutex
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    #[inline]
    fn consume_permit(&self) -> bool {
        self.inner
            .notified
            .compare_exchange(true, false, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Parks the current thread until notified.
    pub(crate) fn park(&self) {
        if self.consume_permit() {
            return;
        }

        self.inner.waiting.fetch_add(1, Ordering::SeqCst);
        let mut guard = self.lock_unpoisoned();
        while !self.consume_permit() {
            guard = self
                .inner
                .cvar
                .wait(guard)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
        self.inner.waiting.fetch_sub(1, Ordering::SeqCst);
        drop(guard);
    }

    /// Unparks the parked thread, or leaves a permit if none is parked.
    pub(crate) fn unpark(&self) {
        if self
            .inner
            .notified
            .compare_exchange(false, true, Ordering::Release, Ordering::Relaxed)
            .is_err()
        {
            // Permit already pending; the next park consumes it.
            return;
        }
        if self.inner.waiting.load(Ordering::SeqCst) == 0 {
            return;
        }
        // The thread may be mid-wait: acquire the mutex before notifying
        // so the signal cannot land between its permit check and the wait.
        let _guard = self.lock_unpoisoned();
        self.inner.cvar.notify_one();
    }
}
