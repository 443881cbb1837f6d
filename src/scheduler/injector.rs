//! Central queue and delay heap.
//!
//! Tasks submitted from outside the pool, spilled from full local rings,
//! or promoted from the delay heap pass through here. The FIFO run queue
//! and the delay heap share a single mutex; the condvar is the timer
//! thread's wait condition. An atomic mirror of the run-queue length lets
//! parking workers probe for work without taking the lock.

use crate::config::CENTRAL_DRAIN_BATCH;
use crate::scheduler::ring::RingQueue;
use crate::scheduler::timer::DelayHeap;
use crate::task::Task;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

pub(crate) struct Shared {
    run_queue: VecDeque<Task>,
    delay: DelayHeap,
}

pub(crate) struct Injector {
    shared: Mutex<Shared>,
    timer_cvar: Condvar,
    /// Mirror of `run_queue.len()`; SeqCst so the publish pairs with the
    /// parking worker's state-then-probe sequence.
    run_len: AtomicUsize,
}

impl Injector {
    pub(crate) fn new() -> Self {
        Self {
            shared: Mutex::new(Shared {
                run_queue: VecDeque::new(),
                delay: DelayHeap::new(),
            }),
            timer_cvar: Condvar::new(),
            run_len: AtomicUsize::new(0),
        }
    }

    /// Appends a task to the central run queue.
    pub(crate) fn push(&self, task: Task) {
        let mut shared = self.shared.lock();
        shared.run_queue.push_back(task);
        self.run_len.fetch_add(1, Ordering::SeqCst);
    }

    /// Pops the oldest centrally queued task.
    #[cfg(test)]
    pub(crate) fn pop(&self) -> Option<Task> {
        let mut shared = self.shared.lock();
        let task = shared.run_queue.pop_front();
        if task.is_some() {
            self.run_len.fetch_sub(1, Ordering::SeqCst);
        }
        task
    }

    /// Moves up to [`CENTRAL_DRAIN_BATCH`] tasks out of the central queue
    /// under one lock acquisition. The first task is returned for
    /// immediate execution; the rest are pushed into the caller's ring.
    pub(crate) fn drain_into(&self, local: &RingQueue) -> Option<Task> {
        let mut shared = self.shared.lock();
        let first = shared.run_queue.pop_front()?;
        let mut moved = 1;
        while moved < CENTRAL_DRAIN_BATCH {
            let Some(task) = shared.run_queue.pop_front() else {
                break;
            };
            if let Err(task) = local.push(task) {
                shared.run_queue.push_front(task);
                break;
            }
            moved += 1;
        }
        self.run_len.fetch_sub(moved, Ordering::SeqCst);
        Some(first)
    }

    /// Inserts a delayed task.
    ///
    /// Returns `true` if the entry became the new earliest deadline, in
    /// which case the caller must preempt the timer's current wait.
    pub(crate) fn push_delayed(&self, deadline: Instant, task: Task) -> bool {
        let mut shared = self.shared.lock();
        let preempts = shared.delay.peek_deadline().is_none_or(|d| deadline < d);
        shared.delay.insert(deadline, task);
        if preempts {
            self.timer_cvar.notify_one();
        }
        preempts
    }

    /// Lock-free probe of the central run queue used before parking.
    pub(crate) fn run_is_empty(&self) -> bool {
        self.run_len.load(Ordering::SeqCst) == 0
    }

    /// True when both the run queue and the delay heap are empty.
    pub(crate) fn is_empty(&self) -> bool {
        let shared = self.shared.lock();
        shared.run_queue.is_empty() && shared.delay.is_empty()
    }

    /// Wakes the timer thread (teardown and halt paths).
    pub(crate) fn notify_timer(&self) {
        self.timer_cvar.notify_one();
    }

    // ── Timer-thread interface ────────────────────────────────────────

    pub(crate) fn lock_shared(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock()
    }

    /// Promotes every due delayed task into the run queue. Returns the
    /// number promoted so the caller can wake that many workers.
    pub(crate) fn promote_due_locked(&self, shared: &mut Shared, now: Instant) -> usize {
        let due = shared.delay.pop_expired(now);
        let count = due.len();
        if count > 0 {
            shared.run_queue.extend(due);
            self.run_len.fetch_add(count, Ordering::SeqCst);
        }
        count
    }

    pub(crate) fn next_deadline_locked(shared: &Shared) -> Option<Instant> {
        shared.delay.peek_deadline()
    }

    /// Blocks the timer thread until `deadline` (or a notification).
    pub(crate) fn timer_wait_until(&self, shared: &mut MutexGuard<'_, Shared>, deadline: Instant) {
        let _ = self.timer_cvar.wait_until(shared, deadline);
    }

    /// Blocks the timer thread until notified.
    pub(crate) fn timer_wait(&self, shared: &mut MutexGuard<'_, Shared>) {
        self.timer_cvar.wait(shared);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex as StdMutex};
    use std::time::Duration;

    fn recording_task(log: &Arc<StdMutex<Vec<usize>>>, id: usize) -> Task {
        let log = Arc::clone(log);
        Task::new(move || {
            log.lock().expect("log lock").push(id);
        })
    }

    #[test]
    fn push_pop_is_fifo() {
        let injector = Injector::new();
        let log = Arc::new(StdMutex::new(Vec::new()));
        for id in [1, 2, 3] {
            injector.push(recording_task(&log, id));
        }
        assert!(!injector.run_is_empty());

        while let Some(task) = injector.pop() {
            task.run();
        }
        assert_eq!(*log.lock().expect("log lock"), vec![1, 2, 3]);
        assert!(injector.run_is_empty());
        assert!(injector.is_empty());
    }

    #[test]
    fn drain_returns_first_and_fills_ring() {
        let injector = Injector::new();
        let log = Arc::new(StdMutex::new(Vec::new()));
        for id in 0..10 {
            injector.push(recording_task(&log, id));
        }

        let ring = RingQueue::new();
        let first = injector.drain_into(&ring).expect("drain from non-empty");
        first.run();
        assert_eq!(*log.lock().expect("log lock"), vec![0]);
        assert_eq!(ring.len(), 9, "remaining tasks must land in the ring");
        assert!(injector.run_is_empty());
    }

    #[test]
    fn drain_from_empty_is_none() {
        let injector = Injector::new();
        let ring = RingQueue::new();
        assert!(injector.drain_into(&ring).is_none());
        assert_eq!(ring.len(), 0);
    }

    #[test]
    fn drain_stops_at_batch_limit() {
        let injector = Injector::new();
        for _ in 0..(CENTRAL_DRAIN_BATCH * 2) {
            injector.push(Task::new(|| {}));
        }

        let ring = RingQueue::new();
        let first = injector.drain_into(&ring).expect("drain");
        drop(first);
        assert_eq!(
            ring.len(),
            CENTRAL_DRAIN_BATCH - 1,
            "one batch minus the directly returned task"
        );
        assert_eq!(
            injector.run_len.load(Ordering::SeqCst),
            CENTRAL_DRAIN_BATCH,
            "the rest must stay central"
        );
    }

    #[test]
    fn earlier_delayed_entry_preempts() {
        let injector = Injector::new();
        let base = Instant::now();
        assert!(
            injector.push_delayed(base + Duration::from_secs(10), Task::new(|| {})),
            "first entry is always the new earliest"
        );
        assert!(
            !injector.push_delayed(base + Duration::from_secs(20), Task::new(|| {})),
            "later entry must not preempt"
        );
        assert!(
            injector.push_delayed(base + Duration::from_secs(1), Task::new(|| {})),
            "earlier entry must preempt"
        );
    }

    #[test]
    fn promote_due_moves_tasks_to_run_queue() {
        let injector = Injector::new();
        let base = Instant::now();
        injector.push_delayed(base, Task::new(|| {}));
        injector.push_delayed(base, Task::new(|| {}));
        injector.push_delayed(base + Duration::from_secs(60), Task::new(|| {}));

        let promoted = {
            let mut shared = injector.lock_shared();
            injector.promote_due_locked(&mut shared, base)
        };
        assert_eq!(promoted, 2);
        assert!(!injector.run_is_empty());
        assert!(injector.pop().is_some());
        assert!(injector.pop().is_some());
        assert!(injector.pop().is_none(), "future entry must not promote");
        assert!(!injector.is_empty(), "delay heap still holds one entry");
    }
}
