//! Per-worker bounded ring queue.
//!
//! A Chase-Lev style single-producer multi-consumer deque over a
//! fixed-capacity power-of-two ring. The owning worker pushes and pops at
//! the tail (LIFO); any other thread steals at the head (FIFO). One slot is
//! reserved so that a full ring is distinguishable from an empty one: the
//! queue holds at most `LOCAL_QUEUE_CAPACITY - 1` tasks.
//!
//! Publication pairs a release store of `tail` on push with an acquire
//! load on steal, so a task's invocation happens-after the submit that
//! enqueued it. The last-element race between the owner's pop and a
//! concurrent steal is resolved by promoting both sides to a head-side
//! compare-exchange; the loser forgets its speculative copy of the slot.

use crate::config::{LOCAL_QUEUE_CAPACITY, LOCAL_QUEUE_MASK};
use crate::task::Task;
use crossbeam_utils::CachePadded;
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::Arc;
use std::sync::atomic::{AtomicIsize, Ordering, fence};

/// Outcome of a steal attempt.
#[derive(Debug)]
pub(crate) enum Steal {
    /// The victim's queue was observed empty.
    Empty,
    /// Lost a head race against the owner or another thief.
    Retry,
    /// A task was stolen.
    Success(Task),
}

struct Buffer {
    /// Stealers (and the owner, on the last element) advance this.
    head: CachePadded<AtomicIsize>,
    /// Written only by the owning worker.
    tail: CachePadded<AtomicIsize>,
    slots: Box<[UnsafeCell<MaybeUninit<Task>>]>,
}

// Access to `slots` is governed by the head/tail protocol: a slot is read
// exactly once by whichever side wins the index, and written only by the
// owner at indices outside [head, tail).
unsafe impl Send for Buffer {}
unsafe impl Sync for Buffer {}

impl Buffer {
    fn new() -> Self {
        let slots = (0..LOCAL_QUEUE_CAPACITY)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect();
        Self {
            head: CachePadded::new(AtomicIsize::new(0)),
            tail: CachePadded::new(AtomicIsize::new(0)),
            slots,
        }
    }

    #[inline]
    fn slot(&self, index: isize) -> *mut MaybeUninit<Task> {
        self.slots[index as usize & LOCAL_QUEUE_MASK].get()
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        // Teardown discard: resident tasks are destroyed without running.
        let head = *self.head.get_mut();
        let tail = *self.tail.get_mut();
        let mut index = head;
        while index != tail {
            unsafe {
                drop(self.slot(index).read().assume_init());
            }
            index = index.wrapping_add(1);
        }
    }
}

/// Owner handle to a worker's ring queue.
///
/// `push` and `pop` must only be called from the thread that owns the
/// worker; [`RingQueue::owner_clone`] exists solely so that thread can
/// install a second handle in its thread-local submit context.
pub(crate) struct RingQueue {
    buf: Arc<Buffer>,
}

impl RingQueue {
    pub(crate) fn new() -> Self {
        Self {
            buf: Arc::new(Buffer::new()),
        }
    }

    /// Duplicates the owner handle for the owning thread's local context.
    pub(crate) fn owner_clone(&self) -> Self {
        Self {
            buf: Arc::clone(&self.buf),
        }
    }

    /// Creates a stealer handle for foreign workers.
    pub(crate) fn stealer(&self) -> RingStealer {
        RingStealer {
            buf: Arc::clone(&self.buf),
        }
    }

    /// Pushes a task at the tail. Owner only.
    ///
    /// Fails when the ring already holds `LOCAL_QUEUE_CAPACITY - 1` tasks;
    /// the caller spills the returned task to the central queue.
    pub(crate) fn push(&self, task: Task) -> Result<(), Task> {
        let buf = &*self.buf;
        let tail = buf.tail.load(Ordering::Relaxed);
        let head = buf.head.load(Ordering::Acquire);

        if tail.wrapping_sub(head) >= (LOCAL_QUEUE_CAPACITY - 1) as isize {
            return Err(task);
        }

        unsafe {
            buf.slot(tail).write(MaybeUninit::new(task));
        }
        // Publish the slot to stealers.
        buf.tail.store(tail.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// Pops the most recently pushed task (LIFO). Owner only.
    pub(crate) fn pop(&self) -> Option<Task> {
        let buf = &*self.buf;
        // Speculatively claim the tail slot, then re-read head to detect a
        // race with a stealer on the last element.
        let tail = buf.tail.load(Ordering::Relaxed).wrapping_sub(1);
        buf.tail.store(tail, Ordering::Relaxed);
        fence(Ordering::SeqCst);
        let head = buf.head.load(Ordering::Relaxed);

        if tail.wrapping_sub(head) < 0 {
            // Empty; restore tail.
            buf.tail.store(tail.wrapping_add(1), Ordering::Relaxed);
            return None;
        }

        let task = unsafe { buf.slot(tail).read().assume_init() };
        if tail != head {
            // More than one task remained; the speculative claim stands.
            return Some(task);
        }

        // Last element: contend on the head with any stealer.
        let won = buf
            .head
            .compare_exchange(
                head,
                head.wrapping_add(1),
                Ordering::SeqCst,
                Ordering::Relaxed,
            )
            .is_ok();
        buf.tail.store(tail.wrapping_add(1), Ordering::Relaxed);
        if won {
            Some(task)
        } else {
            // A stealer took it; our bitwise copy must not be dropped.
            std::mem::forget(task);
            None
        }
    }

    /// Returns true if the ring held no tasks at the time of the call.
    pub(crate) fn is_empty(&self) -> bool {
        let buf = &*self.buf;
        let head = buf.head.load(Ordering::Acquire);
        let tail = buf.tail.load(Ordering::Acquire);
        tail.wrapping_sub(head) <= 0
    }

    /// Number of queued tasks. Exact for the owner, approximate otherwise.
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        let buf = &*self.buf;
        let head = buf.head.load(Ordering::Acquire);
        let tail = buf.tail.load(Ordering::Acquire);
        tail.wrapping_sub(head).max(0) as usize
    }
}

/// Handle for stealing from a foreign worker's ring queue.
#[derive(Clone)]
pub(crate) struct RingStealer {
    buf: Arc<Buffer>,
}

impl RingStealer {
    /// Attempts to steal the oldest task (FIFO end).
    pub(crate) fn steal(&self) -> Steal {
        let buf = &*self.buf;
        let head = buf.head.load(Ordering::Acquire);
        fence(Ordering::SeqCst);
        let tail = buf.tail.load(Ordering::Acquire);

        if tail.wrapping_sub(head) <= 0 {
            return Steal::Empty;
        }

        // Speculative read; only valid if the CAS below claims the index.
        let task = unsafe { buf.slot(head).read().assume_init() };
        if buf
            .head
            .compare_exchange(
                head,
                head.wrapping_add(1),
                Ordering::SeqCst,
                Ordering::Relaxed,
            )
            .is_err()
        {
            std::mem::forget(task);
            return Steal::Retry;
        }
        Steal::Success(task)
    }

    /// Returns true if the victim's ring was observed empty.
    pub(crate) fn is_empty(&self) -> bool {
        let buf = &*self.buf;
        let head = buf.head.load(Ordering::Acquire);
        let tail = buf.tail.load(Ordering::Acquire);
        tail.wrapping_sub(head) <= 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Barrier, Mutex};
    use std::thread;

    fn counting_task(counts: &Arc<Vec<AtomicUsize>>, id: usize) -> Task {
        let counts = Arc::clone(counts);
        Task::new(move || {
            counts[id].fetch_add(1, Ordering::SeqCst);
        })
    }

    fn recording_task(log: &Arc<Mutex<Vec<usize>>>, id: usize) -> Task {
        let log = Arc::clone(log);
        Task::new(move || {
            log.lock().expect("log lock").push(id);
        })
    }

    #[test]
    fn owner_pop_is_lifo() {
        let queue = RingQueue::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for id in [1, 2, 3] {
            queue.push(recording_task(&log, id)).expect("push");
        }

        while let Some(task) = queue.pop() {
            task.run();
        }
        assert_eq!(*log.lock().expect("log lock"), vec![3, 2, 1]);
    }

    #[test]
    fn thief_steal_is_fifo() {
        let queue = RingQueue::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for id in [1, 2, 3] {
            queue.push(recording_task(&log, id)).expect("push");
        }

        let stealer = queue.stealer();
        loop {
            match stealer.steal() {
                Steal::Success(task) => task.run(),
                Steal::Empty => break,
                Steal::Retry => {}
            }
        }
        assert_eq!(*log.lock().expect("log lock"), vec![1, 2, 3]);
    }

    #[test]
    fn push_fails_only_at_capacity() {
        let queue = RingQueue::new();
        for _ in 0..LOCAL_QUEUE_CAPACITY - 1 {
            queue
                .push(Task::new(|| {}))
                .expect("ring must accept capacity - 1 tasks");
        }
        assert!(
            queue.push(Task::new(|| {})).is_err(),
            "push into a full ring must hand the task back"
        );
        assert_eq!(queue.len(), LOCAL_QUEUE_CAPACITY - 1);

        // One pop frees exactly one slot.
        queue.pop().expect("pop from full ring").run();
        queue
            .push(Task::new(|| {}))
            .expect("ring must accept a push after a pop");
    }

    #[test]
    fn pop_from_empty_restores_state() {
        let queue = RingQueue::new();
        assert!(queue.pop().is_none());
        assert!(queue.pop().is_none(), "repeated empty pops are idempotent");

        queue.push(Task::new(|| {})).expect("push after empty pops");
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn interleaved_owner_thief_operations_preserve_tasks() {
        let queue = RingQueue::new();
        let stealer = queue.stealer();
        let log = Arc::new(Mutex::new(Vec::new()));

        queue.push(recording_task(&log, 1)).expect("push");
        match stealer.steal() {
            Steal::Success(task) => task.run(),
            other => panic!("expected steal success, got {other:?}"),
        }

        queue.push(recording_task(&log, 2)).expect("push");
        queue.push(recording_task(&log, 3)).expect("push");
        queue.pop().expect("pop").run();
        match stealer.steal() {
            Steal::Success(task) => task.run(),
            other => panic!("expected steal success, got {other:?}"),
        }
        assert!(queue.pop().is_none());
        assert_eq!(*log.lock().expect("log lock"), vec![1, 3, 2]);
    }

    #[test]
    fn dropping_a_loaded_ring_discards_without_running() {
        let hits = Arc::new(AtomicUsize::new(0));
        let queue = RingQueue::new();
        for _ in 0..8 {
            let hits_in_task = Arc::clone(&hits);
            queue
                .push(Task::new(move || {
                    hits_in_task.fetch_add(1, Ordering::SeqCst);
                }))
                .expect("push");
        }

        drop(queue);
        assert_eq!(hits.load(Ordering::SeqCst), 0, "no queued task may run");
        assert_eq!(
            Arc::strong_count(&hits),
            1,
            "queued task captures must be released on drop"
        );
    }

    #[test]
    fn concurrent_owner_and_stealers_run_each_task_once() {
        let total = (LOCAL_QUEUE_CAPACITY - 1) * 4;
        let counts: Arc<Vec<AtomicUsize>> =
            Arc::new((0..total).map(|_| AtomicUsize::new(0)).collect());
        let queue = Arc::new(RingQueue::new());

        let stealer_threads = 4;
        let barrier = Arc::new(Barrier::new(stealer_threads + 1));

        let mut stealers = Vec::new();
        for _ in 0..stealer_threads {
            let stealer = queue.stealer();
            let barrier = Arc::clone(&barrier);
            stealers.push(thread::spawn(move || {
                barrier.wait();
                let mut consecutive_empty = 0;
                while consecutive_empty < 64 {
                    match stealer.steal() {
                        Steal::Success(task) => {
                            consecutive_empty = 0;
                            task.run();
                        }
                        Steal::Empty => {
                            consecutive_empty += 1;
                            thread::yield_now();
                        }
                        Steal::Retry => {}
                    }
                }
            }));
        }

        barrier.wait();
        // The owner refills the ring as stealers drain it, popping some
        // tasks itself so both ends stay contended.
        let mut next = 0;
        while next < total {
            if let Ok(()) = queue.push(counting_task(&counts, next)) {
                next += 1;
            }
            if next % 3 == 0 {
                if let Some(task) = queue.pop() {
                    task.run();
                }
            }
        }
        while let Some(task) = queue.pop() {
            task.run();
        }

        for handle in stealers {
            handle.join().expect("stealer join");
        }

        for (id, count) in counts.iter().enumerate() {
            let value = count.load(Ordering::SeqCst);
            assert_eq!(value, 1, "task {id} ran {value} times");
        }
    }
}
