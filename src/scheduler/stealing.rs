//! Victim selection for work stealing.

use crate::scheduler::ring::{RingStealer, Steal};
use crate::task::Task;
use crate::util::DetRng;
use smallvec::SmallVec;

/// Retries against a single victim after a head-race loss.
const STEAL_RETRIES: usize = 4;

/// One steal sweep over the other workers.
///
/// Victims are visited in randomized order, one steal per victim, with a
/// bounded number of contention retries; the sweep gives up after
/// `2 * concurrency` total attempts so a contended pool degrades into the
/// central-drain path instead of spinning on hot queues.
pub(crate) fn steal_sweep(
    stealers: &[RingStealer],
    self_index: usize,
    rng: &mut DetRng,
) -> Option<Task> {
    let worker_count = stealers.len();
    if worker_count <= 1 {
        return None;
    }

    let mut order: SmallVec<[usize; 16]> =
        (0..worker_count).filter(|&i| i != self_index).collect();
    rng.shuffle(&mut order);

    let mut attempts = 2 * worker_count;
    for &victim in &order {
        let mut retries = STEAL_RETRIES;
        while attempts > 0 && retries > 0 {
            attempts -= 1;
            match stealers[victim].steal() {
                Steal::Success(task) => return Some(task),
                Steal::Empty => break,
                Steal::Retry => retries -= 1,
            }
        }
        if attempts == 0 {
            break;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::ring::RingQueue;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn sweep_finds_work_on_any_victim() {
        let queues: Vec<RingQueue> = (0..4).map(|_| RingQueue::new()).collect();
        let stealers: Vec<_> = queues.iter().map(RingQueue::stealer).collect();

        let hits = Arc::new(AtomicUsize::new(0));
        let hits_in_task = Arc::clone(&hits);
        queues[2]
            .push(Task::new(move || {
                hits_in_task.fetch_add(1, Ordering::SeqCst);
            }))
            .expect("push");

        let mut rng = DetRng::new(9);
        let task = steal_sweep(&stealers, 0, &mut rng).expect("sweep must find the task");
        task.run();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn sweep_never_steals_from_self() {
        let queues: Vec<RingQueue> = (0..3).map(|_| RingQueue::new()).collect();
        let stealers: Vec<_> = queues.iter().map(RingQueue::stealer).collect();

        // Only the sweeping worker's own queue has work.
        queues[1].push(Task::new(|| {})).expect("push");

        let mut rng = DetRng::new(77);
        assert!(
            steal_sweep(&stealers, 1, &mut rng).is_none(),
            "a worker must not steal from its own ring"
        );
        assert_eq!(queues[1].len(), 1, "own task must remain queued");
    }

    #[test]
    fn sweep_over_empty_pool_is_none() {
        let queues: Vec<RingQueue> = (0..4).map(|_| RingQueue::new()).collect();
        let stealers: Vec<_> = queues.iter().map(RingQueue::stealer).collect();
        let mut rng = DetRng::new(3);
        assert!(steal_sweep(&stealers, 0, &mut rng).is_none());
    }

    #[test]
    fn single_worker_pool_has_no_victims() {
        let queue = RingQueue::new();
        let stealers = vec![queue.stealer()];
        let mut rng = DetRng::new(5);
        assert!(steal_sweep(&stealers, 0, &mut rng).is_none());
    }
}
