//! Pool configuration.
//!
//! [`PoolConfig`] holds the values that drive pool construction. The
//! worker-queue capacity is a build-time constant: change
//! [`LOCAL_QUEUE_LOG2_CAPACITY`] and rebuild to trade memory for a larger
//! fast path.
//!
//! # Defaults
//!
//! | Field | Default |
//! |-------|---------|
//! | `worker_threads` | 0 (available CPU parallelism) |
//! | `thread_stack_size` | 2 MiB |
//! | `thread_name_prefix` | `"finepool-worker"` |

use std::thread;

/// Log2 of the per-worker queue capacity.
///
/// Each worker owns a ring of `1 << LOCAL_QUEUE_LOG2_CAPACITY` slots, of
/// which one is reserved, so a worker can hold
/// `(1 << LOCAL_QUEUE_LOG2_CAPACITY) - 1` tasks before spilling to the
/// central queue. The default of 8 (256 slots) keeps the ring within a few
/// cache lines of task pointers while leaving ample headroom for
/// depth-first subtask recursion.
pub const LOCAL_QUEUE_LOG2_CAPACITY: usize = 8;

/// Per-worker queue capacity in slots. Always a power of two.
pub(crate) const LOCAL_QUEUE_CAPACITY: usize = 1 << LOCAL_QUEUE_LOG2_CAPACITY;

/// Index mask for the power-of-two ring.
pub(crate) const LOCAL_QUEUE_MASK: usize = LOCAL_QUEUE_CAPACITY - 1;

/// Number of tasks moved from the central queue into a worker's ring under
/// a single lock acquisition.
pub(crate) const CENTRAL_DRAIN_BATCH: usize = LOCAL_QUEUE_CAPACITY / 2;

/// Configuration for a [`ThreadPool`](crate::ThreadPool).
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of worker threads. `0` selects the available CPU parallelism.
    pub worker_threads: usize,
    /// Stack size per worker thread.
    pub thread_stack_size: usize,
    /// Prefix for worker thread names (`{prefix}-{index}`; the timer thread
    /// is named `{prefix}-timer`).
    pub thread_name_prefix: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            worker_threads: 0,
            thread_stack_size: 2 * 1024 * 1024,
            thread_name_prefix: "finepool-worker".to_string(),
        }
    }
}

impl PoolConfig {
    /// Resolves the configured worker count to a concrete positive number.
    #[must_use]
    pub(crate) fn resolved_worker_threads(&self) -> usize {
        if self.worker_threads > 0 {
            return self.worker_threads;
        }
        thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
    }
}
