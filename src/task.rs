//! The type-erased unit of work.

use core::fmt;

/// A nullary, one-shot unit of work.
///
/// A task carries no identity, no result channel, and no cancellation
/// token. Ownership transfers into the scheduler at submit; the scheduler
/// owns the task until a worker begins executing it, after which it is
/// consumed. A task that is still queued when its pool is dropped is
/// destroyed without being invoked.
pub(crate) struct Task {
    f: Box<dyn FnOnce() + Send + 'static>,
}

impl Task {
    /// Wraps a closure for later execution.
    pub(crate) fn new<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self { f: Box::new(f) }
    }

    /// Invokes the task, consuming it.
    #[inline]
    pub(crate) fn run(self) {
        (self.f)();
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task").finish_non_exhaustive()
    }
}
