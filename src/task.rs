//! The unit of work that gets queued on the scheduler.

use crate::latch::Latch;

/// A task is a nullary closure, optionally gated on a readiness latch.
///
/// A task with a latch is only eligible to run once the latch has fired; a
/// worker that pops a not-ready task puts it back on the queue it came from.
/// A task without a latch is always ready. Execution is at-most-once by
/// construction: running a task consumes it.
pub(crate) struct Task {
    call: Box<dyn FnOnce() + Send + 'static>,
    ready: Option<Latch>,
}

impl Task {
    pub(crate) fn new<F>(call: F) -> Task
    where
        F: FnOnce() + Send + 'static,
    {
        Task {
            call: Box::new(call),
            ready: None,
        }
    }

    /// Creates a task gated on `ready`: it will not execute until the latch
    /// has fired.
    pub(crate) fn gated<F>(call: F, ready: Latch) -> Task
    where
        F: FnOnce() + Send + 'static,
    {
        Task {
            call: Box::new(call),
            ready: Some(ready),
        }
    }

    /// Returns `true` if the task's readiness prerequisite (if any) has fired.
    pub(crate) fn is_ready(&self) -> bool {
        match &self.ready {
            Some(latch) => latch.try_wait(),
            None => true,
        }
    }

    /// Runs the task.
    pub(crate) fn run(self) {
        (self.call)()
    }
}
