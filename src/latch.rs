//! A counting latch, the runtime's core completion-signalling primitive.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

// -----------------------------------------------------------------------------
// Latch

/// A counting latch. The latch is created with a count `n`; each call to
/// [`Latch::notify`] decrements it, and once the count strikes zero the latch
/// is *fired* and stays fired. Waiters block in [`Latch::wait`] until then.
///
/// Latches are cheaply cloneable and share one count, so a task can carry a
/// copy into its closure and signal completion while the submitting caller
/// holds another copy to wait on. The count is fixed at construction and never
/// grows; calling `notify` more than `n` times is a caller bug.
#[derive(Clone)]
pub struct Latch {
    inner: Arc<LatchInner>,
}

struct LatchInner {
    /// The number of notifications still outstanding. Zero means fired.
    count: AtomicU32,
}

impl Latch {
    /// Creates a latch that fires after `count` notifications. A latch with a
    /// count of zero is born fired.
    pub fn new(count: u32) -> Latch {
        Latch {
            inner: Arc::new(LatchInner {
                count: AtomicU32::new(count),
            }),
        }
    }

    /// Decrements the count, waking all waiters if it reaches zero.
    pub fn notify(&self) {
        // The release ordering publishes whatever work preceded this
        // notification to threads returning from `wait`.
        let previous = self.inner.count.fetch_sub(1, Ordering::Release);
        debug_assert!(previous > 0, "latch notified more times than its count");
        if previous == 1 {
            // In the event of a race with `wait`: either the waiter loads zero
            // and returns without sleeping, or it went to sleep on a non-zero
            // value and this wake releases it.
            atomic_wait::wake_all(&self.inner.count);
        }
    }

    /// Blocks until the count reaches zero.
    pub fn wait(&self) {
        loop {
            let current = self.inner.count.load(Ordering::Acquire);
            if current == 0 {
                return;
            }
            // Sleeps only while the count still holds the value we loaded, so
            // a decrement between the load and the sleep cannot be missed.
            atomic_wait::wait(&self.inner.count, current);
        }
    }

    /// Returns `true` if the latch has fired, without blocking.
    pub fn try_wait(&self) -> bool {
        self.inner.count.load(Ordering::Acquire) == 0
    }
}

// -----------------------------------------------------------------------------
// Waitable

/// Something that can be blocked on until an event has occurred. Implemented
/// by [`Latch`] and [`FutureResult`](crate::FutureResult), and accepted by
/// [`TaskScheduler::wait_for`](crate::TaskScheduler::wait_for).
pub trait Waitable {
    /// Blocks the calling thread until the event has occurred.
    fn wait(&self);
}

impl Waitable for Latch {
    fn wait(&self) {
        Latch::wait(self)
    }
}

impl<T: Waitable> Waitable for &T {
    fn wait(&self) {
        (**self).wait()
    }
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn zero_count_is_fired() {
        let latch = Latch::new(0);
        assert!(latch.try_wait());
        latch.wait();
    }

    #[test]
    fn fires_after_exact_count() {
        let latch = Latch::new(3);
        latch.notify();
        latch.notify();
        assert!(!latch.try_wait());
        latch.notify();
        assert!(latch.try_wait());
        latch.wait();
    }

    #[test]
    fn wait_blocks_until_notified() {
        let latch = Latch::new(1);
        let waiter = {
            let latch = latch.clone();
            thread::spawn(move || latch.wait())
        };
        thread::sleep(Duration::from_millis(20));
        assert!(!waiter.is_finished());
        latch.notify();
        waiter.join().unwrap();
    }

    #[test]
    fn notifications_from_many_threads() {
        let latch = Latch::new(8);
        for _ in 0..8 {
            let latch = latch.clone();
            thread::spawn(move || latch.notify());
        }
        latch.wait();
        assert!(latch.try_wait());
    }
}
