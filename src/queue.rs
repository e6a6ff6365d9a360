//! The bounded multi-producer multi-consumer queue backing each worker.

use std::time::Duration;

use arraydeque::ArrayDeque;
use parking_lot::{Condvar, Mutex};

use crate::task::Task;

/// The fixed capacity of every per-worker queue.
pub(crate) const QUEUE_CAPACITY: usize = 1024;

// -----------------------------------------------------------------------------
// Task queue

/// A fixed-capacity FIFO of [`Task`]s guarded by one mutex, with separate
/// condition variables for the not-empty and not-full transitions.
///
/// Blocking operations take a `keep_running` predicate and a timeout; they
/// wake at least every `timeout` to re-check the predicate, so a queue blocked
/// at shutdown always unblocks within one interval even if no poison task
/// reaches it.
pub(crate) struct TaskQueue {
    buffer: Mutex<ArrayDeque<Task, QUEUE_CAPACITY>>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl TaskQueue {
    pub(crate) fn new() -> TaskQueue {
        TaskQueue {
            buffer: Mutex::new(ArrayDeque::new()),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    /// Pushes without blocking. Returns the task back to the caller if the
    /// queue is full or its mutex could not be acquired immediately.
    pub(crate) fn try_push(&self, task: Task) -> Result<(), Task> {
        let Some(mut buffer) = self.buffer.try_lock() else {
            return Err(task);
        };
        match buffer.push_back(task) {
            Ok(()) => {
                drop(buffer);
                self.not_empty.notify_one();
                Ok(())
            }
            Err(full) => Err(full.element),
        }
    }

    /// Pushes, blocking while the queue is full. Returns `false` (dropping
    /// the task) once `keep_running` reports false.
    pub(crate) fn push<F>(&self, task: Task, keep_running: F, timeout: Duration) -> bool
    where
        F: Fn() -> bool,
    {
        let mut buffer = self.buffer.lock();
        let mut task = task;
        loop {
            match buffer.push_back(task) {
                Ok(()) => {
                    drop(buffer);
                    self.not_empty.notify_one();
                    return true;
                }
                Err(full) => {
                    task = full.element;
                    if !keep_running() {
                        return false;
                    }
                    self.not_full.wait_for(&mut buffer, timeout);
                }
            }
        }
    }

    /// Pops without blocking. Returns `None` if the queue is empty or its
    /// mutex could not be acquired immediately.
    pub(crate) fn try_pop(&self) -> Option<Task> {
        let mut buffer = self.buffer.try_lock()?;
        let task = buffer.pop_front();
        if task.is_some() {
            drop(buffer);
            self.not_full.notify_one();
        }
        task
    }

    /// Pops, blocking while the queue is empty. Returns `None` once
    /// `keep_running` reports false.
    pub(crate) fn pop<F>(&self, keep_running: F, timeout: Duration) -> Option<Task>
    where
        F: Fn() -> bool,
    {
        let mut buffer = self.buffer.lock();
        loop {
            if let Some(task) = buffer.pop_front() {
                drop(buffer);
                self.not_full.notify_one();
                return Some(task);
            }
            if !keep_running() {
                return None;
            }
            self.not_empty.wait_for(&mut buffer, timeout);
        }
    }
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    fn counting_task(counter: &Arc<AtomicUsize>) -> Task {
        let counter = counter.clone();
        Task::new(move || {
            counter.fetch_add(1, Ordering::Relaxed);
        })
    }

    #[test]
    fn fifo_order() {
        let queue = TaskQueue::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for n in 0..4 {
            let order = order.clone();
            queue
                .try_push(Task::new(move || order.lock().push(n)))
                .ok()
                .unwrap();
        }
        while let Some(task) = queue.try_pop() {
            task.run();
        }
        assert_eq!(*order.lock(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn try_push_reports_full() {
        let queue = TaskQueue::new();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..QUEUE_CAPACITY {
            assert!(queue.try_push(counting_task(&counter)).is_ok());
        }
        assert!(queue.try_push(counting_task(&counter)).is_err());
        assert!(queue.try_pop().is_some());
        assert!(queue.try_push(counting_task(&counter)).is_ok());
    }

    #[test]
    fn blocking_pop_bails_out_when_stopped() {
        let queue = TaskQueue::new();
        assert!(queue.pop(|| false, Duration::from_millis(1)).is_none());
    }

    #[test]
    fn blocking_pop_receives_pushed_task() {
        let queue = Arc::new(TaskQueue::new());
        let counter = Arc::new(AtomicUsize::new(0));
        let popper = {
            let queue = queue.clone();
            thread::spawn(move || queue.pop(|| true, Duration::from_millis(5)))
        };
        assert!(queue.try_push(counting_task(&counter)).is_ok());
        let task = popper.join().unwrap().unwrap();
        task.run();
        assert_eq!(counter.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn blocking_push_waits_for_space() {
        let queue = Arc::new(TaskQueue::new());
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..QUEUE_CAPACITY {
            assert!(queue.try_push(counting_task(&counter)).is_ok());
        }
        let pusher = {
            let queue = queue.clone();
            let task = counting_task(&counter);
            thread::spawn(move || queue.push(task, || true, Duration::from_millis(5)))
        };
        queue.try_pop().unwrap().run();
        assert!(pusher.join().unwrap());
    }
}
