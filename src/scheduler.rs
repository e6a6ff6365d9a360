//! This module contains the api and worker logic for the task scheduler.

use std::collections::{HashMap, HashSet};
use std::mem;
use std::num::NonZero;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};
use std::time::Duration;

use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace};

use crate::latch::{Latch, Waitable};
use crate::queue::TaskQueue;
use crate::task::Task;
use crate::unwind;

// -----------------------------------------------------------------------------
// States

/// The scheduler accepts tasks but has not spawned workers yet.
const NEW: u8 = 0;

/// Workers are running and draining the queues.
const RUNNING: u8 = 1;

/// Shutdown has begun. Submissions are refused and workers are exiting.
const STOPPED: u8 = 2;

/// How long a blocked queue operation sleeps before re-checking the scheduler
/// state. Bounds the time a parked worker takes to notice a shutdown.
const PARK_INTERVAL: Duration = Duration::from_millis(10);

// -----------------------------------------------------------------------------
// Scheduler core

/// The state shared between scheduler handles and worker threads.
///
/// Handles own the core through an `Arc`; workers hold only a `Weak` and
/// upgrade it once per loop iteration, so the queues they drain can never keep
/// their own scheduler alive.
struct Core {
    /// One queue per worker. The vector is fixed at construction.
    queues: Vec<TaskQueue>,
    /// Lifecycle state (`NEW`, `RUNNING` or `STOPPED`).
    state: AtomicU8,
    /// Round-robin placement counter for choosing a queue.
    next_queue: AtomicUsize,
    /// Join handles for the permanent workers.
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
    /// Reverse map from thread identity to worker queue index.
    worker_index: Mutex<HashMap<ThreadId, usize>>,
    /// Identities of live temporary workers.
    temp_workers: Mutex<HashSet<ThreadId>>,
    /// Whether dropping the last handle blocks until the workers exit.
    block_on_drop: bool,
}

impl Core {
    /// Returns `true` while submissions are accepted (before shutdown).
    fn accepting(&self) -> bool {
        self.state.load(Ordering::Acquire) != STOPPED
    }

    /// Returns `true` while workers should keep draining queues.
    fn running(&self) -> bool {
        self.state.load(Ordering::Acquire) == RUNNING
    }

    /// Picks a placement queue. Every submission advances the round-robin
    /// counter, from workers and external threads alike.
    fn task_id(&self) -> usize {
        self.next_queue.fetch_add(1, Ordering::Relaxed) % self.queues.len()
    }

    /// Places a task on queue `id`, blocking while the queue is full. Fails
    /// only once shutdown has begun.
    fn send_task(&self, task: Task, id: usize) -> bool {
        if !self.accepting() {
            return false;
        }
        if !self.queues[id].push(task, || self.accepting(), PARK_INTERVAL) {
            return false;
        }
        // If shutdown raced the push, the shutdown drain may already have
        // passed this queue. Accepted means executed, so drain it ourselves.
        if !self.accepting() {
            self.drain_queue(id);
        }
        true
    }

    /// Pops and runs every ready task left on queue `id`. Not-ready tasks
    /// are dropped and their completion guards fire. Shutdown-time only.
    fn drain_queue(&self, id: usize) {
        while let Some(task) = self.queues[id].pop(|| false, Duration::ZERO) {
            if !task.is_ready() {
                continue;
            }
            if unwind::halt_unwinding(|| task.run()).is_err() {
                debug!("task panicked during the shutdown drain");
            }
        }
    }

    /// Takes a task without blocking: the own queue first, then a round-robin
    /// steal scan starting from the owner's successor.
    fn find_task(&self, id: usize) -> Option<Task> {
        if let Some(task) = self.queues[id].try_pop() {
            return Some(task);
        }
        let count = self.queues.len();
        for offset in 1..count {
            if let Some(task) = self.queues[(id + offset) % count].try_pop() {
                trace!(worker = id, victim = (id + offset) % count, "stole task");
                return Some(task);
            }
        }
        None
    }

    /// Takes a task, parking on the own queue after a full scan miss. Returns
    /// `None` if the scheduler stopped while parked.
    fn wait_for_task(&self, id: usize) -> Option<Task> {
        if let Some(task) = self.find_task(id) {
            return Some(task);
        }
        self.queues[id].pop(|| self.running(), PARK_INTERVAL)
    }

    /// Executes a popped task, or re-enqueues it if its readiness
    /// prerequisite has not fired yet.
    fn run_task(&self, id: usize, task: Task) {
        if !task.is_ready() {
            // The task stays on the queue it came from until its latch fires.
            // A task whose latch never fires is a caller bug.
            if !self.queues[id].push(task, || self.accepting(), PARK_INTERVAL) {
                debug!("dropped a not-ready task during shutdown");
            }
            thread::yield_now();
            return;
        }
        if unwind::halt_unwinding(|| task.run()).is_err() {
            // A panic must not take down the worker. Tasks that resolve a
            // future have already routed the payload into their cell.
            debug!("task panicked; worker continues");
        }
    }

    /// Finds and executes one task without parking. Returns whether a task
    /// was executed.
    fn run_next_task(&self, id: usize) -> bool {
        match self.find_task(id) {
            Some(task) => {
                self.run_task(id, task);
                true
            }
            None => false,
        }
    }

    /// Flips the state to `STOPPED` and releases the workers. Workers drain
    /// the tasks accepted before shutdown and then exit.
    fn shutdown(&self, block: bool) {
        let prior = self.state.swap(STOPPED, Ordering::AcqRel);
        if prior == RUNNING {
            debug!("stopping task scheduler");
        }
        // One no-op per queue wakes parked pops. Best effort: a full queue
        // already has work to wake on, and parked pops re-check the state on
        // every timeout tick anyway.
        for queue in &self.queues {
            let _ = queue.try_push(Task::new(|| {}));
        }
        let handles = mem::take(&mut *self.workers.lock());
        self.worker_index.lock().clear();
        if block {
            let current = thread::current().id();
            for handle in handles {
                // A worker can end up dropping the last handle; it must not
                // try to join itself.
                if handle.thread().id() != current {
                    let _ = handle.join();
                }
            }
            // Anything still queued never had a worker: the pool was stopped
            // before `start`, or a submission raced the shutdown. Accepted
            // tasks must still run exactly once, so run them here.
            for id in 0..self.queues.len() {
                self.drain_queue(id);
            }
        }
    }
}

impl Drop for Core {
    fn drop(&mut self) {
        self.shutdown(self.block_on_drop);
    }
}

// -----------------------------------------------------------------------------
// Scheduler handle

/// A handle to a pool of worker threads that executes submitted tasks.
///
/// Handles are cheap to clone and share one pool. The pool is constructed
/// stopped: call [`TaskScheduler::start`] to spawn the workers. Tasks may be
/// submitted before `start`; they queue up and run once the workers exist.
/// When the last handle is dropped the pool shuts down, blocking on worker
/// exit if the scheduler was built with `block_on_drop`.
///
/// ```no_run
/// use millrace::TaskScheduler;
///
/// let scheduler = TaskScheduler::new(4, true);
/// scheduler.start();
/// scheduler.submit(|| println!("on a worker"));
/// scheduler.stop(true);
/// ```
#[derive(Clone)]
pub struct TaskScheduler {
    core: Arc<Core>,
}

impl TaskScheduler {
    /// Creates a stopped scheduler with `threads` workers (at least one).
    /// `block_on_drop` controls whether dropping the last handle waits for
    /// the workers to exit.
    pub fn new(threads: usize, block_on_drop: bool) -> TaskScheduler {
        let threads = threads.max(1);
        TaskScheduler {
            core: Arc::new(Core {
                queues: (0..threads).map(|_| TaskQueue::new()).collect(),
                state: AtomicU8::new(NEW),
                next_queue: AtomicUsize::new(0),
                workers: Mutex::new(Vec::new()),
                worker_index: Mutex::new(HashMap::new()),
                temp_workers: Mutex::new(HashSet::new()),
                block_on_drop,
            }),
        }
    }

    /// Spawns the worker threads. Does nothing if the pool is already
    /// running; a stopped pool can be started again.
    pub fn start(&self) {
        if self.core.state.swap(RUNNING, Ordering::AcqRel) == RUNNING {
            return;
        }
        let count = self.core.queues.len();
        debug!(workers = count, "starting task scheduler");
        let mut workers = self.core.workers.lock();
        let mut worker_index = self.core.worker_index.lock();
        for index in 0..count {
            let weak = Arc::downgrade(&self.core);
            // Thread-creation failure is fatal. The guard turns the unwind
            // into an abort; an escaped unwind here could return control to
            // callers whose queued work is still in flight.
            let abort_guard = unwind::AbortOnDrop;
            let handle = thread::Builder::new()
                .name(format!("worker {index}"))
                .spawn(move || worker_loop(weak, index))
                .expect("failed to spawn worker thread");
            mem::forget(abort_guard);
            worker_index.insert(handle.thread().id(), index);
            workers.push(handle);
        }
    }

    /// Begins shutdown: submissions are refused from this point on. Each
    /// queue receives a no-op task to wake parked workers, and the worker
    /// threads are then joined (`block = true`) or detached.
    pub fn stop(&self, block: bool) {
        self.core.shutdown(block);
    }

    /// Returns `true` while the workers are running.
    pub fn is_running(&self) -> bool {
        self.core.running()
    }

    /// The number of worker threads (and queues) in the pool.
    pub fn worker_count(&self) -> usize {
        self.core.queues.len()
    }

    /// Submits a task for execution. Returns `false` only after shutdown has
    /// begun, in which case the task is dropped.
    pub fn submit<F>(&self, f: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.add_task(f, None)
    }

    /// Submits a task gated on `ready`: it will not execute until the latch
    /// has fired. Returns `false` only after shutdown has begun.
    pub fn submit_with_latch<F>(&self, f: F, ready: Latch) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.add_task(f, Some(ready))
    }

    fn add_task<F>(&self, f: F, ready: Option<Latch>) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let id = self.core.task_id();
        let weak = Arc::downgrade(&self.core);
        let call = move || {
            f();
            // Continuation fast path: after finishing a task, keep draining
            // work from the placement queue before returning to the outer
            // loop. Cuts queue-wake overhead for pipeline workloads.
            if let Some(core) = weak.upgrade() {
                while core.running() && core.run_next_task(id) {}
            }
        };
        let task = match ready {
            Some(latch) => Task::gated(call, latch),
            None => Task::new(call),
        };
        self.core.send_task(task, id)
    }

    /// Runs `f` while lending one temporary worker to the pool, so that a
    /// worker thread blocking inside `f` cannot starve the pool of execution.
    /// The helper exits once `f` returns.
    ///
    /// This is the safe way to block on a latch or future from inside a task:
    /// see [`TaskScheduler::wait_for`].
    pub fn wait_for_scope<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let exit = self.start_temp_task_runners(1);
        // Fires even if `f` panics, so the helper can exit.
        let _notify = NotifyOnDrop(exit);
        f()
    }

    /// Blocks on `waitable` while lending a temporary worker to the pool.
    pub fn wait_for<W>(&self, waitable: W)
    where
        W: Waitable,
    {
        self.wait_for_scope(|| waitable.wait());
    }

    /// Spawns `count` detached helper threads that run the worker loop until
    /// the returned latch fires. The helpers register themselves, so
    /// [`TaskScheduler::is_pool_thread`] reports `true` for them. The caller
    /// is responsible for `count` notifications.
    pub fn start_temp_task_runners(&self, count: usize) -> Latch {
        let exit = Latch::new(count as u32);
        for _ in 0..count {
            let index = self.core.task_id();
            let weak = Arc::downgrade(&self.core);
            let exit = exit.clone();
            trace!(queue = index, "spawning temporary worker");
            // Thread-creation failure is fatal. Scoped waiters rely on the
            // helper existing, and an unwind out of here would escape a
            // wait-before-return region.
            let abort_guard = unwind::AbortOnDrop;
            thread::Builder::new()
                .name("temp worker".to_string())
                .spawn(move || temp_worker_loop(weak, index, exit))
                .expect("failed to spawn temporary worker thread");
            mem::forget(abort_guard);
        }
        exit
    }

    /// Returns `true` if the calling thread is one of this pool's workers,
    /// permanent or temporary.
    pub fn is_pool_thread(&self) -> bool {
        let id = thread::current().id();
        self.core.worker_index.lock().contains_key(&id)
            || self.core.temp_workers.lock().contains(&id)
    }

    /// Downgrades the handle for storage inside queued work. Future cells
    /// hold these so that tasks sitting in a queue can never keep their own
    /// pool alive.
    pub(crate) fn downgrade(&self) -> WeakTaskScheduler {
        WeakTaskScheduler {
            core: Arc::downgrade(&self.core),
        }
    }
}

/// A non-owning scheduler handle.
#[derive(Clone)]
pub(crate) struct WeakTaskScheduler {
    core: Weak<Core>,
}

impl WeakTaskScheduler {
    pub(crate) fn upgrade(&self) -> Option<TaskScheduler> {
        self.core.upgrade().map(|core| TaskScheduler { core })
    }
}

/// Notifies a latch when dropped, making completion signals panic-safe.
struct NotifyOnDrop(Latch);

impl Drop for NotifyOnDrop {
    fn drop(&mut self) {
        self.0.notify();
    }
}

// -----------------------------------------------------------------------------
// Task helpers

/// Submits a task that notifies `completion` when it finishes. The
/// notification fires exactly once in every case: when the task returns,
/// panics, is refused at submission, or is dropped unexecuted at shutdown.
/// Returns `false` if the scheduler refused the task.
pub fn schedule_task<F>(completion: &Latch, f: F, scheduler: &TaskScheduler) -> bool
where
    F: FnOnce() + Send + 'static,
{
    // Moving the guard into the closure ties the notification to the task's
    // lifetime, not just its execution.
    let notify = NotifyOnDrop(completion.clone());
    scheduler.submit(move || {
        let _notify = notify;
        f();
    })
}

/// Submits a task and returns a latch that fires when it completes. If the
/// scheduler refuses the task the latch is returned already fired.
pub fn create_waitable_task<F>(f: F, scheduler: &TaskScheduler) -> Latch
where
    F: FnOnce() + Send + 'static,
{
    let latch = Latch::new(1);
    let _ = schedule_task(&latch, f, scheduler);
    latch
}

/// A group of tasks dispatched together and waited on as a unit.
///
/// ```no_run
/// use millrace::{TaskGroup, TaskScheduler};
///
/// let scheduler = TaskScheduler::new(4, true);
/// scheduler.start();
/// TaskGroup::new(&scheduler)
///     .add(|| println!("a"))
///     .add(|| println!("b"))
///     .wait();
/// ```
pub struct TaskGroup<'a> {
    scheduler: &'a TaskScheduler,
    tasks: Vec<Box<dyn FnOnce() + Send + 'static>>,
}

impl<'a> TaskGroup<'a> {
    pub fn new(scheduler: &'a TaskScheduler) -> TaskGroup<'a> {
        TaskGroup {
            scheduler,
            tasks: Vec::new(),
        }
    }

    /// Adds a task to the group.
    pub fn add<F>(mut self, f: F) -> TaskGroup<'a>
    where
        F: FnOnce() + Send + 'static,
    {
        self.tasks.push(Box::new(f));
        self
    }

    /// Submits every task and returns the shared completion latch. Refused
    /// tasks count as completed so the latch always fires.
    pub fn dispatch(self) -> Latch {
        let latch = Latch::new(self.tasks.len() as u32);
        for f in self.tasks {
            let _ = schedule_task(&latch, f, self.scheduler);
        }
        latch
    }

    /// Submits every task and blocks until all of them have completed,
    /// lending a temporary worker to the pool while blocked.
    pub fn wait(self) {
        let scheduler = self.scheduler;
        let latch = self.dispatch();
        scheduler.wait_for(&latch);
    }
}

// -----------------------------------------------------------------------------
// Worker loops

/// The main loop for a permanent worker. The worker upgrades its weak core
/// handle once per iteration, so a pool whose handles are all gone is
/// released promptly.
fn worker_loop(core: Weak<Core>, index: usize) {
    trace!(index, "starting worker");
    loop {
        let Some(core) = core.upgrade() else { break };
        if core.running() {
            if let Some(task) = core.wait_for_task(index) {
                core.run_task(index, task);
            }
        } else {
            // Shutdown has begun. Tasks accepted before it must still run
            // exactly once, so drain the queues before exiting.
            match core.find_task(index) {
                Some(task) => core.run_task(index, task),
                None => break,
            }
        }
    }
    trace!(index, "exiting worker");
}

/// The loop for a temporary worker: identical to the permanent loop, with the
/// extra exit condition that the scope it was lent to has ended.
fn temp_worker_loop(core: Weak<Core>, index: usize, exit: Latch) {
    let id = thread::current().id();
    if let Some(core) = core.upgrade() {
        core.temp_workers.lock().insert(id);
    }
    let _deregister = DeregisterOnExit {
        core: core.clone(),
        id,
    };
    while !exit.try_wait() {
        let Some(core) = core.upgrade() else { return };
        if !core.running() {
            return;
        }
        // `wait_for_task` parks for at most `PARK_INTERVAL`, which bounds how
        // long the helper outlives its scope.
        if let Some(task) = core.wait_for_task(index) {
            core.run_task(index, task);
        }
    }
    trace!("temporary worker released");
}

struct DeregisterOnExit {
    core: Weak<Core>,
    id: ThreadId,
}

impl Drop for DeregisterOnExit {
    fn drop(&mut self) {
        if let Some(core) = self.core.upgrade() {
            core.temp_workers.lock().remove(&self.id);
        }
    }
}

// -----------------------------------------------------------------------------
// The process-wide default scheduler

static DEFAULT_SCHEDULER: Lazy<RwLock<Option<TaskScheduler>>> = Lazy::new(|| RwLock::new(None));

/// Returns a handle to the process-wide scheduler, creating and starting it
/// on first use. The default pool has one worker per available core and
/// blocks on drop.
pub fn default_scheduler() -> TaskScheduler {
    if let Some(scheduler) = DEFAULT_SCHEDULER.read().as_ref() {
        if scheduler.is_running() {
            return scheduler.clone();
        }
    }
    let mut slot = DEFAULT_SCHEDULER.write();
    let scheduler = slot.get_or_insert_with(|| TaskScheduler::new(default_parallelism(), true));
    scheduler.start();
    scheduler.clone()
}

/// Replaces the process-wide scheduler, returning the displaced one. Lets
/// tests substitute a controlled pool.
pub fn install_default(scheduler: TaskScheduler) -> Option<TaskScheduler> {
    DEFAULT_SCHEDULER.write().replace(scheduler)
}

/// Removes the process-wide scheduler, returning it if one was installed.
pub fn uninstall_default() -> Option<TaskScheduler> {
    DEFAULT_SCHEDULER.write().take()
}

fn default_parallelism() -> usize {
    thread::available_parallelism().map(NonZero::get).unwrap_or(1)
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn submit_runs_tasks() {
        let scheduler = TaskScheduler::new(2, true);
        scheduler.start();
        let counter = Arc::new(AtomicUsize::new(0));
        let latch = Latch::new(16);
        for _ in 0..16 {
            let counter = counter.clone();
            assert!(schedule_task(
                &latch,
                move || {
                    counter.fetch_add(1, Ordering::Relaxed);
                },
                &scheduler,
            ));
        }
        latch.wait();
        assert_eq!(counter.load(Ordering::Relaxed), 16);
        scheduler.stop(true);
    }

    #[test]
    fn tasks_queued_before_start_run_after() {
        let scheduler = TaskScheduler::new(1, true);
        let latch = Latch::new(1);
        assert!(schedule_task(&latch, || {}, &scheduler));
        assert!(!latch.try_wait());
        scheduler.start();
        latch.wait();
        scheduler.stop(true);
    }

    #[test]
    fn submit_refused_after_stop() {
        let scheduler = TaskScheduler::new(1, true);
        scheduler.start();
        scheduler.stop(true);
        assert!(!scheduler.submit(|| {}));
    }

    #[test]
    fn gated_task_waits_for_its_latch() {
        let scheduler = TaskScheduler::new(1, true);
        scheduler.start();
        let gate = Latch::new(1);
        let done = Latch::new(1);
        {
            let done = done.clone();
            assert!(scheduler.submit_with_latch(move || done.notify(), gate.clone()));
        }
        thread::sleep(Duration::from_millis(20));
        assert!(!done.try_wait());
        gate.notify();
        done.wait();
        scheduler.stop(true);
    }

    #[test]
    fn pool_thread_registration() {
        let scheduler = TaskScheduler::new(2, true);
        scheduler.start();
        assert!(!scheduler.is_pool_thread());
        let latch = Latch::new(1);
        let observed = Arc::new(Mutex::new(false));
        {
            let handle = scheduler.clone();
            let observed = observed.clone();
            assert!(schedule_task(
                &latch,
                move || {
                    *observed.lock() = handle.is_pool_thread();
                },
                &scheduler,
            ));
        }
        latch.wait();
        assert!(*observed.lock());
        scheduler.stop(true);
    }

    #[test]
    fn task_group_waits_for_all() {
        let scheduler = TaskScheduler::new(2, true);
        scheduler.start();
        let counter = Arc::new(AtomicUsize::new(0));
        let add = |n: usize| {
            let counter = counter.clone();
            move || {
                counter.fetch_add(n, Ordering::Relaxed);
            }
        };
        TaskGroup::new(&scheduler)
            .add(add(1))
            .add(add(2))
            .add(add(4))
            .wait();
        assert_eq!(counter.load(Ordering::Relaxed), 7);
        scheduler.stop(true);
    }

    #[test]
    fn worker_survives_panicking_task() {
        let scheduler = TaskScheduler::new(1, true);
        scheduler.start();
        let latch = Latch::new(2);
        assert!(schedule_task(&latch, || panic!("boom"), &scheduler));
        assert!(schedule_task(&latch, || {}, &scheduler));
        latch.wait();
        scheduler.stop(true);
    }
}
