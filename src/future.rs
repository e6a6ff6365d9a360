//! One-shot future cells with chained continuations.
//!
//! A [`FutureResult`] is a shared slot that a producing task writes exactly
//! once, either with a value or with an error. Consumers may block on it
//! ([`get`](FutureResult::get), [`wait`](FutureResult::wait)) or chain a
//! continuation ([`then`](FutureResult::then)), which schedules follow-up
//! work on the pool the moment the cell resolves. Errors short-circuit:
//! a continuation that receives an error forwards it without invoking its
//! stage.

use std::mem;
use std::ops::Shr;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::error::TaskError;
use crate::latch::{Latch, Waitable};
use crate::scheduler::{TaskScheduler, WeakTaskScheduler};
use crate::unwind;

/// What a stage leaves behind in its cell.
pub type StageResult<T> = Result<T, TaskError>;

// -----------------------------------------------------------------------------
// Cell

/// The state of a future cell.
///
/// Exactly one producer moves the cell out of `Pending`, and it does so
/// exactly once. `Continued` marks a cell whose result has been handed off,
/// either to a continuation or through `get`.
enum State<T> {
    Pending { continuation: Option<Continuation<T>> },
    Ready(StageResult<T>),
    Continued,
}

struct Continuation<T> {
    run: Box<dyn FnOnce(StageResult<T>) + Send + 'static>,
}

struct Cell<T> {
    state: Mutex<State<T>>,
    /// Count-1 latch, notified exactly once when the cell resolves.
    done: Latch,
    /// The pool continuations are scheduled on. Held weakly: a cell queued
    /// inside a task must not keep its own pool alive.
    scheduler: WeakTaskScheduler,
    /// Index of the pipeline stage that writes this cell.
    stage: usize,
}

impl<T: Send + 'static> Cell<T> {
    /// Writes the cell's one result. Panics if the cell was already resolved.
    fn resolve(&self, result: StageResult<T>) {
        let mut state = self.state.lock();
        match mem::replace(&mut *state, State::Continued) {
            State::Pending {
                continuation: Some(continuation),
            } => {
                drop(state);
                self.done.notify();
                self.dispatch(continuation, result);
            }
            State::Pending { continuation: None } => {
                *state = State::Ready(result);
                drop(state);
                self.done.notify();
            }
            State::Ready(_) | State::Continued => panic!("future cell resolved twice"),
        }
    }

    /// Schedules a continuation with the cell's result. If the pool is gone
    /// or refuses the task, dropping the closure resolves the downstream
    /// cell with `SubmissionRefused` through its guard.
    fn dispatch(&self, continuation: Continuation<T>, result: StageResult<T>) {
        trace!(stage = self.stage, "scheduling continuation");
        let run = continuation.run;
        if let Some(scheduler) = self.scheduler.upgrade() {
            scheduler.submit(move || run(result));
        }
    }
}

/// Resolves its cell with `SubmissionRefused` if dropped while armed. Every
/// closure responsible for resolving a cell carries one, so a task dropped
/// unexecuted at shutdown (or refused at submission) still resolves its cell
/// and `get` never hangs.
struct ResolveGuard<T: Send + 'static> {
    cell: Option<Arc<Cell<T>>>,
}

impl<T: Send + 'static> ResolveGuard<T> {
    fn arm(cell: &Arc<Cell<T>>) -> ResolveGuard<T> {
        ResolveGuard {
            cell: Some(cell.clone()),
        }
    }

    fn disarm(mut self) -> Arc<Cell<T>> {
        self.cell.take().expect("resolve guard already disarmed")
    }
}

impl<T: Send + 'static> Drop for ResolveGuard<T> {
    fn drop(&mut self) {
        if let Some(cell) = self.cell.take() {
            let stage = cell.stage;
            cell.resolve(Err(TaskError::SubmissionRefused { stage }));
        }
    }
}

// -----------------------------------------------------------------------------
// FutureResult

/// A one-shot slot carrying a value or an error, with wait and continue
/// semantics.
///
/// Handles are cloneable and share one cell, so a producer can keep writing
/// access while consumers hold their own copies. The consuming operations
/// (`then`, `get`) take the handle by value: a cell supports one continuation
/// and yields its value once.
pub struct FutureResult<T> {
    cell: Arc<Cell<T>>,
}

impl<T> Clone for FutureResult<T> {
    fn clone(&self) -> FutureResult<T> {
        FutureResult {
            cell: self.cell.clone(),
        }
    }
}

impl<T: Send + 'static> FutureResult<T> {
    fn pending(scheduler: WeakTaskScheduler, stage: usize) -> FutureResult<T> {
        FutureResult {
            cell: Arc::new(Cell {
                state: Mutex::new(State::Pending { continuation: None }),
                done: Latch::new(1),
                scheduler,
                stage,
            }),
        }
    }

    /// Creates an unresolved cell whose producer will call
    /// [`set_value`](FutureResult::set_value) or
    /// [`set_error`](FutureResult::set_error).
    pub fn new(scheduler: &TaskScheduler) -> FutureResult<T> {
        FutureResult::pending(scheduler.downgrade(), 0)
    }

    /// Creates a cell already holding `value`, positioned at `stage` in a
    /// pipeline. Continuations chained onto it are stage `stage + 1`.
    pub(crate) fn ready_at(scheduler: &TaskScheduler, value: T, stage: usize) -> FutureResult<T> {
        let future = FutureResult::pending(scheduler.downgrade(), stage);
        future.cell.resolve(Ok(value));
        future
    }

    /// Resolves the cell with a value. Panics if already resolved.
    pub fn set_value(&self, value: T) {
        self.cell.resolve(Ok(value));
    }

    /// Resolves the cell with an error. Panics if already resolved.
    pub fn set_error(&self, error: TaskError) {
        self.cell.resolve(Err(error));
    }

    /// Returns `true` once the cell has resolved, without blocking.
    pub fn is_ready(&self) -> bool {
        self.cell.done.try_wait()
    }

    /// Blocks until the cell has resolved, without consuming the result.
    pub fn wait(&self) {
        self.cell.done.wait();
    }

    /// Blocks until the cell has resolved and takes the result. Panics if the
    /// result was already taken or handed to a continuation.
    pub fn get(self) -> StageResult<T> {
        self.cell.done.wait();
        let mut state = self.cell.state.lock();
        match mem::replace(&mut *state, State::Continued) {
            State::Ready(result) => result,
            State::Continued => panic!("future value already taken"),
            State::Pending { .. } => unreachable!("future latch fired before resolution"),
        }
    }

    /// Chains a stage onto this future, returning the future of its output.
    ///
    /// The stage runs as a pool task once this cell resolves with a value; if
    /// this cell resolves with an error the stage is skipped and the error
    /// propagates unchanged. If the cell is already resolved when `then` is
    /// called, the continuation is scheduled immediately.
    pub fn then<U, F>(self, stage: F) -> FutureResult<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        let next = FutureResult::pending(
            self.cell.scheduler.clone(),
            self.cell.stage.wrapping_add(1),
        );
        let guard = ResolveGuard::arm(&next.cell);
        let run = Box::new(move |result: StageResult<T>| {
            let cell = guard.disarm();
            match result {
                Ok(value) => match unwind::halt_unwinding(|| stage(value)) {
                    Ok(output) => cell.resolve(Ok(output)),
                    Err(payload) => {
                        let stage = cell.stage;
                        let message = unwind::payload_message(&*payload);
                        cell.resolve(Err(TaskError::StageFailed { stage, message }));
                    }
                },
                Err(error) => cell.resolve(Err(error)),
            }
        });
        self.install(Continuation { run });
        next
    }

    /// Hands the resolved result to `f` on a pool thread. Used for terminal
    /// sinks: unlike [`then`](FutureResult::then), `f` also sees errors. If
    /// scheduling the hand-off is refused, `f` runs on the dropping thread
    /// with a `SubmissionRefused` error.
    pub(crate) fn finish<F>(self, f: F)
    where
        F: FnOnce(StageResult<T>) + Send + 'static,
    {
        struct SinkGuard<T> {
            f: Option<Box<dyn FnOnce(StageResult<T>) + Send + 'static>>,
            stage: usize,
        }

        impl<T> SinkGuard<T> {
            fn deliver(mut self, result: StageResult<T>) {
                let f = self.f.take().expect("sink already delivered");
                f(result);
            }
        }

        impl<T> Drop for SinkGuard<T> {
            fn drop(&mut self) {
                if let Some(f) = self.f.take() {
                    f(Err(TaskError::SubmissionRefused { stage: self.stage }));
                }
            }
        }

        let guard = SinkGuard {
            f: Some(Box::new(f)),
            stage: self.cell.stage,
        };
        let run = Box::new(move |result: StageResult<T>| guard.deliver(result));
        self.install(Continuation { run });
    }

    /// Installs a continuation, or schedules it immediately if the cell has
    /// already resolved.
    fn install(self, continuation: Continuation<T>) {
        let cell = self.cell;
        let mut state = cell.state.lock();
        match mem::replace(&mut *state, State::Continued) {
            State::Pending { continuation: None } => {
                *state = State::Pending {
                    continuation: Some(continuation),
                };
            }
            State::Ready(result) => {
                drop(state);
                cell.dispatch(continuation, result);
            }
            State::Pending {
                continuation: Some(_),
            } => panic!("future already has a continuation"),
            State::Continued => panic!("future already continued"),
        }
    }
}

impl<T: Send + 'static> Waitable for FutureResult<T> {
    fn wait(&self) {
        FutureResult::wait(self)
    }
}

/// `future >> sink` is shorthand for chaining a terminal, `()`-returning
/// stage.
impl<T, F> Shr<F> for FutureResult<T>
where
    T: Send + 'static,
    F: FnOnce(T) + Send + 'static,
{
    type Output = FutureResult<()>;

    fn shr(self, sink: F) -> FutureResult<()> {
        self.then(sink)
    }
}

// -----------------------------------------------------------------------------
// Producers

/// Submits a task that runs `f` and resolves the returned future with its
/// output. A panic in `f` resolves the future with
/// [`TaskError::StageFailed`]; a refused or shutdown-dropped task resolves it
/// with [`TaskError::SubmissionRefused`].
pub fn make_future<T, F>(scheduler: &TaskScheduler, f: F) -> FutureResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let future = FutureResult::pending(scheduler.downgrade(), 0);
    let guard = ResolveGuard::arm(&future.cell);
    scheduler.submit(move || {
        let cell = guard.disarm();
        match unwind::halt_unwinding(f) {
            Ok(value) => cell.resolve(Ok(value)),
            Err(payload) => {
                let stage = cell.stage;
                let message = unwind::payload_message(&*payload);
                cell.resolve(Err(TaskError::StageFailed { stage, message }));
            }
        }
    });
    future
}

// -----------------------------------------------------------------------------
// Tests
