//! Compile-time composed pipelines of stages driven by futures.
//!
//! A function stream is an ordered sequence of stages where each stage's
//! output feeds the next. Streams are composed with `|` starting from
//! [`compose`]; composition is pure type-level bookkeeping and allocates
//! nothing. Invoking a stream builds a chain of future cells: one task runs
//! the first stage, and each following stage is a continuation on its
//! predecessor's cell. An error in any stage skips the rest and reaches the
//! error sink with the index of the failing stage.
//!
//! ```no_run
//! use millrace::{compose, TaskScheduler};
//!
//! let scheduler = TaskScheduler::new(4, true);
//! scheduler.start();
//!
//! let stream = compose() | (|x: i32| x * 2) | (|x: i32| x + 1);
//! let future = stream.invoke_with(&scheduler, 20);
//! assert_eq!(future.get(), Ok(41));
//! ```

use std::ops::BitOr;

use crate::error::TaskError;
use crate::future::FutureResult;
use crate::scheduler::{default_scheduler, TaskScheduler};

/// The pseudo-index of the pre-resolved input cell. It sits just before
/// stage 0: the first chained stage wraps around to index 0.
const INPUT_STAGE: usize = usize::MAX;

// -----------------------------------------------------------------------------
// Stage chains

/// A type-level list of stages applicable to an input of type `I`.
///
/// The empty chain `()` is the identity; `(chain, stage)` extends a chain
/// with one more stage. Invocation folds [`FutureResult::then`] over the
/// chain, so stage `i` runs as the continuation at pipeline index `i`.
pub trait StageChain<I>: Clone + Send + 'static {
    /// The output type of the final stage.
    type Output: Send + 'static;

    /// Chains every stage onto `input`, returning the final future.
    fn launch(self, input: FutureResult<I>) -> FutureResult<Self::Output>;
}

impl<I: Send + 'static> StageChain<I> for () {
    type Output = I;

    fn launch(self, input: FutureResult<I>) -> FutureResult<I> {
        input
    }
}

impl<I, S, F, O> StageChain<I> for (S, F)
where
    I: Send + 'static,
    S: StageChain<I>,
    F: FnOnce(S::Output) -> O + Clone + Send + 'static,
    O: Send + 'static,
{
    type Output = O;

    fn launch(self, input: FutureResult<I>) -> FutureResult<O> {
        let (chain, stage) = self;
        chain.launch(input).then(stage)
    }
}

// -----------------------------------------------------------------------------
// Function stream

/// A reusable pipeline of composed stages. Built with [`compose`] and `|`;
/// invoked with [`invoke`](FunctionStream::invoke) (future-returning) or
/// [`call`](FunctionStream::call) (sink-delivering).
///
/// The stream itself is stateless: each invocation clones the stages and
/// owns its chain of future cells.
#[derive(Clone)]
pub struct FunctionStream<S> {
    stages: S,
}

/// Starts a stream composition. `compose() | f | g | h` is the stream that
/// feeds its input through `f`, then `g`, then `h`.
pub fn compose() -> FunctionStream<()> {
    FunctionStream { stages: () }
}

impl<S, F> BitOr<F> for FunctionStream<S> {
    type Output = FunctionStream<(S, F)>;

    fn bitor(self, stage: F) -> FunctionStream<(S, F)> {
        FunctionStream {
            stages: (self.stages, stage),
        }
    }
}

impl<S> FunctionStream<S> {
    /// Invokes the stream on `scheduler`, returning the future of the final
    /// stage's output.
    pub fn invoke_with<I>(&self, scheduler: &TaskScheduler, input: I) -> FutureResult<S::Output>
    where
        S: StageChain<I>,
        I: Send + 'static,
    {
        let chain = self.stages.clone();
        let input = FutureResult::ready_at(scheduler, input, INPUT_STAGE);
        chain.launch(input)
    }

    /// Invokes the stream on the process-wide default scheduler.
    pub fn invoke<I>(&self, input: I) -> FutureResult<S::Output>
    where
        S: StageChain<I>,
        I: Send + 'static,
    {
        self.invoke_with(&default_scheduler(), input)
    }

    /// Invokes the stream and delivers the outcome to sinks: `on_done`
    /// receives the final value if every stage succeeded, otherwise
    /// `on_error` receives the failing stage's index and error, exactly once.
    pub fn call_with<I, D, E>(
        &self,
        scheduler: &TaskScheduler,
        input: I,
        on_done: D,
        on_error: E,
    ) where
        S: StageChain<I>,
        I: Send + 'static,
        D: FnOnce(S::Output) + Send + 'static,
        E: FnOnce(usize, TaskError) + Send + 'static,
    {
        self.invoke_with(scheduler, input)
            .finish(move |result| match result {
                Ok(value) => on_done(value),
                Err(error) => {
                    let stage = error.stage();
                    on_error(stage, error);
                }
            });
    }

    /// Like [`call_with`](FunctionStream::call_with), on the process-wide
    /// default scheduler.
    pub fn call<I, D, E>(&self, input: I, on_done: D, on_error: E)
    where
        S: StageChain<I>,
        I: Send + 'static,
        D: FnOnce(S::Output) + Send + 'static,
        E: FnOnce(usize, TaskError) + Send + 'static,
    {
        self.call_with(&default_scheduler(), input, on_done, on_error)
    }
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduler() -> TaskScheduler {
        let scheduler = TaskScheduler::new(2, true);
        scheduler.start();
        scheduler
    }

    #[test]
    fn empty_stream_is_identity() {
        let ts = scheduler();
        let stream = compose();
        assert_eq!(stream.invoke_with(&ts, 11).get(), Ok(11));
        ts.stop(true);
    }

    #[test]
    fn stages_run_in_declared_order() {
        let ts = scheduler();
        let stream = compose() | (|x: i32| x + 1) | (|x: i32| x * 10);
        assert_eq!(stream.invoke_with(&ts, 4).get(), Ok(50));
        ts.stop(true);
    }

    #[test]
    fn streams_are_reusable() {
        let ts = scheduler();
        let stream = compose() | (|x: u64| x * 3);
        assert_eq!(stream.invoke_with(&ts, 1).get(), Ok(3));
        assert_eq!(stream.invoke_with(&ts, 2).get(), Ok(6));
        ts.stop(true);
    }

    #[test]
    fn failing_stage_reports_its_index() {
        let ts = scheduler();
        let stream = compose()
            | (|x: i32| x + 1)
            | (|_: i32| -> i32 { panic!("stage two") })
            | (|x: i32| x * 10);
        match stream.invoke_with(&ts, 0).get() {
            Err(TaskError::StageFailed { stage, .. }) => assert_eq!(stage, 1),
            other => panic!("unexpected result: {other:?}"),
        }
        ts.stop(true);
    }
}
