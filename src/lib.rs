//! A thread-pool task scheduler with chainable futures, composable function
//! streams, and parallel slice algorithms.
//!
//! Millrace executes nullary tasks on a pool of worker threads, each with its
//! own bounded queue. Submissions are spread round-robin across the queues;
//! idle workers steal from their neighbours. On top of the pool sit three
//! layers:
//!
//! - [`FutureResult`], a one-shot value cell that supports blocking reads and
//!   `then`-style continuations, with errors short-circuiting down the chain.
//! - [`compose`]d function streams: pipelines of stages assembled at compile
//!   time with `|` and driven through chains of future cells.
//! - [`algorithms`], divide-and-conquer parallel renditions of for_each,
//!   transform, reduce, scan, map_reduce, min/max, and sort.
//!
//! Blocking on pool work from inside the pool is safe: the scoped-wait
//! primitive ([`TaskScheduler::wait_for_scope`]) lends a temporary worker to
//! the pool for the duration of the wait, so even a single-threaded pool
//! cannot deadlock on its own latches.
//!
//! ```no_run
//! use millrace::{compose, TaskScheduler};
//!
//! let scheduler = TaskScheduler::new(4, true);
//! scheduler.start();
//!
//! // Plain task submission.
//! scheduler.submit(|| println!("hello from the pool"));
//!
//! // A pipeline of stages, each running as its own task.
//! let doubled = compose() | (|x: i32| x * 2) | (|x: i32| x + 1);
//! assert_eq!(doubled.invoke_with(&scheduler, 20).get(), Ok(41));
//!
//! // Parallel algorithms on the same pool.
//! let data: Vec<u64> = (1..=1_000_000).collect();
//! let sum = millrace::algorithms::reduce_with(&scheduler, &data, 0, |a, b| a + b);
//! assert_eq!(sum, 500_000_500_000);
//!
//! scheduler.stop(true);
//! ```

// -----------------------------------------------------------------------------
// Modules

pub mod algorithms;
mod error;
mod future;
mod latch;
mod queue;
mod scheduler;
mod stream;
mod task;
mod unwind;

// -----------------------------------------------------------------------------
// Top-level exports

pub use error::TaskError;
pub use future::make_future;
pub use future::FutureResult;
pub use future::StageResult;
pub use latch::Latch;
pub use latch::Waitable;
pub use scheduler::create_waitable_task;
pub use scheduler::default_scheduler;
pub use scheduler::install_default;
pub use scheduler::schedule_task;
pub use scheduler::uninstall_default;
pub use scheduler::TaskGroup;
pub use scheduler::TaskScheduler;
pub use stream::compose;
pub use stream::FunctionStream;
pub use stream::StageChain;
