//! The error type shared by futures and function streams.

use core::fmt;

/// Describes why a future cell resolved without a value.
///
/// Every error is tagged with the index of the pipeline stage it arose in.
/// For a future produced directly by [`make_future`](crate::make_future) the
/// stage index is `0`; each [`then`](crate::FutureResult::then) continuation
/// increments it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    /// The scheduler refused to accept a task because shutdown had begun.
    ///
    /// This is also the outcome observed by `get` when the producing task was
    /// still queued at shutdown and never ran.
    SubmissionRefused {
        /// The stage whose task could not be scheduled or did not run.
        stage: usize,
    },
    /// A stage panicked while executing. The panic was captured by the worker
    /// and converted into this error; downstream stages are skipped.
    StageFailed {
        /// The stage that panicked.
        stage: usize,
        /// The panic payload, rendered as a string.
        message: String,
    },
}

impl TaskError {
    /// Returns the index of the stage this error is attributed to.
    pub fn stage(&self) -> usize {
        match self {
            TaskError::SubmissionRefused { stage } => *stage,
            TaskError::StageFailed { stage, .. } => *stage,
        }
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskError::SubmissionRefused { stage } => {
                write!(f, "task for stage {stage} was refused: scheduler is stopped")
            }
            TaskError::StageFailed { stage, message } => {
                write!(f, "stage {stage} failed: {message}")
            }
        }
    }
}

impl std::error::Error for TaskError {}
