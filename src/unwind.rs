//! Unwinding recovery utilities taken from rayon.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::panic::catch_unwind;
use std::panic::resume_unwind;
use std::process::abort;
use std::thread::Result;

/// Executes `f` and captures any panic, translating that panic into a
/// `Err` result. The assumption is that any panic will be propagated
/// later with `resume_unwinding` (or routed into a future cell), and
/// hence `f` can be treated as exception safe.
#[inline(always)]
pub fn halt_unwinding<F, R>(func: F) -> Result<R>
where
    F: FnOnce() -> R,
{
    catch_unwind(AssertUnwindSafe(func))
}

#[cold]
pub fn resume_unwinding(payload: Box<dyn Any + Send>) -> ! {
    resume_unwind(payload)
}

/// Renders a captured panic payload as a string, for embedding in a
/// [`TaskError`](crate::TaskError).
pub fn payload_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "task panicked".to_string()
    }
}

/// Aborts the program when dropped.
pub struct AbortOnDrop;

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        eprintln!("millrace: detected unexpected panic; aborting");
        abort();
    }
}
