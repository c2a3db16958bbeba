//! The seam between this crate and the host's event loop.
//!
//! The manager never runs user code on its worker thread; completions and
//! the wakeup batching timer are handed to the host through this trait.

use std::time::Duration;

/// A unit of work to run on the reactor thread.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Handle to the host process's single-threaded event loop.
///
/// Implementations must run every task on the same thread, in submission
/// order for [`post`](Reactor::post). Both methods may be called from any
/// thread and must not block the caller.
pub trait Reactor: Send + Sync + 'static {
    /// Run `task` on the reactor thread as soon as possible.
    fn post(&self, task: Task);

    /// Run `task` on the reactor thread once `delay` has elapsed.
    fn post_after(&self, delay: Duration, task: Task);
}
