//! Cooperative cancellation for dispatched renders
//!
//! Cancellation never preempts a worker. A job whose page was edited while it
//! was already dispatched gets its token set; the worker I/O thread checks the
//! token before handing the job to its process, and the coordinator discards
//! whatever result arrives for a cancelled job.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

/// Shared cancellation flag
///
/// All clones observe the same state.
///
/// # Example
///
/// ```
/// use diary_scheduler::CancellationToken;
///
/// let token = CancellationToken::new();
/// let io_thread_token = token.clone();
///
/// token.cancel();
/// assert!(io_thread_token.is_cancelled());
/// ```
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the job as cancelled; idempotent
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}
