//! Render error taxonomy

use diary_render::PageId;
use std::io;
use std::time::Duration;

/// Error delivered to a page request
///
/// `Clone` so one failed render can be handed to every waiter of the job.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RenderError {
    /// Worker crash or timeout; retried internally and never surfaced on its own
    #[error("transient render failure: {0}")]
    Transient(String),

    /// The renderer rejected the page snapshot; retrying cannot help
    #[error("page cannot be rendered: {0}")]
    Permanent(String),

    #[error("render failed after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },

    #[error("render workers degraded: {crashes} crashes within {window:?}")]
    SystemDegraded { crashes: usize, window: Duration },

    #[error("render request dropped from a full queue")]
    QueueOverflow,

    #[error("{0} not found")]
    PageNotFound(PageId),

    #[error("render cache is shut down")]
    Disconnected,
}

impl RenderError {
    /// Whether asking for the page again may succeed
    pub fn is_retryable(&self) -> bool {
        !matches!(self, RenderError::Permanent(_) | RenderError::PageNotFound(_))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("failed to spawn render worker {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to locate the current executable: {0}")]
    CurrentExe(#[source] io::Error),

    #[error("render worker pool needs at least one worker")]
    NoWorkers,
}
