//! Diary render scheduling
//!
//! Priority queue of page render jobs and the pool of isolated worker
//! processes that executes them.
//!
//! Jobs are served by priority class (current page, adjacent pages,
//! prefetch, background), oldest first within a class. Requests for a page
//! that already has a job attach to it as waiters, so one render fans out to
//! every caller.
//!
//! # Example
//!
//! ```
//! use diary_render::{Generation, PageId};
//! use diary_scheduler::{RenderPriority, RenderScheduler, Submission, Waiter};
//!
//! let mut scheduler = RenderScheduler::new();
//!
//! let (waiter, _result) = Waiter::channel();
//! let first = scheduler.request(PageId(3), Generation(1), RenderPriority::Prefetch, None);
//! let second =
//!     scheduler.request(PageId(3), Generation(1), RenderPriority::Current, Some(waiter));
//! assert_eq!(second, Submission::Attached(first.job_id()));
//!
//! let dispatch = scheduler.next_dispatch().unwrap();
//! assert_eq!(dispatch.priority, RenderPriority::Current);
//!
//! // The page is edited while the render runs
//! let fresh = scheduler.invalidate(PageId(3), Generation(2));
//! assert!(dispatch.token.is_cancelled());
//! assert!(fresh.is_some());
//! ```

mod cancel;
mod error;
mod priority;
mod scheduler;
mod worker;

pub use cancel::CancellationToken;
pub use error::{PoolError, RenderError};
pub use priority::{JobId, JobState, RenderJob, RenderPriority, RenderResult, Waiter};
pub use scheduler::{Dispatch, RenderScheduler, RetryDecision, SchedulerStats, Submission};
pub use worker::{
    JobFailure, JobOutcome, PoolEvent, PoolHealth, PoolStats, WorkOrder, WorkerCommand, WorkerHandle,
    WorkerId, WorkerPool, WorkerPoolConfig, WorkerStatus, DEFAULT_CRASH_THRESHOLD,
    DEFAULT_CRASH_WINDOW, DEFAULT_RENDER_TIMEOUT, DEFAULT_WORKER_COUNT,
};
