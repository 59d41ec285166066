//! Render jobs and their priorities
//!
//! Jobs are served by priority class first (lowest class number first), then
//! by arrival order within a class.

use crate::cancel::CancellationToken;
use crate::error::RenderError;
use diary_render::{Artifact, Generation, PageId};
use log::warn;
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

/// Result handed to everyone waiting on a page
pub type RenderResult = Result<Arc<Artifact>, RenderError>;

/// Render priority classes
///
/// Lower classes are served first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RenderPriority {
    /// The page currently on screen
    Current = 0,

    /// Pages right next to the current one
    Adjacent = 1,

    /// Explicit prefetch
    Prefetch = 2,

    /// Speculative background work
    Background = 3,
}

impl RenderPriority {
    /// Priority class for a page `distance` pages away from the current page
    pub fn for_distance(distance: usize, prefetch_distance: usize) -> Self {
        match distance {
            0 => RenderPriority::Current,
            1 => RenderPriority::Adjacent,
            d if d <= prefetch_distance => RenderPriority::Prefetch,
            _ => RenderPriority::Background,
        }
    }

    pub fn class(self) -> u8 {
        self as u8
    }

    /// Whether `self` should be served before `other`
    pub fn is_more_urgent_than(self, other: RenderPriority) -> bool {
        self < other
    }
}

/// Unique job identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job#{}", self.0)
    }
}

/// Lifecycle of a render job
///
/// ```text
/// Queued -> Dispatched -> { Completed, Cancelled, TimedOut, Failed }
/// TimedOut -> { Queued, Failed }
/// Queued -> { Cancelled, Failed }
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobState {
    Queued,
    Dispatched,
    Completed,
    Cancelled,
    TimedOut,
    Failed,
}

impl JobState {
    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Queued, Dispatched)
                | (Queued, Cancelled)
                | (Queued, Failed)
                | (Dispatched, Completed)
                | (Dispatched, Cancelled)
                | (Dispatched, TimedOut)
                | (Dispatched, Failed)
                | (TimedOut, Queued)
                | (TimedOut, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Cancelled | JobState::Failed)
    }
}

/// Handle to a caller waiting for a page render
#[derive(Debug, Clone)]
pub struct Waiter {
    tx: flume::Sender<RenderResult>,
}

impl Waiter {
    /// Create a waiter and the receiving end the caller keeps
    pub fn channel() -> (Waiter, flume::Receiver<RenderResult>) {
        let (tx, rx) = flume::bounded(1);
        (Waiter { tx }, rx)
    }

    /// Deliver the result; returns false when the caller has gone away
    pub fn resolve(self, result: RenderResult) -> bool {
        self.tx.send(result).is_ok()
    }

    /// Whether the receiving end has been dropped
    pub fn is_abandoned(&self) -> bool {
        self.tx.is_disconnected()
    }
}

/// A pending or running render of one page at one generation
#[derive(Debug)]
pub struct RenderJob {
    pub id: JobId,
    pub page_id: PageId,
    pub generation: Generation,
    pub priority: RenderPriority,
    pub state: JobState,

    /// Number of failed attempts so far
    pub attempts: u32,

    pub waiters: Vec<Waiter>,

    /// Reason of the most recent failed attempt
    pub last_error: Option<String>,

    arrival: u64,
    token: CancellationToken,
}

impl RenderJob {
    pub(crate) fn new(
        id: JobId,
        page_id: PageId,
        generation: Generation,
        priority: RenderPriority,
        arrival: u64,
    ) -> Self {
        Self {
            id,
            page_id,
            generation,
            priority,
            state: JobState::Queued,
            attempts: 0,
            waiters: Vec::new(),
            last_error: None,
            arrival,
            token: CancellationToken::new(),
        }
    }

    /// Position in arrival order, used to break ties within a class
    pub fn arrival(&self) -> u64 {
        self.arrival
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Whether the page changed after this job was dispatched
    pub fn is_stale(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn has_waiters(&self) -> bool {
        self.waiters.iter().any(|waiter| !waiter.is_abandoned())
    }

    /// Move to `next`, refusing transitions the lifecycle does not allow
    pub fn advance(&mut self, next: JobState) -> bool {
        if !self.state.can_transition_to(next) {
            warn!("{}: refusing transition {:?} -> {:?}", self.id, self.state, next);
            return false;
        }
        self.state = next;
        true
    }

    /// Hand `result` to every waiter; returns how many were still listening
    pub fn resolve(&mut self, result: &RenderResult) -> usize {
        let mut delivered = 0;
        for waiter in self.waiters.drain(..) {
            if waiter.resolve(result.clone()) {
                delivered += 1;
            }
        }
        delivered
    }

    pub(crate) fn queue_key(&self) -> QueueKey {
        QueueKey { priority: self.priority, arrival: self.arrival, job_id: self.id }
    }
}

/// Heap entry for a queued job
///
/// `BinaryHeap` is a max heap, so the ordering is reversed: the most urgent
/// class and the earliest arrival compare greatest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct QueueKey {
    pub priority: RenderPriority,
    pub arrival: u64,
    pub job_id: JobId,
}

impl PartialOrd for QueueKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueKey {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.arrival.cmp(&self.arrival))
            .then_with(|| other.job_id.cmp(&self.job_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BinaryHeap;

    #[test]
    fn test_priority_ordering() {
        assert!(RenderPriority::Current.is_more_urgent_than(RenderPriority::Adjacent));
        assert!(RenderPriority::Adjacent.is_more_urgent_than(RenderPriority::Prefetch));
        assert!(RenderPriority::Prefetch.is_more_urgent_than(RenderPriority::Background));
        assert_eq!(RenderPriority::Background.class(), 3);
    }

    #[test]
    fn test_priority_for_distance() {
        assert_eq!(RenderPriority::for_distance(0, 2), RenderPriority::Current);
        assert_eq!(RenderPriority::for_distance(1, 2), RenderPriority::Adjacent);
        assert_eq!(RenderPriority::for_distance(2, 2), RenderPriority::Prefetch);
        assert_eq!(RenderPriority::for_distance(3, 2), RenderPriority::Background);
        assert_eq!(RenderPriority::for_distance(1, 0), RenderPriority::Adjacent);
    }

    #[test]
    fn test_state_transitions() {
        assert!(JobState::Queued.can_transition_to(JobState::Dispatched));
        assert!(JobState::Dispatched.can_transition_to(JobState::TimedOut));
        assert!(JobState::TimedOut.can_transition_to(JobState::Queued));
        assert!(JobState::TimedOut.can_transition_to(JobState::Failed));
        assert!(!JobState::Queued.can_transition_to(JobState::Completed));
        assert!(!JobState::Completed.can_transition_to(JobState::Queued));
        assert!(JobState::Cancelled.is_terminal());
    }

    #[test]
    fn test_advance_refuses_invalid_transition() {
        let mut job = RenderJob::new(JobId(1), PageId(1), Generation(1), RenderPriority::Current, 0);
        assert!(!job.advance(JobState::Completed));
        assert_eq!(job.state, JobState::Queued);
        assert!(job.advance(JobState::Dispatched));
        assert!(job.advance(JobState::Completed));
    }

    #[test]
    fn test_queue_key_heap_order() {
        let mut heap = BinaryHeap::new();
        heap.push(QueueKey { priority: RenderPriority::Background, arrival: 0, job_id: JobId(1) });
        heap.push(QueueKey { priority: RenderPriority::Current, arrival: 2, job_id: JobId(2) });
        heap.push(QueueKey { priority: RenderPriority::Current, arrival: 1, job_id: JobId(3) });
        heap.push(QueueKey { priority: RenderPriority::Adjacent, arrival: 3, job_id: JobId(4) });

        let order: Vec<_> = std::iter::from_fn(|| heap.pop()).map(|k| k.job_id.0).collect();
        assert_eq!(order, vec![3, 2, 4, 1]);
    }

    #[test]
    fn test_resolve_reaches_live_waiters_only() {
        let mut job = RenderJob::new(JobId(1), PageId(1), Generation(1), RenderPriority::Current, 0);
        let (first, first_rx) = Waiter::channel();
        let (second, second_rx) = Waiter::channel();
        job.waiters.push(first);
        job.waiters.push(second);
        drop(second_rx);

        assert!(job.has_waiters());
        let delivered = job.resolve(&Err(RenderError::QueueOverflow));
        assert_eq!(delivered, 1);
        assert_eq!(first_rx.try_recv().unwrap(), Err(RenderError::QueueOverflow));
        assert!(job.waiters.is_empty());
    }
}
