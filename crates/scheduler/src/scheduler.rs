//! Render scheduler
//!
//! Orders, deduplicates and retries render jobs. The scheduler is owned by a
//! single coordinator and has no internal locking; every method takes
//! `&mut self`.
//!
//! Per page there is at most one *live* job (the one new requests attach to)
//! and at most one *dispatched* job. The two differ only when the page was
//! edited while a render was running: the old job keeps its worker until it
//! reports back, its cancellation token is set, and a fresh job for the new
//! generation waits in the queue until the page is free again.

use crate::cancel::CancellationToken;
use crate::priority::{JobId, JobState, QueueKey, RenderJob, RenderPriority, Waiter};
use diary_render::{Generation, PageId};
use log::{debug, info, warn};
use std::collections::{BinaryHeap, HashMap};

/// Scheduler statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Jobs created
    pub jobs_submitted: u64,

    /// Jobs whose worker reported a result
    pub jobs_completed: u64,

    /// Jobs cancelled by invalidation or pruning
    pub jobs_cancelled: u64,

    /// Jobs dropped by the queue depth limit
    pub jobs_dropped: u64,

    /// Failed attempts that were put back into the queue
    pub retries: u64,

    /// Requests that attached to an existing job instead of creating one
    pub waiters_attached: u64,

    /// Jobs waiting in the queue
    pub queue_size: usize,

    /// Jobs running on a worker
    pub in_flight: usize,
}

/// How a request was absorbed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    Created(JobId),
    Attached(JobId),
}

impl Submission {
    pub fn job_id(self) -> JobId {
        match self {
            Submission::Created(id) | Submission::Attached(id) => id,
        }
    }
}

/// A job handed out for execution
#[derive(Debug, Clone)]
pub struct Dispatch {
    pub job_id: JobId,
    pub page_id: PageId,
    pub generation: Generation,
    pub priority: RenderPriority,
    /// Failed attempts before this one
    pub attempt: u32,
    pub token: CancellationToken,
}

/// What happened to a job after a transient failure
#[derive(Debug)]
pub enum RetryDecision {
    /// Back in the queue at its original priority
    Requeued { attempts: u32 },

    /// Out of attempts; the job is returned so its waiters can be resolved
    Exhausted(RenderJob),

    /// The page changed meanwhile; the job is dropped without a retry
    Stale(RenderJob),
}

/// Priority queue of render jobs with deduplication and retries
#[derive(Debug, Default)]
pub struct RenderScheduler {
    /// Queued and dispatched jobs
    jobs: HashMap<JobId, RenderJob>,

    /// Queue order; entries that no longer match their job are skipped
    heap: BinaryHeap<QueueKey>,

    /// Job new requests for a page attach to
    live: HashMap<PageId, JobId>,

    /// Job currently running for a page
    dispatched: HashMap<PageId, JobId>,

    next_job_id: u64,
    arrival_counter: u64,
    stats: SchedulerStats,
}

impl RenderScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a render of `page_id` at `generation`
    ///
    /// A request for the page+generation of the live job attaches to it, and
    /// a more urgent request promotes the job without changing its place
    /// among jobs of the new class. A request for a newer generation
    /// supersedes the live job; one for an older generation attaches to the
    /// newer job, since only the newest content may be shown.
    pub fn request(
        &mut self,
        page_id: PageId,
        generation: Generation,
        priority: RenderPriority,
        waiter: Option<Waiter>,
    ) -> Submission {
        if let Some(live_gen) = self.live_job(page_id).map(|job| job.generation) {
            if generation > live_gen {
                self.invalidate(page_id, generation);
            }
        }

        if let Some(job_id) = self.live.get(&page_id).copied() {
            if let Some(job) = self.jobs.get_mut(&job_id) {
                if let Some(waiter) = waiter {
                    job.waiters.push(waiter);
                    self.stats.waiters_attached += 1;
                }
                if priority.is_more_urgent_than(job.priority) {
                    debug!("{job_id}: promoted {:?} -> {:?}", job.priority, priority);
                    job.priority = priority;
                    if job.state == JobState::Queued {
                        self.heap.push(job.queue_key());
                    }
                }
                return Submission::Attached(job_id);
            }
        }

        let job_id = self.create(page_id, generation, priority, waiter.into_iter().collect());
        Submission::Created(job_id)
    }

    /// Take the most urgent queued job whose page has nothing in flight
    pub fn next_dispatch(&mut self) -> Option<Dispatch> {
        let mut deferred = Vec::new();
        let mut found = None;

        while let Some(key) = self.heap.pop() {
            let Some(job) = self.jobs.get_mut(&key.job_id) else {
                continue;
            };
            if job.state != JobState::Queued || job.queue_key() != key {
                continue;
            }
            if self.dispatched.contains_key(&job.page_id) {
                deferred.push(key);
                continue;
            }

            job.advance(JobState::Dispatched);
            self.dispatched.insert(job.page_id, job.id);
            debug!("{}: dispatch {} {} ({:?})", job.id, job.page_id, job.generation, job.priority);

            found = Some(Dispatch {
                job_id: job.id,
                page_id: job.page_id,
                generation: job.generation,
                priority: job.priority,
                attempt: job.attempts,
                token: job.token().clone(),
            });
            break;
        }

        self.heap.extend(deferred);
        found
    }

    /// Record a result for a dispatched job and hand the job back
    ///
    /// The caller decides whether the result is still current; a stale job
    /// comes back with [`RenderJob::is_stale`] set.
    pub fn finish(&mut self, job_id: JobId) -> Option<RenderJob> {
        let mut job = self.take_dispatched(job_id)?;
        job.advance(JobState::Completed);
        self.stats.jobs_completed += 1;
        Some(job)
    }

    /// Record a permanent failure for a dispatched job
    pub fn fail_permanent(&mut self, job_id: JobId, reason: &str) -> Option<RenderJob> {
        let mut job = self.take_dispatched(job_id)?;
        job.attempts += 1;
        job.last_error = Some(reason.to_string());
        job.advance(JobState::Failed);
        Some(job)
    }

    /// Record a crash or timeout of a dispatched job
    ///
    /// The job is requeued while `attempts <= max_retries`, so a job is tried
    /// at most `max_retries + 1` times.
    pub fn fail_transient(
        &mut self,
        job_id: JobId,
        reason: &str,
        max_retries: u32,
    ) -> Option<RetryDecision> {
        let job = self.jobs.get(&job_id)?;
        if job.state != JobState::Dispatched {
            return None;
        }

        if job.is_stale() {
            let job = self.discard(job_id)?;
            return Some(RetryDecision::Stale(job));
        }

        let page_id = job.page_id;
        self.release_page(page_id, job_id);

        let job = self.jobs.get_mut(&job_id)?;
        job.attempts += 1;
        job.last_error = Some(reason.to_string());
        job.advance(JobState::TimedOut);

        if job.attempts <= max_retries {
            job.advance(JobState::Queued);
            let attempts = job.attempts;
            self.heap.push(job.queue_key());
            self.stats.retries += 1;
            info!("{job_id}: attempt {attempts} failed ({reason}), requeued");
            return Some(RetryDecision::Requeued { attempts });
        }

        job.advance(JobState::Failed);
        warn!("{job_id}: giving up after {} attempts ({reason})", job.attempts);
        let job = self.remove(job_id)?;
        Some(RetryDecision::Exhausted(job))
    }

    /// Drop a dispatched job whose result will be ignored
    pub fn discard(&mut self, job_id: JobId) -> Option<RenderJob> {
        let mut job = self.take_dispatched(job_id)?;
        job.advance(JobState::Cancelled);
        self.stats.jobs_cancelled += 1;
        Some(job)
    }

    /// Mark a dispatched job so its result will be discarded
    pub fn cancel_dispatched(&mut self, job_id: JobId) -> bool {
        let Some(job) = self.jobs.get(&job_id) else {
            return false;
        };
        if job.state != JobState::Dispatched {
            return false;
        }

        job.token().cancel();
        let page_id = job.page_id;
        if self.live.get(&page_id) == Some(&job_id) {
            self.live.remove(&page_id);
        }
        true
    }

    /// The page was edited and now stands at `new_generation`
    ///
    /// A queued job for an older generation is removed, a dispatched one is
    /// cancelled. Waiters of the old job move to a fresh job at the new
    /// generation with the same priority, whose id is returned.
    pub fn invalidate(&mut self, page_id: PageId, new_generation: Generation) -> Option<JobId> {
        let job_id = *self.live.get(&page_id)?;
        let job = self.jobs.get_mut(&job_id)?;
        if job.generation >= new_generation {
            return None;
        }

        let waiters = std::mem::take(&mut job.waiters);
        let priority = job.priority;
        let old_generation = job.generation;

        match job.state {
            JobState::Queued => {
                job.advance(JobState::Cancelled);
                self.remove(job_id);
                self.stats.jobs_cancelled += 1;
            }
            _ => {
                self.cancel_dispatched(job_id);
            }
        }
        self.live.remove(&page_id);
        info!("{page_id}: {old_generation} invalidated by {new_generation}, {job_id} dropped");

        if waiters.is_empty() {
            return None;
        }
        Some(self.create(page_id, new_generation, priority, waiters))
    }

    /// Drop queued jobs nobody waits for whose page fails `keep`
    pub fn retain_speculative<F>(&mut self, keep: F) -> Vec<RenderJob>
    where
        F: Fn(PageId) -> bool,
    {
        let doomed: Vec<JobId> = self
            .jobs
            .values()
            .filter(|job| job.state == JobState::Queued && !job.has_waiters())
            .filter(|job| !keep(job.page_id))
            .map(|job| job.id)
            .collect();

        let removed = self.remove_queued(&doomed);
        self.stats.jobs_cancelled += removed.len() as u64;
        if !removed.is_empty() {
            debug!("pruned {} speculative jobs", removed.len());
        }
        removed
    }

    /// Keep at most `limit` queued jobs, dropping the least urgent, latest
    /// arrivals first
    pub fn enforce_depth_limit(&mut self, limit: usize) -> Vec<RenderJob> {
        let mut queued: Vec<QueueKey> = self
            .jobs
            .values()
            .filter(|job| job.state == JobState::Queued)
            .map(RenderJob::queue_key)
            .collect();
        if queued.len() <= limit {
            return Vec::new();
        }

        // Most urgent first, so the tail is what goes
        queued.sort_by(|a, b| b.cmp(a));
        let doomed: Vec<JobId> = queued[limit..].iter().rev().map(|key| key.job_id).collect();

        let removed = self.remove_queued(&doomed);
        self.stats.jobs_dropped += removed.len() as u64;
        warn!("queue over its limit of {limit}, dropped {} jobs", removed.len());
        removed
    }

    /// Remove every queued job, most urgent first
    pub fn drain_queued(&mut self) -> Vec<RenderJob> {
        let mut queued: Vec<QueueKey> = self
            .jobs
            .values()
            .filter(|job| job.state == JobState::Queued)
            .map(RenderJob::queue_key)
            .collect();
        queued.sort_by(|a, b| b.cmp(a));

        let ids: Vec<JobId> = queued.into_iter().map(|key| key.job_id).collect();
        let removed = self.remove_queued(&ids);
        self.stats.jobs_cancelled += removed.len() as u64;
        self.heap.clear();
        removed
    }

    pub fn job(&self, job_id: JobId) -> Option<&RenderJob> {
        self.jobs.get(&job_id)
    }

    /// The job new requests for `page_id` would attach to
    pub fn live_job(&self, page_id: PageId) -> Option<&RenderJob> {
        self.live.get(&page_id).and_then(|id| self.jobs.get(id))
    }

    pub fn queued_len(&self) -> usize {
        self.jobs.values().filter(|job| job.state == JobState::Queued).count()
    }

    pub fn in_flight(&self) -> usize {
        self.dispatched.len()
    }

    pub fn is_idle(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            queue_size: self.queued_len(),
            in_flight: self.in_flight(),
            ..self.stats.clone()
        }
    }

    fn create(
        &mut self,
        page_id: PageId,
        generation: Generation,
        priority: RenderPriority,
        waiters: Vec<Waiter>,
    ) -> JobId {
        self.next_job_id += 1;
        let job_id = JobId(self.next_job_id);
        let arrival = self.arrival_counter;
        self.arrival_counter += 1;

        let mut job = RenderJob::new(job_id, page_id, generation, priority, arrival);
        job.waiters = waiters;

        self.heap.push(job.queue_key());
        self.live.insert(page_id, job_id);
        self.jobs.insert(job_id, job);
        self.stats.jobs_submitted += 1;
        debug!("{job_id}: queued {page_id} {generation} ({priority:?})");
        job_id
    }

    fn take_dispatched(&mut self, job_id: JobId) -> Option<RenderJob> {
        if self.jobs.get(&job_id)?.state != JobState::Dispatched {
            return None;
        }
        self.remove(job_id)
    }

    fn remove_queued(&mut self, ids: &[JobId]) -> Vec<RenderJob> {
        ids.iter()
            .filter_map(|id| {
                let mut job = self.remove(*id)?;
                job.advance(JobState::Cancelled);
                Some(job)
            })
            .collect()
    }

    fn remove(&mut self, job_id: JobId) -> Option<RenderJob> {
        let job = self.jobs.remove(&job_id)?;
        if self.live.get(&job.page_id) == Some(&job_id) {
            self.live.remove(&job.page_id);
        }
        self.release_page(job.page_id, job_id);
        Some(job)
    }

    fn release_page(&mut self, page_id: PageId, job_id: JobId) {
        if self.dispatched.get(&page_id) == Some(&job_id) {
            self.dispatched.remove(&page_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RenderError;

    const P1: PageId = PageId(1);
    const P2: PageId = PageId(2);
    const G1: Generation = Generation(1);
    const G2: Generation = Generation(2);

    #[test]
    fn test_dispatch_order_by_class_then_arrival() {
        let mut scheduler = RenderScheduler::new();
        scheduler.request(PageId(1), G1, RenderPriority::Background, None);
        scheduler.request(PageId(2), G1, RenderPriority::Adjacent, None);
        scheduler.request(PageId(3), G1, RenderPriority::Current, None);
        scheduler.request(PageId(4), G1, RenderPriority::Adjacent, None);

        let order: Vec<u64> =
            std::iter::from_fn(|| scheduler.next_dispatch()).map(|d| d.page_id.0).collect();
        assert_eq!(order, vec![3, 2, 4, 1]);
        assert_eq!(scheduler.in_flight(), 4);
    }

    #[test]
    fn test_duplicate_requests_attach_as_waiters() {
        let mut scheduler = RenderScheduler::new();
        let (w1, _rx1) = Waiter::channel();
        let (w2, _rx2) = Waiter::channel();
        let (w3, _rx3) = Waiter::channel();

        let first = scheduler.request(P1, G1, RenderPriority::Prefetch, Some(w1));
        let second = scheduler.request(P1, G1, RenderPriority::Prefetch, Some(w2));
        assert!(matches!(first, Submission::Created(_)));
        assert_eq!(second, Submission::Attached(first.job_id()));

        // Still attaches once the job is running
        scheduler.next_dispatch().unwrap();
        let third = scheduler.request(P1, G1, RenderPriority::Current, Some(w3));
        assert_eq!(third, Submission::Attached(first.job_id()));

        let stats = scheduler.stats();
        assert_eq!(stats.jobs_submitted, 1);
        assert_eq!(stats.waiters_attached, 2);
        assert_eq!(scheduler.job(first.job_id()).unwrap().waiters.len(), 3);
    }

    #[test]
    fn test_attach_promotes_priority() {
        let mut scheduler = RenderScheduler::new();
        scheduler.request(P1, G1, RenderPriority::Background, None);
        scheduler.request(P2, G1, RenderPriority::Current, None);
        scheduler.request(PageId(3), G1, RenderPriority::Adjacent, None);

        // Page 1 becomes current; it arrived before page 2 so it goes first
        scheduler.request(P1, G1, RenderPriority::Current, None);

        let order: Vec<u64> =
            std::iter::from_fn(|| scheduler.next_dispatch()).map(|d| d.page_id.0).collect();
        assert_eq!(order, vec![1, 2, 3]);
    }

    #[test]
    fn test_one_dispatch_per_page() {
        let mut scheduler = RenderScheduler::new();
        let (waiter, _rx) = Waiter::channel();
        scheduler.request(P1, G1, RenderPriority::Current, Some(waiter));
        let running = scheduler.next_dispatch().unwrap();

        // Page edited while rendering: new job waits for the old one
        let replacement = scheduler.invalidate(P1, G2).unwrap();
        scheduler.request(P2, G1, RenderPriority::Background, None);

        let next = scheduler.next_dispatch().unwrap();
        assert_eq!(next.page_id, P2);
        assert!(scheduler.next_dispatch().is_none());

        // Old job reports back and is recognized as stale
        let finished = scheduler.finish(running.job_id).unwrap();
        assert!(finished.is_stale());
        assert!(finished.waiters.is_empty());

        let next = scheduler.next_dispatch().unwrap();
        assert_eq!(next.job_id, replacement);
        assert_eq!(next.generation, G2);
        assert_eq!(scheduler.job(replacement).unwrap().waiters.len(), 1);
    }

    #[test]
    fn test_invalidate_drops_queued_job() {
        let mut scheduler = RenderScheduler::new();
        let old = scheduler.request(P1, G1, RenderPriority::Prefetch, None).job_id();

        assert_eq!(scheduler.invalidate(P1, G2), None);
        assert!(scheduler.job(old).is_none());
        assert!(scheduler.next_dispatch().is_none());
        assert_eq!(scheduler.stats().jobs_cancelled, 1);
    }

    #[test]
    fn test_invalidate_ignores_current_generation() {
        let mut scheduler = RenderScheduler::new();
        let job = scheduler.request(P1, G2, RenderPriority::Current, None).job_id();
        assert_eq!(scheduler.invalidate(P1, G2), None);
        assert_eq!(scheduler.invalidate(P1, G1), None);
        assert!(scheduler.job(job).is_some());
    }

    #[test]
    fn test_newer_generation_request_supersedes() {
        let mut scheduler = RenderScheduler::new();
        let (w1, rx1) = Waiter::channel();
        let (w2, _rx2) = Waiter::channel();
        let old = scheduler.request(P1, G1, RenderPriority::Current, Some(w1)).job_id();
        let new = scheduler.request(P1, G2, RenderPriority::Current, Some(w2));

        assert!(matches!(new, Submission::Attached(_)));
        assert_ne!(new.job_id(), old);
        let job = scheduler.live_job(P1).unwrap();
        assert_eq!(job.generation, G2);
        assert_eq!(job.waiters.len(), 2);
        assert!(rx1.is_empty());
    }

    #[test]
    fn test_retry_then_exhaust() {
        let mut scheduler = RenderScheduler::new();
        let (waiter, _rx) = Waiter::channel();
        let job_id = scheduler.request(P1, G1, RenderPriority::Current, Some(waiter)).job_id();

        for attempt in 1..=2 {
            let dispatch = scheduler.next_dispatch().unwrap();
            assert_eq!(dispatch.attempt, attempt - 1);
            match scheduler.fail_transient(job_id, "worker crashed", 2).unwrap() {
                RetryDecision::Requeued { attempts } => assert_eq!(attempts, attempt),
                other => panic!("expected requeue, got {other:?}"),
            }
        }

        scheduler.next_dispatch().unwrap();
        match scheduler.fail_transient(job_id, "worker crashed", 2).unwrap() {
            RetryDecision::Exhausted(job) => {
                assert_eq!(job.attempts, 3);
                assert_eq!(job.state, JobState::Failed);
                assert_eq!(job.waiters.len(), 1);
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
        assert!(scheduler.is_idle());
        assert_eq!(scheduler.stats().retries, 2);
    }

    #[test]
    fn test_requeued_job_keeps_its_place() {
        let mut scheduler = RenderScheduler::new();
        let first = scheduler.request(P1, G1, RenderPriority::Adjacent, None).job_id();
        scheduler.next_dispatch().unwrap();
        scheduler.request(P2, G1, RenderPriority::Adjacent, None);

        scheduler.fail_transient(first, "timeout", 2);
        assert_eq!(scheduler.next_dispatch().unwrap().job_id, first);
    }

    #[test]
    fn test_transient_failure_of_stale_job_is_not_retried() {
        let mut scheduler = RenderScheduler::new();
        let job_id = scheduler.request(P1, G1, RenderPriority::Current, None).job_id();
        scheduler.next_dispatch().unwrap();
        scheduler.cancel_dispatched(job_id);

        assert!(matches!(
            scheduler.fail_transient(job_id, "crash", 5),
            Some(RetryDecision::Stale(_))
        ));
        assert!(scheduler.is_idle());
    }

    #[test]
    fn test_failures_for_unknown_jobs_are_ignored() {
        let mut scheduler = RenderScheduler::new();
        let job_id = scheduler.request(P1, G1, RenderPriority::Current, None).job_id();

        // Queued, not dispatched
        assert!(scheduler.finish(job_id).is_none());
        assert!(scheduler.fail_transient(job_id, "x", 1).is_none());
        assert!(scheduler.fail_transient(JobId(99), "x", 1).is_none());
    }

    #[test]
    fn test_depth_limit_drops_least_urgent() {
        let mut scheduler = RenderScheduler::new();
        let (waiter, rx) = Waiter::channel();
        scheduler.request(PageId(1), G1, RenderPriority::Current, None);
        scheduler.request(PageId(2), G1, RenderPriority::Background, Some(waiter));
        scheduler.request(PageId(3), G1, RenderPriority::Background, None);
        scheduler.request(PageId(4), G1, RenderPriority::Prefetch, None);

        let mut dropped = scheduler.enforce_depth_limit(2);
        let pages: Vec<u64> = dropped.iter().map(|job| job.page_id.0).collect();
        assert_eq!(pages, vec![3, 2]);
        assert_eq!(scheduler.queued_len(), 2);
        assert_eq!(scheduler.stats().jobs_dropped, 2);

        for job in &mut dropped {
            job.resolve(&Err(RenderError::QueueOverflow));
        }
        assert_eq!(rx.try_recv().unwrap(), Err(RenderError::QueueOverflow));
    }

    #[test]
    fn test_retain_speculative_keeps_waited_jobs() {
        let mut scheduler = RenderScheduler::new();
        let (waiter, _rx) = Waiter::channel();
        scheduler.request(PageId(1), G1, RenderPriority::Background, Some(waiter));
        scheduler.request(PageId(2), G1, RenderPriority::Background, None);
        scheduler.request(PageId(3), G1, RenderPriority::Prefetch, None);

        let removed = scheduler.retain_speculative(|page| page == PageId(3));
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].page_id, PageId(2));
        assert!(scheduler.live_job(PageId(1)).is_some());
        assert!(scheduler.live_job(PageId(2)).is_none());
    }

    #[test]
    fn test_drain_queued_leaves_dispatched() {
        let mut scheduler = RenderScheduler::new();
        scheduler.request(PageId(1), G1, RenderPriority::Current, None);
        scheduler.next_dispatch().unwrap();
        scheduler.request(PageId(2), G1, RenderPriority::Background, None);
        scheduler.request(PageId(3), G1, RenderPriority::Adjacent, None);

        let drained: Vec<u64> = scheduler.drain_queued().iter().map(|j| j.page_id.0).collect();
        assert_eq!(drained, vec![3, 2]);
        assert_eq!(scheduler.in_flight(), 1);
        assert!(scheduler.next_dispatch().is_none());
    }
}
