//! Coordinator state
//!
//! [`CacheCore`] holds everything the coordinator thread mutates: entries,
//! expected generations, the render scheduler and the last known worker
//! health. It has no threads or channels of its own. The coordinator feeds
//! it client commands and worker outcomes and forwards the work orders it
//! produces to the pool.

use crate::config::CacheConfig;
use crate::entry::{CacheEntry, EntryState, EntryStore};
use crate::generation::GenerationTable;
use crate::stats::CacheStats;
use crate::store::PageStore;
use diary_render::{Artifact, Bitmap, Generation, PageId, RenderRequest};
use diary_scheduler::{
    JobFailure, JobId, JobOutcome, PoolHealth, RenderError, RenderJob, RenderPriority, RenderScheduler,
    RetryDecision, Submission, Waiter, WorkOrder,
};
use log::{debug, error, info, warn};
use std::collections::HashSet;
use std::sync::Arc;

/// How a request was answered
#[derive(Debug)]
pub enum Lookup {
    Hit(Arc<Artifact>),
    Queued(Submission),
    Failed(RenderError),
}

pub struct CacheCore {
    config: CacheConfig,
    store: Arc<dyn PageStore>,
    entries: EntryStore,
    generations: GenerationTable,
    scheduler: RenderScheduler,
    health: PoolHealth,
    current_page: Option<PageId>,

    hits: u64,
    misses: u64,
    stale_results_discarded: u64,
    failures: u64,
}

impl CacheCore {
    pub fn new(config: CacheConfig, store: Arc<dyn PageStore>) -> Self {
        Self {
            entries: EntryStore::new(config.memory_budget_bytes),
            config,
            store,
            generations: GenerationTable::new(),
            scheduler: RenderScheduler::new(),
            health: PoolHealth::Healthy,
            current_page: None,
            hits: 0,
            misses: 0,
            stale_results_discarded: 0,
            failures: 0,
        }
    }

    /// Answer a request for a page
    ///
    /// `generation` is the caller's view of the page: a newer one than the
    /// cache knows acts as an invalidation, an older one is served at the
    /// current generation. Requests without a waiter are speculative; they
    /// are not counted as hits or misses and never retry a failed page.
    pub fn request(
        &mut self,
        page_id: PageId,
        generation: Option<Generation>,
        priority: RenderPriority,
        waiter: Option<Waiter>,
    ) -> Lookup {
        if let Some(generation) = generation {
            if self.generations.observe(page_id, generation) {
                self.advance_generation(page_id, generation);
            }
        }
        let generation = self.generations.current(page_id);
        let explicit = waiter.is_some();

        if let Some(artifact) = self.entries.lookup(page_id, generation) {
            if let Some(waiter) = waiter {
                self.hits += 1;
                waiter.resolve(Ok(artifact.clone()));
            }
            return Lookup::Hit(artifact);
        }
        if explicit {
            self.misses += 1;
        }

        if self.health.is_degraded() {
            let err = self.degraded_error();
            return self.reject(waiter, err);
        }
        if !self.store.contains(page_id) {
            return self.reject(waiter, RenderError::PageNotFound(page_id));
        }
        if let Some(CacheEntry { state: EntryState::Failed(err), generation: failed_gen, .. }) =
            self.entries.peek(page_id)
        {
            if !explicit && *failed_gen == generation {
                return Lookup::Failed(err.clone());
            }
        }

        let submission = self.scheduler.request(page_id, generation, priority, waiter);
        self.entries.mark_pending(page_id, generation);

        self.enforce_queue_limit();
        if self.scheduler.job(submission.job_id()).is_none() {
            return Lookup::Failed(RenderError::QueueOverflow);
        }
        Lookup::Queued(submission)
    }

    /// The page changed; returns its new generation
    ///
    /// Queued work for the old generation is dropped and a running render is
    /// marked so its result will be discarded. Callers still waiting are
    /// carried over to a render of the new generation.
    pub fn invalidate(&mut self, page_id: PageId) -> Generation {
        let generation = self.generations.bump(page_id);
        self.advance_generation(page_id, generation);
        generation
    }

    pub fn pin(&mut self, page_id: PageId) {
        self.entries.pin(page_id);
    }

    pub fn unpin(&mut self, page_id: PageId) {
        if self.entries.unpin(page_id) {
            self.entries.evict_if_needed();
        }
        if self.current_page == Some(page_id) {
            self.current_page = None;
        }
    }

    /// Make `page_id` the displayed page
    ///
    /// Moves the pin to it, requests it and its neighbours within the
    /// prefetch distance, and drops queued speculative work for pages that
    /// left the window.
    pub fn set_current_page(&mut self, page_id: PageId) {
        self.entries.unpin_all();
        self.entries.pin(page_id);
        self.current_page = Some(page_id);

        let pages = self.store.page_ids();
        let Some(index) = pages.iter().position(|id| *id == page_id) else {
            warn!("{page_id} is not in the page store");
            self.entries.evict_if_needed();
            return;
        };

        let reach = self.config.prefetch_distance.max(1);
        let first = index.saturating_sub(reach);
        let last = (index + reach).min(pages.len() - 1);
        let mut window: Vec<(usize, PageId)> =
            (first..=last).map(|i| (i.abs_diff(index), pages[i])).collect();
        window.sort_by_key(|(distance, _)| *distance);

        for (distance, page) in &window {
            let priority = RenderPriority::for_distance(*distance, self.config.prefetch_distance);
            self.request(*page, None, priority, None);
        }

        let keep: HashSet<PageId> = window.iter().map(|(_, page)| *page).collect();
        for job in self.scheduler.retain_speculative(|page| keep.contains(&page)) {
            self.entries.reset(job.page_id);
        }
        self.entries.evict_if_needed();
        debug!("current page {page_id}, window {first}..={last}");
    }

    pub fn set_memory_budget(&mut self, bytes: usize) {
        let evicted = self.entries.set_budget(bytes);
        info!("memory budget set to {bytes} bytes, evicted {} pages", evicted.len());
    }

    /// Work orders for up to `idle_workers` workers
    pub fn take_orders(&mut self, idle_workers: usize) -> Vec<WorkOrder> {
        let mut orders = Vec::new();
        while orders.len() < idle_workers {
            let Some(dispatch) = self.scheduler.next_dispatch() else {
                break;
            };
            let page_id = dispatch.page_id;

            let Some(snapshot) = self.store.get_page(page_id) else {
                if let Some(job) = self.scheduler.fail_permanent(dispatch.job_id, "page not found") {
                    self.fail_job(job, RenderError::PageNotFound(page_id));
                }
                continue;
            };

            let request = RenderRequest::new(
                dispatch.job_id.0,
                &snapshot,
                dispatch.generation,
                self.config.render_scale,
            );
            match request {
                Ok(request) => orders.push(WorkOrder {
                    job_id: dispatch.job_id,
                    request,
                    token: dispatch.token,
                }),
                Err(err) => {
                    let reason = format!("failed to encode page: {err}");
                    if let Some(job) = self.scheduler.fail_permanent(dispatch.job_id, &reason) {
                        self.fail_job(job, RenderError::Permanent(reason));
                    }
                }
            }
        }
        orders
    }

    /// Apply the outcome of a dispatched job
    pub fn on_outcome(&mut self, outcome: JobOutcome) {
        let JobOutcome { job_id, result } = outcome;
        match result {
            Ok(bitmap) => self.complete(job_id, bitmap),
            Err(JobFailure::Skipped) => {
                if let Some(job) = self.scheduler.discard(job_id) {
                    self.drop_stale(job, false);
                }
            }
            Err(JobFailure::Permanent(reason)) => {
                let Some(job) = self.scheduler.fail_permanent(job_id, &reason) else {
                    return;
                };
                if job.is_stale() {
                    self.drop_stale(job, true);
                } else {
                    warn!("{job_id}: {} cannot be rendered: {reason}", job.page_id);
                    self.fail_job(job, RenderError::Permanent(reason));
                }
            }
            Err(JobFailure::Transient(reason)) => {
                let degraded = self.health.is_degraded();
                let max_retries = if degraded { 0 } else { self.config.max_retries };
                match self.scheduler.fail_transient(job_id, &reason, max_retries) {
                    Some(RetryDecision::Requeued { .. }) => self.enforce_queue_limit(),
                    Some(RetryDecision::Exhausted(job)) => {
                        let err = if degraded {
                            self.degraded_error()
                        } else {
                            RenderError::RetriesExhausted { attempts: job.attempts, last: reason }
                        };
                        self.fail_job(job, err);
                    }
                    Some(RetryDecision::Stale(job)) => self.drop_stale(job, false),
                    None => debug!("{job_id}: failure for a job that is no longer running"),
                }
            }
        }
    }

    /// Record the worker pool's health
    ///
    /// Entering degraded mode fails every queued job.
    pub fn set_health(&mut self, health: PoolHealth) {
        let was_degraded = self.health.is_degraded();
        self.health = health;

        match (was_degraded, health) {
            (false, PoolHealth::Degraded { crashes, window }) => {
                error!("render workers degraded: {crashes} crashes within {window:?}");
                let err = self.degraded_error();
                for job in self.scheduler.drain_queued() {
                    self.fail_job(job, err.clone());
                }
            }
            (true, PoolHealth::Healthy) => info!("render workers recovered"),
            _ => {}
        }
    }

    pub fn health(&self) -> PoolHealth {
        self.health
    }

    pub fn current_page(&self) -> Option<PageId> {
        self.current_page
    }

    pub fn generation(&self, page_id: PageId) -> Generation {
        self.generations.current(page_id)
    }

    pub fn entry(&self, page_id: PageId) -> Option<&CacheEntry> {
        self.entries.peek(page_id)
    }

    /// Whether no job is queued or running
    pub fn is_idle(&self) -> bool {
        self.scheduler.is_idle()
    }

    /// Counters; the pool's are filled in by the coordinator
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits,
            misses: self.misses,
            evictions: self.entries.evictions(),
            current_size_bytes: self.entries.size_bytes(),
            memory_budget_bytes: self.entries.budget_bytes(),
            entries: self.entries.len(),
            pinned: self.entries.pinned_len(),
            stale_results_discarded: self.stale_results_discarded,
            failures: self.failures,
            degraded: self.health.is_degraded(),
            scheduler: self.scheduler.stats(),
            pool: Default::default(),
        }
    }

    fn complete(&mut self, job_id: JobId, bitmap: Bitmap) {
        let Some(mut job) = self.scheduler.finish(job_id) else {
            debug!("{job_id}: result for a job that is no longer running");
            return;
        };
        if job.is_stale() || job.generation != self.generations.current(job.page_id) {
            self.drop_stale(job, true);
            return;
        }

        let artifact = Arc::new(Artifact::from_bitmap(
            job.page_id,
            job.generation,
            self.config.render_scale,
            bitmap,
        ));
        let evicted = self.entries.store(artifact.clone());
        let delivered = job.resolve(&Ok(artifact));
        debug!(
            "{job_id}: {} {} cached for {delivered} waiters, {} evicted",
            job.page_id,
            job.generation,
            evicted.len()
        );
    }

    fn advance_generation(&mut self, page_id: PageId, generation: Generation) {
        let replacement = self.scheduler.invalidate(page_id, generation);
        self.entries.demote(page_id, generation, replacement.is_some());
        self.enforce_queue_limit();
    }

    /// Fail the least urgent queued jobs beyond `queue_depth_limit`
    fn enforce_queue_limit(&mut self) {
        for job in self.scheduler.enforce_depth_limit(self.config.queue_depth_limit) {
            self.fail_job(job, RenderError::QueueOverflow);
        }
    }

    /// Throw away a job whose page changed while it ran
    ///
    /// Waiters still attached are moved to a job for the current generation.
    fn drop_stale(&mut self, mut job: RenderJob, rendered: bool) {
        if rendered {
            self.stale_results_discarded += 1;
        }
        let current = self.generations.current(job.page_id);
        info!("{}: dropped {} {}, page is at {current}", job.id, job.page_id, job.generation);

        let waiters = std::mem::take(&mut job.waiters);
        if waiters.is_empty() {
            return;
        }
        for waiter in waiters {
            self.scheduler.request(job.page_id, current, job.priority, Some(waiter));
        }
        self.entries.mark_pending(job.page_id, current);
        self.enforce_queue_limit();
    }

    /// Resolve every waiter of `job` with `err`
    fn fail_job(&mut self, mut job: RenderJob, err: RenderError) {
        let page_id = job.page_id;
        let has_live_job = self.scheduler.live_job(page_id).is_some();
        let remembered = matches!(
            err,
            RenderError::Permanent(_) | RenderError::RetriesExhausted { .. }
        );

        if remembered && !has_live_job && job.generation == self.generations.current(page_id) {
            self.entries.mark_failed(page_id, job.generation, err.clone());
        } else if !has_live_job {
            self.entries.reset(page_id);
        }

        let delivered = job.resolve(&Err(err));
        self.failures += delivered as u64;
    }

    fn reject(&mut self, waiter: Option<Waiter>, err: RenderError) -> Lookup {
        if let Some(waiter) = waiter {
            self.failures += 1;
            waiter.resolve(Err(err.clone()));
        }
        Lookup::Failed(err)
    }

    fn degraded_error(&self) -> RenderError {
        match self.health {
            PoolHealth::Degraded { crashes, window } => {
                RenderError::SystemDegraded { crashes, window }
            }
            PoolHealth::Healthy => {
                RenderError::SystemDegraded { crashes: 0, window: self.config.crash_window }
            }
        }
    }
}
