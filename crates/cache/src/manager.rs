//! Client handle and coordinator thread
//!
//! [`CacheManager`] is a cheap handle that turns every call into a command
//! on a channel. A single coordinator thread owns the [`CacheCore`] and the
//! [`WorkerPool`]; it waits on client commands and worker events at the
//! same time, with a deadline at the earliest render timeout.

use crate::config::CacheConfig;
use crate::core::CacheCore;
use crate::error::CacheError;
use crate::stats::CacheStats;
use crate::store::PageStore;
use diary_render::{Generation, PageId};
use diary_scheduler::{
    JobFailure, JobOutcome, PoolEvent, RenderError, RenderPriority, RenderResult, Waiter,
    WorkerCommand, WorkerPool, WorkerPoolConfig,
};
use log::{debug, info, warn};
use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

enum Command {
    Request {
        page_id: PageId,
        generation: Option<Generation>,
        priority: RenderPriority,
        waiter: Waiter,
    },
    Invalidate(PageId),
    Pin(PageId),
    Unpin(PageId),
    SetCurrentPage(PageId),
    SetMemoryBudget(usize),
    Stats(flume::Sender<CacheStats>),
    Shutdown,
}

/// Handle to a running render cache
///
/// # Example
///
/// ```no_run
/// use diary_cache::{CacheConfig, CacheManager, MemoryPageStore};
/// use diary_render::{PageId, PageSnapshot};
/// use diary_scheduler::RenderPriority;
/// use std::sync::Arc;
///
/// let store = Arc::new(MemoryPageStore::from_snapshots([PageSnapshot::new(PageId(1))]));
/// let cache = CacheManager::start(CacheConfig::default(), store)?;
///
/// cache.set_current_page(PageId(1));
/// let artifact = cache.request_page(PageId(1), RenderPriority::Current).wait()?;
/// println!("{}x{}", artifact.width, artifact.height);
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub struct CacheManager {
    commands: flume::Sender<Command>,
    coordinator: Option<JoinHandle<()>>,
}

impl CacheManager {
    /// Start the worker processes and the coordinator thread
    ///
    /// Without a configured worker command, workers re-invoke the current
    /// executable with the `worker` subcommand.
    pub fn start(config: CacheConfig, store: Arc<dyn PageStore>) -> Result<Self, CacheError> {
        config.validate()?;

        let command = match &config.worker_command {
            Some(command) => command.clone(),
            None => WorkerCommand::current_exe(["worker"])?,
        };
        let pool_config = WorkerPoolConfig::new(command)
            .with_workers(config.worker_count)
            .with_render_timeout(config.render_timeout)
            .with_crash_threshold(config.crash_threshold, config.crash_window);
        let pool = WorkerPool::start(pool_config)?;

        let (commands, inbox) = flume::unbounded();
        let core = CacheCore::new(config, store);
        let coordinator = thread::Builder::new()
            .name("diary-cache-coordinator".into())
            .spawn(move || coordinate(core, pool, inbox))
            .map_err(CacheError::Thread)?;

        Ok(Self { commands, coordinator: Some(coordinator) })
    }

    /// Ask for a page as the caller knows it
    ///
    /// Resolves immediately on a hit. A `generation` newer than the cache's
    /// invalidates the page first; an older one is served at the newest
    /// generation.
    pub fn get_or_request(
        &self,
        page_id: PageId,
        generation: Generation,
        priority: RenderPriority,
    ) -> PageTicket {
        self.submit(page_id, Some(generation), priority)
    }

    /// Ask for the current content of a page
    pub fn request_page(&self, page_id: PageId, priority: RenderPriority) -> PageTicket {
        self.submit(page_id, None, priority)
    }

    pub fn invalidate(&self, page_id: PageId) {
        self.send(Command::Invalidate(page_id));
    }

    /// Hook for the page store's owner after an edit
    pub fn page_mutated(&self, page_id: PageId) {
        self.invalidate(page_id);
    }

    pub fn pin(&self, page_id: PageId) {
        self.send(Command::Pin(page_id));
    }

    pub fn unpin(&self, page_id: PageId) {
        self.send(Command::Unpin(page_id));
    }

    /// The page now on screen; pins it and prefetches around it
    pub fn set_current_page(&self, page_id: PageId) {
        self.send(Command::SetCurrentPage(page_id));
    }

    pub fn set_memory_budget(&self, bytes: usize) {
        self.send(Command::SetMemoryBudget(bytes));
    }

    pub fn get_stats(&self) -> Result<CacheStats, CacheError> {
        let (tx, rx) = flume::bounded(1);
        if !self.send(Command::Stats(tx)) {
            return Err(CacheError::Disconnected);
        }
        rx.recv().map_err(|_| CacheError::Disconnected)
    }

    /// Stop the coordinator and the workers
    ///
    /// Requests still pending resolve with [`RenderError::Disconnected`].
    pub fn shutdown(&mut self) {
        let Some(coordinator) = self.coordinator.take() else {
            return;
        };
        self.send(Command::Shutdown);
        if coordinator.join().is_err() {
            warn!("render cache coordinator panicked");
        }
    }

    fn submit(
        &self,
        page_id: PageId,
        generation: Option<Generation>,
        priority: RenderPriority,
    ) -> PageTicket {
        let (waiter, rx) = Waiter::channel();
        // A refused command drops the waiter, which the ticket sees as a
        // disconnect
        self.send(Command::Request { page_id, generation, priority, waiter });
        PageTicket { page_id, rx }
    }

    fn send(&self, command: Command) -> bool {
        if self.commands.send(command).is_err() {
            debug!("render cache is shut down, command dropped");
            return false;
        }
        true
    }
}

impl Drop for CacheManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Pending answer to a page request
///
/// Block on it with [`PageTicket::wait`] or `.await` it from any executor.
#[derive(Debug)]
pub struct PageTicket {
    page_id: PageId,
    rx: flume::Receiver<RenderResult>,
}

impl PageTicket {
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    pub fn wait(self) -> RenderResult {
        self.rx.recv().unwrap_or(Err(RenderError::Disconnected))
    }

    /// `None` if nothing arrived within `timeout`
    pub fn wait_timeout(&self, timeout: Duration) -> Option<RenderResult> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => Some(result),
            Err(flume::RecvTimeoutError::Timeout) => None,
            Err(flume::RecvTimeoutError::Disconnected) => Some(Err(RenderError::Disconnected)),
        }
    }

    pub fn try_result(&self) -> Option<RenderResult> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(flume::TryRecvError::Empty) => None,
            Err(flume::TryRecvError::Disconnected) => Some(Err(RenderError::Disconnected)),
        }
    }
}

impl IntoFuture for PageTicket {
    type Output = RenderResult;
    type IntoFuture = PageFuture;

    fn into_future(self) -> PageFuture {
        PageFuture { inner: Box::pin(self.rx.into_recv_async()) }
    }
}

/// Future returned by awaiting a [`PageTicket`]
pub struct PageFuture {
    inner: Pin<Box<flume::r#async::RecvFut<'static, RenderResult>>>,
}

impl Future for PageFuture {
    type Output = RenderResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<RenderResult> {
        self.inner
            .as_mut()
            .poll(cx)
            .map(|received| received.unwrap_or(Err(RenderError::Disconnected)))
    }
}

enum Step {
    Command(Command),
    Event(PoolEvent),
    Timeout,
    Closed,
}

/// Body of the coordinator thread
fn coordinate(mut core: CacheCore, mut pool: WorkerPool, inbox: flume::Receiver<Command>) {
    info!("render cache coordinator started with {} workers", pool.len());

    loop {
        let step = next_step(&inbox, &pool);
        core.set_health(pool.health(Instant::now()));

        match step {
            Step::Command(Command::Shutdown) | Step::Closed => break,
            Step::Command(command) => apply(&mut core, &pool, command),
            Step::Event(event) => {
                if let Some(outcome) = pool.handle_event(event) {
                    core.on_outcome(outcome);
                }
            }
            Step::Timeout => {}
        }

        let now = Instant::now();
        for outcome in pool.reap_timeouts(now) {
            core.on_outcome(outcome);
        }
        core.set_health(pool.health(now));
        pump(&mut core, &mut pool);
    }

    pool.shutdown();
    info!("render cache coordinator stopped");
}

fn next_step(inbox: &flume::Receiver<Command>, pool: &WorkerPool) -> Step {
    let selector = flume::Selector::new()
        .recv(inbox, |received| match received {
            Ok(command) => Step::Command(command),
            Err(_) => Step::Closed,
        })
        .recv(pool.events(), |received| match received {
            Ok(event) => Step::Event(event),
            Err(_) => Step::Timeout,
        });

    match pool.next_deadline() {
        Some(deadline) => selector.wait_deadline(deadline).unwrap_or(Step::Timeout),
        None => selector.wait(),
    }
}

fn apply(core: &mut CacheCore, pool: &WorkerPool, command: Command) {
    match command {
        Command::Request { page_id, generation, priority, waiter } => {
            core.request(page_id, generation, priority, Some(waiter));
        }
        Command::Invalidate(page_id) => {
            core.invalidate(page_id);
        }
        Command::Pin(page_id) => core.pin(page_id),
        Command::Unpin(page_id) => core.unpin(page_id),
        Command::SetCurrentPage(page_id) => core.set_current_page(page_id),
        Command::SetMemoryBudget(bytes) => core.set_memory_budget(bytes),
        Command::Stats(reply) => {
            let mut stats = core.stats();
            stats.pool = pool.stats();
            let _ = reply.send(stats);
        }
        Command::Shutdown => {}
    }
}

/// Hand queued jobs to idle workers
fn pump(core: &mut CacheCore, pool: &mut WorkerPool) {
    let idle = pool.idle_count();
    if idle == 0 {
        return;
    }
    for order in core.take_orders(idle) {
        if let Err(order) = pool.dispatch(order) {
            warn!("{}: no worker could take the job", order.job_id);
            core.on_outcome(JobOutcome {
                job_id: order.job_id,
                result: Err(JobFailure::Transient("no idle worker".into())),
            });
        }
    }
}
