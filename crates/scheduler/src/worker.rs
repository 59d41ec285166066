//! Pool of isolated render worker processes
//!
//! Each worker is a child process speaking the [`diary_render::wire`]
//! protocol on its stdin/stdout, paired with an I/O thread in this process
//! that owns the pipes. The pool itself (owned by the coordinator) only
//! keeps the [`Child`] handle, so it can kill a hung worker without ever
//! blocking on its pipes.
//!
//! I/O threads report back through a single event channel. The coordinator
//! feeds those events into [`WorkerPool::handle_event`] and calls
//! [`WorkerPool::reap_timeouts`] once [`WorkerPool::next_deadline`] passes.

use crate::cancel::CancellationToken;
use crate::error::PoolError;
use crate::priority::JobId;
use diary_render::wire::{self, RenderReply, RenderRequest};
use diary_render::{Bitmap, PageId};
use log::{debug, error, info, warn};
use std::collections::VecDeque;
use std::ffi::OsString;
use std::fmt;
use std::io::{self, BufReader, BufWriter};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

pub const DEFAULT_WORKER_COUNT: usize = 2;
pub const DEFAULT_RENDER_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_CRASH_THRESHOLD: usize = 8;
pub const DEFAULT_CRASH_WINDOW: Duration = Duration::from_secs(30);

/// How long a worker may take to exit after its stdin closes
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);
const SHUTDOWN_POLL: Duration = Duration::from_millis(10);

/// Delay before retrying a worker slot whose respawn failed; doubles per failure
const RESPAWN_BACKOFF: Duration = Duration::from_millis(100);
const MAX_RESPAWN_BACKOFF: Duration = Duration::from_secs(5);

/// Program used to start worker processes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub envs: Vec<(OsString, OsString)>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self { program: program.into(), args: Vec::new(), envs: Vec::new() }
    }

    /// Re-invoke the running executable with `args`
    pub fn current_exe<I, S>(args: I) -> Result<Self, PoolError>
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        let exe = std::env::current_exe().map_err(PoolError::CurrentExe)?;
        Ok(Self::new(exe).args(args))
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    fn build(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        for (key, value) in &self.envs {
            command.env(key, value);
        }
        command
    }
}

/// Configuration for the worker pool
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of worker processes
    pub worker_count: usize,

    /// Time a worker gets for one render before it is killed
    pub render_timeout: Duration,

    pub command: WorkerCommand,

    /// Crashes and timeouts within `crash_window` that mark the pool degraded
    pub crash_threshold: usize,

    pub crash_window: Duration,
}

impl WorkerPoolConfig {
    pub fn new(command: WorkerCommand) -> Self {
        Self {
            worker_count: DEFAULT_WORKER_COUNT,
            render_timeout: DEFAULT_RENDER_TIMEOUT,
            command,
            crash_threshold: DEFAULT_CRASH_THRESHOLD,
            crash_window: DEFAULT_CRASH_WINDOW,
        }
    }

    pub fn with_workers(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count;
        self
    }

    pub fn with_render_timeout(mut self, timeout: Duration) -> Self {
        self.render_timeout = timeout;
        self
    }

    pub fn with_crash_threshold(mut self, threshold: usize, window: Duration) -> Self {
        self.crash_threshold = threshold;
        self.crash_window = window;
        self
    }
}

/// Identifier of one worker process; never reused within a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerId(pub u64);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    Idle,
    Busy,
    Crashed,
}

/// Inspection snapshot of a worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerHandle {
    pub id: WorkerId,
    pub pid: u32,
    pub status: WorkerStatus,
    pub job: Option<JobId>,
}

/// A render ready to be sent to a worker
#[derive(Debug)]
pub struct WorkOrder {
    pub job_id: JobId,
    pub request: RenderRequest,
    pub token: CancellationToken,
}

impl WorkOrder {
    pub fn page_id(&self) -> PageId {
        self.request.header.page_id
    }
}

/// Report from a worker I/O thread
#[derive(Debug)]
pub enum PoolEvent {
    /// The worker answered the request
    Finished { worker: WorkerId, job_id: JobId, reply: RenderReply },

    /// The job was cancelled before it reached the worker
    Skipped { worker: WorkerId, job_id: JobId },

    /// The worker process died or broke the protocol
    Crashed { worker: WorkerId, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobFailure {
    /// Crash or timeout; the same job may succeed on a fresh worker
    Transient(String),

    /// The renderer rejected the snapshot
    Permanent(String),

    /// Never sent because the job was cancelled
    Skipped,
}

/// Result of one dispatched job
#[derive(Debug)]
pub struct JobOutcome {
    pub job_id: JobId,
    pub result: Result<Bitmap, JobFailure>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolHealth {
    Healthy,
    /// Too many recent crashes, or no worker could be started
    Degraded { crashes: usize, window: Duration },
}

impl PoolHealth {
    pub fn is_degraded(&self) -> bool {
        matches!(self, PoolHealth::Degraded { .. })
    }
}

/// Worker pool statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Worker processes started, replacements included
    pub spawned: u64,

    /// Workers that died or broke the protocol mid-job
    pub crashes: u64,

    /// Workers killed for exceeding the render timeout
    pub timeouts: u64,

    /// Replies received
    pub renders: u64,

    /// Orders skipped because they were cancelled
    pub skipped: u64,
}

struct Assignment {
    job_id: JobId,
    deadline: Instant,
}

struct Worker {
    id: WorkerId,
    child: Child,
    orders: flume::Sender<WorkOrder>,
    status: WorkerStatus,
    job: Option<Assignment>,
}

/// Fixed-size pool of render worker processes
///
/// # Example
///
/// ```no_run
/// use diary_scheduler::{WorkerCommand, WorkerPool, WorkerPoolConfig};
/// use std::time::Duration;
///
/// let command = WorkerCommand::new("diary-render").arg("worker");
/// let config = WorkerPoolConfig::new(command)
///     .with_workers(2)
///     .with_render_timeout(Duration::from_secs(5));
///
/// let mut pool = WorkerPool::start(config)?;
/// assert_eq!(pool.idle_count(), 2);
/// pool.shutdown();
/// # Ok::<(), diary_scheduler::PoolError>(())
/// ```
pub struct WorkerPool {
    config: WorkerPoolConfig,
    workers: Vec<Worker>,
    events_tx: flume::Sender<PoolEvent>,
    events_rx: flume::Receiver<PoolEvent>,
    crash_times: VecDeque<Instant>,
    next_worker_id: u64,
    /// Slots whose replacement could not be spawned yet
    missing: usize,
    respawn_at: Option<Instant>,
    respawn_backoff: Duration,
    stats: PoolStats,
}

impl WorkerPool {
    /// Start `config.worker_count` worker processes
    pub fn start(config: WorkerPoolConfig) -> Result<Self, PoolError> {
        if config.worker_count == 0 {
            return Err(PoolError::NoWorkers);
        }

        let (events_tx, events_rx) = flume::unbounded();
        let mut pool = Self {
            workers: Vec::with_capacity(config.worker_count),
            config,
            events_tx,
            events_rx,
            crash_times: VecDeque::new(),
            next_worker_id: 0,
            missing: 0,
            respawn_at: None,
            respawn_backoff: RESPAWN_BACKOFF,
            stats: PoolStats::default(),
        };

        for _ in 0..pool.config.worker_count {
            pool.spawn_worker()?;
        }
        info!(
            "started {} render workers ({})",
            pool.workers.len(),
            pool.config.command.program.display()
        );
        Ok(pool)
    }

    /// Channel the coordinator receives worker events on
    pub fn events(&self) -> &flume::Receiver<PoolEvent> {
        &self.events_rx
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Worker slots waiting for a successful respawn
    pub fn missing_count(&self) -> usize {
        self.missing
    }

    pub fn idle_count(&self) -> usize {
        self.workers.iter().filter(|w| w.status == WorkerStatus::Idle).count()
    }

    pub fn busy_count(&self) -> usize {
        self.workers.iter().filter(|w| w.status == WorkerStatus::Busy).count()
    }

    pub fn workers(&self) -> Vec<WorkerHandle> {
        self.workers
            .iter()
            .map(|w| WorkerHandle {
                id: w.id,
                pid: w.child.id(),
                status: w.status,
                job: w.job.as_ref().map(|a| a.job_id),
            })
            .collect()
    }

    pub fn stats(&self) -> PoolStats {
        self.stats.clone()
    }

    /// Hand `order` to the first idle worker
    ///
    /// Gives the order back when no worker is idle.
    pub fn dispatch(&mut self, order: WorkOrder) -> Result<WorkerId, WorkOrder> {
        let mut order = order;
        loop {
            let Some(index) = self.workers.iter().position(|w| w.status == WorkerStatus::Idle)
            else {
                return Err(order);
            };

            let worker = &mut self.workers[index];
            let job_id = order.job_id;
            match worker.orders.send(order) {
                Ok(()) => {
                    worker.status = WorkerStatus::Busy;
                    worker.job = Some(Assignment {
                        job_id,
                        deadline: Instant::now() + self.config.render_timeout,
                    });
                    debug!("{}: assigned {job_id}", worker.id);
                    return Ok(worker.id);
                }
                Err(flume::SendError(returned)) => {
                    order = returned;
                    warn!("{}: I/O thread is gone", worker.id);
                    self.replace(index, "I/O thread exited");
                }
            }
        }
    }

    /// Apply an event from a worker I/O thread
    ///
    /// Events from workers that were already replaced are ignored.
    pub fn handle_event(&mut self, event: PoolEvent) -> Option<JobOutcome> {
        match event {
            PoolEvent::Finished { worker, job_id, reply } => {
                self.release(worker, job_id)?;
                self.stats.renders += 1;
                let result = match reply {
                    RenderReply::Rendered { bitmap, .. } => Ok(bitmap),
                    RenderReply::Failed { message, .. } => Err(JobFailure::Permanent(message)),
                };
                Some(JobOutcome { job_id, result })
            }
            PoolEvent::Skipped { worker, job_id } => {
                self.release(worker, job_id)?;
                self.stats.skipped += 1;
                Some(JobOutcome { job_id, result: Err(JobFailure::Skipped) })
            }
            PoolEvent::Crashed { worker, reason } => {
                let index = self.index_of(worker)?;
                let job_id = self.workers[index].job.as_ref().map(|a| a.job_id);
                error!("{worker}: crashed ({reason})");

                self.stats.crashes += 1;
                self.crash_times.push_back(Instant::now());
                self.replace(index, &reason);

                job_id.map(|job_id| JobOutcome {
                    job_id,
                    result: Err(JobFailure::Transient(format!("worker crashed: {reason}"))),
                })
            }
        }
    }

    /// Kill workers whose job ran past its deadline
    ///
    /// Also retries spawning workers for empty slots once their backoff has
    /// passed.
    pub fn reap_timeouts(&mut self, now: Instant) -> Vec<JobOutcome> {
        self.restore_workers(now);
        let expired: Vec<usize> = self
            .workers
            .iter()
            .enumerate()
            .filter(|(_, w)| w.job.as_ref().is_some_and(|a| a.deadline <= now))
            .map(|(index, _)| index)
            .collect();

        let mut outcomes = Vec::with_capacity(expired.len());
        // Highest index first; a failed respawn removes the slot
        for index in expired.into_iter().rev() {
            let worker = &self.workers[index];
            let Some(job_id) = worker.job.as_ref().map(|a| a.job_id) else {
                continue;
            };
            warn!(
                "{}: {job_id} exceeded {:?}, killing pid {}",
                worker.id,
                self.config.render_timeout,
                worker.child.id()
            );

            self.stats.timeouts += 1;
            self.crash_times.push_back(now);
            self.replace(index, "render timeout");

            outcomes.push(JobOutcome {
                job_id,
                result: Err(JobFailure::Transient(format!(
                    "render timed out after {:?}",
                    self.config.render_timeout
                ))),
            });
        }
        outcomes
    }

    /// Earliest deadline of a running job or of the next respawn attempt
    pub fn next_deadline(&self) -> Option<Instant> {
        let respawn = self.respawn_at.filter(|_| self.missing > 0);
        self.workers
            .iter()
            .filter_map(|w| w.job.as_ref().map(|a| a.deadline))
            .chain(respawn)
            .min()
    }

    /// Crash rate over the configured window
    pub fn health(&mut self, now: Instant) -> PoolHealth {
        self.restore_workers(now);
        let window = self.config.crash_window;
        while let Some(&oldest) = self.crash_times.front() {
            if now.saturating_duration_since(oldest) <= window {
                break;
            }
            self.crash_times.pop_front();
        }

        let crashes = self.crash_times.len();
        if crashes >= self.config.crash_threshold || self.workers.is_empty() {
            PoolHealth::Degraded { crashes, window }
        } else {
            PoolHealth::Healthy
        }
    }

    /// Stop all workers
    ///
    /// Closing a worker's order channel closes its stdin, which ends its
    /// serve loop. Workers still running after a short grace period are
    /// killed.
    pub fn shutdown(&mut self) {
        if self.workers.is_empty() {
            return;
        }

        let mut children = Vec::with_capacity(self.workers.len());
        for worker in self.workers.drain(..) {
            let Worker { id, child, orders, .. } = worker;
            drop(orders);
            children.push((id, child));
        }

        let deadline = Instant::now() + SHUTDOWN_GRACE;
        for (id, mut child) in children {
            loop {
                match child.try_wait() {
                    Ok(Some(status)) => {
                        debug!("{id}: exited with {status}");
                        break;
                    }
                    Ok(None) if Instant::now() < deadline => thread::sleep(SHUTDOWN_POLL),
                    Ok(None) | Err(_) => {
                        debug!("{id}: still running at shutdown, killing");
                        kill_and_reap(&mut child);
                        break;
                    }
                }
            }
        }
        info!("render worker pool shut down");
    }

    fn spawn_worker(&mut self) -> Result<WorkerId, PoolError> {
        let id = WorkerId(self.next_worker_id);
        self.next_worker_id += 1;

        let program = self.config.command.program.display().to_string();
        let spawn_error = |source: io::Error| PoolError::Spawn { program: program.clone(), source };

        let mut child = self
            .config
            .command
            .build()
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(spawn_error)?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            kill_and_reap(&mut child);
            return Err(spawn_error(io::Error::other("worker pipes were not captured")));
        };

        let (orders_tx, orders_rx) = flume::bounded(1);
        let events = self.events_tx.clone();
        // Detached: a killed worker's descendants may keep its pipes open
        let io_thread = thread::Builder::new()
            .name(format!("diary-render-io-{}", id.0))
            .spawn(move || io_loop(id, stdin, stdout, orders_rx, events));
        if let Err(source) = io_thread {
            kill_and_reap(&mut child);
            return Err(spawn_error(source));
        }

        debug!("{id}: spawned pid {}", child.id());
        self.workers.push(Worker {
            id,
            child,
            orders: orders_tx,
            status: WorkerStatus::Idle,
            job: None,
        });
        self.stats.spawned += 1;
        Ok(id)
    }

    /// Kill the worker at `index` and put a fresh one in its slot
    fn replace(&mut self, index: usize, reason: &str) {
        let worker = &mut self.workers[index];
        worker.status = WorkerStatus::Crashed;
        kill_and_reap(&mut worker.child);
        let old = worker.id;

        match self.spawn_worker() {
            Ok(new) => {
                self.workers.swap_remove(index);
                info!("{old} replaced by {new} ({reason})");
            }
            Err(err) => {
                self.workers.remove(index);
                self.missing += 1;
                let retry_at = Instant::now() + self.respawn_backoff;
                self.respawn_at.get_or_insert(retry_at);
                error!(
                    "{old} could not be replaced, retrying in {:?}: {err}",
                    self.respawn_backoff
                );
            }
        }
    }

    /// Spawn workers for empty slots once the backoff has passed
    fn restore_workers(&mut self, now: Instant) {
        if self.missing == 0 || self.respawn_at.is_some_and(|at| now < at) {
            return;
        }

        while self.missing > 0 {
            match self.spawn_worker() {
                Ok(id) => {
                    self.missing -= 1;
                    info!("{id}: respawned into an empty slot");
                }
                Err(err) => {
                    self.respawn_backoff = (self.respawn_backoff * 2).min(MAX_RESPAWN_BACKOFF);
                    self.respawn_at = Some(now + self.respawn_backoff);
                    warn!(
                        "{} worker slots still empty, retrying in {:?}: {err}",
                        self.missing, self.respawn_backoff
                    );
                    return;
                }
            }
        }
        self.respawn_at = None;
        self.respawn_backoff = RESPAWN_BACKOFF;
    }

    fn release(&mut self, worker: WorkerId, job_id: JobId) -> Option<()> {
        let index = self.index_of(worker)?;
        let worker = &mut self.workers[index];
        if worker.job.as_ref().map(|a| a.job_id) != Some(job_id) {
            warn!("{}: unexpected result for {job_id}", worker.id);
            return None;
        }
        worker.status = WorkerStatus::Idle;
        worker.job = None;
        Some(())
    }

    fn index_of(&self, worker: WorkerId) -> Option<usize> {
        self.workers.iter().position(|w| w.id == worker)
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn kill_and_reap(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

/// Body of a worker's I/O thread
fn io_loop(
    id: WorkerId,
    stdin: ChildStdin,
    stdout: ChildStdout,
    orders: flume::Receiver<WorkOrder>,
    events: flume::Sender<PoolEvent>,
) {
    let mut writer = BufWriter::new(stdin);
    let mut reader = BufReader::new(stdout);

    for order in orders.iter() {
        let job_id = order.job_id;
        if order.token.is_cancelled() {
            debug!("{id}: {job_id} cancelled before sending");
            if events.send(PoolEvent::Skipped { worker: id, job_id }).is_err() {
                return;
            }
            continue;
        }

        match exchange(&mut writer, &mut reader, &order) {
            Ok(reply) => {
                if events.send(PoolEvent::Finished { worker: id, job_id, reply }).is_err() {
                    return;
                }
            }
            Err(reason) => {
                let _ = events.send(PoolEvent::Crashed { worker: id, reason });
                return;
            }
        }
    }
}

fn exchange(
    writer: &mut BufWriter<ChildStdin>,
    reader: &mut BufReader<ChildStdout>,
    order: &WorkOrder,
) -> Result<RenderReply, String> {
    wire::write_request(writer, &order.request)
        .map_err(|err| format!("failed to send request: {err}"))?;

    match wire::read_reply(reader) {
        Ok(Some(reply)) if reply.job_id() == order.job_id.0 => Ok(reply),
        Ok(Some(reply)) => Err(format!(
            "reply for job {} while waiting for {}",
            reply.job_id(),
            order.job_id
        )),
        Ok(None) => Err("worker exited".to_string()),
        Err(err) => Err(format!("broken reply: {err}")),
    }
}
