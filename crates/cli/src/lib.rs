use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use diary_cache::{CacheConfig, CacheManager, CacheStats, MemoryPageStore, PageStore};
use diary_render::{
    render_in_process, serve, Generation, PageId, PageSnapshot, RasterRenderer, ServeOptions,
    DEFAULT_SCALE,
};
use diary_scheduler::{RenderPriority, WorkerCommand};
use log::{info, LevelFilter};
use serde::{Deserialize, Serialize};
use simplelog::{ColorChoice, Config, TermLogger, TerminalMode, WriteLogger};
use std::ffi::OsString;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Parser)]
#[command(name = "diary-render")]
#[command(about = "Diary page renderer and render worker")]
pub struct Cli {
    /// Log verbosity (off, error, warn, info, debug, trace).
    #[arg(long, global = true, value_name = "LEVEL", value_parser = parse_level)]
    log_level: Option<LevelFilter>,

    /// Append logs to this file instead of stderr.
    #[arg(long, global = true, value_name = "FILE")]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Serve render requests on stdin/stdout (started by the render cache).
    Worker {
        /// Sleep before every render.
        #[arg(long, hide = true, default_value_t = 0)]
        delay_ms: u64,
    },
    /// Render one page snapshot in this process and write a PNG.
    Render {
        /// Page snapshot JSON file.
        #[arg(long, value_name = "FILE")]
        page: PathBuf,
        #[arg(long, default_value_t = DEFAULT_SCALE)]
        scale: f32,
        #[arg(long, value_name = "FILE")]
        output: PathBuf,
    },
    /// Render a notebook through the worker pool and print a JSON summary.
    Warm {
        /// Notebook JSON file: {"pages": [...]}.
        #[arg(long, value_name = "FILE")]
        notebook: PathBuf,
        /// Page shown on screen; defaults to the first page.
        #[arg(long, value_name = "ID")]
        current: Option<u64>,
        /// Cache configuration file; defaults to the user configuration.
        #[arg(long, value_name = "FILE")]
        config: Option<PathBuf>,
        #[arg(long)]
        workers: Option<usize>,
        #[arg(long)]
        budget_mb: Option<usize>,
        #[arg(long)]
        prefetch: Option<usize>,
        #[arg(long)]
        scale: Option<f32>,
    },
}

/// Notebook file contents
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Notebook {
    pub pages: Vec<PageSnapshot>,
}

impl Notebook {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read notebook {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("invalid notebook {}", path.display()))
    }
}

#[derive(Debug, Serialize)]
struct WarmOutput {
    current_page: u64,
    pages: Vec<PageOutput>,
    stats: StatsOutput,
}

#[derive(Debug, Serialize)]
struct PageOutput {
    page_id: u64,
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    height: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Debug, Serialize)]
struct StatsOutput {
    hits: u64,
    misses: u64,
    evictions: u64,
    current_size_bytes: usize,
    memory_budget_bytes: usize,
    pinned: usize,
    failures: u64,
    stale_results_discarded: u64,
    jobs_submitted: u64,
    retries: u64,
    worker_crashes: u64,
    worker_timeouts: u64,
    degraded: bool,
}

impl From<CacheStats> for StatsOutput {
    fn from(stats: CacheStats) -> Self {
        Self {
            hits: stats.hits,
            misses: stats.misses,
            evictions: stats.evictions,
            current_size_bytes: stats.current_size_bytes,
            memory_budget_bytes: stats.memory_budget_bytes,
            pinned: stats.pinned,
            failures: stats.failures,
            stale_results_discarded: stats.stale_results_discarded,
            jobs_submitted: stats.scheduler.jobs_submitted,
            retries: stats.scheduler.retries,
            worker_crashes: stats.pool.crashes,
            worker_timeouts: stats.pool.timeouts,
            degraded: stats.degraded,
        }
    }
}

pub fn run<I, T>(args: I) -> Result<()>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let cli = Cli::parse_from(args);

    // Workers stay quiet unless asked; their stderr is shared with the host
    let default_level =
        if matches!(cli.command, Commands::Worker { .. }) { LevelFilter::Warn } else { LevelFilter::Info };
    let level = cli.log_level.unwrap_or(default_level);
    init_logging(level, cli.log_file.as_deref())?;

    match cli.command {
        Commands::Worker { delay_ms } => run_worker(delay_ms),
        Commands::Render { page, scale, output } => run_render(&page, scale, &output),
        Commands::Warm { notebook, current, config, workers, budget_mb, prefetch, scale } => {
            let overrides = Overrides { workers, budget_mb, prefetch, scale };
            let config = load_config(config.as_deref(), &overrides)?;
            let worker = worker_command(level, cli.log_file.as_deref())?;
            run_warm(&notebook, current, config.with_worker_command(worker))
        }
    }
}

fn init_logging(level: LevelFilter, log_file: Option<&Path>) -> Result<()> {
    let installed = match log_file {
        Some(path) => {
            let file = File::options()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            WriteLogger::init(level, Config::default(), file)
        }
        // stdout carries the worker protocol
        None => TermLogger::init(level, Config::default(), TerminalMode::Stderr, ColorChoice::Auto),
    };
    installed.context("failed to initialize logging")
}

fn parse_level(value: &str) -> Result<LevelFilter, String> {
    value.parse().map_err(|_| format!("unknown log level {value:?}"))
}

fn run_worker(delay_ms: u64) -> Result<()> {
    let options = ServeOptions { delay: (delay_ms > 0).then(|| Duration::from_millis(delay_ms)) };
    let summary = serve(io::stdin().lock(), io::stdout().lock(), &RasterRenderer::new(), &options)
        .context("render worker stopped")?;
    info!("worker exiting: {} rendered, {} failed", summary.rendered, summary.failed);
    Ok(())
}

fn run_render(page: &Path, scale: f32, output: &Path) -> Result<()> {
    let contents = fs::read_to_string(page)
        .with_context(|| format!("failed to read page {}", page.display()))?;
    let snapshot: PageSnapshot = serde_json::from_str(&contents)
        .with_context(|| format!("invalid page snapshot {}", page.display()))?;

    let artifact = render_in_process(&snapshot, Generation::INITIAL, scale)
        .with_context(|| format!("failed to render {}", snapshot.page_id))?;
    let png = artifact.to_png().context("failed to encode PNG")?;

    if let Some(parent) = output.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(output, png)
        .with_context(|| format!("failed to write image to {}", output.display()))?;

    println!("{}", output.display());
    Ok(())
}

struct Overrides {
    workers: Option<usize>,
    budget_mb: Option<usize>,
    prefetch: Option<usize>,
    scale: Option<f32>,
}

fn load_config(path: Option<&Path>, overrides: &Overrides) -> Result<CacheConfig> {
    let mut config = match path {
        Some(path) => CacheConfig::load_from(path),
        None => CacheConfig::load(),
    }
    .context("failed to load cache configuration")?;

    if let Some(workers) = overrides.workers {
        config = config.with_workers(workers);
    }
    if let Some(mb) = overrides.budget_mb {
        config = config.with_memory_budget_mb(mb).context("invalid --budget-mb")?;
    }
    if let Some(distance) = overrides.prefetch {
        config = config.with_prefetch_distance(distance);
    }
    if let Some(scale) = overrides.scale {
        config = config.with_render_scale(scale);
    }
    config.validate().context("invalid cache configuration")?;
    Ok(config)
}

/// This executable's `worker` subcommand, logging like the parent
fn worker_command(level: LevelFilter, log_file: Option<&Path>) -> Result<WorkerCommand> {
    let level = level.to_string().to_lowercase();
    let mut command = WorkerCommand::current_exe(["worker", "--log-level", level.as_str()])
        .context("failed to locate the worker executable")?;
    if let Some(path) = log_file {
        command = command.arg("--log-file").arg(path);
    }
    Ok(command)
}

fn run_warm(notebook: &Path, current: Option<u64>, config: CacheConfig) -> Result<()> {
    let notebook = Notebook::load(notebook)?;
    let store = Arc::new(MemoryPageStore::from_snapshots(notebook.pages));
    let pages = store.page_ids();

    let Some(first) = pages.first().copied() else {
        anyhow::bail!("notebook has no pages");
    };
    let current = current.map(PageId).unwrap_or(first);
    let Some(current_index) = pages.iter().position(|id| *id == current) else {
        anyhow::bail!("{current} is not in the notebook");
    };

    let prefetch = config.prefetch_distance;
    let mut cache = CacheManager::start(config, store).context("failed to start render cache")?;
    cache.set_current_page(current);

    let tickets: Vec<_> = pages
        .iter()
        .enumerate()
        .map(|(index, page_id)| {
            let priority = RenderPriority::for_distance(index.abs_diff(current_index), prefetch);
            cache.request_page(*page_id, priority)
        })
        .collect();

    let reports = tickets
        .into_iter()
        .map(|ticket| {
            let page_id = ticket.page_id().0;
            match ticket.wait() {
                Ok(artifact) => PageOutput {
                    page_id,
                    status: "rendered",
                    generation: Some(artifact.generation.0),
                    width: Some(artifact.width),
                    height: Some(artifact.height),
                    error: None,
                },
                Err(err) => PageOutput {
                    page_id,
                    status: "failed",
                    generation: None,
                    width: None,
                    height: None,
                    error: Some(err.to_string()),
                },
            }
        })
        .collect();

    let stats = cache.get_stats().context("render cache stopped unexpectedly")?;
    cache.shutdown();

    let payload = WarmOutput { current_page: current.0, pages: reports, stats: stats.into() };
    let json = serde_json::to_string_pretty(&payload)?;
    println!("{json}");
    Ok(())
}
