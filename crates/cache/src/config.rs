//! Render cache configuration
//!
//! A [`CacheConfig`] is an immutable value handed to
//! [`CacheManager::start`](crate::CacheManager::start). It can be built in
//! code, loaded from a TOML file, or overridden from environment variables.

use diary_render::DEFAULT_SCALE;
use diary_scheduler::{
    WorkerCommand, DEFAULT_CRASH_THRESHOLD, DEFAULT_CRASH_WINDOW, DEFAULT_RENDER_TIMEOUT,
    DEFAULT_WORKER_COUNT,
};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

const MB: usize = 1024 * 1024;

pub const ENV_WORKERS: &str = "DIARY_RENDER_WORKERS";
pub const ENV_QUEUE_DEPTH: &str = "DIARY_RENDER_QUEUE_DEPTH";
pub const ENV_TIMEOUT_MS: &str = "DIARY_RENDER_TIMEOUT_MS";
pub const ENV_MAX_RETRIES: &str = "DIARY_RENDER_MAX_RETRIES";
pub const ENV_BUDGET_MB: &str = "DIARY_RENDER_BUDGET_MB";
pub const ENV_PREFETCH: &str = "DIARY_RENDER_PREFETCH";
pub const ENV_SCALE: &str = "DIARY_RENDER_SCALE";

/// Configuration for the render cache
#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    /// Number of worker processes
    pub worker_count: usize,

    /// Queued jobs beyond this are dropped, least urgent first
    pub queue_depth_limit: usize,

    /// Time one render may take before its worker is killed
    pub render_timeout: Duration,

    /// Retries after a crash or timeout before a job fails
    pub max_retries: u32,

    /// Upper bound for the pixel memory of cached artifacts
    pub memory_budget_bytes: usize,

    /// Pages on each side of the current page that are rendered ahead
    pub prefetch_distance: usize,

    /// Logical page pixels to bitmap pixels
    pub render_scale: f32,

    /// Crashes within `crash_window` that mark the workers degraded
    pub crash_threshold: usize,

    pub crash_window: Duration,

    /// Worker process command; `None` re-invokes the current executable
    /// with the `worker` subcommand
    pub worker_command: Option<WorkerCommand>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            worker_count: DEFAULT_WORKER_COUNT,
            queue_depth_limit: 64,
            render_timeout: DEFAULT_RENDER_TIMEOUT,
            max_retries: 2,
            memory_budget_bytes: 256 * MB,
            prefetch_distance: 2,
            render_scale: DEFAULT_SCALE,
            crash_threshold: DEFAULT_CRASH_THRESHOLD,
            crash_window: DEFAULT_CRASH_WINDOW,
            worker_command: None,
        }
    }
}

impl CacheConfig {
    pub fn with_workers(mut self, count: usize) -> Self {
        self.worker_count = count;
        self
    }

    pub fn with_queue_depth_limit(mut self, limit: usize) -> Self {
        self.queue_depth_limit = limit;
        self
    }

    pub fn with_render_timeout(mut self, timeout: Duration) -> Self {
        self.render_timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_memory_budget(mut self, bytes: usize) -> Self {
        self.memory_budget_bytes = bytes;
        self
    }

    /// Sets the memory budget in megabytes.
    ///
    /// # Errors
    /// Returns an error if the budget does not fit in `usize` bytes.
    pub fn with_memory_budget_mb(mut self, mb: usize) -> Result<Self, ConfigError> {
        self.memory_budget_bytes = megabytes(mb)?;
        Ok(self)
    }

    pub fn with_prefetch_distance(mut self, distance: usize) -> Self {
        self.prefetch_distance = distance;
        self
    }

    pub fn with_render_scale(mut self, scale: f32) -> Self {
        self.render_scale = scale;
        self
    }

    pub fn with_crash_threshold(mut self, threshold: usize, window: Duration) -> Self {
        self.crash_threshold = threshold;
        self.crash_window = window;
        self
    }

    pub fn with_worker_command(mut self, command: WorkerCommand) -> Self {
        self.worker_command = Some(command);
        self
    }

    /// Returns the memory budget in megabytes.
    pub fn memory_budget_mb(&self) -> usize {
        self.memory_budget_bytes / MB
    }

    /// Default location of the configuration file.
    ///
    /// - Linux: ~/.config/diary/render-cache.toml
    /// - macOS: ~/Library/Application Support/diary/render-cache.toml
    /// - Windows: %APPDATA%\diary\render-cache.toml
    pub fn default_path() -> PathBuf {
        match dirs::config_dir() {
            Some(dir) => dir.join("diary").join("render-cache.toml"),
            None => PathBuf::from("render-cache.toml"),
        }
    }

    /// Defaults, then the default file if it exists, then the environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::default_path())
    }

    /// Like [`CacheConfig::load`] with an explicit file location.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let config = if path.exists() { Self::from_file(path)? } else { Self::default() };
        config.apply_env()
    }

    /// Loads configuration from environment variables.
    ///
    /// Environment variables:
    /// - `DIARY_RENDER_WORKERS`: worker processes (default: 2)
    /// - `DIARY_RENDER_QUEUE_DEPTH`: queued job limit (default: 64)
    /// - `DIARY_RENDER_TIMEOUT_MS`: per-render timeout (default: 5000)
    /// - `DIARY_RENDER_MAX_RETRIES`: retries after crashes (default: 2)
    /// - `DIARY_RENDER_BUDGET_MB`: memory budget in MB (default: 256)
    /// - `DIARY_RENDER_PREFETCH`: prefetch distance in pages (default: 2)
    /// - `DIARY_RENDER_SCALE`: render scale (default: 4.0)
    ///
    /// # Errors
    /// Returns an error if any environment variable contains an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().apply_env()
    }

    /// Overrides fields from the environment variables listed in
    /// [`CacheConfig::from_env`].
    pub fn apply_env(mut self) -> Result<Self, ConfigError> {
        if let Some(count) = env_value(ENV_WORKERS)? {
            self.worker_count = count;
        }
        if let Some(limit) = env_value(ENV_QUEUE_DEPTH)? {
            self.queue_depth_limit = limit;
        }
        if let Some(ms) = env_value(ENV_TIMEOUT_MS)? {
            self.render_timeout = Duration::from_millis(ms);
        }
        if let Some(retries) = env_value(ENV_MAX_RETRIES)? {
            self.max_retries = retries;
        }
        if let Some(mb) = env_value::<usize>(ENV_BUDGET_MB)? {
            self.memory_budget_bytes = megabytes(mb)?;
        }
        if let Some(distance) = env_value(ENV_PREFETCH)? {
            self.prefetch_distance = distance;
        }
        if let Some(scale) = env_value(ENV_SCALE)? {
            self.render_scale = scale;
        }
        Ok(self)
    }

    /// Loads configuration from a TOML file.
    ///
    /// Missing keys keep their defaults:
    /// ```toml
    /// worker_count = 2
    /// queue_depth_limit = 64
    /// render_timeout_ms = 5000
    /// max_retries = 2
    /// memory_budget_mb = 256
    /// prefetch_distance = 2
    /// render_scale = 4.0
    /// crash_threshold = 8
    /// crash_window_secs = 30
    /// worker_program = "/usr/local/bin/diary-render"
    /// worker_args = ["worker"]
    /// ```
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path.as_ref())?;
        Self::from_toml(&contents)
    }

    fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = toml::from_str(contents)?;
        file.apply(Self::default())
    }

    /// Saves configuration to a TOML file.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let contents = toml::to_string_pretty(&ConfigFile::from(self))?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// Checks that every value is usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_count == 0 {
            return Err(ConfigError::Invalid("worker_count must be at least 1".into()));
        }
        if self.queue_depth_limit == 0 {
            return Err(ConfigError::Invalid("queue_depth_limit must be at least 1".into()));
        }
        if self.render_timeout.is_zero() {
            return Err(ConfigError::Invalid("render_timeout must be positive".into()));
        }
        if !(self.render_scale.is_finite() && self.render_scale > 0.0 && self.render_scale <= 16.0)
        {
            return Err(ConfigError::Invalid(format!(
                "render_scale {} is outside (0, 16]",
                self.render_scale
            )));
        }
        if self.crash_threshold == 0 {
            return Err(ConfigError::Invalid("crash_threshold must be at least 1".into()));
        }
        Ok(())
    }
}

/// On-disk form of [`CacheConfig`]
#[derive(Debug, Default, Serialize, Deserialize)]
struct ConfigFile {
    #[serde(skip_serializing_if = "Option::is_none")]
    worker_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    queue_depth_limit: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    render_timeout_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_retries: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    memory_budget_mb: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    prefetch_distance: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    render_scale: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    crash_threshold: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    crash_window_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    worker_program: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    worker_args: Vec<String>,
}

impl ConfigFile {
    fn apply(self, mut config: CacheConfig) -> Result<CacheConfig, ConfigError> {
        if let Some(count) = self.worker_count {
            config.worker_count = count;
        }
        if let Some(limit) = self.queue_depth_limit {
            config.queue_depth_limit = limit;
        }
        if let Some(ms) = self.render_timeout_ms {
            config.render_timeout = Duration::from_millis(ms);
        }
        if let Some(retries) = self.max_retries {
            config.max_retries = retries;
        }
        if let Some(mb) = self.memory_budget_mb {
            config.memory_budget_bytes = megabytes(mb)?;
        }
        if let Some(distance) = self.prefetch_distance {
            config.prefetch_distance = distance;
        }
        if let Some(scale) = self.render_scale {
            config.render_scale = scale;
        }
        if let Some(threshold) = self.crash_threshold {
            config.crash_threshold = threshold;
        }
        if let Some(secs) = self.crash_window_secs {
            config.crash_window = Duration::from_secs(secs);
        }
        if let Some(program) = self.worker_program {
            config.worker_command = Some(WorkerCommand::new(program).args(self.worker_args));
        }
        Ok(config)
    }
}

impl From<&CacheConfig> for ConfigFile {
    fn from(config: &CacheConfig) -> Self {
        let (worker_program, worker_args) = match &config.worker_command {
            Some(command) => (
                Some(command.program.clone()),
                command.args.iter().map(|arg| arg.to_string_lossy().into_owned()).collect(),
            ),
            None => (None, Vec::new()),
        };

        Self {
            worker_count: Some(config.worker_count),
            queue_depth_limit: Some(config.queue_depth_limit),
            render_timeout_ms: Some(config.render_timeout.as_millis() as u64),
            max_retries: Some(config.max_retries),
            memory_budget_mb: Some(config.memory_budget_mb()),
            prefetch_distance: Some(config.prefetch_distance),
            render_scale: Some(config.render_scale),
            crash_threshold: Some(config.crash_threshold),
            crash_window_secs: Some(config.crash_window.as_secs()),
            worker_program,
            worker_args,
        }
    }
}

fn megabytes(mb: usize) -> Result<usize, ConfigError> {
    mb.checked_mul(MB)
        .ok_or_else(|| ConfigError::Invalid(format!("memory budget of {mb} MB is too large")))
}

fn env_value<T: FromStr>(key: &str) -> Result<Option<T>, ConfigError> {
    match std::env::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { key: key.to_string(), value }),
        Err(_) => Ok(None),
    }
}

/// Errors that can occur during configuration operations.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: String, value: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    const ALL_VARS: [&str; 7] = [
        ENV_WORKERS,
        ENV_QUEUE_DEPTH,
        ENV_TIMEOUT_MS,
        ENV_MAX_RETRIES,
        ENV_BUDGET_MB,
        ENV_PREFETCH,
        ENV_SCALE,
    ];

    // Helper to save and restore environment variables
    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new(var_names: &[&str]) -> Self {
            let vars = var_names
                .iter()
                .map(|name| (name.to_string(), env::var(name).ok()))
                .collect();
            for name in var_names {
                env::remove_var(name);
            }
            Self { vars }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (name, value) in &self.vars {
                match value {
                    Some(v) => env::set_var(name, v),
                    None => env::remove_var(name),
                }
            }
        }
    }

    #[test]
    fn test_default_config() {
        let config = CacheConfig::default();
        assert_eq!(config.worker_count, 2);
        assert_eq!(config.queue_depth_limit, 64);
        assert_eq!(config.render_timeout, Duration::from_secs(5));
        assert_eq!(config.max_retries, 2);
        assert_eq!(config.memory_budget_mb(), 256);
        assert_eq!(config.prefetch_distance, 2);
        assert_eq!(config.render_scale, 4.0);
        assert!(config.worker_command.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_methods() {
        let config = CacheConfig::default()
            .with_workers(4)
            .with_queue_depth_limit(8)
            .with_render_timeout(Duration::from_millis(750))
            .with_max_retries(5)
            .with_memory_budget_mb(32)
            .unwrap()
            .with_prefetch_distance(1)
            .with_render_scale(2.0)
            .with_worker_command(WorkerCommand::new("/bin/worker"));

        assert_eq!(config.worker_count, 4);
        assert_eq!(config.queue_depth_limit, 8);
        assert_eq!(config.render_timeout, Duration::from_millis(750));
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.memory_budget_bytes, 32 * MB);
        assert_eq!(config.prefetch_distance, 1);
        assert_eq!(config.render_scale, 2.0);
        assert_eq!(config.worker_command, Some(WorkerCommand::new("/bin/worker")));
    }

    #[test]
    fn test_validate_rejects_unusable_values() {
        assert!(CacheConfig::default().with_workers(0).validate().is_err());
        assert!(CacheConfig::default().with_queue_depth_limit(0).validate().is_err());
        assert!(CacheConfig::default().with_render_timeout(Duration::ZERO).validate().is_err());
        assert!(CacheConfig::default().with_render_scale(0.0).validate().is_err());
        assert!(CacheConfig::default().with_render_scale(f32::NAN).validate().is_err());
        assert!(CacheConfig::default()
            .with_crash_threshold(0, Duration::from_secs(1))
            .validate()
            .is_err());
    }

    #[test]
    #[serial]
    fn test_from_env() {
        let _guard = EnvGuard::new(&ALL_VARS);

        env::set_var(ENV_WORKERS, "3");
        env::set_var(ENV_QUEUE_DEPTH, "16");
        env::set_var(ENV_TIMEOUT_MS, "1500");
        env::set_var(ENV_MAX_RETRIES, "4");
        env::set_var(ENV_BUDGET_MB, "64");
        env::set_var(ENV_PREFETCH, "5");
        env::set_var(ENV_SCALE, "2.5");

        let config = CacheConfig::from_env().unwrap();
        assert_eq!(config.worker_count, 3);
        assert_eq!(config.queue_depth_limit, 16);
        assert_eq!(config.render_timeout, Duration::from_millis(1500));
        assert_eq!(config.max_retries, 4);
        assert_eq!(config.memory_budget_bytes, 64 * MB);
        assert_eq!(config.prefetch_distance, 5);
        assert_eq!(config.render_scale, 2.5);
    }

    #[test]
    #[serial]
    fn test_from_env_partial() {
        let _guard = EnvGuard::new(&ALL_VARS);
        env::set_var(ENV_BUDGET_MB, "128");

        let config = CacheConfig::from_env().unwrap();
        assert_eq!(config.memory_budget_mb(), 128);
        assert_eq!(config.worker_count, 2); // default
        assert_eq!(config.max_retries, 2); // default
    }

    #[test]
    #[serial]
    fn test_from_env_invalid() {
        let _guard = EnvGuard::new(&ALL_VARS);
        env::set_var(ENV_WORKERS, "many");

        let err = CacheConfig::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == ENV_WORKERS));
    }

    #[test]
    fn test_from_toml() {
        let toml = r#"
            # Render cache configuration
            worker_count = 3
            render_timeout_ms = 2500
            memory_budget_mb = 48
            crash_window_secs = 10
            worker_program = "/opt/diary/diary-render"
            worker_args = ["worker", "--log-level", "debug"]
        "#;

        let config = CacheConfig::from_toml(toml).unwrap();
        assert_eq!(config.worker_count, 3);
        assert_eq!(config.render_timeout, Duration::from_millis(2500));
        assert_eq!(config.memory_budget_mb(), 48);
        assert_eq!(config.crash_window, Duration::from_secs(10));
        assert_eq!(config.queue_depth_limit, 64); // default

        let command = config.worker_command.unwrap();
        assert_eq!(command.program, PathBuf::from("/opt/diary/diary-render"));
        assert_eq!(command.args.len(), 3);
    }

    #[test]
    #[serial]
    fn test_oversized_budget_is_rejected() {
        let _guard = EnvGuard::new(&ALL_VARS);
        let huge = usize::MAX / 1024;

        let err = CacheConfig::default().with_memory_budget_mb(huge).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(ref msg) if msg.contains("too large")));

        env::set_var(ENV_BUDGET_MB, huge.to_string());
        assert!(matches!(CacheConfig::from_env(), Err(ConfigError::Invalid(_))));

        let toml = format!("memory_budget_mb = {}", i64::MAX);
        assert!(matches!(CacheConfig::from_toml(&toml), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_from_toml_rejects_bad_types() {
        assert!(matches!(
            CacheConfig::from_toml("worker_count = \"two\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_file_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("render-cache.toml");

        let config = CacheConfig::default()
            .with_workers(5)
            .with_memory_budget_mb(12)
            .unwrap()
            .with_render_timeout(Duration::from_millis(1200))
            .with_worker_command(WorkerCommand::new("/bin/diary-render").arg("worker"));
        config.save_to_file(&path).unwrap();

        let loaded = CacheConfig::from_file(&path).unwrap();
        assert_eq!(config, loaded);
    }

    #[test]
    #[serial]
    fn test_load_from_missing_file_uses_defaults() {
        let _guard = EnvGuard::new(&ALL_VARS);
        let dir = tempfile::tempdir().unwrap();

        let config = CacheConfig::load_from(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, CacheConfig::default());
    }

    #[test]
    #[serial]
    fn test_env_overrides_file() {
        let _guard = EnvGuard::new(&ALL_VARS);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("render-cache.toml");
        fs::write(&path, "worker_count = 6\nmax_retries = 1\n").unwrap();
        env::set_var(ENV_MAX_RETRIES, "3");

        let config = CacheConfig::load_from(&path).unwrap();
        assert_eq!(config.worker_count, 6);
        assert_eq!(config.max_retries, 3);
    }

    #[test]
    fn test_default_path_location() {
        let path = CacheConfig::default_path();
        assert!(path.ends_with("diary/render-cache.toml") || path.ends_with("render-cache.toml"));
    }
}
