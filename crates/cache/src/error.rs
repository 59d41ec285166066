use crate::config::ConfigError;
use diary_scheduler::PoolError;
use std::io;

/// Errors of the cache handle itself
///
/// Render failures are not here; they reach callers as
/// [`RenderError`](diary_scheduler::RenderError) through their tickets.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to start render workers: {0}")]
    Pool(#[from] PoolError),

    #[error("failed to start the cache coordinator: {0}")]
    Thread(#[source] io::Error),

    #[error("render cache is shut down")]
    Disconnected,
}
