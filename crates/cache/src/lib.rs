//! Diary page cache
//!
//! Keeps rendered page artifacts within a memory budget and renders misses
//! in isolated worker processes. An edited page is never served from a stale
//! artifact: every entry carries the generation it was rendered from.

pub mod config;
pub mod core;
pub mod entry;
pub mod error;
pub mod generation;
pub mod manager;
pub mod stats;
pub mod store;

pub use config::{CacheConfig, ConfigError};
pub use core::{CacheCore, Lookup};
pub use entry::{CacheEntry, EntryState, EntryStore};
pub use error::CacheError;
pub use generation::GenerationTable;
pub use manager::{CacheManager, PageFuture, PageTicket};
pub use stats::{CacheStats, MemoryPressure};
pub use store::{MemoryPageStore, PageStore};
