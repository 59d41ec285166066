//! Cache statistics and memory pressure

use diary_scheduler::{PoolStats, SchedulerStats};

/// Memory pressure level indicating cache health
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MemoryPressure {
    /// Memory usage is low (< 50% utilization)
    Low,
    /// Memory usage is moderate (50-75% utilization)
    Moderate,
    /// Memory usage is high (75-90% utilization)
    High,
    /// Memory usage is critical (> 90% utilization)
    Critical,
}

impl MemoryPressure {
    /// Get the memory pressure level from a utilization ratio (0.0 to 1.0)
    pub fn from_utilization(utilization: f64) -> Self {
        if utilization < 0.5 {
            MemoryPressure::Low
        } else if utilization < 0.75 {
            MemoryPressure::Moderate
        } else if utilization < 0.90 {
            MemoryPressure::High
        } else {
            MemoryPressure::Critical
        }
    }

    /// Returns true if memory pressure requires action (High or Critical)
    pub fn needs_eviction(&self) -> bool {
        matches!(self, MemoryPressure::High | MemoryPressure::Critical)
    }
}

/// Snapshot of cache, scheduler and worker pool counters
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheStats {
    /// Requests answered from a ready entry
    pub hits: u64,

    /// Requests that needed a render
    pub misses: u64,

    /// Entries removed to stay within the memory budget
    pub evictions: u64,

    /// Pixel memory held by cached artifacts (bytes)
    pub current_size_bytes: usize,

    /// Maximum memory allowed (bytes)
    pub memory_budget_bytes: usize,

    /// Entries in the cache, pending and failed ones included
    pub entries: usize,

    /// Pinned pages
    pub pinned: usize,

    /// Render results dropped because the page changed meanwhile
    pub stale_results_discarded: u64,

    /// Requests resolved with an error
    pub failures: u64,

    /// Whether the worker pool is currently degraded
    pub degraded: bool,

    pub scheduler: SchedulerStats,
    pub pool: PoolStats,
}

impl CacheStats {
    /// Calculate the cache hit rate (0.0 to 1.0)
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    /// Calculate memory utilization (0.0 to 1.0)
    pub fn utilization(&self) -> f64 {
        if self.memory_budget_bytes == 0 {
            0.0
        } else {
            self.current_size_bytes as f64 / self.memory_budget_bytes as f64
        }
    }

    pub fn pressure(&self) -> MemoryPressure {
        MemoryPressure::from_utilization(self.utilization())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_pressure_levels() {
        assert_eq!(MemoryPressure::from_utilization(0.0), MemoryPressure::Low);
        assert_eq!(MemoryPressure::from_utilization(0.49), MemoryPressure::Low);
        assert_eq!(MemoryPressure::from_utilization(0.5), MemoryPressure::Moderate);
        assert_eq!(MemoryPressure::from_utilization(0.8), MemoryPressure::High);
        assert_eq!(MemoryPressure::from_utilization(0.95), MemoryPressure::Critical);
        assert_eq!(MemoryPressure::from_utilization(1.5), MemoryPressure::Critical);
    }

    #[test]
    fn test_memory_pressure_needs_eviction() {
        assert!(!MemoryPressure::Low.needs_eviction());
        assert!(!MemoryPressure::Moderate.needs_eviction());
        assert!(MemoryPressure::High.needs_eviction());
        assert!(MemoryPressure::Critical.needs_eviction());
    }

    #[test]
    fn test_hit_rate_and_utilization() {
        let stats = CacheStats {
            hits: 3,
            misses: 1,
            current_size_bytes: 60,
            memory_budget_bytes: 100,
            ..Default::default()
        };
        assert_eq!(stats.hit_rate(), 0.75);
        assert_eq!(stats.utilization(), 0.6);
        assert_eq!(stats.pressure(), MemoryPressure::Moderate);

        let empty = CacheStats::default();
        assert_eq!(empty.hit_rate(), 0.0);
        assert_eq!(empty.utilization(), 0.0);
    }
}
