//! Cache hit/miss and build-outcome counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counters tracking cache behavior over the process lifetime.
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    builds_completed: AtomicU64,
    builds_failed: AtomicU64,
    preloaded: AtomicU64,
}

impl CacheStats {
    /// Creates zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_build_completed(&self) {
        self.builds_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_build_failed(&self) {
        self.builds_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_preloaded(&self, entries: u64) {
        self.preloaded.fetch_add(entries, Ordering::Relaxed);
    }

    /// Returns a point-in-time copy of all counters.
    pub fn snapshot(&self) -> CacheSnapshot {
        CacheSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            builds_completed: self.builds_completed.load(Ordering::Relaxed),
            builds_failed: self.builds_failed.load(Ordering::Relaxed),
            preloaded: self.preloaded.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of [`CacheStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheSnapshot {
    /// Lookups answered from the cache.
    pub hits: u64,
    /// Lookups that required a fallback substitution.
    pub misses: u64,
    /// Background or synchronous builds that produced an artifact.
    pub builds_completed: u64,
    /// Builds that failed; their keys fall back permanently.
    pub builds_failed: u64,
    /// Entries trusted from the persisted store at startup.
    pub preloaded: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_stats_are_zero() {
        let stats = CacheStats::new();
        assert_eq!(stats.snapshot(), CacheSnapshot::default());
    }

    #[test]
    fn test_counters_accumulate() {
        let stats = CacheStats::new();
        stats.record_hit();
        stats.record_hit();
        stats.record_miss();
        stats.record_build_completed();
        stats.record_build_failed();
        stats.record_preloaded(12);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.hits, 2);
        assert_eq!(snapshot.misses, 1);
        assert_eq!(snapshot.builds_completed, 1);
        assert_eq!(snapshot.builds_failed, 1);
        assert_eq!(snapshot.preloaded, 12);
    }
}
