//! Atomic counters for allocation-layer observability.
//!
//! All counters use relaxed ordering; they are diagnostic only.

use std::sync::atomic::{AtomicU64, Ordering};

/// Global allocation counters.
pub struct AllocMetrics {
    /// Successful façade allocations.
    pub allocations: AtomicU64,
    /// Reallocations satisfied in place by the backend.
    pub resizes_in_place: AtomicU64,
    /// Reallocations that had to allocate, copy and free.
    pub resizes_moved: AtomicU64,
    /// Individual frees.
    pub frees: AtomicU64,
    /// Bulk FREE_ALL requests that succeeded.
    pub free_alls: AtomicU64,
    /// Overflow pages chained by arenas.
    pub arena_overflow_pages: AtomicU64,
    /// Arena base pages regrown by FREE_ALL.
    pub arena_base_regrowths: AtomicU64,
    /// Full heap verification passes.
    pub heap_verifications: AtomicU64,
    /// Leaked allocations reported.
    pub leaks_reported: AtomicU64,
}

impl AllocMetrics {
    /// Create a new zeroed metrics instance.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            allocations: AtomicU64::new(0),
            resizes_in_place: AtomicU64::new(0),
            resizes_moved: AtomicU64::new(0),
            frees: AtomicU64::new(0),
            free_alls: AtomicU64::new(0),
            arena_overflow_pages: AtomicU64::new(0),
            arena_base_regrowths: AtomicU64::new(0),
            heap_verifications: AtomicU64::new(0),
            leaks_reported: AtomicU64::new(0),
        }
    }

    /// Increment a counter by 1.
    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment a counter by `n`.
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Read a counter value.
    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    /// Snapshot all counters.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            allocations: Self::get(&self.allocations),
            resizes_in_place: Self::get(&self.resizes_in_place),
            resizes_moved: Self::get(&self.resizes_moved),
            frees: Self::get(&self.frees),
            free_alls: Self::get(&self.free_alls),
            arena_overflow_pages: Self::get(&self.arena_overflow_pages),
            arena_base_regrowths: Self::get(&self.arena_base_regrowths),
            heap_verifications: Self::get(&self.heap_verifications),
            leaks_reported: Self::get(&self.leaks_reported),
        }
    }
}

impl Default for AllocMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time snapshot of all counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct MetricsSnapshot {
    pub allocations: u64,
    pub resizes_in_place: u64,
    pub resizes_moved: u64,
    pub frees: u64,
    pub free_alls: u64,
    pub arena_overflow_pages: u64,
    pub arena_base_regrowths: u64,
    pub heap_verifications: u64,
    pub leaks_reported: u64,
}

static GLOBAL_METRICS: AllocMetrics = AllocMetrics::new();

/// Access the global metrics singleton.
#[must_use]
pub fn global_metrics() -> &'static AllocMetrics {
    &GLOBAL_METRICS
}
