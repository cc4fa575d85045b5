//! All counters use `Relaxed` ordering. Individual counter values are
//! eventually consistent. Cross-counter snapshots may be transiently
//! inconsistent (e.g., pool gauges may briefly disagree with each other
//! mid-operation). This is acceptable for diagnostic display.
//! Do NOT use these values for allocation decisions; the authoritative
//! accounting lives inside the allocator mutex.

use crate::sync::atomic::{AtomicIsize, Ordering};

/// Diagnostic-only gauge counter.
///
/// Under contention, subtract-before-add races are tolerated and the raw value
/// may transiently dip below zero. Readers should always use `load()`/`get()`,
/// which clamp negative values to zero.
pub struct Counter(AtomicIsize);

impl Counter {
    #[cfg(not(loom))]
    pub const fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[cfg(loom)]
    pub fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[inline]
    fn delta(val: usize) -> isize {
        // Diagnostic counters only: clamp absurd deltas instead of panicking.
        std::cmp::min(val, isize::MAX as usize).cast_signed()
    }

    #[inline]
    pub fn add(&self, val: usize) {
        self.0.fetch_add(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    pub fn sub(&self, val: usize) {
        self.0.fetch_sub(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    #[allow(dead_code)]
    pub fn get(&self) -> usize {
        self.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn load(&self, ordering: Ordering) -> usize {
        self.0.load(ordering).max(0).cast_unsigned()
    }
}

// Payload bytes handed out to callers by pool-backed allocations
crate::sync::static_atomic! {
    pub static POOL_USED: Counter = Counter::new();
}
// Bytes sitting in free pools, available without a system refill
crate::sync::static_atomic! {
    pub static POOL_FREE: Counter = Counter::new();
}
// Bytes in outstanding huge pass-through allocations
crate::sync::static_atomic! {
    pub static HUGE_OUTSTANDING: Counter = Counter::new();
}
// Source regions currently held from system allocators (refills + huge)
crate::sync::static_atomic! {
    pub static SYSTEM_REGIONS: Counter = Counter::new();
}

/// Best-effort subtract from a diagnostic atomic counter.
///
/// Uses a single atomic subtraction (no TOCTOU load-then-subtract race).
/// Readers clamp negative transients via `Counter::load`.
pub fn sub_saturating(counter: &Counter, val: usize) {
    counter.sub(val);
}

/// Point-in-time view of the diagnostic gauges.
#[derive(Debug, Clone, Copy)]
pub struct MemorySnapshot {
    pub pool_used: usize,
    pub pool_free: usize,
    pub huge_outstanding: usize,
    pub system_regions: usize,
}

/// Read all gauges. Values are individually consistent only.
#[must_use]
pub fn snapshot() -> MemorySnapshot {
    MemorySnapshot {
        pool_used: POOL_USED.load(Ordering::Relaxed),
        pool_free: POOL_FREE.load(Ordering::Relaxed),
        huge_outstanding: HUGE_OUTSTANDING.load(Ordering::Relaxed),
        system_regions: SYSTEM_REGIONS.load(Ordering::Relaxed),
    }
}
