//! All counters use `Relaxed` ordering. Individual counter values are
//! eventually consistent. Cross-counter snapshots may be transiently
//! inconsistent (e.g., total may briefly disagree with the sum of
//! per-subsystem counters). This is acceptable for diagnostic display.
//! Do NOT use these values for allocation decisions.

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
    pub fn get(&self) -> usize {
        self.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn load(&self, ordering: Ordering) -> usize {
        self.0.load(ordering).max(0).cast_unsigned()
    }

    /// Move the gauge from `old` to `new` in a single atomic step.
    #[inline]
    pub fn adjust(&self, old: usize, new: usize) {
        if new > old {
            self.add(new - old);
        } else if old > new {
            self.sub(old - new);
        }
    }
}

// Total address space reserved through `Reservation`
crate::sync::static_atomic! {
    pub static TOTAL_RESERVED: Counter = Counter::new();
}
// Total physical memory committed by arenas and slot pools
crate::sync::static_atomic! {
    pub static TOTAL_COMMITTED: Counter = Counter::new();
}

// Breakdown by subsystem
crate::sync::static_atomic! {
    pub static ARENA_COMMITTED: Counter = Counter::new();
}

crate::sync::static_atomic! {
    pub static SLOT_POOL_COMMITTED: Counter = Counter::new();
}
crate::sync::static_atomic! {
    pub static SLOT_POOL_LIVE: Counter = Counter::new();
}

/// Record a commit change of one subsystem in both its own and the total gauge.
pub(crate) fn track_commit(subsystem: &Counter, old: usize, new: usize) {
    subsystem.adjust(old, new);
    TOTAL_COMMITTED.adjust(old, new);
}

/// Point-in-time copy of the diagnostic counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub total_reserved: usize,
    pub total_committed: usize,
    pub arena_committed: usize,
    pub slot_pool_committed: usize,
    pub slot_pool_live: usize,
}

#[must_use]
pub fn snapshot() -> MemoryStats {
    MemoryStats {
        total_reserved: TOTAL_RESERVED.get(),
        total_committed: TOTAL_COMMITTED.get(),
        arena_committed: ARENA_COMMITTED.get(),
        slot_pool_committed: SLOT_POOL_COMMITTED.get(),
        slot_pool_live: SLOT_POOL_LIVE.get(),
    }
}
