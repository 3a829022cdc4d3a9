//! Memory Management
//!
//! Bookkeeping for device memory owned by the paging engine:
//! - Slot pools that hand out fixed-size offsets inside one allocation
//! - Allocation statistics with peak tracking
//! - Budget enforcement for the total amount of device memory

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Memory budget configuration
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MemoryBudget {
    /// Maximum bytes that may be allocated
    pub max_bytes: u64,
    /// Warning threshold (fraction of max)
    pub warning_threshold: f32,
}

impl Default for MemoryBudget {
    fn default() -> Self {
        Self {
            max_bytes: 256 * 1024 * 1024,
            warning_threshold: 0.8,
        }
    }
}

impl MemoryBudget {
    /// Create a budget with the default warning threshold
    pub fn new(max_bytes: u64) -> Self {
        Self {
            max_bytes,
            ..Default::default()
        }
    }

    /// Check whether `additional` more bytes fit on top of `current`
    pub fn allows(&self, current: u64, additional: u64) -> bool {
        current.saturating_add(additional) <= self.max_bytes
    }

    /// Check whether `current` is past the warning threshold
    pub fn is_warning(&self, current: u64) -> bool {
        current as f64 >= self.max_bytes as f64 * self.warning_threshold as f64
    }
}

/// Allocation statistics
#[derive(Debug, Default)]
pub struct MemoryStats {
    allocated: AtomicU64,
    peak: AtomicU64,
    allocation_count: AtomicU64,
}

impl MemoryStats {
    /// Create new memory stats
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an allocation
    pub fn record_alloc(&self, size: u64) {
        let total = self.allocated.fetch_add(size, Ordering::Relaxed) + size;
        self.allocation_count.fetch_add(1, Ordering::Relaxed);
        self.peak.fetch_max(total, Ordering::Relaxed);
    }

    /// Record a deallocation
    pub fn record_dealloc(&self, size: u64) {
        self.allocated.fetch_sub(size, Ordering::Relaxed);
        self.allocation_count.fetch_sub(1, Ordering::Relaxed);
    }

    /// Bytes currently allocated
    pub fn current(&self) -> u64 {
        self.allocated.load(Ordering::Relaxed)
    }

    /// Highest number of bytes allocated at once
    pub fn peak_usage(&self) -> u64 {
        self.peak.load(Ordering::Relaxed)
    }

    /// Number of live allocations
    pub fn count(&self) -> u64 {
        self.allocation_count.load(Ordering::Relaxed)
    }
}

/// Pool of fixed-size slots inside a single allocation.
///
/// Slots are identified by their byte offset. The lowest free offset is
/// always handed out first so that live slots stay packed at the front.
#[derive(Debug, Clone)]
pub struct SlotPool {
    slot_size: u64,
    capacity: u32,
    available: BTreeSet<u64>,
}

impl SlotPool {
    /// Create a pool with `capacity` free slots of `slot_size` bytes
    pub fn new(slot_size: u64, capacity: u32) -> Self {
        let available = (0..capacity as u64).map(|i| i * slot_size).collect();
        Self {
            slot_size,
            capacity,
            available,
        }
    }

    /// Take the lowest free slot
    pub fn take(&mut self) -> Option<u64> {
        self.available.pop_first()
    }

    /// Return a slot to the pool
    ///
    /// Returns false if the offset does not belong to the pool or is already free.
    pub fn give_back(&mut self, offset: u64) -> bool {
        let in_range = self.slot_size > 0
            && offset % self.slot_size == 0
            && offset / self.slot_size < self.capacity as u64;
        in_range && self.available.insert(offset)
    }

    /// Number of free slots
    pub fn available(&self) -> u32 {
        self.available.len() as u32
    }

    /// Number of slots in use
    pub fn used(&self) -> u32 {
        self.capacity - self.available()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_pool_lowest_first() {
        let mut pool = SlotPool::new(64, 4);
        assert_eq!(pool.take(), Some(0));
        assert_eq!(pool.take(), Some(64));
        assert!(pool.give_back(0));
        assert_eq!(pool.take(), Some(0));
        assert_eq!(pool.used(), 2);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_slot_pool_exhaustion() {
        let mut pool = SlotPool::new(16, 2);
        assert!(pool.take().is_some());
        assert!(pool.take().is_some());
        assert_eq!(pool.available(), 0);
        assert_eq!(pool.take(), None);
    }

    #[test]
    fn test_slot_pool_rejects_foreign_offsets() {
        let mut pool = SlotPool::new(16, 2);
        assert!(!pool.give_back(0));
        assert!(!pool.give_back(8));
        assert!(!pool.give_back(32));
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_memory_stats_peak() {
        let stats = MemoryStats::new();
        stats.record_alloc(100);
        stats.record_alloc(50);
        stats.record_dealloc(100);

        assert_eq!(stats.current(), 50);
        assert_eq!(stats.peak_usage(), 150);
        assert_eq!(stats.count(), 1);

        stats.record_dealloc(50);
        assert_eq!(stats.current(), 0);
        assert_eq!(stats.peak_usage(), 150);
    }

    #[test]
    fn test_memory_budget() {
        let budget = MemoryBudget::new(1000);
        assert!(budget.allows(500, 500));
        assert!(!budget.allows(500, 501));
        assert!(budget.is_warning(800));
        assert!(!budget.is_warning(799));
    }
}
