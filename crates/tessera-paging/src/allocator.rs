//! Memory sector allocator
//!
//! Device memory is allocated in sectors of `pages_per_allocation` page
//! slots. Resident pages own their sector through an `Arc`, the allocator
//! only keeps `Weak` references, so a sector dies with its last page.
//! Dropping a sector queues its memory for release; the memory is handed
//! back to the backend by [`MemorySectorAllocator::collect_released`] once
//! the pages that used it have been rebound.

use std::collections::BTreeSet;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use tessera_core::memory::{MemoryBudget, MemoryStats, SlotPool};

use crate::backend::{MemoryHandle, SparseBackend};
use crate::{PagingError, PagingResult};

type ReleaseQueue = Arc<Mutex<Vec<(MemoryHandle, u64)>>>;

#[derive(Debug)]
struct SectorState {
    slots: SlotPool,
    referenced_pages: BTreeSet<usize>,
}

/// One device memory allocation subdivided into page slots
#[derive(Debug)]
pub struct MemorySector {
    memory: MemoryHandle,
    size: u64,
    state: Mutex<SectorState>,
    released: ReleaseQueue,
}

impl MemorySector {
    /// Backing device memory
    pub fn memory(&self) -> MemoryHandle {
        self.memory
    }

    /// Size of the allocation in bytes
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Number of free page slots
    pub fn available_slots(&self) -> u32 {
        self.state.lock().slots.available()
    }

    /// Number of occupied page slots
    pub fn used_slots(&self) -> u32 {
        self.state.lock().slots.used()
    }

    /// Pages currently resident in this sector
    pub fn referenced_pages(&self) -> Vec<usize> {
        self.state.lock().referenced_pages.iter().copied().collect()
    }
}

impl Drop for MemorySector {
    fn drop(&mut self) {
        self.released.lock().push((self.memory, self.size));
    }
}

/// A page slot inside a sector
#[derive(Debug, Clone)]
pub struct PageAllocation {
    sector: Arc<MemorySector>,
    offset: u64,
}

impl PageAllocation {
    /// Device memory holding the page
    pub fn memory(&self) -> MemoryHandle {
        self.sector.memory
    }

    /// Byte offset of the slot
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Owning sector
    pub fn sector(&self) -> &Arc<MemorySector> {
        &self.sector
    }
}

/// Slab allocator handing out page slots from shared sectors
#[derive(Debug)]
pub struct MemorySectorAllocator {
    sectors: Vec<Weak<MemorySector>>,
    page_size: u64,
    pages_per_allocation: u32,
    memory_type: u32,
    budget: MemoryBudget,
    stats: MemoryStats,
    released: ReleaseQueue,
}

impl MemorySectorAllocator {
    /// Create an allocator for `page_size` byte pages
    pub fn new(page_size: u64, pages_per_allocation: u32, memory_type: u32, budget: MemoryBudget) -> Self {
        Self {
            sectors: Vec::new(),
            page_size,
            pages_per_allocation,
            memory_type,
            budget,
            stats: MemoryStats::new(),
            released: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Bytes per page slot
    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    /// Page slots per sector
    pub fn pages_per_allocation(&self) -> u32 {
        self.pages_per_allocation
    }

    /// Device memory statistics
    pub fn stats(&self) -> &MemoryStats {
        &self.stats
    }

    /// Configured memory budget
    pub fn budget(&self) -> &MemoryBudget {
        &self.budget
    }

    /// Live sectors in allocation preference order
    pub fn sectors(&self) -> Vec<Arc<MemorySector>> {
        self.sectors.iter().filter_map(Weak::upgrade).collect()
    }

    /// Number of live sectors
    pub fn sector_count(&self) -> usize {
        self.sectors.iter().filter(|s| s.strong_count() > 0).count()
    }

    /// Page slots across all live sectors
    pub fn allocated_slots(&self) -> u64 {
        self.sector_count() as u64 * self.pages_per_allocation as u64
    }

    /// Occupied page slots across all live sectors
    pub fn used_slots(&self) -> u64 {
        self.sectors().iter().map(|s| s.used_slots() as u64).sum()
    }

    /// Sectors with more than `cap` free slots
    pub fn fragmented_sector_count(&self, cap: u32) -> usize {
        self.sectors().iter().filter(|s| s.available_slots() > cap).count()
    }

    /// Sector memory waiting to be returned to the backend
    pub fn pending_release_count(&self) -> usize {
        self.released.lock().len()
    }

    /// Take a page slot for `page`, creating a sector if every sector is full
    pub fn acquire<B: SparseBackend>(&mut self, page: usize, backend: &mut B) -> PagingResult<PageAllocation> {
        self.sectors.retain(|s| s.strong_count() > 0);

        for sector in self.sectors.iter().filter_map(Weak::upgrade) {
            let offset = {
                let mut state = sector.state.lock();
                let offset = state.slots.take();
                if offset.is_some() {
                    state.referenced_pages.insert(page);
                }
                offset
            };
            if let Some(offset) = offset {
                return Ok(PageAllocation { sector, offset });
            }
        }

        let sector = self.create_sector(backend)?;
        let offset = {
            let mut state = sector.state.lock();
            state.referenced_pages.insert(page);
            state.slots.take()
        };
        offset
            .map(|offset| PageAllocation { sector, offset })
            .ok_or(PagingError::AllocationExhausted {
                size: self.page_size,
                type_index: self.memory_type,
            })
    }

    fn create_sector<B: SparseBackend>(&mut self, backend: &mut B) -> PagingResult<Arc<MemorySector>> {
        let size = self.page_size * self.pages_per_allocation as u64;
        let exhausted = PagingError::AllocationExhausted {
            size,
            type_index: self.memory_type,
        };

        if !self.budget.allows(self.stats.current(), size) {
            log::error!(
                "Memory budget of {} bytes exhausted ({} bytes in use)",
                self.budget.max_bytes,
                self.stats.current()
            );
            return Err(exhausted);
        }

        let memory = backend.allocate_memory(size, self.memory_type).map_err(|err| {
            log::error!("Sector allocation of {size} bytes failed: {err}");
            exhausted
        })?;
        self.stats.record_alloc(size);

        if self.budget.is_warning(self.stats.current()) {
            log::warn!(
                "Sector memory at {} of {} budgeted bytes",
                self.stats.current(),
                self.budget.max_bytes
            );
        }
        log::debug!("Allocated sector {:?} ({} slots)", memory, self.pages_per_allocation);

        let sector = Arc::new(MemorySector {
            memory,
            size,
            state: Mutex::new(SectorState {
                slots: SlotPool::new(self.page_size, self.pages_per_allocation),
                referenced_pages: BTreeSet::new(),
            }),
            released: Arc::clone(&self.released),
        });
        self.sectors.insert(0, Arc::downgrade(&sector));
        Ok(sector)
    }

    /// Return the slot of `page` to its sector
    pub fn release(&self, page: usize, allocation: PageAllocation) {
        let mut state = allocation.sector.state.lock();
        state.slots.give_back(allocation.offset);
        state.referenced_pages.remove(&page);
    }

    /// Free the memory of every sector that died since the last call
    ///
    /// Only call once nothing is bound to that memory any more.
    pub fn collect_released<B: SparseBackend>(&mut self, backend: &mut B) -> usize {
        self.sectors.retain(|s| s.strong_count() > 0);
        let released: Vec<_> = std::mem::take(&mut *self.released.lock());
        for (memory, size) in &released {
            backend.free_memory(*memory);
            self.stats.record_dealloc(*size);
            log::debug!("Released sector {:?}", memory);
        }
        released.len()
    }

    /// Order sectors densest first so new pages fill occupied sectors
    pub fn sort_by_occupancy(&mut self) {
        self.sectors.retain(|s| s.strong_count() > 0);
        self.sectors
            .sort_by_key(|s| s.upgrade().map_or(u32::MAX, |sector| sector.available_slots()));
    }

    /// Pages to relocate out of fragmented sectors
    ///
    /// Sectors are sorted densest first. The first sector with more than
    /// `cap` free slots is kept, the pages of every later one are returned.
    pub fn plan_defragmentation(&mut self, cap: u32) -> Vec<usize> {
        self.sort_by_occupancy();

        let mut kept_one = false;
        let mut pages = BTreeSet::new();
        for sector in self.sectors() {
            if sector.available_slots() <= cap {
                continue;
            }
            if kept_one {
                pages.extend(sector.referenced_pages());
            }
            kept_one = true;
        }
        pages.into_iter().collect()
    }
}
