//! Page table
//!
//! One entry per virtual page across every tier.

use ahash::AHashSet;

use crate::allocator::PageAllocation;
use crate::block::BlockKey;

/// State of one virtual page
#[derive(Debug, Clone, Default)]
pub struct PageTableEntry {
    /// Page holds correct texel data
    pub valid: bool,
    /// Page is needed as the source of a coarser page this cycle
    pub pending_regen: bool,
    /// Page stays resident for the whole session
    pub pinned: bool,
    allocation: Option<PageAllocation>,
    dependents: AHashSet<BlockKey>,
}

impl PageTableEntry {
    /// Memory slot backing the page, if any
    pub fn allocation(&self) -> Option<&PageAllocation> {
        self.allocation.as_ref()
    }

    /// Blocks currently rendering from this page
    pub fn dependents(&self) -> &AHashSet<BlockKey> {
        &self.dependents
    }

    /// Page must be resident
    pub fn is_required(&self) -> bool {
        self.pinned || self.pending_regen || !self.dependents.is_empty()
    }

    /// Page holds memory nobody needs
    pub fn is_evictable(&self) -> bool {
        self.valid && !self.is_required()
    }
}

/// Flat table of every virtual page
#[derive(Debug, Clone, Default)]
pub struct PageTable {
    entries: Vec<PageTableEntry>,
}

impl PageTable {
    /// Create a table of `page_count` invalid pages
    pub fn new(page_count: usize) -> Self {
        Self {
            entries: vec![PageTableEntry::default(); page_count],
        }
    }

    /// Number of pages
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the table has no pages
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entry of a page
    pub fn entry(&self, page: usize) -> &PageTableEntry {
        &self.entries[page]
    }

    /// Mutable entry of a page
    pub fn entry_mut(&mut self, page: usize) -> &mut PageTableEntry {
        &mut self.entries[page]
    }

    /// Iterate over `(page, entry)`
    pub fn iter(&self) -> impl Iterator<Item = (usize, &PageTableEntry)> {
        self.entries.iter().enumerate()
    }

    /// Keep a page resident permanently
    pub fn pin(&mut self, page: usize) {
        let entry = &mut self.entries[page];
        entry.pinned = true;
        entry.dependents.clear();
    }

    /// Record that `block` renders from `page`; pinned pages track no dependents
    pub fn add_dependent(&mut self, page: usize, block: BlockKey) {
        let entry = &mut self.entries[page];
        if !entry.pinned {
            entry.dependents.insert(block);
        }
    }

    /// Forget that `block` renders from `page`
    pub fn remove_dependent(&mut self, page: usize, block: &BlockKey) {
        let entry = &mut self.entries[page];
        if !entry.pinned {
            entry.dependents.remove(block);
        }
    }

    /// Attach a memory slot
    pub fn set_allocation(&mut self, page: usize, allocation: PageAllocation) {
        self.entries[page].allocation = Some(allocation);
    }

    /// Detach the memory slot, marking the page invalid
    pub fn take_allocation(&mut self, page: usize) -> Option<PageAllocation> {
        let entry = &mut self.entries[page];
        entry.valid = false;
        entry.allocation.take()
    }

    /// Clear the regeneration flag of every page
    pub fn clear_pending_regen(&mut self) {
        for entry in &mut self.entries {
            entry.pending_regen = false;
        }
    }

    /// Drop the dependents of every unpinned page
    pub fn clear_dependents(&mut self) {
        for entry in self.entries.iter_mut().filter(|e| !e.pinned) {
            entry.dependents.clear();
        }
    }

    /// Pages that can give their memory back
    pub fn evictable_pages(&self) -> Vec<usize> {
        self.iter()
            .filter(|(_, entry)| entry.is_evictable())
            .map(|(page, _)| page)
            .collect()
    }

    /// Number of valid pages
    pub fn valid_count(&self) -> usize {
        self.entries.iter().filter(|e| e.valid).count()
    }

    /// Number of pages holding a memory slot
    pub fn resident_count(&self) -> usize {
        self.entries.iter().filter(|e| e.allocation.is_some()).count()
    }
}
