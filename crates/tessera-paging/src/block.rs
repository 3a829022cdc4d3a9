//! Screen blocks and the block update queue

use std::cmp::Ordering;
use std::collections::BTreeSet;

use ahash::AHashMap;

/// A block that consumes a page at a given tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockKey {
    /// Tier the block samples
    pub tier: u32,
    /// Block row
    pub row: u32,
    /// Block column
    pub col: u32,
}

impl BlockKey {
    /// Create a new block key
    pub const fn new(tier: u32, row: u32, col: u32) -> Self {
        Self { tier, row, col }
    }
}

/// A screen block whose required detail changed
///
/// Ordered by `new_lod`, then column, then row. Lower LOD values are
/// served first.
#[derive(Debug, Clone, Copy)]
pub struct TextureBlock {
    /// Block row
    pub row: u32,
    /// Block column
    pub col: u32,
    /// Detail the block is currently rendered with
    pub old_lod: f64,
    /// Detail the block now needs
    pub new_lod: f64,
    /// Whether the block is visible
    pub on_screen: bool,
}

impl TextureBlock {
    /// Tier the block currently depends on
    pub fn old_tier(&self) -> u32 {
        tier_of_lod(self.old_lod)
    }

    /// Tier the block will depend on
    pub fn new_tier(&self) -> u32 {
        tier_of_lod(self.new_lod)
    }
}

/// Discrete tier for a continuous LOD value (truncation)
pub fn tier_of_lod(lod: f64) -> u32 {
    if lod.is_finite() && lod > 0.0 { lod as u32 } else { 0 }
}

impl PartialEq for TextureBlock {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for TextureBlock {}

impl PartialOrd for TextureBlock {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TextureBlock {
    fn cmp(&self, other: &Self) -> Ordering {
        self.new_lod
            .total_cmp(&other.new_lod)
            .then(self.col.cmp(&other.col))
            .then(self.row.cmp(&other.row))
    }
}

/// Prioritized set of pending block updates, at most one per cell
#[derive(Debug, Default)]
pub struct BlockUpdateQueue {
    ordered: BTreeSet<TextureBlock>,
    by_cell: AHashMap<(u32, u32), TextureBlock>,
}

impl BlockUpdateQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a block, replacing any pending update of the same cell
    pub fn insert_or_replace(&mut self, block: TextureBlock) {
        if let Some(previous) = self.by_cell.insert((block.row, block.col), block) {
            self.ordered.remove(&previous);
        }
        self.ordered.insert(block);
    }

    /// Pop up to `count` highest priority blocks
    pub fn pop_batch(&mut self, count: usize) -> Vec<TextureBlock> {
        let mut batch = Vec::with_capacity(count.min(self.ordered.len()));
        while batch.len() < count {
            let Some(block) = self.ordered.pop_first() else {
                break;
            };
            self.by_cell.remove(&(block.row, block.col));
            batch.push(block);
        }
        batch
    }

    /// Pending update of a cell
    pub fn get(&self, row: u32, col: u32) -> Option<&TextureBlock> {
        self.by_cell.get(&(row, col))
    }

    /// Iterate in priority order
    pub fn iter(&self) -> impl Iterator<Item = &TextureBlock> {
        self.ordered.iter()
    }

    /// Number of pending updates
    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    /// Check if nothing is pending
    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }

    /// Drop every pending update
    pub fn clear(&mut self) {
        self.ordered.clear();
        self.by_cell.clear();
    }
}
