//! Dependency resolver
//!
//! Maps screen blocks to the pages they sample and expands pages of
//! coarser tiers to the finer pages they are generated from.

use std::collections::BTreeSet;

use smallvec::SmallVec;

use tessera_core::grid::GridSize;

use crate::layout::TextureLayout;
use crate::page_table::PageTable;

/// Resolves page dependencies for one tier layout and block grid
#[derive(Debug, Clone, Copy)]
pub struct DependencyResolver<'a> {
    layout: &'a TextureLayout,
    grid: GridSize,
}

impl<'a> DependencyResolver<'a> {
    /// Create a resolver
    pub fn new(layout: &'a TextureLayout, grid: GridSize) -> Self {
        Self { layout, grid }
    }

    /// Pages of `tier` overlapped by the block at `(row, col)`
    ///
    /// The block covers a fixed fraction of the texture; the fraction is
    /// scaled by the fractional number of pages across the tier and the
    /// covering page range is rounded outwards.
    pub fn pages_for_block(&self, row: u32, col: u32, tier: u32) -> Vec<usize> {
        let props = self.layout.tier(tier);
        let gran = self.layout.granularity();

        let (col_low, col_high) = page_span(
            col,
            self.grid.cols,
            props.extent.width as f64 / gran.width as f64,
            props.cols,
        );
        let (row_low, row_high) = page_span(
            row,
            self.grid.rows,
            props.extent.height as f64 / gran.height as f64,
            props.rows,
        );

        let mut pages = Vec::with_capacity(((row_high - row_low) * (col_high - col_low)) as usize);
        for page_row in row_low..row_high {
            for page_col in col_low..col_high {
                pages.push(self.layout.page_index(tier, page_row, page_col));
            }
        }
        pages
    }

    /// Pages of the next finer tier a page is downsampled from
    pub fn regeneration_sources(&self, page: usize) -> SmallVec<[usize; 4]> {
        let coord = self.layout.page_coord(page);
        let mut sources = SmallVec::new();
        if coord.tier == 0 {
            return sources;
        }

        let finer = coord.tier - 1;
        let props = self.layout.tier(finer);
        for dy in 0..2 {
            for dx in 0..2 {
                let row = (coord.row * 2 + dy).min(props.rows - 1);
                let col = (coord.col * 2 + dx).min(props.cols - 1);
                let source = self.layout.page_index(finer, row, col);
                if !sources.contains(&source) {
                    sources.push(source);
                }
            }
        }
        sources
    }

    /// Schedule every finer page needed to generate `page`
    ///
    /// Walks down the tiers with an explicit worklist. Each source page is
    /// flagged for regeneration; invalid ones join `update_set` and are
    /// expanded in turn. Pages already in `update_set` are not revisited,
    /// so repeated calls schedule nothing new. Returns the newly scheduled
    /// pages.
    pub fn expand_ancestors(
        &self,
        page: usize,
        table: &mut PageTable,
        update_set: &mut BTreeSet<usize>,
    ) -> Vec<usize> {
        let mut scheduled = Vec::new();
        let mut worklist = vec![page];

        while let Some(current) = worklist.pop() {
            for source in self.regeneration_sources(current) {
                let entry = table.entry_mut(source);
                entry.pending_regen = true;
                if !entry.valid && update_set.insert(source) {
                    worklist.push(source);
                    scheduled.push(source);
                }
            }
        }
        scheduled
    }
}

/// Half-open page range covered by block `index` of `blocks`
fn page_span(index: u32, blocks: u32, pages_across: f64, page_limit: u32) -> (u32, u32) {
    let page_divider = 1.0 / pages_across;
    let low = index as f64 / blocks as f64;
    let high = (index + 1) as f64 / blocks as f64;
    let first = (low / page_divider).floor() as u32;
    let last = ((high / page_divider).ceil() as u32).min(page_limit);
    (first.min(last), last)
}
