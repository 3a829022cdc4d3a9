//! Virtual texture
//!
//! The aggregate every paging stage operates on: tier layout, sparse image,
//! page table, sector allocator, LOD tables and the pending work sets.

use std::collections::BTreeSet;

use glam::Mat4;

use tessera_core::grid::{Grid, GridSize};
use tessera_core::math::{align_up, Extent2D};
use tessera_core::memory::MemoryBudget;
use tessera_core::timer::ScopedTimer;

use crate::allocator::MemorySectorAllocator;
use crate::backend::{
    ImageHandle, ImageUsage, MemoryPropertyFlags, SemaphoreHandle, SparseBackend, SparseImageDesc, TextureFormat,
};
use crate::block::{BlockKey, BlockUpdateQueue, TextureBlock};
use crate::executor::UpdateExecutor;
use crate::layout::TextureLayout;
use crate::page_table::PageTable;
use crate::projector::{LodCell, LodProjector, LodTable};
use crate::resolver::DependencyResolver;
use crate::source::{RawImage, BYTES_PER_TEXEL};
use crate::{FrameSync, PagingConfig, PagingError, PagingResult, PagingStatistics};

/// Semaphores ordering binds against host render submissions
#[derive(Debug)]
pub(crate) struct SyncState {
    bound: SemaphoreHandle,
    submit: SemaphoreHandle,
    bound_since_frame: bool,
    submit_pending: bool,
}

impl SyncState {
    /// Semaphores for the next bind: wait on the last submission, signal `bound`
    pub(crate) fn begin_bind(&mut self) -> (Option<SemaphoreHandle>, SemaphoreHandle) {
        let wait = self.submit_pending.then_some(self.submit);
        self.submit_pending = false;
        self.bound_since_frame = true;
        (wait, self.bound)
    }

    fn frame(&mut self) -> FrameSync {
        let wait = self.bound_since_frame.then_some(self.bound);
        self.bound_since_frame = false;
        self.submit_pending = true;
        FrameSync {
            wait,
            signal: self.submit,
        }
    }
}

/// A sparse texture paged in and out of device memory
pub struct VirtualTexture {
    pub(crate) config: PagingConfig,
    pub(crate) layout: TextureLayout,
    pub(crate) image: ImageHandle,
    pub(crate) source: RawImage,
    pub(crate) page_table: PageTable,
    pub(crate) allocator: MemorySectorAllocator,
    pub(crate) projector: LodProjector,
    pub(crate) current_table: LodTable,
    pub(crate) new_table: LodTable,
    pub(crate) block_queue: BlockUpdateQueue,
    /// Pages awaiting data this cycle
    pub(crate) update_set: BTreeSet<usize>,
    /// Pages whose binding may have to change
    pub(crate) bind_queue: BTreeSet<usize>,
    pub(crate) sync: SyncState,
    pub(crate) reported_fragmentation: usize,
    grid: GridSize,
    pending_grid: Option<GridSize>,
    view_projection: Mat4,
    screen: Extent2D,
}

impl VirtualTexture {
    /// Create the sparse image for `source` and load its least detailed level
    ///
    /// Fails with [`PagingError::Capability`] before any paging state exists
    /// when the backend cannot page a sparse image.
    pub fn new<B: SparseBackend>(backend: &mut B, source: RawImage, config: PagingConfig) -> PagingResult<Self> {
        config.validate()?;

        if let Some(feature) = backend.capabilities().missing_feature() {
            return Err(PagingError::Capability(format!("device lacks {feature}")));
        }

        let format = TextureFormat::Rgba8Srgb;
        let usage = ImageUsage::SAMPLED | ImageUsage::TRANSFER_SRC | ImageUsage::TRANSFER_DST;
        let granularity = backend
            .query_page_granularity(format, usage)
            .map_err(|err| PagingError::Capability(err.to_string()))?;
        if granularity.width == 0 || granularity.height == 0 {
            return Err(PagingError::Capability(format!(
                "unusable page granularity {}x{}",
                granularity.width, granularity.height
            )));
        }

        let extent = source.extent();
        let tiers = config.max_tiers.min(TextureLayout::full_chain_length(extent));
        let image = backend
            .create_sparse_image(&SparseImageDesc {
                format,
                extent,
                tiers,
                usage,
            })
            .map_err(|err| PagingError::Capability(err.to_string()))?;

        let requirements = backend.query_memory_requirements(image)?;
        let memory_type = backend
            .find_memory_type(requirements.type_mask, MemoryPropertyFlags::DEVICE_LOCAL)
            .ok_or_else(|| PagingError::Capability("no device-local memory type for the image".to_string()))?;

        let page_size = align_up(
            granularity.volume() * BYTES_PER_TEXEL as u64,
            requirements.alignment,
        );
        let layout = TextureLayout::new(extent, granularity.to_2d(), tiers, page_size);
        let budget = MemoryBudget {
            max_bytes: config.memory_budget_bytes,
            warning_threshold: config.budget_warning_threshold,
        };
        let allocator = MemorySectorAllocator::new(page_size, config.pages_per_allocation, memory_type, budget);

        let sync = SyncState {
            bound: backend.create_semaphore()?,
            submit: backend.create_semaphore()?,
            bound_since_frame: false,
            submit_pending: false,
        };

        let grid = config.grid_size();
        let coarsest = LodCell::new(layout.coarsest_tier() as f64, false);
        let mut texture = Self {
            page_table: PageTable::new(layout.page_count()),
            projector: LodProjector::new(extent, layout.tier_count(), config.plane_half_extent),
            current_table: Grid::filled(grid, coarsest),
            new_table: Grid::filled(grid, coarsest),
            block_queue: BlockUpdateQueue::new(),
            update_set: BTreeSet::new(),
            bind_queue: BTreeSet::new(),
            reported_fragmentation: 0,
            pending_grid: None,
            view_projection: Mat4::IDENTITY,
            screen: config.screen_extent(),
            grid,
            sync,
            allocator,
            layout,
            image,
            source,
            config,
        };
        log::info!(
            "Created virtual texture {}x{}: {} tiers, {} pages of {} bytes",
            extent.width,
            extent.height,
            texture.layout.tier_count(),
            texture.layout.page_count(),
            page_size
        );

        texture.load_least_detailed_level(backend)?;
        Ok(texture)
    }

    /// Tier layout
    pub fn layout(&self) -> &TextureLayout {
        &self.layout
    }

    /// Sparse image handle
    pub fn image(&self) -> ImageHandle {
        self.image
    }

    /// Source image
    pub fn source(&self) -> &RawImage {
        &self.source
    }

    /// Configuration
    pub fn config(&self) -> &PagingConfig {
        &self.config
    }

    /// Page table
    pub fn page_table(&self) -> &PageTable {
        &self.page_table
    }

    /// Sector allocator
    pub fn allocator(&self) -> &MemorySectorAllocator {
        &self.allocator
    }

    /// Block grid in use
    pub fn grid(&self) -> GridSize {
        self.grid
    }

    /// LOD table the texture is currently rendered with
    pub fn current_lod_table(&self) -> &LodTable {
        &self.current_table
    }

    /// Pending block updates, in processing order
    pub fn block_queue(&self) -> &BlockUpdateQueue {
        &self.block_queue
    }

    /// Set the transform from plane model space to clip space
    pub fn set_view_projection(&mut self, transform: Mat4) {
        self.view_projection = transform;
    }

    /// Request a new block grid, applied on the next LOD calculation
    pub fn set_grid_resolution(&mut self, grid: GridSize) -> PagingResult<()> {
        if grid.rows == 0 || grid.cols == 0 {
            return Err(PagingError::InvalidConfig(format!(
                "grid resolution {}x{} has no blocks",
                grid.rows, grid.cols
            )));
        }
        self.pending_grid = Some(grid).filter(|grid| *grid != self.grid);
        Ok(())
    }

    /// Set the screen extent used for projection
    pub fn set_screen_extent(&mut self, screen: Extent2D) {
        self.screen = screen;
    }

    /// Residency statistics
    pub fn statistics(&self) -> PagingStatistics {
        let stats = self.allocator.stats();
        PagingStatistics {
            virtual_page_count: self.layout.page_count(),
            resident_page_count: self.page_table.resident_count(),
            valid_page_count: self.page_table.valid_count(),
            allocated_sector_count: self.allocator.sector_count(),
            allocated_page_slots: self.allocator.allocated_slots(),
            used_page_slots: self.allocator.used_slots(),
            fragmented_sector_count: self.allocator.fragmented_sector_count(self.config.fragmentation_cap),
            pending_block_updates: self.block_queue.len(),
            device_memory_bytes: stats.current(),
            peak_device_memory_bytes: stats.peak_usage(),
            stage: None,
        }
    }

    /// Semaphores for this frame's render submission
    pub fn frame_sync(&mut self) -> FrameSync {
        self.sync.frame()
    }

    /// Apply a pending grid change and project the plane into the new table
    pub(crate) fn calculate_lod_table(&mut self) {
        if let Some(grid) = self.pending_grid.take() {
            self.reset_lod_tables(grid);
        }
        self.new_table = self.projector.calculate(&self.view_projection, self.grid, self.screen);
    }

    /// Diff the new table against the current one
    ///
    /// Rebuilds the block queue. Blocks leaving the screen drop their page
    /// dependencies right away; blocks entering the screen or changing tier
    /// are queued. Returns whether anything changed.
    pub fn compare_lod_tables(&mut self) -> bool {
        self.block_queue.clear();
        let mut changed = false;

        for row in 0..self.grid.rows {
            for col in 0..self.grid.cols {
                let current = *self.current_table.get(row, col);
                let new = *self.new_table.get(row, col);
                let block = TextureBlock {
                    row,
                    col,
                    old_lod: current.lod,
                    new_lod: new.lod,
                    on_screen: new.on_screen,
                };

                if !new.on_screen && current.on_screen {
                    self.process_texture_block(&block);
                    self.current_table.set(row, col, new);
                    changed = true;
                } else if new.on_screen && (!current.on_screen || new.tier() != current.tier()) {
                    self.block_queue.insert_or_replace(block);
                    changed = true;
                }
            }
        }
        changed
    }

    /// Move a block's page dependencies from its old tier to its new one
    ///
    /// Pages the block now needs that hold no data are scheduled together
    /// with the finer pages they are generated from.
    pub fn process_texture_block(&mut self, block: &TextureBlock) {
        let resolver = DependencyResolver::new(&self.layout, self.grid);

        let old_key = BlockKey::new(block.old_tier(), block.row, block.col);
        for page in resolver.pages_for_block(block.row, block.col, old_key.tier) {
            self.page_table.remove_dependent(page, &old_key);
        }
        if !block.on_screen {
            return;
        }

        let new_key = BlockKey::new(block.new_tier(), block.row, block.col);
        for page in resolver.pages_for_block(block.row, block.col, new_key.tier) {
            self.page_table.add_dependent(page, new_key);
            if !self.page_table.entry(page).valid && self.update_set.insert(page) {
                resolver.expand_ancestors(page, &mut self.page_table, &mut self.update_set);
            }
        }
    }

    /// Process the next batch of queued blocks, returning how many ran
    pub(crate) fn process_blocks(&mut self) -> usize {
        let batch = self.block_queue.pop_batch(self.config.blocks_per_cycle);
        for block in &batch {
            self.process_texture_block(block);
            let cell = *self.new_table.get(block.row, block.col);
            self.current_table.set(block.row, block.col, cell);
        }
        batch.len()
    }

    /// Release the slot of every valid page nobody needs
    ///
    /// The pages are queued so the next bind unbinds them.
    pub fn evict_unreferenced_pages(&mut self) -> usize {
        let pages = self.page_table.evictable_pages();
        for &page in &pages {
            if let Some(allocation) = self.page_table.take_allocation(page) {
                self.allocator.release(page, allocation);
            }
            self.bind_queue.insert(page);
        }
        if !pages.is_empty() {
            log::debug!("Evicted {} page(s)", pages.len());
        }
        pages.len()
    }

    /// Switch to a new block grid, forgetting every block dependency
    pub fn reset_lod_tables(&mut self, grid: GridSize) {
        let coarsest = LodCell::new(self.layout.coarsest_tier() as f64, false);
        self.grid = grid;
        self.current_table = Grid::filled(grid, coarsest);
        self.new_table = Grid::filled(grid, coarsest);
        self.block_queue.clear();
        self.page_table.clear_dependents();
        self.projector.reset_topology();
        log::info!("Grid resolution changed to {}x{}", grid.rows, grid.cols);
    }

    /// Pin and fully generate the coarsest tier
    ///
    /// Every block is treated as entering the screen at the coarsest tier.
    /// Generating it streams the whole finer chain once; those pages are
    /// released again as soon as the coarsest tier is valid.
    pub fn load_least_detailed_level<B: SparseBackend>(&mut self, backend: &mut B) -> PagingResult<()> {
        let _timer = ScopedTimer::traced("load_least_detailed_level");

        let coarsest = self.layout.coarsest_tier();
        for page in self.layout.tier_pages(coarsest) {
            self.page_table.pin(page);
        }
        self.current_table.fill(LodCell::new(coarsest as f64, false));
        self.new_table.fill(LodCell::new(coarsest as f64, true));

        self.compare_lod_tables();
        while !self.block_queue.is_empty() {
            self.process_blocks();
            let mut executor = UpdateExecutor::new(self, backend);
            executor.update_and_generate()?;
            executor.reclaim_memory()?;
        }

        log::info!(
            "Loaded least detailed level: {} page(s) pinned at tier {}",
            self.layout.tier_pages(coarsest).len(),
            coarsest
        );
        Ok(())
    }
}
