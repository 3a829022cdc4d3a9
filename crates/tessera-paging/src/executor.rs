//! Update executor
//!
//! Turns page table state into backend work: sparse binds, uploads of
//! finest-tier texels, downsample blits for coarser tiers and the copy
//! round trip that moves pages out of fragmented sectors.

use tessera_core::math::Extent2D;

use crate::backend::{BackendError, BufferHandle, BufferImageCopy, ImageBlit, SparseBackend, SparseImageBind};
use crate::texture::VirtualTexture;
use crate::{PagingError, PagingResult};

/// Work done by one memory reclamation pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReclaimReport {
    /// Pages that gave their slot back
    pub evicted: usize,
    /// Pages moved out of fragmented sectors
    pub relocated: usize,
}

/// Executes pending page work of one texture against a backend
pub struct UpdateExecutor<'a, B: SparseBackend> {
    texture: &'a mut VirtualTexture,
    backend: &'a mut B,
}

impl<'a, B: SparseBackend> UpdateExecutor<'a, B> {
    /// Create an executor
    pub fn new(texture: &'a mut VirtualTexture, backend: &'a mut B) -> Self {
        Self { texture, backend }
    }

    /// Bind memory to required pages and unbind pages nobody needs
    ///
    /// Looks at every page queued for binding and every page awaiting data.
    /// All changes go out in one sparse bind; sector memory that died is
    /// returned to the backend once the bind has completed. Returns the
    /// number of bind operations.
    pub fn bind_pending(&mut self) -> PagingResult<usize> {
        let texture = &mut *self.texture;
        let mut candidates = std::mem::take(&mut texture.bind_queue);
        candidates.extend(texture.update_set.iter().copied());

        let mut binds = Vec::new();
        let mut pages = Vec::new();
        for page in candidates {
            let entry = texture.page_table.entry(page);
            let (required, allocated, valid) = (entry.is_required(), entry.allocation().is_some(), entry.valid);
            let (tier, offset, extent) = texture.layout.page_region(page);

            let memory = if required {
                if allocated {
                    continue;
                }
                let allocation = texture.allocator.acquire(page, &mut *self.backend)?;
                let memory = (allocation.memory(), allocation.offset());
                texture.page_table.set_allocation(page, allocation);
                Some(memory)
            } else {
                texture.update_set.remove(&page);
                if valid {
                    // Left for eviction
                    continue;
                }
                if let Some(allocation) = texture.page_table.take_allocation(page) {
                    texture.allocator.release(page, allocation);
                }
                None
            };
            binds.push(SparseImageBind { tier, offset, extent, memory });
            pages.push(page);
        }

        if binds.is_empty() {
            return Ok(0);
        }

        let (wait, signal) = texture.sync.begin_bind();
        self.backend
            .bind_sparse(texture.image, &binds, wait, Some(signal))
            .map_err(|err| bind_error(&pages, err))?;
        self.backend.wait_sparse_idle().map_err(|err| bind_error(&pages, err))?;

        let released = texture.allocator.collect_released(&mut *self.backend);
        log::debug!("Bound {} page(s), released {} sector(s)", binds.len(), released);
        Ok(binds.len())
    }

    /// Bind, fill and validate every page awaiting data
    ///
    /// Finest-tier pages are uploaded from the source image through one
    /// staging buffer. Coarser pages are blitted from the tier below,
    /// finest first, so every source is written before it is read. All of
    /// it is submitted together. Returns the number of pages made valid.
    pub fn update_and_generate(&mut self) -> PagingResult<usize> {
        self.bind_pending()?;

        let pages: Vec<usize> = self.texture.update_set.iter().copied().collect();
        if pages.is_empty() {
            self.texture.page_table.clear_pending_regen();
            return Ok(0);
        }

        let staging = self.upload_finest_tier(&pages)?;
        let submitted = self
            .generate_coarser_tiers(&pages)
            .and_then(|_| self.backend.flush().map_err(transfer_error));
        if let Some(buffer) = staging {
            self.backend.destroy_buffer(buffer);
        }
        submitted?;

        let texture = &mut *self.texture;
        for &page in &pages {
            texture.page_table.entry_mut(page).valid = true;
        }
        texture.update_set.clear();
        texture.page_table.clear_pending_regen();

        log::debug!("Streamed {} page(s)", pages.len());
        Ok(pages.len())
    }

    /// Evict unreferenced pages, defragment and apply the resulting binds
    pub fn reclaim_memory(&mut self) -> PagingResult<ReclaimReport> {
        let evicted = self.texture.evict_unreferenced_pages();
        let cap = self.texture.config.fragmentation_cap;
        let planned = self.texture.allocator.plan_defragmentation(cap);

        let mut report = ReclaimReport {
            evicted,
            relocated: 0,
        };
        if !planned.is_empty() && self.texture.config.memory_defragmentation {
            report.relocated = self.relocate_pages(&planned)?;
            return Ok(report);
        }

        let fragmented = self.texture.allocator.fragmented_sector_count(cap);
        if !planned.is_empty() && fragmented > self.texture.reported_fragmentation {
            log::warn!(
                "{} sector(s) have more than {} free slots and defragmentation is disabled",
                fragmented,
                cap
            );
        }
        self.texture.reported_fragmentation = fragmented;

        self.texture.allocator.sort_by_occupancy();
        self.bind_pending()?;
        Ok(report)
    }

    /// Move pages into the densest sectors, preserving their contents
    ///
    /// Valid pages are copied out to a temporary buffer, given new slots,
    /// rebound and copied back. Waits for the copies on both sides.
    pub fn relocate_pages(&mut self, pages: &[usize]) -> PagingResult<usize> {
        if pages.is_empty() {
            return Ok(0);
        }

        let page_size = self.texture.layout.page_size();
        let regions: Vec<BufferImageCopy> = pages
            .iter()
            .filter(|&&page| self.texture.page_table.entry(page).valid)
            .enumerate()
            .map(|(slot, &page)| {
                let (tier, offset, extent) = self.texture.layout.page_region(page);
                BufferImageCopy {
                    buffer_offset: slot as u64 * page_size,
                    tier,
                    offset,
                    extent,
                }
            })
            .collect();
        let preserved: Vec<usize> = pages
            .iter()
            .copied()
            .filter(|&page| self.texture.page_table.entry(page).valid)
            .collect();

        let buffer = self
            .backend
            .create_buffer(page_size * regions.len().max(1) as u64)
            .map_err(transfer_error)?;
        let result = self.relocate_through(buffer, pages, &preserved, &regions);
        self.backend.destroy_buffer(buffer);
        result?;

        log::debug!("Relocated {} page(s) out of fragmented sectors", pages.len());
        Ok(pages.len())
    }

    fn relocate_through(
        &mut self,
        buffer: BufferHandle,
        pages: &[usize],
        preserved: &[usize],
        regions: &[BufferImageCopy],
    ) -> PagingResult<()> {
        let image = self.texture.image;
        if !regions.is_empty() {
            self.backend
                .copy_image_to_buffer(image, buffer, regions)
                .and_then(|_| self.backend.flush())
                .map_err(transfer_error)?;
        }

        let texture = &mut *self.texture;
        for &page in pages {
            if let Some(allocation) = texture.page_table.take_allocation(page) {
                texture.allocator.release(page, allocation);
            }
            texture.bind_queue.insert(page);
        }
        texture.allocator.sort_by_occupancy();
        self.bind_pending()?;

        if !regions.is_empty() {
            self.backend
                .copy_buffer_to_image(buffer, image, regions)
                .and_then(|_| self.backend.flush())
                .map_err(transfer_error)?;
        }
        for &page in preserved {
            self.texture.page_table.entry_mut(page).valid = true;
        }
        Ok(())
    }

    /// Stage finest-tier texels; the returned buffer lives until the flush
    fn upload_finest_tier(&mut self, pages: &[usize]) -> PagingResult<Option<BufferHandle>> {
        let texture = &*self.texture;
        let mut data = Vec::new();
        let mut regions = Vec::new();
        for &page in pages.iter().filter(|&&page| texture.layout.tier_of_page(page) == 0) {
            let (tier, offset, extent) = texture.layout.page_region(page);
            regions.push(BufferImageCopy {
                buffer_offset: data.len() as u64,
                tier,
                offset,
                extent,
            });
            texture.source.copy_block(offset, extent, &mut data)?;
        }
        if regions.is_empty() {
            return Ok(None);
        }

        let buffer = self.backend.create_buffer(data.len() as u64).map_err(transfer_error)?;
        let recorded = self
            .backend
            .write_buffer(buffer, 0, &data)
            .and_then(|_| self.backend.copy_buffer_to_image(buffer, texture.image, &regions));
        if let Err(err) = recorded {
            self.backend.destroy_buffer(buffer);
            return Err(transfer_error(err));
        }
        Ok(Some(buffer))
    }

    fn generate_coarser_tiers(&mut self, pages: &[usize]) -> PagingResult<()> {
        let texture = &*self.texture;
        let layout = &texture.layout;

        for tier in 1..layout.tier_count() {
            let source_extent = layout.tier(tier - 1).extent;
            let blits: Vec<ImageBlit> = pages
                .iter()
                .filter(|&&page| layout.tier_of_page(page) == tier)
                .map(|&page| {
                    let (_, offset, extent) = layout.page_region(page);
                    let src_offset = offset.scaled(2);
                    let src_extent = Extent2D::new(
                        (extent.width * 2)
                            .min(source_extent.width.saturating_sub(src_offset.x))
                            .max(1),
                        (extent.height * 2)
                            .min(source_extent.height.saturating_sub(src_offset.y))
                            .max(1),
                    );
                    ImageBlit {
                        src_tier: tier - 1,
                        src_offset,
                        src_extent,
                        dst_tier: tier,
                        dst_offset: offset,
                        dst_extent: extent,
                    }
                })
                .collect();
            if blits.is_empty() {
                continue;
            }

            self.backend.barrier(texture.image, tier - 1);
            self.backend.blit_image(texture.image, &blits).map_err(transfer_error)?;
        }
        Ok(())
    }
}

fn bind_error(pages: &[usize], err: BackendError) -> PagingError {
    log::error!("Sparse bind of pages {:?} failed: {}", pages, err);
    PagingError::BindFailed {
        pages: pages.to_vec(),
        reason: err.to_string(),
    }
}

fn transfer_error(err: BackendError) -> PagingError {
    PagingError::TransferFailed(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockKey;
    use crate::headless::HeadlessBackend;
    use crate::source::RawImage;
    use crate::PagingConfig;

    const BLOCK: BlockKey = BlockKey::new(0, 0, 0);

    fn setup() -> (HeadlessBackend, VirtualTexture) {
        let mut backend = HeadlessBackend::default();
        let config = PagingConfig {
            grid_rows: 1,
            grid_cols: 1,
            pages_per_allocation: 4,
            fragmentation_cap: 1,
            ..Default::default()
        };
        let source = RawImage::procedural(1024, 1024).unwrap();
        let texture = VirtualTexture::new(&mut backend, source, config).unwrap();
        (backend, texture)
    }

    fn request(texture: &mut VirtualTexture, pages: impl IntoIterator<Item = usize>) {
        for page in pages {
            texture.page_table.add_dependent(page, BLOCK);
            texture.update_set.insert(page);
        }
    }

    fn release(texture: &mut VirtualTexture, pages: impl IntoIterator<Item = usize>) {
        for page in pages {
            texture.page_table.remove_dependent(page, &BLOCK);
        }
    }

    fn read_page(backend: &HeadlessBackend, texture: &VirtualTexture, page: usize) -> Vec<u8> {
        let (tier, offset, extent) = texture.layout().page_region(page);
        backend.read_region(texture.image(), tier, offset, extent).unwrap()
    }

    #[test]
    fn test_finest_page_matches_source() {
        let (mut backend, mut texture) = setup();
        let page = texture.layout().page_index(0, 1, 1);
        request(&mut texture, [page]);

        let streamed = UpdateExecutor::new(&mut texture, &mut backend).update_and_generate().unwrap();
        assert_eq!(streamed, 1);
        assert!(texture.page_table().entry(page).valid);

        let (_, offset, extent) = texture.layout().page_region(page);
        let mut expected = Vec::new();
        texture.source().copy_block(offset, extent, &mut expected).unwrap();
        assert_eq!(read_page(&backend, &texture, page), expected);
    }

    #[test]
    fn test_reload_after_eviction_is_identical() {
        let (mut backend, mut texture) = setup();
        let page = texture.layout().page_index(0, 3, 5);
        request(&mut texture, [page]);
        UpdateExecutor::new(&mut texture, &mut backend).update_and_generate().unwrap();
        let original = read_page(&backend, &texture, page);

        release(&mut texture, [page]);
        let report = UpdateExecutor::new(&mut texture, &mut backend).reclaim_memory().unwrap();
        assert_eq!(report.evicted, 1);
        assert!(!backend.is_page_bound(texture.image(), 0, 5, 3));
        assert!(texture.page_table().entry(page).allocation().is_none());

        request(&mut texture, [page]);
        UpdateExecutor::new(&mut texture, &mut backend).update_and_generate().unwrap();
        assert_eq!(read_page(&backend, &texture, page), original);
        assert_eq!(backend.counters().dangling_frees, 0);
    }

    #[test]
    fn test_sources_released_after_generation() {
        let (mut backend, mut texture) = setup();
        let layout = texture.layout().clone();
        let page = layout.page_index(1, 0, 0);
        request(&mut texture, [page]);
        {
            let resolver = crate::resolver::DependencyResolver::new(&layout, texture.grid());
            let texture = &mut texture;
            resolver.expand_ancestors(page, &mut texture.page_table, &mut texture.update_set);
        }

        let streamed = UpdateExecutor::new(&mut texture, &mut backend).update_and_generate().unwrap();
        assert_eq!(streamed, 5);
        assert!(read_page(&backend, &texture, page).iter().any(|&b| b != 0));

        let report = UpdateExecutor::new(&mut texture, &mut backend).reclaim_memory().unwrap();
        assert_eq!(report.evicted, 4);
        assert!(texture.page_table().entry(page).valid);
        assert_eq!(texture.page_table().valid_count(), 2);
        assert_eq!(texture.allocator().used_slots(), 2);
    }

    #[test]
    fn test_relocation_preserves_data() {
        let (mut backend, mut texture) = setup();
        request(&mut texture, 0..12);
        UpdateExecutor::new(&mut texture, &mut backend).update_and_generate().unwrap();
        assert_eq!(texture.allocator().sector_count(), 4);

        let kept = [0, 1, 2, 6, 10, 11, texture.layout().page_count() - 1];
        let before: Vec<Vec<u8>> = kept.iter().map(|&page| read_page(&backend, &texture, page)).collect();

        // Thin out two sectors so each keeps one page
        release(&mut texture, [3, 4, 5, 7, 8, 9]);
        let report = UpdateExecutor::new(&mut texture, &mut backend).reclaim_memory().unwrap();
        assert_eq!(report, ReclaimReport { evicted: 6, relocated: 2 });

        let after: Vec<Vec<u8>> = kept.iter().map(|&page| read_page(&backend, &texture, page)).collect();
        assert_eq!(before, after);
        assert!(kept.iter().all(|&page| texture.page_table().entry(page).valid));
        assert_eq!(texture.allocator().sector_count(), 2);
        assert_eq!(texture.allocator().used_slots() as usize, texture.page_table().valid_count());
        assert_eq!(backend.counters().dangling_frees, 0);
    }

    #[test]
    fn test_fragmentation_kept_without_defragmentation() {
        let (mut backend, mut texture) = setup();
        texture.config.memory_defragmentation = false;
        request(&mut texture, 0..12);
        UpdateExecutor::new(&mut texture, &mut backend).update_and_generate().unwrap();

        release(&mut texture, [3, 4, 5, 7, 8, 9]);
        let report = UpdateExecutor::new(&mut texture, &mut backend).reclaim_memory().unwrap();
        assert_eq!(report, ReclaimReport { evicted: 6, relocated: 0 });
        assert_eq!(texture.allocator().sector_count(), 4);
        assert_eq!(texture.allocator().fragmented_sector_count(1), 3);
        assert_eq!(texture.allocator.plan_defragmentation(1), vec![6, 10]);
    }

    #[test]
    fn test_nothing_pending_binds_nothing() {
        let (mut backend, mut texture) = setup();
        let before = backend.counters().bind_calls;
        let mut executor = UpdateExecutor::new(&mut texture, &mut backend);
        assert_eq!(executor.bind_pending().unwrap(), 0);
        assert_eq!(executor.update_and_generate().unwrap(), 0);
        assert_eq!(backend.counters().bind_calls, before);
    }
}
