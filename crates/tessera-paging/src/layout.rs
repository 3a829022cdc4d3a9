//! Tier layout
//!
//! Dimensions and page ranges of every detail tier. Pages are numbered
//! contiguously, finest tier first and row-major within a tier.

use serde::Serialize;

use tessera_core::math::{Extent2D, Offset2D};

/// Properties of one detail tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LodProperties {
    /// Texel dimensions of the tier
    pub extent: Extent2D,
    /// Page rows
    pub rows: u32,
    /// Page columns
    pub cols: u32,
    /// Number of pages in the tier
    pub page_count: usize,
    /// Index of the first page of the tier
    pub base_page: usize,
}

/// Location of a page inside its tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PageCoord {
    /// Detail tier
    pub tier: u32,
    /// Page row
    pub row: u32,
    /// Page column
    pub col: u32,
}

/// Tier and page layout of a virtual texture
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TextureLayout {
    base_extent: Extent2D,
    granularity: Extent2D,
    page_size: u64,
    tiers: Vec<LodProperties>,
}

impl TextureLayout {
    /// Number of tiers in a full chain down to 1x1
    pub fn full_chain_length(extent: Extent2D) -> u32 {
        32 - extent.width.max(extent.height).max(1).leading_zeros()
    }

    /// Lay out `max_tiers` tiers (clamped to the full chain) of `base_extent`
    pub fn new(base_extent: Extent2D, granularity: Extent2D, max_tiers: u32, page_size: u64) -> Self {
        let count = max_tiers.clamp(1, Self::full_chain_length(base_extent));
        let mut tiers = Vec::with_capacity(count as usize);
        let mut extent = base_extent;
        let mut base_page = 0;

        for _ in 0..count {
            let pages = extent.tiles(granularity);
            let page_count = pages.area() as usize;
            tiers.push(LodProperties {
                extent,
                rows: pages.height,
                cols: pages.width,
                page_count,
                base_page,
            });
            base_page += page_count;
            extent = extent.halved();
        }

        Self {
            base_extent,
            granularity,
            page_size,
            tiers,
        }
    }

    /// Size of the finest tier
    pub fn base_extent(&self) -> Extent2D {
        self.base_extent
    }

    /// Page granularity in texels
    pub fn granularity(&self) -> Extent2D {
        self.granularity
    }

    /// Bytes of device memory backing one page
    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    /// All tiers, finest first
    pub fn tiers(&self) -> &[LodProperties] {
        &self.tiers
    }

    /// Properties of one tier
    pub fn tier(&self, tier: u32) -> &LodProperties {
        &self.tiers[tier as usize]
    }

    /// Number of tiers
    pub fn tier_count(&self) -> u32 {
        self.tiers.len() as u32
    }

    /// Index of the least detailed tier
    pub fn coarsest_tier(&self) -> u32 {
        self.tier_count() - 1
    }

    /// Total number of virtual pages
    pub fn page_count(&self) -> usize {
        self.tiers.iter().map(|t| t.page_count).sum()
    }

    /// Page index range of one tier
    pub fn tier_pages(&self, tier: u32) -> std::ops::Range<usize> {
        let props = self.tier(tier);
        props.base_page..props.base_page + props.page_count
    }

    /// Tier a page belongs to
    pub fn tier_of_page(&self, page: usize) -> u32 {
        let tier = self
            .tiers
            .partition_point(|t| t.base_page + t.page_count <= page);
        debug_assert!(tier < self.tiers.len(), "page {page} out of range");
        tier as u32
    }

    /// Tier, row and column of a page
    pub fn page_coord(&self, page: usize) -> PageCoord {
        let tier = self.tier_of_page(page);
        let props = self.tier(tier);
        let local = (page - props.base_page) as u32;
        PageCoord {
            tier,
            row: local / props.cols,
            col: local % props.cols,
        }
    }

    /// Page index of a tier, row and column
    pub fn page_index(&self, tier: u32, row: u32, col: u32) -> usize {
        let props = self.tier(tier);
        props.base_page + row as usize * props.cols as usize + col as usize
    }

    /// Texel region covered by a page, clamped at the tier edge
    pub fn page_region(&self, page: usize) -> (u32, Offset2D, Extent2D) {
        let coord = self.page_coord(page);
        let tier_extent = self.tier(coord.tier).extent;
        let offset = Offset2D::new(coord.col * self.granularity.width, coord.row * self.granularity.height);
        let extent = Extent2D::new(
            self.granularity.width.min(tier_extent.width - offset.x),
            self.granularity.height.min(tier_extent.height - offset.y),
        );
        (coord.tier, offset, extent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout_1000() -> TextureLayout {
        TextureLayout::new(Extent2D::new(1000, 600), Extent2D::new(128, 128), 5, 65536)
    }

    #[test]
    fn test_tier_dimensions() {
        let layout = layout_1000();
        let extents: Vec<_> = layout.tiers().iter().map(|t| t.extent).collect();
        assert_eq!(
            extents,
            vec![
                Extent2D::new(1000, 600),
                Extent2D::new(500, 300),
                Extent2D::new(250, 150),
                Extent2D::new(125, 75),
                Extent2D::new(62, 37),
            ]
        );
        assert_eq!((layout.tier(0).cols, layout.tier(0).rows), (8, 5));
        assert_eq!((layout.tier(4).cols, layout.tier(4).rows), (1, 1));
    }

    #[test]
    fn test_page_counts_are_contiguous() {
        let layout = layout_1000();
        let mut expected_base = 0;
        for tier in layout.tiers() {
            assert_eq!(tier.base_page, expected_base);
            expected_base += tier.page_count;
        }
        assert_eq!(layout.page_count(), expected_base);
        assert_eq!(layout.page_count(), 40 + 12 + 4 + 1 + 1);
    }

    #[test]
    fn test_page_coord_roundtrip() {
        let layout = layout_1000();
        for page in 0..layout.page_count() {
            let coord = layout.page_coord(page);
            assert_eq!(layout.page_index(coord.tier, coord.row, coord.col), page);
        }
        assert_eq!(layout.tier_of_page(39), 0);
        assert_eq!(layout.tier_of_page(40), 1);
        assert_eq!(layout.tier_of_page(layout.page_count() - 1), 4);
    }

    #[test]
    fn test_page_region_clamped_at_edge() {
        let layout = layout_1000();
        let last_tier0 = layout.page_index(0, 4, 7);
        let (tier, offset, extent) = layout.page_region(last_tier0);
        assert_eq!(tier, 0);
        assert_eq!(offset, Offset2D::new(896, 512));
        assert_eq!(extent, Extent2D::new(104, 88));
    }

    #[test]
    fn test_tier_count_clamped_to_chain() {
        let layout = TextureLayout::new(Extent2D::new(4, 4), Extent2D::new(2, 2), 10, 16);
        assert_eq!(TextureLayout::full_chain_length(Extent2D::new(4, 4)), 3);
        assert_eq!(layout.tier_count(), 3);
        assert_eq!(layout.coarsest_tier(), 2);
    }
}
