//! Raw source image
//!
//! The full-resolution RGBA8 image that finest-tier pages are streamed from.

use tessera_core::math::{Extent2D, Offset2D};

use crate::{PagingError, PagingResult};

/// Bytes per RGBA8 texel
pub const BYTES_PER_TEXEL: usize = 4;

/// Full-resolution RGBA8 image held in host memory
#[derive(Debug, Clone, PartialEq)]
pub struct RawImage {
    extent: Extent2D,
    pixels: Vec<u8>,
}

impl RawImage {
    /// Wrap tightly packed RGBA8 rows
    pub fn from_rgba8(width: u32, height: u32, pixels: Vec<u8>) -> PagingResult<Self> {
        let extent = Extent2D::new(width, height);
        if extent.is_empty() {
            return Err(PagingError::SourceMismatch(format!("empty image {width}x{height}")));
        }
        let expected = extent.area() as usize * BYTES_PER_TEXEL;
        if pixels.len() != expected {
            return Err(PagingError::SourceMismatch(format!(
                "{width}x{height} RGBA8 image needs {expected} bytes, got {}",
                pixels.len()
            )));
        }
        Ok(Self { extent, pixels })
    }

    /// Deterministic test pattern: UV gradient with an 8x8 checker in blue
    pub fn procedural(width: u32, height: u32) -> PagingResult<Self> {
        let w = width.max(1) as u64;
        let h = height.max(1) as u64;
        let cell_w = (w / 8).max(1);
        let cell_h = (h / 8).max(1);
        let mut pixels = Vec::with_capacity((w * h) as usize * BYTES_PER_TEXEL);
        for y in 0..h {
            for x in 0..w {
                let checker = ((x / cell_w) + (y / cell_h)) % 2 == 0;
                pixels.extend_from_slice(&[
                    (x * 255 / w) as u8,
                    (y * 255 / h) as u8,
                    if checker { 224 } else { 32 },
                    255,
                ]);
            }
        }
        Self::from_rgba8(width, height, pixels)
    }

    /// Image size
    pub fn extent(&self) -> Extent2D {
        self.extent
    }

    /// All texels
    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// Append a rectangular region as tightly packed rows to `out`
    pub fn copy_block(&self, offset: Offset2D, extent: Extent2D, out: &mut Vec<u8>) -> PagingResult<()> {
        if offset.x + extent.width > self.extent.width || offset.y + extent.height > self.extent.height {
            return Err(PagingError::SourceMismatch(format!(
                "block {:?}+{:?} outside source {:?}",
                offset, extent, self.extent
            )));
        }
        let stride = self.extent.width as usize * BYTES_PER_TEXEL;
        let row_bytes = extent.width as usize * BYTES_PER_TEXEL;
        for row in offset.y..offset.y + extent.height {
            let start = row as usize * stride + offset.x as usize * BYTES_PER_TEXEL;
            out.extend_from_slice(&self.pixels[start..start + row_bytes]);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_mismatch() {
        let result = RawImage::from_rgba8(2, 2, vec![0; 15]);
        assert!(matches!(result, Err(PagingError::SourceMismatch(_))));
    }

    #[test]
    fn test_copy_block() {
        let pixels: Vec<u8> = (0..16u8).flat_map(|i| [i, 0, 0, 255]).collect();
        let image = RawImage::from_rgba8(4, 4, pixels).unwrap();

        let mut out = Vec::new();
        image
            .copy_block(Offset2D::new(1, 2), Extent2D::new(2, 2), &mut out)
            .unwrap();
        let reds: Vec<u8> = out.chunks(4).map(|t| t[0]).collect();
        assert_eq!(reds, vec![9, 10, 13, 14]);
    }

    #[test]
    fn test_copy_block_out_of_range() {
        let image = RawImage::procedural(4, 4).unwrap();
        let mut out = Vec::new();
        assert!(image.copy_block(Offset2D::new(3, 0), Extent2D::new(2, 1), &mut out).is_err());
    }

    #[test]
    fn test_procedural_is_deterministic() {
        let a = RawImage::procedural(64, 32).unwrap();
        let b = RawImage::procedural(64, 32).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.pixels().len(), 64 * 32 * 4);
    }
}
