//! Math utilities
//!
//! Re-exports from glam and the integer extents/offsets used to address texels and pages.

pub use glam::{DVec2, Mat4, Vec2, Vec3, Vec4};

use serde::{Deserialize, Serialize};

/// Two-dimensional size in texels or pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Extent2D {
    /// Width
    pub width: u32,
    /// Height
    pub height: u32,
}

impl Extent2D {
    /// Create a new extent
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Number of elements covered by the extent
    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    /// Check if either dimension is zero
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Halve both dimensions, never going below one
    pub fn halved(&self) -> Self {
        Self {
            width: (self.width / 2).max(1),
            height: (self.height / 2).max(1),
        }
    }

    /// Number of `cell`-sized tiles needed to cover this extent
    pub fn tiles(&self, cell: Extent2D) -> Extent2D {
        Extent2D {
            width: self.width.div_ceil(cell.width.max(1)),
            height: self.height.div_ceil(cell.height.max(1)),
        }
    }
}

/// Three-dimensional size, as reported by graphics backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Extent3D {
    /// Width
    pub width: u32,
    /// Height
    pub height: u32,
    /// Depth
    pub depth: u32,
}

impl Extent3D {
    /// Create a new extent
    pub const fn new(width: u32, height: u32, depth: u32) -> Self {
        Self { width, height, depth }
    }

    /// Number of elements covered by the extent
    pub fn volume(&self) -> u64 {
        self.width as u64 * self.height as u64 * self.depth as u64
    }

    /// Drop the depth component
    pub fn to_2d(&self) -> Extent2D {
        Extent2D::new(self.width, self.height)
    }
}

/// Texel offset inside an image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Offset2D {
    /// Horizontal offset
    pub x: u32,
    /// Vertical offset
    pub y: u32,
}

impl Offset2D {
    /// Create a new offset
    pub const fn new(x: u32, y: u32) -> Self {
        Self { x, y }
    }

    /// Scale both components
    pub fn scaled(&self, factor: u32) -> Self {
        Self {
            x: self.x * factor,
            y: self.y * factor,
        }
    }
}

/// Linear interpolation
pub fn lerp(a: f32, b: f32, t: f32) -> f32 {
    a + (b - a) * t
}

/// Round `value` up to the next multiple of `alignment`
pub fn align_up(value: u64, alignment: u64) -> u64 {
    if alignment <= 1 {
        value
    } else {
        value.div_ceil(alignment) * alignment
    }
}
