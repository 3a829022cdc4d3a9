//! Graphics backend seam
//!
//! Everything the paging engine needs from a sparse-capable graphics API:
//! capability and granularity queries, device memory, sparse binding,
//! staging buffers and transfer commands. Transfer commands are recorded
//! in order and executed by [`SparseBackend::flush`].

use bitflags::bitflags;
use thiserror::Error;

use tessera_core::math::{Extent2D, Extent3D, Offset2D};

/// Backend errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackendError {
    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Out of device memory: {requested} bytes requested")]
    OutOfDeviceMemory { requested: u64 },

    #[error("Invalid handle: {0}")]
    InvalidHandle(String),

    #[error("Sparse bind rejected: {0}")]
    BindRejected(String),

    #[error("Region out of bounds: {0}")]
    OutOfBounds(String),
}

/// Result type for backend operations
pub type BackendResult<T> = Result<T, BackendError>;

/// Sparse image handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ImageHandle(pub u64);

/// Device memory handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemoryHandle(pub u64);

/// Host-visible transfer buffer handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferHandle(pub u64);

/// Queue semaphore handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SemaphoreHandle(pub u64);

/// Texel formats understood by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TextureFormat {
    /// 8-bit RGBA, sRGB encoded
    #[default]
    Rgba8Srgb,
}

impl TextureFormat {
    /// Size of one texel in bytes
    pub fn bytes_per_texel(&self) -> u32 {
        match self {
            TextureFormat::Rgba8Srgb => 4,
        }
    }
}

bitflags! {
    /// How a sparse image will be used
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ImageUsage: u32 {
        const SAMPLED = 1 << 0;
        const TRANSFER_SRC = 1 << 1;
        const TRANSFER_DST = 1 << 2;
    }
}

bitflags! {
    /// Properties of a device memory type
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MemoryPropertyFlags: u32 {
        const DEVICE_LOCAL = 1 << 0;
        const HOST_VISIBLE = 1 << 1;
        const HOST_COHERENT = 1 << 2;
    }
}

/// Sparse features reported by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceCapabilities {
    /// Memory can be bound to resources after creation
    pub sparse_binding: bool,
    /// 2-D images may be partially resident
    pub sparse_residency_image_2d: bool,
    /// Shaders can query residency of sparse images
    pub shader_resource_residency: bool,
}

impl DeviceCapabilities {
    /// Every feature the engine relies on
    pub fn full() -> Self {
        Self {
            sparse_binding: true,
            sparse_residency_image_2d: true,
            shader_resource_residency: true,
        }
    }

    /// Name of the first missing feature, if any
    pub fn missing_feature(&self) -> Option<&'static str> {
        if !self.sparse_binding {
            Some("sparseBinding")
        } else if !self.sparse_residency_image_2d {
            Some("sparseResidencyImage2D")
        } else if !self.shader_resource_residency {
            Some("shaderResourceResidency")
        } else {
            None
        }
    }
}

/// Parameters for creating a sparse image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SparseImageDesc {
    /// Texel format
    pub format: TextureFormat,
    /// Size of the finest tier
    pub extent: Extent2D,
    /// Number of detail tiers
    pub tiers: u32,
    /// Intended usage
    pub usage: ImageUsage,
}

/// Memory requirements of a sparse image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRequirements {
    /// Total size if fully resident
    pub size: u64,
    /// Required alignment of bound memory
    pub alignment: u64,
    /// Bitmask of acceptable memory type indices
    pub type_mask: u32,
}

/// One page worth of sparse binding
///
/// `memory` of `None` unbinds the region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SparseImageBind {
    /// Detail tier
    pub tier: u32,
    /// Granularity-aligned texel offset
    pub offset: Offset2D,
    /// Extent, clamped at the tier edge
    pub extent: Extent2D,
    /// Memory and byte offset inside it
    pub memory: Option<(MemoryHandle, u64)>,
}

/// Buffer to image (or image to buffer) copy region
///
/// Buffer data is tightly packed rows of `extent.width` texels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferImageCopy {
    /// Byte offset in the buffer
    pub buffer_offset: u64,
    /// Detail tier
    pub tier: u32,
    /// Texel offset in the tier
    pub offset: Offset2D,
    /// Texel extent
    pub extent: Extent2D,
}

/// Filtered copy between two tiers of the same image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageBlit {
    /// Source tier
    pub src_tier: u32,
    /// Source offset
    pub src_offset: Offset2D,
    /// Source extent
    pub src_extent: Extent2D,
    /// Destination tier
    pub dst_tier: u32,
    /// Destination offset
    pub dst_offset: Offset2D,
    /// Destination extent
    pub dst_extent: Extent2D,
}

/// Capability interface of a sparse-capable graphics backend
pub trait SparseBackend {
    /// Sparse features supported by the device
    fn capabilities(&self) -> DeviceCapabilities;

    /// Texel size of one sparse page for the given format and usage
    fn query_page_granularity(&self, format: TextureFormat, usage: ImageUsage) -> BackendResult<Extent3D>;

    /// Create a sparse image with no memory bound
    fn create_sparse_image(&mut self, desc: &SparseImageDesc) -> BackendResult<ImageHandle>;

    /// Size, alignment and acceptable memory types of an image
    fn query_memory_requirements(&self, image: ImageHandle) -> BackendResult<MemoryRequirements>;

    /// Lowest memory type index allowed by `type_bits` that has `properties`
    fn find_memory_type(&self, type_bits: u32, properties: MemoryPropertyFlags) -> Option<u32>;

    /// Allocate device memory
    fn allocate_memory(&mut self, size: u64, type_index: u32) -> BackendResult<MemoryHandle>;

    /// Release device memory
    fn free_memory(&mut self, memory: MemoryHandle);

    /// Create a queue semaphore
    fn create_semaphore(&mut self) -> BackendResult<SemaphoreHandle>;

    /// Submit one batch of sparse binds and unbinds
    fn bind_sparse(
        &mut self,
        image: ImageHandle,
        binds: &[SparseImageBind],
        wait: Option<SemaphoreHandle>,
        signal: Option<SemaphoreHandle>,
    ) -> BackendResult<()>;

    /// Block until every submitted bind has completed
    fn wait_sparse_idle(&mut self) -> BackendResult<()>;

    /// Create a host-visible transfer buffer
    fn create_buffer(&mut self, size: u64) -> BackendResult<BufferHandle>;

    /// Write host data into a buffer
    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) -> BackendResult<()>;

    /// Destroy a transfer buffer
    fn destroy_buffer(&mut self, buffer: BufferHandle);

    /// Record buffer to image copies
    fn copy_buffer_to_image(
        &mut self,
        buffer: BufferHandle,
        image: ImageHandle,
        regions: &[BufferImageCopy],
    ) -> BackendResult<()>;

    /// Record image to buffer copies
    fn copy_image_to_buffer(
        &mut self,
        image: ImageHandle,
        buffer: BufferHandle,
        regions: &[BufferImageCopy],
    ) -> BackendResult<()>;

    /// Record filtered downsample copies between tiers
    fn blit_image(&mut self, image: ImageHandle, blits: &[ImageBlit]) -> BackendResult<()>;

    /// Make writes to `tier` visible to later reads
    fn barrier(&mut self, image: ImageHandle, tier: u32);

    /// Submit recorded transfers and wait for them
    fn flush(&mut self) -> BackendResult<()>;
}
