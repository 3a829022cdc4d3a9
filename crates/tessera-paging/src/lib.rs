//! # Tessera Paging
//!
//! Sparse virtual texture paging engine.
//!
//! A very large texture is streamed into a bounded pool of device memory by
//! binding only the pages the camera currently needs:
//! - **Projector**: estimates the required detail tier per screen block
//! - **Resolver**: maps blocks to pages and pages to the finer pages they are built from
//! - **Allocator**: slab allocator over reference counted memory sectors
//! - **State machine**: spreads eviction, binding and streaming over many frames
//! - **Executor**: performs binds, uploads and downsample blits
//!
//! Everything talks to the device through [`SparseBackend`]; the
//! [`HeadlessBackend`] implements it in host memory.

pub mod allocator;
pub mod backend;
pub mod block;
pub mod executor;
pub mod headless;
pub mod layout;
pub mod page_table;
pub mod projector;
pub mod resolver;
pub mod source;
pub mod state_machine;
pub mod texture;

pub use allocator::{MemorySector, MemorySectorAllocator, PageAllocation};
pub use backend::{BackendError, BackendResult, DeviceCapabilities, SemaphoreHandle, SparseBackend};
pub use block::{BlockKey, BlockUpdateQueue, TextureBlock};
pub use executor::UpdateExecutor;
pub use headless::{HeadlessBackend, HeadlessConfig, HeadlessCounters};
pub use layout::{LodProperties, PageCoord, TextureLayout};
pub use page_table::{PageTable, PageTableEntry};
pub use projector::{LodCell, LodProjector, LodTable};
pub use resolver::DependencyResolver;
pub use source::RawImage;
pub use state_machine::{PagingStage, PagingStateMachine};
pub use texture::VirtualTexture;

use glam::Mat4;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use tessera_core::grid::GridSize;
use tessera_core::math::Extent2D;

/// Paging errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PagingError {
    #[error("Device capability missing: {0}")]
    Capability(String),

    #[error("Device memory exhausted allocating {size} bytes of type {type_index}")]
    AllocationExhausted { size: u64, type_index: u32 },

    #[error("Sparse bind failed for pages {pages:?}: {reason}")]
    BindFailed { pages: Vec<usize>, reason: String },

    #[error("Transfer failed: {0}")]
    TransferFailed(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Source image mismatch: {0}")]
    SourceMismatch(String),

    #[error("Paging session faulted by an earlier error")]
    Faulted,

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),
}

/// Result type for paging operations
pub type PagingResult<T> = Result<T, PagingError>;

/// Paging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PagingConfig {
    /// Block grid rows
    pub grid_rows: u32,
    /// Block grid columns
    pub grid_cols: u32,
    /// Block updates processed per cycle
    pub blocks_per_cycle: usize,
    /// Force a LOD recalculation after `frame_counter_cap` cycles
    pub frame_counter_enabled: bool,
    /// Processing cycles before LOD recalculation is forced
    pub frame_counter_cap: u32,
    /// Relocate pages out of fragmented sectors
    pub memory_defragmentation: bool,
    /// Free slot count above which a sector is fragmented
    pub fragmentation_cap: u32,
    /// Page slots per memory sector
    pub pages_per_allocation: u32,
    /// Upper bound on detail tiers
    pub max_tiers: u32,
    /// Half size of the textured plane in model units
    pub plane_half_extent: f32,
    /// Screen width in pixels
    pub screen_width: u32,
    /// Screen height in pixels
    pub screen_height: u32,
    /// Device memory available to sectors
    pub memory_budget_bytes: u64,
    /// Budget fraction that triggers a warning
    pub budget_warning_threshold: f32,
}

impl Default for PagingConfig {
    fn default() -> Self {
        Self {
            grid_rows: 50,
            grid_cols: 50,
            blocks_per_cycle: 10,
            frame_counter_enabled: true,
            frame_counter_cap: 10,
            memory_defragmentation: true,
            fragmentation_cap: 20,
            pages_per_allocation: 50,
            max_tiers: 5,
            plane_half_extent: 100.0,
            screen_width: 1280,
            screen_height: 720,
            memory_budget_bytes: 256 * 1024 * 1024,
            budget_warning_threshold: 0.8,
        }
    }
}

impl PagingConfig {
    /// Check the configuration for values the engine cannot run with
    pub fn validate(&self) -> PagingResult<()> {
        let invalid = |message: &str| Err(PagingError::InvalidConfig(message.to_string()));

        if self.grid_rows == 0 || self.grid_cols == 0 {
            return invalid("block grid must have at least one row and column");
        }
        if self.blocks_per_cycle == 0 {
            return invalid("blocks_per_cycle must be positive");
        }
        if self.pages_per_allocation == 0 {
            return invalid("pages_per_allocation must be positive");
        }
        if self.max_tiers == 0 {
            return invalid("max_tiers must be positive");
        }
        if !(self.plane_half_extent.is_finite() && self.plane_half_extent > 0.0) {
            return invalid("plane_half_extent must be a positive number");
        }
        if self.screen_width == 0 || self.screen_height == 0 {
            return invalid("screen extent must be non-zero");
        }
        if self.memory_budget_bytes == 0 {
            return invalid("memory_budget_bytes must be positive");
        }
        if !(self.budget_warning_threshold > 0.0 && self.budget_warning_threshold <= 1.0) {
            return invalid("budget_warning_threshold must be in (0, 1]");
        }
        Ok(())
    }

    /// Block grid resolution
    pub fn grid_size(&self) -> GridSize {
        GridSize::new(self.grid_rows, self.grid_cols)
    }

    /// Screen extent used for projection
    pub fn screen_extent(&self) -> Extent2D {
        Extent2D::new(self.screen_width, self.screen_height)
    }
}

/// Residency statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PagingStatistics {
    pub virtual_page_count: usize,
    pub resident_page_count: usize,
    pub valid_page_count: usize,
    pub allocated_sector_count: usize,
    pub allocated_page_slots: u64,
    pub used_page_slots: u64,
    pub fragmented_sector_count: usize,
    pub pending_block_updates: usize,
    pub device_memory_bytes: u64,
    pub peak_device_memory_bytes: u64,
    /// Stage the state machine will run next, when known
    pub stage: Option<PagingStage>,
}

/// Semaphores the host render submission must honor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSync {
    /// Wait before sampling: signaled by the latest bind, if one happened since the last frame
    pub wait: Option<SemaphoreHandle>,
    /// Signal when the submission completes; the next bind waits on it
    pub signal: SemaphoreHandle,
}

/// A backend, one virtual texture and its state machine
pub struct TextureStreamer<B: SparseBackend> {
    backend: B,
    texture: VirtualTexture,
    machine: PagingStateMachine,
}

impl<B: SparseBackend> TextureStreamer<B> {
    /// Create the virtual texture and load its least detailed level
    pub fn new(mut backend: B, source: RawImage, config: PagingConfig) -> PagingResult<Self> {
        let texture = VirtualTexture::new(&mut backend, source, config)?;
        Ok(Self {
            backend,
            texture,
            machine: PagingStateMachine::new(),
        })
    }

    /// Get the backend
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Get the virtual texture
    pub fn texture(&self) -> &VirtualTexture {
        &self.texture
    }

    /// Get the state machine
    pub fn state_machine(&self) -> &PagingStateMachine {
        &self.machine
    }

    /// Set the transform from plane model space to clip space
    pub fn set_view_projection(&mut self, transform: Mat4) {
        self.texture.set_view_projection(transform);
    }

    /// Change the block grid; applied on the next LOD calculation
    pub fn set_grid_resolution(&mut self, rows: u32, cols: u32) -> PagingResult<()> {
        self.texture.set_grid_resolution(GridSize::new(rows, cols))
    }

    /// Change the screen extent used for projection
    pub fn set_screen_extent(&mut self, width: u32, height: u32) {
        self.texture.set_screen_extent(Extent2D::new(width, height));
    }

    /// Advance the state machine by one transition
    pub fn tick(&mut self) -> PagingResult<PagingStage> {
        self.machine.tick(&mut self.texture, &mut self.backend)
    }

    /// Current residency statistics
    pub fn statistics(&self) -> PagingStatistics {
        PagingStatistics {
            stage: Some(self.machine.stage()),
            ..self.texture.statistics()
        }
    }

    /// Semaphores for this frame's render submission
    pub fn frame_sync(&mut self) -> FrameSync {
        self.texture.frame_sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::camera::Camera;

    fn streamer(config: PagingConfig) -> TextureStreamer<HeadlessBackend> {
        let source = RawImage::procedural(1024, 1024).unwrap();
        TextureStreamer::new(HeadlessBackend::default(), source, config).unwrap()
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = PagingConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.grid_size(), GridSize::new(50, 50));
        assert_eq!(config.screen_extent(), Extent2D::new(1280, 720));
    }

    #[test]
    fn test_invalid_config() {
        let config = PagingConfig {
            blocks_per_cycle: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(PagingError::InvalidConfig(_))));

        let config = PagingConfig {
            budget_warning_threshold: 1.5,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_json_defaults() {
        let config: PagingConfig = serde_json::from_str(r#"{"grid_rows": 8, "memory_defragmentation": false}"#).unwrap();
        assert_eq!(config.grid_rows, 8);
        assert!(!config.memory_defragmentation);
        assert_eq!(config.grid_cols, 50);
        assert_eq!(config.pages_per_allocation, 50);
    }

    #[test]
    fn test_streamer_reaches_steady_state() {
        let config = PagingConfig {
            grid_rows: 8,
            grid_cols: 8,
            ..Default::default()
        };
        let mut streamer = streamer(config);
        let camera = Camera::looking_at_origin(120.0);
        streamer.set_view_projection(camera.view_projection(16.0 / 9.0));

        for _ in 0..2000 {
            streamer.tick().unwrap();
        }
        // A static camera settles into alternating calculate and compare
        for _ in 0..10 {
            let stage = streamer.tick().unwrap();
            assert!(matches!(stage, PagingStage::CalculateLodTable | PagingStage::CompareLodTable));
        }

        let stats = streamer.statistics();
        assert_eq!(stats.virtual_page_count, streamer.texture().layout().page_count());
        assert_eq!(stats.used_page_slots as usize, stats.valid_page_count);
        assert!(stats.valid_page_count > 1);
        assert_eq!(streamer.backend().counters().dangling_frees, 0);
    }

    #[test]
    fn test_frame_sync_follows_binds() {
        let mut streamer = streamer(PagingConfig::default());

        // The preload bound pages, so the first frame waits on them
        let first = streamer.frame_sync();
        assert!(first.wait.is_some());
        assert_ne!(first.wait, Some(first.signal));

        let second = streamer.frame_sync();
        assert!(second.wait.is_none());
        assert_eq!(second.signal, first.signal);
    }

    #[test]
    fn test_statistics_serialize() {
        let streamer = streamer(PagingConfig::default());
        let json = serde_json::to_value(streamer.statistics()).unwrap();
        assert_eq!(json["stage"], "Idle");
        assert_eq!(json["allocated_sector_count"], 1);
    }
}
