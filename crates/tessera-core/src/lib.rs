//! # Tessera Core
//!
//! Core building blocks for the Tessera virtual texture paging engine.
//!
//! This crate provides the engine-agnostic pieces the paging engine is built from:
//! - **Math**: glam re-exports plus 2-D/3-D extents and texel offsets
//! - **Grid**: dense row-major 2-D container for per-block tables
//! - **Memory**: fixed-size slot pools, device memory statistics and budgets
//! - **Timer**: scoped and rolling timers
//! - **Camera**: perspective camera producing view-projection transforms

pub mod camera;
pub mod grid;
pub mod math;
pub mod memory;
pub mod timer;

pub use camera::Camera;
pub use grid::{Grid, GridSize};
pub use math::{Extent2D, Extent3D, Offset2D};
pub use memory::{MemoryBudget, MemoryStats, SlotPool};
pub use timer::{RollingTimer, ScopedTimer};
