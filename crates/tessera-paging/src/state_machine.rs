//! Paging state machine
//!
//! Advances one stage per tick:
//!
//! ```text
//! Idle --> FreeMemory --> ProcessBlocks --> UpdateAndGenerate
//!            |    ^                                 |
//!            |    +---------------------------------+
//!            v    | changes
//!   CalculateLodTable <--> CompareLodTable
//! ```
//!
//! FreeMemory returns to CalculateLodTable once the block queue drains, or
//! early when the frame counter passes its cap.

use std::time::{Duration, Instant};

use serde::Serialize;

use tessera_core::timer::RollingTimer;

use crate::backend::SparseBackend;
use crate::executor::UpdateExecutor;
use crate::texture::VirtualTexture;
use crate::{PagingError, PagingResult};

/// Samples kept per stage timing
const TIMING_WINDOW: usize = 120;

/// Stage the state machine runs on its next tick
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub enum PagingStage {
    #[default]
    Idle,
    CalculateLodTable,
    CompareLodTable,
    FreeMemory,
    ProcessBlocks,
    UpdateAndGenerate,
}

impl PagingStage {
    /// Every stage, in declaration order
    pub const ALL: [PagingStage; 6] = [
        PagingStage::Idle,
        PagingStage::CalculateLodTable,
        PagingStage::CompareLodTable,
        PagingStage::FreeMemory,
        PagingStage::ProcessBlocks,
        PagingStage::UpdateAndGenerate,
    ];

    /// Stage name
    pub fn name(&self) -> &'static str {
        match self {
            PagingStage::Idle => "idle",
            PagingStage::CalculateLodTable => "calculate_lod_table",
            PagingStage::CompareLodTable => "compare_lod_table",
            PagingStage::FreeMemory => "free_memory",
            PagingStage::ProcessBlocks => "process_blocks",
            PagingStage::UpdateAndGenerate => "update_and_generate",
        }
    }
}

/// Drives a [`VirtualTexture`] through the paging stages
#[derive(Debug)]
pub struct PagingStateMachine {
    stage: PagingStage,
    /// Block batches processed since the last LOD comparison
    frame_counter: u32,
    update_required: bool,
    faulted: bool,
    timings: [RollingTimer; 6],
}

impl Default for PagingStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl PagingStateMachine {
    /// Create a state machine in [`PagingStage::Idle`]
    pub fn new() -> Self {
        Self {
            stage: PagingStage::Idle,
            frame_counter: 0,
            update_required: false,
            faulted: false,
            timings: std::array::from_fn(|_| RollingTimer::new(TIMING_WINDOW)),
        }
    }

    /// Stage the next tick will run
    pub fn stage(&self) -> PagingStage {
        self.stage
    }

    /// Block batches processed since the last LOD comparison
    pub fn frame_counter(&self) -> u32 {
        self.frame_counter
    }

    /// Check if a tick has failed
    pub fn is_faulted(&self) -> bool {
        self.faulted
    }

    /// Rolling duration samples of a stage
    pub fn stage_timing(&self, stage: PagingStage) -> &RollingTimer {
        &self.timings[stage as usize]
    }

    /// Average duration of every stage that has run
    pub fn average_timings(&self) -> Vec<(PagingStage, Duration)> {
        PagingStage::ALL
            .iter()
            .filter(|stage| self.stage_timing(**stage).count() > 0)
            .map(|stage| (*stage, self.stage_timing(*stage).average()))
            .collect()
    }

    /// Run the current stage and move to the next one
    ///
    /// Returns the stage the following tick will run. An error leaves the
    /// machine faulted: every later tick fails with [`PagingError::Faulted`]
    /// without touching the texture or backend.
    pub fn tick<B: SparseBackend>(
        &mut self,
        texture: &mut VirtualTexture,
        backend: &mut B,
    ) -> PagingResult<PagingStage> {
        if self.faulted {
            return Err(PagingError::Faulted);
        }

        let stage = self.stage;
        let span = tracing::debug_span!("paging_stage", stage = stage.name());
        let _entered = span.enter();

        let start = Instant::now();
        let result = self.run_stage(stage, texture, backend);
        self.timings[stage as usize].record(start.elapsed());

        match result {
            Ok(next) => {
                self.stage = next;
                Ok(next)
            }
            Err(err) => {
                log::error!("Paging stage {} failed: {}", stage.name(), err);
                self.faulted = true;
                Err(err)
            }
        }
    }

    fn run_stage<B: SparseBackend>(
        &mut self,
        stage: PagingStage,
        texture: &mut VirtualTexture,
        backend: &mut B,
    ) -> PagingResult<PagingStage> {
        match stage {
            PagingStage::Idle => Ok(PagingStage::FreeMemory),
            PagingStage::CalculateLodTable => {
                UpdateExecutor::new(texture, backend).bind_pending()?;
                texture.calculate_lod_table();
                Ok(PagingStage::CompareLodTable)
            }
            PagingStage::CompareLodTable => {
                self.frame_counter = 0;
                if texture.compare_lod_tables() {
                    self.update_required = true;
                    log::debug!("{} block(s) queued for update", texture.block_queue.len());
                }
                Ok(if self.update_required {
                    PagingStage::FreeMemory
                } else {
                    PagingStage::CalculateLodTable
                })
            }
            PagingStage::FreeMemory => {
                let report = UpdateExecutor::new(texture, backend).reclaim_memory()?;
                if report.relocated > 0 {
                    log::debug!("Relocated {} page(s)", report.relocated);
                }

                let config = &texture.config;
                if texture.block_queue.is_empty() {
                    self.update_required = false;
                    Ok(PagingStage::CalculateLodTable)
                } else if config.frame_counter_enabled && self.frame_counter > config.frame_counter_cap {
                    log::debug!(
                        "Recalculating LOD with {} block(s) still queued",
                        texture.block_queue.len()
                    );
                    Ok(PagingStage::CalculateLodTable)
                } else {
                    Ok(PagingStage::ProcessBlocks)
                }
            }
            PagingStage::ProcessBlocks => {
                let processed = texture.process_blocks();
                self.frame_counter += 1;
                log::debug!(
                    "Processed {} block(s), {} page(s) to stream",
                    processed,
                    texture.update_set.len()
                );
                Ok(PagingStage::UpdateAndGenerate)
            }
            PagingStage::UpdateAndGenerate => {
                UpdateExecutor::new(texture, backend).update_and_generate()?;
                Ok(PagingStage::FreeMemory)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::HeadlessBackend;
    use crate::projector::LodCell;
    use crate::source::RawImage;
    use crate::PagingConfig;
    use tessera_core::camera::Camera;

    fn setup(config: PagingConfig) -> (HeadlessBackend, VirtualTexture) {
        let mut backend = HeadlessBackend::default();
        let source = RawImage::procedural(1024, 1024).unwrap();
        let texture = VirtualTexture::new(&mut backend, source, config).unwrap();
        (backend, texture)
    }

    fn at_stage(stage: PagingStage) -> PagingStateMachine {
        PagingStateMachine {
            stage,
            ..PagingStateMachine::new()
        }
    }

    fn valid_pages_in_tier(texture: &VirtualTexture, tier: u32) -> usize {
        texture
            .layout()
            .tier_pages(tier)
            .filter(|&page| texture.page_table().entry(page).valid)
            .count()
    }

    #[test]
    fn test_idle_reclaims_first() {
        let (mut backend, mut texture) = setup(PagingConfig::default());
        let mut machine = PagingStateMachine::new();

        assert_eq!(machine.tick(&mut texture, &mut backend).unwrap(), PagingStage::FreeMemory);
        assert_eq!(machine.tick(&mut texture, &mut backend).unwrap(), PagingStage::CalculateLodTable);
        assert_eq!(machine.stage_timing(PagingStage::Idle).count(), 1);
    }

    #[test]
    fn test_stage_timings_cover_run_stages() {
        let (mut backend, mut texture) = setup(PagingConfig::default());
        let mut machine = PagingStateMachine::new();
        for _ in 0..5 {
            machine.tick(&mut texture, &mut backend).unwrap();
        }

        let timings = machine.average_timings();
        let stages: Vec<PagingStage> = timings.iter().map(|(stage, _)| *stage).collect();
        assert_eq!(
            stages,
            vec![
                PagingStage::Idle,
                PagingStage::CalculateLodTable,
                PagingStage::CompareLodTable,
                PagingStage::FreeMemory
            ]
        );
        for (stage, average) in timings {
            let timing = machine.stage_timing(stage);
            assert!(timing.min() <= average && average <= timing.max());
        }
    }

    #[test]
    fn test_far_camera_keeps_coarsest_tier() {
        let config = PagingConfig {
            grid_rows: 1,
            grid_cols: 1,
            ..Default::default()
        };
        let (mut backend, mut texture) = setup(config);
        let camera = Camera::looking_at_origin(3000.0).with_clip_planes(1.0, 10_000.0);
        texture.set_view_projection(camera.view_projection(1280.0 / 720.0));

        let mut machine = PagingStateMachine::new();
        let stages: Vec<PagingStage> = (0..6)
            .map(|_| machine.tick(&mut texture, &mut backend).unwrap())
            .collect();
        assert_eq!(
            stages,
            vec![
                PagingStage::FreeMemory,
                PagingStage::CalculateLodTable,
                PagingStage::CompareLodTable,
                PagingStage::CalculateLodTable,
                PagingStage::CompareLodTable,
                PagingStage::CalculateLodTable,
            ]
        );

        let coarsest = texture.layout().coarsest_tier();
        assert_eq!(texture.current_lod_table().get(0, 0).tier(), coarsest);
        assert_eq!(texture.page_table().valid_count(), 1);
        assert_eq!(valid_pages_in_tier(&texture, coarsest), 1);
    }

    #[test]
    fn test_block_entering_screen_streams_ancestor_chain() {
        let config = PagingConfig {
            grid_rows: 1,
            grid_cols: 1,
            ..Default::default()
        };
        let (mut backend, mut texture) = setup(config);
        texture.current_table.set(0, 0, LodCell::new(4.0, false));
        texture.new_table.set(0, 0, LodCell::new(2.0, true));

        let mut machine = at_stage(PagingStage::CompareLodTable);
        assert_eq!(machine.tick(&mut texture, &mut backend).unwrap(), PagingStage::FreeMemory);
        assert_eq!(machine.tick(&mut texture, &mut backend).unwrap(), PagingStage::ProcessBlocks);
        assert_eq!(machine.tick(&mut texture, &mut backend).unwrap(), PagingStage::UpdateAndGenerate);

        // Tier 2 is 2x2 pages, built from 4x4 at tier 1 and 8x8 at tier 0
        let layout = texture.layout();
        let scheduled = |tier| texture.update_set.iter().filter(|&&p| layout.tier_of_page(p) == tier).count();
        assert_eq!((scheduled(2), scheduled(1), scheduled(0)), (4, 16, 64));

        assert_eq!(machine.tick(&mut texture, &mut backend).unwrap(), PagingStage::FreeMemory);
        assert_eq!(valid_pages_in_tier(&texture, 0), 64);

        assert_eq!(machine.tick(&mut texture, &mut backend).unwrap(), PagingStage::CalculateLodTable);
        assert_eq!(valid_pages_in_tier(&texture, 2), 4);
        assert_eq!(valid_pages_in_tier(&texture, 1), 0);
        assert_eq!(valid_pages_in_tier(&texture, 0), 0);
        assert_eq!(texture.allocator().used_slots() as usize, texture.page_table().valid_count());
        assert_eq!(backend.counters().dangling_frees, 0);
    }

    #[test]
    fn test_frame_counter_cap_preserves_queue() {
        let config = PagingConfig {
            grid_rows: 4,
            grid_cols: 4,
            blocks_per_cycle: 1,
            frame_counter_cap: 2,
            ..Default::default()
        };
        let (mut backend, mut texture) = setup(config);
        texture.new_table.fill(LodCell::new(3.0, true));

        let mut machine = at_stage(PagingStage::CompareLodTable);
        machine.tick(&mut texture, &mut backend).unwrap();
        assert_eq!(texture.block_queue().len(), 16);

        for _ in 0..3 {
            assert_eq!(machine.tick(&mut texture, &mut backend).unwrap(), PagingStage::ProcessBlocks);
            assert_eq!(machine.tick(&mut texture, &mut backend).unwrap(), PagingStage::UpdateAndGenerate);
            assert_eq!(machine.tick(&mut texture, &mut backend).unwrap(), PagingStage::FreeMemory);
        }
        assert_eq!(machine.frame_counter(), 3);
        assert_eq!(machine.tick(&mut texture, &mut backend).unwrap(), PagingStage::CalculateLodTable);
        assert_eq!(texture.block_queue().len(), 13);

        // The unprocessed blocks still differ and are queued again
        machine.stage = PagingStage::CompareLodTable;
        assert_eq!(machine.tick(&mut texture, &mut backend).unwrap(), PagingStage::FreeMemory);
        assert_eq!(machine.frame_counter(), 0);
        assert_eq!(texture.block_queue().len(), 13);
    }

    #[test]
    fn test_frame_counter_can_be_disabled() {
        let config = PagingConfig {
            grid_rows: 4,
            grid_cols: 4,
            blocks_per_cycle: 1,
            frame_counter_cap: 0,
            frame_counter_enabled: false,
            ..Default::default()
        };
        let (mut backend, mut texture) = setup(config);
        texture.new_table.fill(LodCell::new(3.0, true));

        let mut machine = at_stage(PagingStage::CompareLodTable);
        let mut stage = machine.tick(&mut texture, &mut backend).unwrap();
        while stage != PagingStage::CalculateLodTable {
            stage = machine.tick(&mut texture, &mut backend).unwrap();
        }
        assert!(texture.block_queue().is_empty());
        assert_eq!(machine.frame_counter(), 16);
        assert_eq!(valid_pages_in_tier(&texture, 3), 1);
    }

    #[test]
    fn test_bind_failure_faults_the_session() {
        let config = PagingConfig {
            grid_rows: 1,
            grid_cols: 1,
            ..Default::default()
        };
        let (mut backend, mut texture) = setup(config);
        texture.new_table.set(0, 0, LodCell::new(3.0, true));

        let mut machine = at_stage(PagingStage::CompareLodTable);
        for _ in 0..3 {
            machine.tick(&mut texture, &mut backend).unwrap();
        }
        assert_eq!(machine.stage(), PagingStage::UpdateAndGenerate);

        backend.reject_next_bind();
        let err = machine.tick(&mut texture, &mut backend).unwrap_err();
        match err {
            PagingError::BindFailed { pages, .. } => assert!(!pages.is_empty()),
            other => panic!("unexpected error {other:?}"),
        }
        assert!(machine.is_faulted());

        let bind_calls = backend.counters().bind_calls;
        assert_eq!(machine.tick(&mut texture, &mut backend), Err(PagingError::Faulted));
        assert_eq!(backend.counters().bind_calls, bind_calls);
    }
}
