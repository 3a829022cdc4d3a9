//! # Tessera CLI
//!
//! Command-line driver for the Tessera paging engine, running against the
//! headless backend.
//!
//! ## Commands
//! - `simulate` - Stream a procedural texture along a camera dolly
//! - `layout` - Print the tier layout of a texture
//! - `lod` - Print the LOD table seen from a camera
//! - `config` - Print the default paging configuration

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::fmt::format::FmtSpan;

use tessera_core::camera::Camera;
use tessera_core::math::{align_up, lerp, Extent2D, Vec3};
use tessera_paging::headless::HeadlessConfig;
use tessera_paging::{
    HeadlessBackend, LodProjector, LodTable, PagingConfig, PagingStatistics, RawImage, TextureLayout,
    TextureStreamer,
};

/// Device memory alignment assumed by `layout`
const LAYOUT_ALIGNMENT: u64 = 64 * 1024;

/// Tessera virtual texture CLI
#[derive(Parser)]
#[command(name = "tessera")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit per-stage timing spans
    #[arg(long, global = true)]
    pub timings: bool,

    /// Paging configuration file (JSON)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Stream a procedural texture while the camera moves
    Simulate {
        /// Frames to simulate
        #[arg(short, long, default_value = "600")]
        frames: u32,

        /// Texture width
        #[arg(long, default_value = "8192")]
        width: u32,

        /// Texture height
        #[arg(long, default_value = "8192")]
        height: u32,

        /// Page granularity in texels
        #[arg(short, long, default_value = "128")]
        granularity: u32,

        /// Camera distance on the first frame
        #[arg(long, default_value = "400")]
        start_distance: f32,

        /// Camera distance on the last frame
        #[arg(long, default_value = "60")]
        end_distance: f32,

        /// Camera tilt from the plane normal in degrees
        #[arg(short, long, default_value = "30")]
        tilt: f32,

        /// Log statistics every N frames
        #[arg(long, default_value = "60")]
        report_every: u32,

        /// Print the final statistics as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the tier layout of a texture
    Layout {
        /// Texture width
        #[arg(long, default_value = "8192")]
        width: u32,

        /// Texture height
        #[arg(long, default_value = "8192")]
        height: u32,

        /// Page granularity in texels
        #[arg(short, long, default_value = "128")]
        granularity: u32,
    },

    /// Print the LOD table seen from a camera
    Lod {
        /// Camera distance
        #[arg(short, long, default_value = "150")]
        distance: f32,

        /// Camera tilt from the plane normal in degrees
        #[arg(short, long, default_value = "0")]
        tilt: f32,

        /// Texture width
        #[arg(long, default_value = "8192")]
        width: u32,

        /// Texture height
        #[arg(long, default_value = "8192")]
        height: u32,
    },

    /// Print the default paging configuration
    Config,
}

/// Execute the CLI command
pub fn execute(cli: Cli) -> Result<()> {
    let filter = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter)).init();

    if cli.timings {
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_span_events(FmtSpan::CLOSE)
            .finish();
        tracing::subscriber::set_global_default(subscriber).context("installing the timing subscriber")?;
    }

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Simulate {
            frames,
            width,
            height,
            granularity,
            start_distance,
            end_distance,
            tilt,
            report_every,
            json,
        } => {
            let sim = Simulation {
                frames,
                extent: Extent2D::new(width, height),
                granularity,
                start_distance,
                end_distance,
                tilt,
                report_every,
            };
            let stats = simulate(&sim, config, cli.timings)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                print_statistics(&stats);
            }
        }

        Commands::Layout {
            width,
            height,
            granularity,
        } => {
            if granularity == 0 {
                bail!("granularity must be positive");
            }
            let layout = texture_layout(Extent2D::new(width, height), granularity, config.max_tiers);
            print!("{}", render_layout(&layout));
        }

        Commands::Lod {
            distance,
            tilt,
            width,
            height,
        } => {
            let camera = orbit_camera(distance, tilt)?;
            let extent = Extent2D::new(width, height);
            let tiers = config.max_tiers.min(TextureLayout::full_chain_length(extent));
            let mut projector = LodProjector::new(extent, tiers, config.plane_half_extent);
            let screen = config.screen_extent();
            let transform = camera.view_projection(screen.width as f32 / screen.height as f32);
            let table = projector.calculate(&transform, config.grid_size(), screen);
            print!("{}", render_lod_table(&table));
        }

        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&PagingConfig::default())?);
        }
    }

    Ok(())
}

/// Parameters of a camera dolly simulation
#[derive(Debug, Clone, PartialEq)]
pub struct Simulation {
    pub frames: u32,
    pub extent: Extent2D,
    pub granularity: u32,
    pub start_distance: f32,
    pub end_distance: f32,
    pub tilt: f32,
    pub report_every: u32,
}

/// Run a simulation and return the final statistics
pub fn simulate(sim: &Simulation, config: PagingConfig, timings: bool) -> Result<PagingStatistics> {
    if sim.granularity == 0 {
        bail!("granularity must be positive");
    }
    let source = RawImage::procedural(sim.extent.width, sim.extent.height)?;
    let backend = HeadlessBackend::new(HeadlessConfig::default().with_granularity(sim.granularity, sim.granularity));
    let screen = config.screen_extent();
    let aspect = screen.width as f32 / screen.height as f32;
    let mut streamer = TextureStreamer::new(backend, source, config).context("creating the virtual texture")?;

    for frame in 0..sim.frames {
        let t = if sim.frames > 1 {
            frame as f32 / (sim.frames - 1) as f32
        } else {
            1.0
        };
        let camera = orbit_camera(lerp(sim.start_distance, sim.end_distance, t), sim.tilt)?;
        streamer.set_view_projection(camera.view_projection(aspect));
        streamer
            .tick()
            .with_context(|| format!("paging failed on frame {frame}"))?;
        streamer.frame_sync();

        if sim.report_every > 0 && frame % sim.report_every == 0 {
            let stats = streamer.statistics();
            log::info!(
                "frame {}: {} valid / {} resident pages, {} sectors, {} blocks queued",
                frame,
                stats.valid_page_count,
                stats.resident_page_count,
                stats.allocated_sector_count,
                stats.pending_block_updates
            );
        }
    }

    if timings {
        let machine = streamer.state_machine();
        for (stage, average) in machine.average_timings() {
            let timing = machine.stage_timing(stage);
            log::info!(
                "{:>20}: avg {:?}, min {:?}, max {:?}",
                stage.name(),
                average,
                timing.min(),
                timing.max()
            );
        }
    }
    let counters = streamer.backend().counters();
    log::info!(
        "{} binds, {} submissions, {} bytes uploaded, {} blits",
        counters.bind_calls,
        counters.submissions,
        counters.uploaded_bytes,
        counters.blits
    );

    Ok(streamer.statistics())
}

/// Camera at `distance` from the plane center, tilted about the X axis
pub fn orbit_camera(distance: f32, tilt_degrees: f32) -> Result<Camera> {
    if !(distance.is_finite() && distance > 0.0) {
        bail!("camera distance must be positive, got {distance}");
    }
    if !(0.0..=85.0).contains(&tilt_degrees) {
        bail!("tilt must be between 0 and 85 degrees, got {tilt_degrees}");
    }
    let tilt = tilt_degrees.to_radians();
    let position = Vec3::new(0.0, -distance * tilt.sin(), distance * tilt.cos());
    Ok(Camera::looking_at_origin(distance)
        .with_position(position)
        .with_clip_planes(0.1, distance * 4.0 + 1000.0))
}

/// Tier layout for a texture, with the page size the headless backend reports
pub fn texture_layout(extent: Extent2D, granularity: u32, max_tiers: u32) -> TextureLayout {
    let granularity = Extent2D::new(granularity, granularity);
    let page_size = align_up(granularity.area() * 4, LAYOUT_ALIGNMENT);
    let tiers = max_tiers.min(TextureLayout::full_chain_length(extent));
    TextureLayout::new(extent, granularity, tiers, page_size)
}

/// Tier table as text
pub fn render_layout(layout: &TextureLayout) -> String {
    let mut out = format!(
        "{:>4} {:>12} {:>9} {:>7} {:>9}\n",
        "tier", "extent", "pages", "count", "base"
    );
    for (tier, props) in layout.tiers().iter().enumerate() {
        out.push_str(&format!(
            "{:>4} {:>12} {:>9} {:>7} {:>9}\n",
            tier,
            format!("{}x{}", props.extent.width, props.extent.height),
            format!("{}x{}", props.cols, props.rows),
            props.page_count,
            props.base_page
        ));
    }
    out.push_str(&format!(
        "{} pages of {} bytes, {} bytes fully resident\n",
        layout.page_count(),
        layout.page_size(),
        layout.page_count() as u64 * layout.page_size()
    ));
    out
}

/// LOD table as a character grid: `.` off screen, digit = tier
pub fn render_lod_table(table: &LodTable) -> String {
    let mut out = String::with_capacity(table.size().cell_count() + table.rows() as usize);
    for row in 0..table.rows() {
        for col in 0..table.cols() {
            let cell = table.get(row, col);
            if cell.on_screen {
                out.push(char::from_digit(cell.tier().min(9), 10).unwrap_or('#'));
            } else {
                out.push('.');
            }
        }
        out.push('\n');
    }
    out
}

fn load_config(path: Option<&Path>) -> Result<PagingConfig> {
    let Some(path) = path else {
        return Ok(PagingConfig::default());
    };
    let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let config: PagingConfig =
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

fn print_statistics(stats: &PagingStatistics) {
    println!("virtual pages:        {}", stats.virtual_page_count);
    println!("resident pages:       {}", stats.resident_page_count);
    println!("valid pages:          {}", stats.valid_page_count);
    println!("sectors:              {}", stats.allocated_sector_count);
    println!("page slots:           {} used / {}", stats.used_page_slots, stats.allocated_page_slots);
    println!("fragmented sectors:   {}", stats.fragmented_sector_count);
    println!("queued blocks:        {}", stats.pending_block_updates);
    println!(
        "device memory:        {} bytes (peak {})",
        stats.device_memory_bytes, stats.peak_device_memory_bytes
    );
    if let Some(stage) = stats.stage {
        println!("next stage:           {}", stage.name());
    }
}
