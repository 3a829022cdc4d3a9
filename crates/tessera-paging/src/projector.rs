//! LOD projector
//!
//! Projects a grid laid over the textured plane onto the screen and
//! estimates, per grid cell, which detail tier the texture needs there.
//!
//! Each cell is treated as a parallelogram on screen. For a step from the
//! cell corner `A` to its lower neighbour `B` and to its right neighbour
//! `C`, the screen step is split along the cell's two edge directions,
//! the split lengths are mapped back to texels, and the texel-per-pixel
//! ratio of the step follows from the right triangle they form. The cell's
//! LOD is `log2` of the worst of the four ratios. This ignores perspective
//! distortion inside a cell, which shrinks as the grid gets finer.

use glam::{DVec2, Mat4, Vec4};
use serde::Serialize;

use tessera_core::grid::{Grid, GridSize};
use tessera_core::math::Extent2D;

use crate::block::tier_of_lod;

/// Edge slope used when an edge is nearly vertical on screen
const STEEP_SLOPE: f64 = 1000.0;

/// Horizontal screen displacement under which an edge counts as vertical
const VERTICAL_EPSILON: f64 = 0.01;

/// Screen position of one grid node
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MeshNode {
    /// Pixels right of the screen center
    pub x: f64,
    /// Pixels below the screen center
    pub y: f64,
    /// Node is inside the screen and in front of the camera
    pub on_screen: bool,
}

/// Projected grid nodes plus the per-row and per-column edge slopes
#[derive(Debug, Clone)]
pub struct Mesh {
    nodes: Grid<MeshNode>,
    /// Slope of the first horizontal edge of every node row
    ax_horizontal: Vec<f64>,
    /// Slope of the first vertical edge of every node column
    ax_vertical: Vec<f64>,
}

impl Mesh {
    /// Projected nodes, one more row and column than there are cells
    pub fn nodes(&self) -> &Grid<MeshNode> {
        &self.nodes
    }

    /// Cell resolution of the mesh
    pub fn cells(&self) -> GridSize {
        GridSize::new(self.nodes.rows() - 1, self.nodes.cols() - 1)
    }
}

/// Required detail of one grid cell
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LodCell {
    /// Continuous level of detail, `0` is the finest tier
    pub lod: f64,
    /// Any corner of the cell is visible
    pub on_screen: bool,
}

impl LodCell {
    /// Create a cell
    pub const fn new(lod: f64, on_screen: bool) -> Self {
        Self { lod, on_screen }
    }

    /// Discrete tier of the cell
    pub fn tier(&self) -> u32 {
        tier_of_lod(self.lod)
    }
}

/// Per-cell LOD values of one projection
pub type LodTable = Grid<LodCell>;

/// Estimates per-cell detail tiers from a view-projection transform
#[derive(Debug, Clone)]
pub struct LodProjector {
    texture_extent: Extent2D,
    tier_count: u32,
    plane_half_extent: f32,
    topology: Option<Grid<Vec4>>,
}

impl LodProjector {
    /// Create a projector for a texture mapped onto a square plane
    pub fn new(texture_extent: Extent2D, tier_count: u32, plane_half_extent: f32) -> Self {
        Self {
            texture_extent,
            tier_count: tier_count.max(1),
            plane_half_extent,
            topology: None,
        }
    }

    /// Grid resolution of the cached plane topology
    pub fn topology(&self) -> Option<GridSize> {
        self.topology.as_ref().map(|nodes| {
            let size = nodes.size();
            GridSize::new(size.rows - 1, size.cols - 1)
        })
    }

    /// Drop the cached plane topology
    pub fn reset_topology(&mut self) {
        self.topology = None;
    }

    /// Plane positions of the grid nodes, rebuilt when the grid changes
    fn plane_nodes(&mut self, grid: GridSize) -> &Grid<Vec4> {
        let nodes = match self.topology.take() {
            Some(nodes) if nodes.size() == grid.nodes() => nodes,
            _ => build_topology(self.plane_half_extent, grid),
        };
        self.topology.insert(nodes)
    }

    /// Project every grid node through `transform` onto a `screen` sized viewport
    pub fn project(&mut self, transform: &Mat4, grid: GridSize, screen: Extent2D) -> Mesh {
        let half_w = screen.width as f64 / 2.0;
        let half_h = screen.height as f64 / 2.0;
        let plane = self.plane_nodes(grid);

        let mut nodes = Grid::filled(grid.nodes(), MeshNode::default());
        for (v, h, position) in plane.iter() {
            let clip = *transform * *position;
            let w = clip.w as f64;
            let x = half_w * clip.x as f64 / w.abs();
            let y = half_h * clip.y as f64 / w.abs();
            let on_screen = x.abs() < half_w && y.abs() < half_h && w > 0.0;
            nodes.set(v, h, MeshNode { x, y, on_screen });
        }

        let ax_horizontal = (0..=grid.rows)
            .map(|v| slope(nodes.get(v, 0), nodes.get(v, 1)))
            .collect();
        let ax_vertical = (0..=grid.cols)
            .map(|h| slope(nodes.get(0, h), nodes.get(1, h)))
            .collect();

        Mesh {
            nodes,
            ax_horizontal,
            ax_vertical,
        }
    }

    /// Derive the per-cell LOD table from a projected mesh
    pub fn lod_table(&self, mesh: &Mesh) -> LodTable {
        let cells = mesh.cells();
        let nodes = &mesh.nodes;
        let max_lod = (self.tier_count - 1) as f64;

        // One cell step in texels
        let d_tu = self.texture_extent.width as f64 / cells.cols as f64;
        let d_tv = self.texture_extent.height as f64 / cells.rows as f64;

        let mut table = Grid::filled(cells, LodCell::new(0.0, false));
        for row in 0..cells.rows {
            for col in 0..cells.cols {
                let a_node = nodes.get(row, col);
                let b_node = nodes.get(row + 1, col);
                let c_node = nodes.get(row, col + 1);
                let d_node = nodes.get(row + 1, col + 1);

                let a = DVec2::new(a_node.x, a_node.y);
                let b = DVec2::new(b_node.x, b_node.y);
                let c = DVec2::new(c_node.x, c_node.y);

                let ab = a.distance(b);
                let ac = a.distance(c);

                // Corners of the right triangles for the vertical and horizontal steps
                let h_vertical = DVec2::new(a.x, b.y);
                let h_horizontal = DVec2::new(c.x, a.y);

                let a_vertical = mesh.ax_vertical[col as usize];
                let a_horizontal = mesh.ax_horizontal[row as usize];

                let vv = intersect(a, a_vertical, h_vertical, a_horizontal);
                let vh_top = intersect(a, a_horizontal, h_vertical, a_vertical);
                let vh_bottom = intersect(b, a_horizontal, h_vertical, a_vertical);
                let hh = intersect(a, a_horizontal, h_horizontal, a_vertical);
                let hv_left = intersect(a, a_vertical, h_horizontal, a_horizontal);
                let hv_right = intersect(c, a_vertical, h_horizontal, a_horizontal);

                let t_vv = h_vertical.distance(vv) / ac * d_tu;
                let t_vh_top = h_vertical.distance(vh_top) / ab * d_tv;
                let t_vh_bottom = h_vertical.distance(vh_bottom) / ab * d_tv;
                let t_hh = h_horizontal.distance(hh) / ab * d_tv;
                let t_hv_left = h_horizontal.distance(hv_left) / ac * d_tu;
                let t_hv_right = h_horizontal.distance(hv_right) / ac * d_tu;

                let ratios = [
                    texel_ratio(t_vv, t_vh_top, h_vertical.distance(a)),
                    texel_ratio(t_vv, t_vh_bottom, h_vertical.distance(b)),
                    texel_ratio(t_hh, t_hv_left, h_horizontal.distance(a)),
                    texel_ratio(t_hh, t_hv_right, h_horizontal.distance(c)),
                ];
                // f64::max drops NaN from degenerate cells
                let delta = ratios.into_iter().fold(0.0, f64::max);
                let lod = delta.log2().max(0.0).min(max_lod);

                let on_screen = a_node.on_screen || b_node.on_screen || c_node.on_screen || d_node.on_screen;
                table.set(row, col, LodCell::new(lod, on_screen));
            }
        }
        table
    }

    /// Project and derive the LOD table in one step
    pub fn calculate(&mut self, transform: &Mat4, grid: GridSize, screen: Extent2D) -> LodTable {
        let mesh = self.project(transform, grid, screen);
        self.lod_table(&mesh)
    }
}

fn build_topology(extent: f32, grid: GridSize) -> Grid<Vec4> {
    let h_interval = 2.0 * extent / grid.cols as f32;
    let v_interval = 2.0 * extent / grid.rows as f32;
    let mut nodes = Grid::filled(grid.nodes(), Vec4::W);
    for v in 0..=grid.rows {
        for h in 0..=grid.cols {
            let x = -extent + h as f32 * h_interval;
            let y = -extent + v as f32 * v_interval;
            nodes.set(v, h, Vec4::new(x, y, 0.0, 1.0));
        }
    }
    log::debug!("Rebuilt mesh topology for a {}x{} grid", grid.rows, grid.cols);
    nodes
}

fn slope(from: &MeshNode, to: &MeshNode) -> f64 {
    let dx = from.x - to.x;
    if dx.abs() < VERTICAL_EPSILON {
        STEEP_SLOPE
    } else {
        (from.y - to.y) / dx
    }
}

/// Intersection of the line through `origin` with slope `s1` and the line
/// through `through` with slope `s2`
fn intersect(origin: DVec2, s1: f64, through: DVec2, s2: f64) -> DVec2 {
    let x = (s1 * origin.x + through.y - through.x * s2 - origin.y) / (s1 - s2);
    let y = (x - origin.x) * s1 + origin.y;
    DVec2::new(x, y)
}

/// Texels per pixel of a screen step of length `pixels`
fn texel_ratio(t1: f64, t2: f64, pixels: f64) -> f64 {
    if pixels.abs() < 1.0 {
        0.0
    } else {
        t1.hypot(t2) / pixels.abs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;
    use tessera_core::Camera;

    const SCREEN: Extent2D = Extent2D::new(1280, 720);

    fn projector() -> LodProjector {
        LodProjector::new(Extent2D::new(1024, 1024), 5, 100.0)
    }

    fn transform(camera: Camera) -> Mat4 {
        camera.view_projection(SCREEN.width as f32 / SCREEN.height as f32)
    }

    #[test]
    fn test_far_camera_needs_coarsest_tier() {
        let camera = Camera::looking_at_origin(3000.0).with_clip_planes(1.0, 10_000.0);
        let table = projector().calculate(&transform(camera), GridSize::new(1, 1), SCREEN);

        let cell = table.get(0, 0);
        assert!(cell.on_screen);
        assert_eq!(cell.lod, 4.0);
        assert_eq!(cell.tier(), 4);
    }

    #[test]
    fn test_close_camera_needs_finest_tier() {
        let camera = Camera::looking_at_origin(100.0);
        let table = projector().calculate(&transform(camera), GridSize::new(4, 4), SCREEN);

        for (row, col) in [(1, 1), (1, 2), (2, 1), (2, 2)] {
            let cell = table.get(row, col);
            assert!(cell.on_screen);
            assert_eq!(cell.tier(), 0, "cell ({row}, {col}) lod {}", cell.lod);
        }
    }

    #[test]
    fn test_degenerate_transform_yields_zero_lod() {
        let collapse = Mat4::from_cols(Vec4::ZERO, Vec4::ZERO, Vec4::ZERO, Vec4::W);
        let table = projector().calculate(&collapse, GridSize::new(3, 3), SCREEN);

        for (_, _, cell) in table.iter() {
            assert_eq!(cell.lod, 0.0);
            assert!(!cell.lod.is_nan());
        }
    }

    #[test]
    fn test_plane_behind_camera_is_off_screen() {
        let mut camera = Camera::looking_at_origin(50.0);
        camera.target = Vec3::new(0.0, 0.0, 100.0);
        let table = projector().calculate(&transform(camera), GridSize::new(4, 4), SCREEN);

        assert!(table.iter().all(|(_, _, cell)| !cell.on_screen));
    }

    #[test]
    fn test_tilted_plane_coarsens_with_distance() {
        let camera = Camera::default().with_position(Vec3::new(0.0, -150.0, 60.0));
        let table = projector().calculate(&transform(camera), GridSize::new(8, 8), SCREEN);

        let near = table.get(0, 3);
        let far = table.get(7, 3);
        assert!(near.on_screen && far.on_screen);
        assert!(far.lod > near.lod, "far {} near {}", far.lod, near.lod);
    }

    #[test]
    fn test_lod_is_clamped_to_tier_range() {
        let camera = Camera::default().with_position(Vec3::new(0.0, -150.0, 20.0));
        let table = projector().calculate(&transform(camera), GridSize::new(10, 10), SCREEN);

        for (_, _, cell) in table.iter() {
            assert!((0.0..=4.0).contains(&cell.lod), "lod {}", cell.lod);
        }
    }

    #[test]
    fn test_topology_is_cached_per_grid() {
        let mut projector = projector();
        let vp = transform(Camera::default());
        assert_eq!(projector.topology(), None);

        let mesh = projector.project(&vp, GridSize::new(5, 7), SCREEN);
        assert_eq!(mesh.cells(), GridSize::new(5, 7));
        assert_eq!(mesh.nodes().size(), GridSize::new(6, 8));
        assert_eq!(projector.topology(), Some(GridSize::new(5, 7)));

        projector.project(&vp, GridSize::new(2, 2), SCREEN);
        assert_eq!(projector.topology(), Some(GridSize::new(2, 2)));

        projector.reset_topology();
        assert_eq!(projector.topology(), None);
    }

    #[test]
    fn test_steep_edges_use_slope_constant() {
        let mesh = projector().project(&transform(Camera::default()), GridSize::new(2, 2), SCREEN);
        // Face-on: rows stay horizontal, the center column stays vertical
        assert!(mesh.ax_horizontal.iter().all(|s| s.abs() < 1e-6));
        assert_eq!(mesh.ax_vertical[1], STEEP_SLOPE);
    }
}
