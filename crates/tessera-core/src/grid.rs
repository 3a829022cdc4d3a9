//! Dense 2-D grids
//!
//! Row-major storage for per-block tables and projected meshes.

use serde::{Deserialize, Serialize};

/// Grid resolution in rows and columns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GridSize {
    /// Number of rows
    pub rows: u32,
    /// Number of columns
    pub cols: u32,
}

impl GridSize {
    /// Create a new grid size
    pub const fn new(rows: u32, cols: u32) -> Self {
        Self { rows, cols }
    }

    /// Total number of cells
    pub fn cell_count(&self) -> usize {
        self.rows as usize * self.cols as usize
    }

    /// Size of the node lattice surrounding the cells
    pub fn nodes(&self) -> GridSize {
        GridSize::new(self.rows + 1, self.cols + 1)
    }
}

/// Row-major 2-D grid of values
#[derive(Debug, Clone, PartialEq)]
pub struct Grid<T> {
    size: GridSize,
    cells: Vec<T>,
}

impl<T: Clone> Grid<T> {
    /// Create a grid with every cell set to `value`
    pub fn filled(size: GridSize, value: T) -> Self {
        Self {
            size,
            cells: vec![value; size.cell_count()],
        }
    }

    /// Overwrite every cell with `value`
    pub fn fill(&mut self, value: T) {
        self.cells.fill(value);
    }
}

impl<T> Grid<T> {
    /// Grid resolution
    pub fn size(&self) -> GridSize {
        self.size
    }

    /// Number of rows
    pub fn rows(&self) -> u32 {
        self.size.rows
    }

    /// Number of columns
    pub fn cols(&self) -> u32 {
        self.size.cols
    }

    fn index(&self, row: u32, col: u32) -> usize {
        debug_assert!(row < self.size.rows && col < self.size.cols);
        row as usize * self.size.cols as usize + col as usize
    }

    /// Get a cell
    pub fn get(&self, row: u32, col: u32) -> &T {
        &self.cells[self.index(row, col)]
    }

    /// Get a mutable cell
    pub fn get_mut(&mut self, row: u32, col: u32) -> &mut T {
        let index = self.index(row, col);
        &mut self.cells[index]
    }

    /// Replace a cell
    pub fn set(&mut self, row: u32, col: u32, value: T) {
        *self.get_mut(row, col) = value;
    }

    /// Iterate over `(row, col, value)` in row-major order
    pub fn iter(&self) -> impl Iterator<Item = (u32, u32, &T)> {
        let cols = self.size.cols.max(1);
        self.cells
            .iter()
            .enumerate()
            .map(move |(i, value)| ((i as u32) / cols, (i as u32) % cols, value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grid_row_major() {
        let mut grid = Grid::filled(GridSize::new(2, 3), 0u32);
        grid.set(1, 2, 7);
        grid.set(0, 1, 3);

        assert_eq!(*grid.get(1, 2), 7);
        let flat: Vec<_> = grid.iter().map(|(_, _, v)| *v).collect();
        assert_eq!(flat, vec![0, 3, 0, 0, 0, 7]);
    }

    #[test]
    fn test_grid_iter_coordinates() {
        let grid = Grid::filled(GridSize::new(2, 2), ());
        let coords: Vec<_> = grid.iter().map(|(r, c, _)| (r, c)).collect();
        assert_eq!(coords, vec![(0, 0), (0, 1), (1, 0), (1, 1)]);
    }

    #[test]
    fn test_node_lattice() {
        assert_eq!(GridSize::new(50, 40).nodes(), GridSize::new(51, 41));
        assert_eq!(GridSize::new(3, 4).cell_count(), 12);
    }
}
