use canopy_common::{CellIndex, Rect};
use glam::{Vec2, Vec3};

/// Errors from partitioning terrain into cells.
#[derive(Debug, thiserror::Error)]
pub enum GridError {
    #[error("cell size must be positive and finite, got {0}")]
    InvalidCellSize(f32),
    #[error("terrain bounds are empty: {0:?}")]
    EmptyBounds(Rect),
    #[error("grid of {columns}x{rows} cells exceeds the cell index range")]
    TooManyCells { columns: u32, rows: u32 },
}

/// Fixed-size grid partitioning of the terrain on the XZ plane.
///
/// Cells are numbered row-major from the bounds' minimum corner. Edge cells
/// are clipped to the terrain bounds, so every cell lies inside them.
#[derive(Debug, Clone)]
pub struct CellGrid {
    bounds: Rect,
    cell_size: f32,
    columns: u32,
    rows: u32,
}

impl CellGrid {
    /// Partition `bounds` into square cells of `cell_size`.
    pub fn new(bounds: Rect, cell_size: f32) -> Result<Self, GridError> {
        if !(cell_size.is_finite() && cell_size > 0.0) {
            return Err(GridError::InvalidCellSize(cell_size));
        }
        let size = bounds.size();
        if size.x <= 0.0 || size.y <= 0.0 {
            return Err(GridError::EmptyBounds(bounds));
        }
        let columns = (size.x / cell_size).ceil() as u32;
        let rows = (size.y / cell_size).ceil() as u32;
        if (columns as u64) * (rows as u64) > u32::MAX as u64 {
            return Err(GridError::TooManyCells { columns, rows });
        }
        Ok(Self {
            bounds,
            cell_size,
            columns,
            rows,
        })
    }

    pub fn bounds(&self) -> Rect {
        self.bounds
    }

    pub fn cell_size(&self) -> f32 {
        self.cell_size
    }

    pub fn columns(&self) -> u32 {
        self.columns
    }

    pub fn rows(&self) -> u32 {
        self.rows
    }

    pub fn cell_count(&self) -> usize {
        self.columns as usize * self.rows as usize
    }

    /// World bounds of a cell, or `None` for an index outside the grid.
    pub fn cell_bounds(&self, index: CellIndex) -> Option<Rect> {
        if index.as_usize() >= self.cell_count() {
            return None;
        }
        let col = index.0 % self.columns;
        let row = index.0 / self.columns;
        let min = self.bounds.min + Vec2::new(col as f32, row as f32) * self.cell_size;
        let max = (min + Vec2::splat(self.cell_size)).min(self.bounds.max);
        Some(Rect::new(min, max))
    }

    /// All cells with their bounds, in index order.
    pub fn cells(&self) -> impl Iterator<Item = (CellIndex, Rect)> + '_ {
        (0..self.cell_count() as u32).filter_map(move |i| {
            let index = CellIndex(i);
            self.cell_bounds(index).map(|b| (index, b))
        })
    }

    /// Cell containing a world position, ignoring height.
    pub fn position_to_cell(&self, position: Vec3) -> Option<CellIndex> {
        if !self.bounds.contains_position(position) {
            return None;
        }
        let local = (Vec2::new(position.x, position.z) - self.bounds.min) / self.cell_size;
        let col = (local.x.floor() as u32).min(self.columns - 1);
        let row = (local.y.floor() as u32).min(self.rows - 1);
        Some(CellIndex(row * self.columns + col))
    }

    /// Cells within a square radius (in cells) of a center cell.
    pub fn cells_in_radius(&self, center: CellIndex, radius: u32) -> Vec<CellIndex> {
        if center.as_usize() >= self.cell_count() {
            return Vec::new();
        }
        let col = center.0 % self.columns;
        let row = center.0 / self.columns;
        let (c0, c1) = (col.saturating_sub(radius), (col + radius).min(self.columns - 1));
        let (r0, r1) = (row.saturating_sub(radius), (row + radius).min(self.rows - 1));
        let mut result = Vec::with_capacity(((c1 - c0 + 1) * (r1 - r0 + 1)) as usize);
        for r in r0..=r1 {
            for c in c0..=c1 {
                result.push(CellIndex(r * self.columns + c));
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid() -> CellGrid {
        CellGrid::new(Rect::from_xz(0.0, 0.0, 100.0, 64.0), 16.0).unwrap()
    }

    #[test]
    fn partition_counts() {
        let g = grid();
        assert_eq!(g.columns(), 7);
        assert_eq!(g.rows(), 4);
        assert_eq!(g.cell_count(), 28);
        assert_eq!(g.cells().count(), 28);
    }

    #[test]
    fn edge_cells_are_clipped() {
        let g = grid();
        let last_in_row = g.cell_bounds(CellIndex(6)).unwrap();
        assert_eq!(last_in_row, Rect::from_xz(96.0, 0.0, 4.0, 16.0));
        assert!(g.cells().all(|(_, b)| g.bounds().contains_rect(&b)));
    }

    #[test]
    fn position_to_cell_basic() {
        let g = grid();
        assert_eq!(
            g.position_to_cell(Vec3::new(10.0, 5.0, 10.0)),
            Some(CellIndex(0))
        );
        assert_eq!(
            g.position_to_cell(Vec3::new(20.0, 0.0, 17.0)),
            Some(CellIndex(8))
        );
        assert_eq!(g.position_to_cell(Vec3::new(-1.0, 0.0, 0.0)), None);
        assert_eq!(g.position_to_cell(Vec3::new(100.0, 0.0, 0.0)), None);
    }

    #[test]
    fn position_maps_into_its_cell_bounds() {
        let g = grid();
        let p = Vec3::new(57.5, 0.0, 33.0);
        let cell = g.position_to_cell(p).unwrap();
        assert!(g.cell_bounds(cell).unwrap().contains_position(p));
    }

    #[test]
    fn cells_in_radius_clamps_at_edges() {
        let g = grid();
        assert_eq!(g.cells_in_radius(CellIndex(0), 1).len(), 4);
        assert_eq!(g.cells_in_radius(CellIndex(8), 1).len(), 9);
        assert!(g.cells_in_radius(CellIndex(999), 1).is_empty());
    }

    #[test]
    fn invalid_configuration_is_rejected() {
        let bounds = Rect::from_xz(0.0, 0.0, 10.0, 10.0);
        assert!(matches!(
            CellGrid::new(bounds, 0.0),
            Err(GridError::InvalidCellSize(_))
        ));
        assert!(matches!(
            CellGrid::new(Rect::from_xz(0.0, 0.0, 0.0, 10.0), 1.0),
            Err(GridError::EmptyBounds(_))
        ));
    }
}
