//! Spatial indexing for vegetation cells: the terrain grid and the cell quad-tree.
//!
//! # Invariants
//! - Every cell stored at a quad-tree node lies inside that node's bounds.
//! - `CellQuadTree::query` returns exactly the cells overlapping the query rect,
//!   each once; an empty or unbuilt tree returns nothing.

mod grid;
mod quadtree;

pub use grid::{CellGrid, GridError};
pub use quadtree::{CellQuadTree, DEFAULT_NODE_CAPACITY};

pub fn crate_info() -> &'static str {
    "canopy-spatial v0.1.0"
}
