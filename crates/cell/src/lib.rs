//! Vegetation cells and the placement rules that fill them.
//!
//! # Invariants
//! - A cell's lists are readable only in `CellState::Loaded`.
//! - Loading is a pure function of (cell, package, placement, storage).
//! - `clear_cache` always returns the cell to `CellState::Unloaded`.

mod cell;
mod placement;

pub use cell::{CellError, CellState, LoadContext, VegetationCell};
pub use placement::{
    EmptyPlacement, PlacedInstance, PlacementRequest, PlacementSource, ProceduralPlacement,
};

pub fn crate_info() -> &'static str {
    "canopy-cell v0.1.0"
}
