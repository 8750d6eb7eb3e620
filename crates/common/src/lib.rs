//! Shared value types for the canopy vegetation engine.
//!
//! # Invariants
//! - `CellIndex` is the only stable handle to a cell.
//! - A package fingerprint changes whenever anything affecting pooled buffers
//!   or placement changes.

mod package;
mod rect;
mod types;

pub use package::{
    DEFAULT_MAX_LIST_SIZE, PackageError, RenderPath, VegetationModel, VegetationPackage,
    VegetationType,
};
pub use rect::Rect;
pub use types::{CellIndex, Fnv1a, InstanceId, InstanceMatrix, Transform, splitmix64};

pub fn crate_info() -> &'static str {
    "canopy-common v0.1.0"
}
