//! Persistence for hand-placed and removed vegetation instances.
//!
//! # Invariants
//! - Stored instance ids never collide with rule-generated ids.
//! - Files are schema-versioned and hash-verified; loading fails closed.

mod storage;
mod store;

pub use storage::{
    InstanceSource, ModelOverrides, PersistentVegetationStorage, RebucketReport, StoredInstance,
};
pub use store::{StorageFile, StorageMeta, StoreError};

pub fn crate_info() -> &'static str {
    "canopy-persist v0.1.0"
}
