//! Pooling for the batching hot path.
//!
//! # Invariants
//! - A list is handed out by value and is never held by two workers at once.
//! - Committed split lists belong to the render output until the next cycle
//!   reset hands them back.
//! - `init_cache_pool` with an unchanged key leaves every pool untouched.

mod cache_pool;
mod list_pool;

pub use cache_pool::{CachePoolStats, PoolKey, VegetationCachePool};
pub use list_pool::{MatrixListPool, PoolStats};

pub fn crate_info() -> &'static str {
    "canopy-pool v0.1.0"
}
