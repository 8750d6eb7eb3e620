//! Vegetation cycle: cell selection, fork-join loading, and per-model batching.
//!
//! # Invariants
//! - No committed batch is empty or longer than its model's `max_list_size`.
//! - Every instance of a contributing cell lands in exactly one batch, in
//!   selection order.
//! - A cell is loaded before any batch reads it; the load barrier completes
//!   even when a worker panics.
//! - Fewer than two cells to load never reach the scheduler.

mod batcher;
mod config;
mod loader;
mod scheduler;
mod stats;
mod system;

#[cfg(test)]
mod testing;

pub use batcher::{
    BATCH_SLOTS, BatchOutcome, BatchPlan, ModelRenderList, SelectedCell, build_model_batches,
    build_render_lists,
};
pub use config::{ConfigError, RunMode, VegetationSettings};
pub use loader::{LoadOutcome, load_cells};
pub use scheduler::{
    ForkJoinReport, InlineScheduler, Job, RayonScheduler, SchedulerError, WorkScheduler,
    run_guarded,
};
pub use stats::{CycleStats, CycleTimer};
pub use system::{SystemError, VegetationSystem};

pub fn crate_info() -> &'static str {
    "canopy-batch v0.1.0"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crate_loads() {
        assert!(crate_info().contains("batch"));
    }
}
