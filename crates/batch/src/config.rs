use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Errors from loading or validating settings.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("cell size must be positive and finite, got {0}")]
    InvalidCellSize(f32),
}

/// Whether the host is editing the scene or running it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Editor: indirect-path models are still batched on the CPU for previews,
    /// and batch building stays on the calling thread.
    Edit,
    #[default]
    Play,
}

/// Runtime settings for loading and batching.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VegetationSettings {
    /// Workers for the load phase. Values below 1 fall back to a single thread.
    pub thread_count: i32,
    /// Load cells in parallel.
    pub use_multithreading: bool,
    /// Build per-model batches in parallel (play mode only).
    pub use_list_multithreading: bool,
    /// Pack post-processed cells into compute staging buffers.
    pub use_compute_shaders: bool,
    /// Dispatch batch workers 64 at a time instead of all at once.
    pub enable_unlimited_vegetation_items: bool,
    pub run_mode: RunMode,
    /// Edge length of a vegetation cell in world units.
    pub cell_size: f32,
    /// Quad-tree node capacity before a split.
    pub quadtree_capacity: usize,
    /// Time budget for one update cycle; exceeding it logs a warning.
    pub frame_budget_ms: f32,
}

impl Default for VegetationSettings {
    fn default() -> Self {
        Self {
            thread_count: std::thread::available_parallelism()
                .map(|n| n.get().min(8) as i32)
                .unwrap_or(4),
            use_multithreading: true,
            use_list_multithreading: true,
            use_compute_shaders: false,
            enable_unlimited_vegetation_items: false,
            run_mode: RunMode::Play,
            cell_size: 100.0,
            quadtree_capacity: canopy_spatial::DEFAULT_NODE_CAPACITY,
            frame_budget_ms: 16.0,
        }
    }
}

impl VegetationSettings {
    /// Load settings from a JSON file; missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let settings: Self = serde_json::from_reader(std::fs::File::open(path)?)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.cell_size.is_finite() && self.cell_size > 0.0) {
            return Err(ConfigError::InvalidCellSize(self.cell_size));
        }
        Ok(())
    }

    /// Thread count clamped to at least one worker.
    pub fn effective_thread_count(&self) -> usize {
        self.thread_count.max(1) as usize
    }

    pub fn frame_budget(&self) -> Duration {
        Duration::from_micros((self.frame_budget_ms.max(0.0) * 1000.0) as u64)
    }

    pub fn is_edit_mode(&self) -> bool {
        self.run_mode == RunMode::Edit
    }
}
