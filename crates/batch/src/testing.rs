//! Shared fixtures for this crate's unit tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use canopy_cell::VegetationCell;
use canopy_common::{CellIndex, Rect, VegetationModel, VegetationPackage, VegetationType};

use crate::scheduler::{ForkJoinReport, InlineScheduler, Job, WorkScheduler};

/// Inline scheduler that counts how often it is used. Clones share counters.
#[derive(Debug, Clone, Default)]
pub struct CountingScheduler {
    calls: Arc<AtomicUsize>,
    jobs: Arc<AtomicUsize>,
}

impl CountingScheduler {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn jobs(&self) -> usize {
        self.jobs.load(Ordering::SeqCst)
    }
}

impl WorkScheduler for CountingScheduler {
    fn worker_count(&self) -> usize {
        4
    }

    fn fork_join<'a>(&self, jobs: Vec<Job<'a>>) -> ForkJoinReport {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.jobs.fetch_add(jobs.len(), Ordering::SeqCst);
        InlineScheduler.fork_join(jobs)
    }
}

pub fn package() -> VegetationPackage {
    VegetationPackage::new(
        "fixture",
        vec![
            VegetationModel::new("grass", VegetationType::Grass).with_density(20.0),
            VegetationModel::new("oak", VegetationType::Tree).with_density(1.5),
        ],
    )
}

/// `columns * rows` cells of 16x16 units, indexed row-major.
pub fn cells_for(package: &VegetationPackage, columns: u32, rows: u32) -> Vec<VegetationCell> {
    (0..rows)
        .flat_map(|row| (0..columns).map(move |col| (row, col)))
        .map(|(row, col)| {
            VegetationCell::new(
                CellIndex(row * columns + col),
                Rect::from_xz(col as f32 * 16.0, row as f32 * 16.0, 16.0, 16.0),
                package,
            )
        })
        .collect()
}
