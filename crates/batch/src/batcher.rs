use canopy_cell::VegetationCell;
use canopy_common::{InstanceMatrix, RenderPath, VegetationPackage};
use canopy_pool::{MatrixListPool, VegetationCachePool};

use crate::config::VegetationSettings;
use crate::scheduler::{ForkJoinReport, Job, WorkScheduler, run_guarded};

/// Batch workers dispatched per fork-join pass when vegetation items are limited.
pub const BATCH_SLOTS: usize = 64;

/// Render batches for one model, each at most `max_list_size` instances.
#[derive(Debug, Default)]
pub struct ModelRenderList {
    split_lists: Vec<Vec<InstanceMatrix>>,
    built: bool,
    skipped: bool,
}

impl ModelRenderList {
    pub fn split_lists(&self) -> &[Vec<InstanceMatrix>] {
        &self.split_lists
    }

    pub fn instance_count(&self) -> usize {
        self.split_lists.iter().map(Vec::len).sum()
    }

    pub fn batch_count(&self) -> usize {
        self.split_lists.len()
    }

    /// True once a build finished for the current cycle.
    pub fn is_built(&self) -> bool {
        self.built
    }

    /// True if the model's render path kept it out of this cycle.
    pub fn is_skipped(&self) -> bool {
        self.skipped
    }

    /// Return committed lists to `pool` and forget the last build.
    pub fn reset(&mut self, pool: &MatrixListPool) {
        pool.reclaim(self.split_lists.drain(..));
        self.built = false;
        self.skipped = false;
    }

    /// Drop committed lists without recycling them.
    pub fn clear(&mut self) {
        self.split_lists.clear();
        self.built = false;
        self.skipped = false;
    }
}

/// A selected cell as seen by the batcher.
#[derive(Debug, Clone, Copy)]
pub struct SelectedCell<'a> {
    pub cell: &'a VegetationCell,
    /// In the camera's visible set; otherwise the cell is only shadow-relevant.
    pub visible: bool,
}

/// Build `model`'s batches from the selected cells, in selection order.
///
/// Cells that are neither visible nor hold trees or large objects for the
/// model are skipped. A cell's list is bulk-appended while the batch stays
/// below the cap; otherwise instances are appended one at a time and every
/// batch that reaches exactly `max_list_size` is committed. The final batch
/// is committed if it is non-empty.
pub fn build_model_batches(
    model: usize,
    pool: &MatrixListPool,
    selected: &[SelectedCell<'_>],
    out: &mut ModelRenderList,
) {
    out.reset(pool);
    let max = pool.max_list_size();
    let mut current = pool.get_list();

    for entry in selected {
        if !entry.visible && !entry.cell.is_tree_or_large_object(model) {
            continue;
        }
        let list = match entry.cell.current_vegetation_list(model) {
            Ok(Some(list)) => list,
            Ok(None) => continue,
            Err(err) => {
                tracing::warn!(model, %err, "cell skipped while batching");
                continue;
            }
        };

        if current.len() + list.len() < max {
            current.extend_from_slice(list);
            continue;
        }
        for matrix in list {
            current.push(*matrix);
            if current.len() == max {
                let full = std::mem::replace(&mut current, pool.get_list());
                out.split_lists.push(full);
            }
        }
    }

    if current.is_empty() {
        pool.return_list(current);
    } else {
        out.split_lists.push(current);
    }
    out.built = true;
}

/// How the batch phase dispatches its per-model jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchPlan {
    pub parallel: bool,
    /// Jobs per fork-join pass.
    pub slots: usize,
    /// Edit mode batches indirect-path models too.
    pub edit_mode: bool,
}

impl BatchPlan {
    pub fn from_settings(settings: &VegetationSettings, model_count: usize) -> Self {
        let slots = if settings.enable_unlimited_vegetation_items {
            BATCH_SLOTS
        } else {
            BATCH_SLOTS.max(model_count)
        };
        Self {
            parallel: settings.use_list_multithreading
                && !settings.is_edit_mode()
                && model_count > 1,
            slots,
            edit_mode: settings.is_edit_mode(),
        }
    }
}

/// Result of one batch phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub jobs: usize,
    pub failed: usize,
    /// Fork-join passes issued; zero when batching ran on the calling thread.
    pub passes: usize,
    pub skipped_models: usize,
    pub batches: usize,
    pub instances: usize,
}

struct ModelJob<'a> {
    model: usize,
    pool: &'a MatrixListPool,
    out: &'a mut ModelRenderList,
}

impl ModelJob<'_> {
    fn run(&mut self, selected: &[SelectedCell<'_>]) {
        build_model_batches(self.model, self.pool, selected, self.out);
    }
}

/// Rebuild every model's render list from the selected cells.
///
/// `outputs` holds one entry per package model. Every output is reset before
/// dispatch, so a job that panics or never runs leaves its model with no
/// batches for the cycle.
pub fn build_render_lists(
    package: &VegetationPackage,
    pools: &VegetationCachePool,
    outputs: &mut [ModelRenderList],
    selected: &[SelectedCell<'_>],
    scheduler: &dyn WorkScheduler,
    plan: BatchPlan,
) -> BatchOutcome {
    let _span =
        tracing::info_span!("build_render_lists", models = package.models.len()).entered();
    let mut outcome = BatchOutcome::default();

    let mut work: Vec<ModelJob<'_>> = Vec::with_capacity(outputs.len());
    for (model, (desc, out)) in package.models.iter().zip(outputs.iter_mut()).enumerate() {
        let Some(pool) = pools.model_pool(model) else {
            tracing::warn!(model, "no list pool for model");
            out.clear();
            outcome.skipped_models += 1;
            continue;
        };
        out.reset(pool);
        if desc.render_path == RenderPath::InstancedIndirect && !plan.edit_mode {
            out.skipped = true;
            outcome.skipped_models += 1;
            continue;
        }
        work.push(ModelJob { model, pool, out });
    }

    let mut report = ForkJoinReport::default();
    if plan.parallel && work.len() > 1 {
        for pass in work.chunks_mut(plan.slots.max(1)) {
            let jobs: Vec<Job<'_>> = pass
                .iter_mut()
                .map(|job| Box::new(move || job.run(selected)) as Job<'_>)
                .collect();
            report += scheduler.fork_join(jobs);
            outcome.passes += 1;
        }
        tracing::debug!(
            jobs = report.dispatched,
            passes = outcome.passes,
            "batched models in parallel"
        );
    } else {
        for job in work.iter_mut() {
            report.dispatched += 1;
            if !run_guarded(Box::new(|| job.run(selected))) {
                report.failed += 1;
            }
        }
        tracing::debug!(jobs = report.dispatched, "batched models sequentially");
    }

    for job in work.iter_mut() {
        if !job.out.built {
            tracing::warn!(model = job.model, "discarding partial batches");
            job.out.reset(job.pool);
            continue;
        }
        outcome.batches += job.out.batch_count();
        outcome.instances += job.out.instance_count();
    }

    outcome.jobs = report.dispatched;
    outcome.failed = report.failed;
    outcome
}
