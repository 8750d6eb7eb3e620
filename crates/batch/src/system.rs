use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use canopy_cell::{LoadContext, PlacementSource, VegetationCell};
use canopy_common::{
    CellIndex, InstanceId, InstanceMatrix, PackageError, Rect, Transform, VegetationPackage,
};
use canopy_persist::{InstanceSource, PersistentVegetationStorage};
use canopy_pool::VegetationCachePool;
use canopy_spatial::{CellGrid, CellQuadTree, GridError};

use crate::batcher::{BatchPlan, ModelRenderList, SelectedCell, build_render_lists};
use crate::config::{ConfigError, VegetationSettings};
use crate::loader::load_cells;
use crate::scheduler::{RayonScheduler, SchedulerError, WorkScheduler};
use crate::stats::{CycleStats, CycleTimer};

/// Cycles kept in the timing history.
const TIMER_HISTORY: usize = 120;

/// Errors from building or reconfiguring a [`VegetationSystem`].
#[derive(Debug, thiserror::Error)]
pub enum SystemError {
    #[error("grid error: {0}")]
    Grid(#[from] GridError),
    #[error("scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("package error: {0}")]
    Package(#[from] PackageError),
}

/// Owns the cells of one terrain and turns camera visibility into
/// per-model render batches.
///
/// A cycle is [`preprocess`](Self::preprocess) (select, load, post-process)
/// followed by [`update_vegetation_instance_lists`](Self::update_vegetation_instance_lists).
/// Render lists stay valid until the next call to the latter.
pub struct VegetationSystem {
    package: VegetationPackage,
    settings: VegetationSettings,
    terrain_bounds: Rect,
    grid: CellGrid,
    cells: Vec<VegetationCell>,
    quadtree: CellQuadTree,
    cache_pool: VegetationCachePool,
    render_lists: Vec<ModelRenderList>,
    placement: Arc<dyn PlacementSource>,
    storage: PersistentVegetationStorage,
    scheduler: Box<dyn WorkScheduler>,
    visible: BTreeSet<CellIndex>,
    shadow: BTreeSet<CellIndex>,
    selection: Vec<CellIndex>,
    needs_redraw: bool,
    stats: CycleStats,
    timer: CycleTimer,
}

impl VegetationSystem {
    /// Build a system with a rayon worker pool of `settings.thread_count` threads.
    pub fn new(
        package: VegetationPackage,
        settings: VegetationSettings,
        terrain_bounds: Rect,
        placement: Arc<dyn PlacementSource>,
    ) -> Result<Self, SystemError> {
        let scheduler = RayonScheduler::new(settings.effective_thread_count())?;
        Self::with_scheduler(package, settings, terrain_bounds, placement, Box::new(scheduler))
    }

    pub fn with_scheduler(
        package: VegetationPackage,
        settings: VegetationSettings,
        terrain_bounds: Rect,
        placement: Arc<dyn PlacementSource>,
        scheduler: Box<dyn WorkScheduler>,
    ) -> Result<Self, SystemError> {
        settings.validate()?;
        package.validate()?;
        let grid = CellGrid::new(terrain_bounds, settings.cell_size)?;
        let storage = PersistentVegetationStorage::new(package.name.clone())
            .with_cell_size(settings.cell_size);
        let timer = CycleTimer::new(TIMER_HISTORY, settings.frame_budget());

        let mut system = Self {
            package,
            settings,
            terrain_bounds,
            grid,
            cells: Vec::new(),
            quadtree: CellQuadTree::default(),
            cache_pool: VegetationCachePool::new(),
            render_lists: Vec::new(),
            placement,
            storage,
            scheduler,
            visible: BTreeSet::new(),
            shadow: BTreeSet::new(),
            selection: Vec::new(),
            needs_redraw: true,
            stats: CycleStats::default(),
            timer,
        };
        system.rebuild_cells();
        Ok(system)
    }

    /// Replace the persistent storage. Every cell reloads on the next cycle.
    ///
    /// Storage bucketed at another cell size, or at an unknown one, is
    /// rebucketed onto the current grid.
    pub fn with_storage(mut self, storage: PersistentVegetationStorage) -> Self {
        self.storage = storage;
        if self.storage.cell_size() != Some(self.grid.cell_size()) {
            self.rebucket_storage();
        }
        self.clear_all_caches(true);
        self
    }

    fn rebucket_storage(&mut self) {
        let grid = &self.grid;
        self.storage
            .rebucket(grid.cell_size(), |t| grid.position_to_cell(t.position));
    }

    fn rebuild_cells(&mut self) {
        let _span =
            tracing::info_span!("rebuild_cells", cell_size = self.grid.cell_size()).entered();
        let entries: Vec<(CellIndex, Rect)> = self.grid.cells().collect();
        self.cells = entries
            .iter()
            .map(|&(index, bounds)| VegetationCell::new(index, bounds, &self.package))
            .collect();
        self.quadtree =
            CellQuadTree::build(&entries, self.grid.bounds(), self.settings.quadtree_capacity);
        self.render_lists.clear();
        self.render_lists
            .resize_with(self.package.models.len(), ModelRenderList::default);
        self.visible.clear();
        self.shadow.clear();
        self.selection.clear();
        self.needs_redraw = true;
        tracing::debug!(
            cells = self.cells.len(),
            nodes = self.quadtree.node_count(),
            depth = self.quadtree.depth(),
            "cells partitioned"
        );
    }

    /// Repartition the terrain. Visibility is cleared since cell indices
    /// change; stored instances follow their positions to the new cells.
    pub fn resize_cells(&mut self, cell_size: f32) -> Result<(), SystemError> {
        self.grid = CellGrid::new(self.terrain_bounds, cell_size)?;
        self.settings.cell_size = cell_size;
        self.rebucket_storage();
        self.rebuild_cells();
        Ok(())
    }

    /// Switch to another package. Every cell is rebuilt and reloads lazily.
    pub fn set_package(&mut self, package: VegetationPackage) -> Result<(), SystemError> {
        package.validate()?;
        self.package = package;
        self.rebuild_cells();
        Ok(())
    }

    /// Apply new settings. A changed thread count replaces the worker pool
    /// with a rayon pool; a changed cell size repartitions the terrain.
    pub fn set_settings(&mut self, settings: VegetationSettings) -> Result<(), SystemError> {
        settings.validate()?;
        if settings.effective_thread_count() != self.settings.effective_thread_count() {
            self.scheduler = Box::new(RayonScheduler::new(settings.effective_thread_count())?);
        }
        let resize = settings.cell_size != self.settings.cell_size;
        let capacity_changed = settings.quadtree_capacity != self.settings.quadtree_capacity;
        self.timer.set_budget(settings.frame_budget());
        self.settings = settings;
        if resize {
            let cell_size = self.settings.cell_size;
            self.resize_cells(cell_size)?;
        } else if capacity_changed {
            let entries: Vec<(CellIndex, Rect)> = self.grid.cells().collect();
            self.quadtree =
                CellQuadTree::build(&entries, self.grid.bounds(), self.settings.quadtree_capacity);
        }
        Ok(())
    }

    pub fn set_scheduler(&mut self, scheduler: Box<dyn WorkScheduler>) {
        self.scheduler = scheduler;
    }

    /// Make the pool match the current package and cell size.
    ///
    /// Returns `true` if the pool was rebuilt, in which case the previous
    /// render lists are dropped.
    pub fn init_cache_pool(&mut self) -> bool {
        let rebuilt = self
            .cache_pool
            .init_cache_pool(&self.package, self.settings.cell_size);
        if rebuilt {
            for list in &mut self.render_lists {
                list.clear();
            }
        }
        rebuilt
    }

    pub fn set_visible_cells(&mut self, cells: impl IntoIterator<Item = CellIndex>) {
        self.visible = cells.into_iter().collect();
    }

    pub fn set_shadow_cells(&mut self, cells: impl IntoIterator<Item = CellIndex>) {
        self.shadow = cells.into_iter().collect();
    }

    /// Derive visibility from a view rectangle: cells overlapping `view` are
    /// visible, cells within `shadow_margin` of it cast shadows only.
    pub fn update_visibility(&mut self, view: Rect, shadow_margin: f32) {
        let visible: BTreeSet<CellIndex> = self.quadtree.query(view).into_iter().collect();
        self.shadow = if shadow_margin > 0.0 {
            self.quadtree
                .query(view.expand(shadow_margin))
                .into_iter()
                .filter(|c| !visible.contains(c))
                .collect()
        } else {
            BTreeSet::new()
        };
        self.visible = visible;
    }

    pub fn visible_cells(&self) -> &BTreeSet<CellIndex> {
        &self.visible
    }

    pub fn shadow_cells(&self) -> &BTreeSet<CellIndex> {
        &self.shadow
    }

    /// Cells selected by the last preprocess, in index order.
    pub fn selection(&self) -> &[CellIndex] {
        &self.selection
    }

    pub fn query_cells(&self, rect: Rect) -> Vec<CellIndex> {
        self.quadtree.query(rect)
    }

    pub fn cell(&self, index: CellIndex) -> Option<&VegetationCell> {
        self.cells.get(index.as_usize())
    }

    pub fn cells(&self) -> &[VegetationCell] {
        &self.cells
    }

    pub fn grid(&self) -> &CellGrid {
        &self.grid
    }

    pub fn quadtree(&self) -> &CellQuadTree {
        &self.quadtree
    }

    pub fn package(&self) -> &VegetationPackage {
        &self.package
    }

    pub fn settings(&self) -> &VegetationSettings {
        &self.settings
    }

    /// Drop a cell's lists so it reloads on its next selection. Returns
    /// `false` for an unknown cell.
    pub fn clear_cell_cache(&mut self, index: CellIndex, mark_dirty: bool) -> bool {
        let Some(cell) = self.cells.get_mut(index.as_usize()) else {
            return false;
        };
        let freed = cell.clear_cache();
        self.cache_pool.recycle_instance_buffers(freed);
        if mark_dirty {
            self.needs_redraw = true;
        }
        true
    }

    pub fn clear_all_caches(&mut self, mark_dirty: bool) {
        for cell in &mut self.cells {
            let freed = cell.clear_cache();
            self.cache_pool.recycle_instance_buffers(freed);
        }
        if mark_dirty {
            self.needs_redraw = true;
        }
    }

    /// Store a manually placed instance and invalidate the cell it lands in.
    /// Returns `None` for an unknown model or a position outside the terrain.
    pub fn add_persistent_instance(
        &mut self,
        model: usize,
        transform: Transform,
        source: InstanceSource,
    ) -> Option<InstanceId> {
        if model >= self.package.models.len() {
            tracing::warn!(model, "persistent instance for unknown model");
            return None;
        }
        let cell = self.grid.position_to_cell(transform.position)?;
        let id = self.storage.add_instance(cell, model, transform, source);
        self.clear_cell_cache(cell, true);
        Some(id)
    }

    /// Remove a stored instance or suppress a rule-placed one.
    pub fn remove_persistent_instance(
        &mut self,
        cell: CellIndex,
        model: usize,
        id: InstanceId,
    ) -> bool {
        if cell.as_usize() >= self.cells.len() || model >= self.package.models.len() {
            return false;
        }
        let changed = self.storage.remove_instance(cell, model, id);
        if changed {
            self.clear_cell_cache(cell, true);
        }
        changed
    }

    pub fn storage(&self) -> &PersistentVegetationStorage {
        &self.storage
    }

    pub fn needs_redraw(&self) -> bool {
        self.needs_redraw
    }

    /// Read and reset the redraw flag.
    pub fn take_redraw(&mut self) -> bool {
        std::mem::take(&mut self.needs_redraw)
    }

    fn rebuild_selection(&mut self) {
        let count = self.cells.len();
        self.selection.clear();
        for &index in self.visible.union(&self.shadow) {
            if index.as_usize() < count {
                self.selection.push(index);
            } else {
                tracing::warn!(%index, cells = count, "ignoring out-of-range cell");
            }
        }
    }

    /// Select visible and shadow cells, load the ones that need it, and
    /// post-process every selected cell.
    pub fn preprocess(&mut self) {
        let _span = tracing::info_span!("preprocess").entered();
        let start = Instant::now();

        self.init_cache_pool();
        self.rebuild_selection();
        self.stats = CycleStats {
            selected_cells: self.selection.len(),
            ..CycleStats::default()
        };

        let ctx = LoadContext {
            package: &self.package,
            placement: self.placement.as_ref(),
            storage: Some(&self.storage),
            pool: &self.cache_pool,
        };
        let outcome = load_cells(
            &mut self.cells,
            &self.selection,
            &ctx,
            self.scheduler.as_ref(),
            self.settings.effective_thread_count(),
            self.settings.use_multithreading,
        );
        self.stats.loaded_cells = outcome.loaded;
        self.stats.parallel_load = outcome.parallel;
        self.stats.load_jobs = outcome.jobs;
        self.stats.load_failures = outcome.failed;
        if outcome.loaded > 0 {
            self.needs_redraw = true;
        }

        let use_compute = self.settings.use_compute_shaders;
        for index in &self.selection {
            let cell = &mut self.cells[index.as_usize()];
            match cell.post_process(use_compute) {
                Ok(bytes) => self.stats.staged_bytes += bytes,
                Err(err) => {
                    tracing::warn!(%err, "post-process skipped");
                    self.stats.post_process_failures += 1;
                }
            }
        }

        self.stats.preprocess_time = start.elapsed();
        tracing::trace!(
            selected = self.stats.selected_cells,
            loaded = self.stats.loaded_cells,
            parallel = self.stats.parallel_load,
            "preprocess complete"
        );
    }

    /// Rebuild every model's render batches from the current selection.
    pub fn update_vegetation_instance_lists(&mut self) {
        let _span = tracing::info_span!("update_vegetation_instance_lists").entered();
        let start = Instant::now();

        self.init_cache_pool();
        let model_count = self.package.models.len();
        if self.render_lists.len() != model_count {
            self.render_lists.resize_with(model_count, ModelRenderList::default);
        }

        let selected: Vec<SelectedCell<'_>> = self
            .selection
            .iter()
            .filter_map(|index| {
                self.cells.get(index.as_usize()).map(|cell| SelectedCell {
                    cell,
                    visible: self.visible.contains(index),
                })
            })
            .collect();
        let plan = BatchPlan::from_settings(&self.settings, model_count);
        let outcome = build_render_lists(
            &self.package,
            &self.cache_pool,
            &mut self.render_lists,
            &selected,
            self.scheduler.as_ref(),
            plan,
        );

        self.stats.batch_jobs = outcome.jobs;
        self.stats.batch_failures = outcome.failed;
        self.stats.skipped_models = outcome.skipped_models;
        self.stats.committed_batches = outcome.batches;
        self.stats.committed_instances = outcome.instances;
        self.stats.batch_time = start.elapsed();
        tracing::trace!(
            batches = outcome.batches,
            instances = outcome.instances,
            parallel = plan.parallel,
            "render lists updated"
        );
    }

    /// One full update: preprocess then batch. Warns when the cycle runs over
    /// the frame budget.
    pub fn run_cycle(&mut self) -> &CycleStats {
        self.preprocess();
        self.update_vegetation_instance_lists();
        let total = self.stats.total_time();
        if self.timer.record(total) {
            tracing::warn!(
                elapsed = ?total,
                budget = ?self.timer.budget(),
                "vegetation cycle over budget"
            );
        }
        &self.stats
    }

    pub fn render_lists(&self) -> &[ModelRenderList] {
        &self.render_lists
    }

    /// Committed batches for a model; empty for an unknown model.
    pub fn split_lists(&self, model: usize) -> &[Vec<InstanceMatrix>] {
        self.render_lists
            .get(model)
            .map(ModelRenderList::split_lists)
            .unwrap_or(&[])
    }

    pub fn stats(&self) -> &CycleStats {
        &self.stats
    }

    pub fn timer(&self) -> &CycleTimer {
        &self.timer
    }

    pub fn cache_pool(&self) -> &VegetationCachePool {
        &self.cache_pool
    }
}
