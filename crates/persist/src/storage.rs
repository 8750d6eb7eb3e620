use std::collections::{BTreeMap, BTreeSet};

use canopy_common::{CellIndex, InstanceId, Transform};
use serde::{Deserialize, Serialize};

/// Where a stored instance came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceSource {
    #[default]
    Manual,
    Brush,
    Baked,
}

/// An instance owned by persistent storage rather than a placement rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredInstance {
    pub id: InstanceId,
    pub transform: Transform,
    pub source: InstanceSource,
}

/// Overrides for one model in one cell.
///
/// `added` instances are appended after rule placement; rule instances whose
/// id is in `removed` are suppressed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelOverrides {
    pub added: Vec<StoredInstance>,
    pub removed: BTreeSet<InstanceId>,
}

impl ModelOverrides {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }

    pub fn is_removed(&self, id: InstanceId) -> bool {
        self.removed.contains(&id)
    }
}

/// Outcome of moving stored overrides onto a new cell grid.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RebucketReport {
    /// Stored instances whose cell index changed.
    pub moved: usize,
    /// Stored instances outside the new grid.
    pub dropped_instances: usize,
    /// Suppressed rule ids; these are tied to the old cells and cannot move.
    pub dropped_removals: usize,
}

/// Persisted placement edits for a whole terrain, keyed by cell and model.
///
/// Cell indices are only meaningful for the grid the storage was bucketed
/// at, recorded as `cell_size`. Use [`rebucket`](Self::rebucket) when the
/// grid changes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistentVegetationStorage {
    package_name: String,
    #[serde(default)]
    cell_size: Option<f32>,
    cells: BTreeMap<CellIndex, BTreeMap<usize, ModelOverrides>>,
    next_serial: u64,
}

impl PersistentVegetationStorage {
    pub fn new(package_name: impl Into<String>) -> Self {
        Self {
            package_name: package_name.into(),
            ..Self::default()
        }
    }

    /// Storage bucketed for cells of `cell_size`.
    pub fn with_cell_size(mut self, cell_size: f32) -> Self {
        self.cell_size = Some(cell_size);
        self
    }

    pub fn package_name(&self) -> &str {
        &self.package_name
    }

    /// Cell size the indices refer to; `None` if never recorded.
    pub fn cell_size(&self) -> Option<f32> {
        self.cell_size
    }

    /// Move every stored instance to the cell `locate` assigns its transform
    /// and record the new `cell_size`.
    ///
    /// Suppressed rule ids are dropped since rule instances are regenerated
    /// per cell. Instances `locate` rejects are dropped too.
    pub fn rebucket(
        &mut self,
        cell_size: f32,
        mut locate: impl FnMut(&Transform) -> Option<CellIndex>,
    ) -> RebucketReport {
        let mut report = RebucketReport::default();
        for (cell, models) in std::mem::take(&mut self.cells) {
            for (model, overrides) in models {
                report.dropped_removals += overrides.removed.len();
                for stored in overrides.added {
                    let Some(target) = locate(&stored.transform) else {
                        report.dropped_instances += 1;
                        continue;
                    };
                    if target != cell {
                        report.moved += 1;
                    }
                    self.cells
                        .entry(target)
                        .or_default()
                        .entry(model)
                        .or_default()
                        .added
                        .push(stored);
                }
            }
        }
        self.cell_size = Some(cell_size);

        if report.dropped_instances > 0 || report.dropped_removals > 0 {
            tracing::warn!(
                cell_size,
                dropped_instances = report.dropped_instances,
                dropped_removals = report.dropped_removals,
                "overrides lost while rebucketing storage"
            );
        }
        tracing::debug!(cell_size, moved = report.moved, "storage rebucketed");
        report
    }

    /// Store a new instance for `model` in `cell`. Returns its persistent id.
    pub fn add_instance(
        &mut self,
        cell: CellIndex,
        model: usize,
        transform: Transform,
        source: InstanceSource,
    ) -> InstanceId {
        let id = InstanceId::persistent(self.next_serial);
        self.next_serial += 1;
        self.cells
            .entry(cell)
            .or_default()
            .entry(model)
            .or_default()
            .added
            .push(StoredInstance {
                id,
                transform,
                source,
            });
        tracing::trace!(%cell, model, id = id.0, "stored instance added");
        id
    }

    /// Remove an instance. A stored instance is deleted outright; a rule
    /// instance is recorded as suppressed. Returns `false` if nothing changed.
    pub fn remove_instance(&mut self, cell: CellIndex, model: usize, id: InstanceId) -> bool {
        let overrides = self.cells.entry(cell).or_default().entry(model).or_default();
        let changed = if id.is_persistent() {
            let before = overrides.added.len();
            overrides.added.retain(|s| s.id != id);
            overrides.added.len() != before
        } else {
            overrides.removed.insert(id)
        };
        self.prune(cell, model);
        changed
    }

    /// Overrides for `model` in `cell`, if any were recorded.
    pub fn overrides(&self, cell: CellIndex, model: usize) -> Option<&ModelOverrides> {
        self.cells.get(&cell)?.get(&model)
    }

    pub fn has_overrides(&self, cell: CellIndex) -> bool {
        self.cells.contains_key(&cell)
    }

    /// Drop every override in a cell. Returns `true` if the cell had any.
    pub fn clear_cell(&mut self, cell: CellIndex) -> bool {
        self.cells.remove(&cell).is_some()
    }

    /// Drop every override for a model; returns the cells that changed.
    pub fn clear_model(&mut self, model: usize) -> Vec<CellIndex> {
        let mut affected = Vec::new();
        for (cell, models) in self.cells.iter_mut() {
            if models.remove(&model).is_some() {
                affected.push(*cell);
            }
        }
        self.cells.retain(|_, models| !models.is_empty());
        affected
    }

    /// Cells with at least one override, ascending.
    pub fn cells(&self) -> impl Iterator<Item = CellIndex> + '_ {
        self.cells.keys().copied()
    }

    /// Number of stored (added) instances.
    pub fn instance_count(&self) -> usize {
        self.cells
            .values()
            .flat_map(|m| m.values())
            .map(|o| o.added.len())
            .sum()
    }

    /// Number of suppressed rule instances.
    pub fn removed_count(&self) -> usize {
        self.cells
            .values()
            .flat_map(|m| m.values())
            .map(|o| o.removed.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn clear(&mut self) {
        self.cells.clear();
    }

    fn prune(&mut self, cell: CellIndex, model: usize) {
        if let Some(models) = self.cells.get_mut(&cell) {
            if models.get(&model).is_some_and(ModelOverrides::is_empty) {
                models.remove(&model);
            }
            if models.is_empty() {
                self.cells.remove(&cell);
            }
        }
    }
}
