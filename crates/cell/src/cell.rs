use canopy_common::{CellIndex, InstanceMatrix, Rect, VegetationPackage};
use canopy_persist::PersistentVegetationStorage;
use canopy_pool::VegetationCachePool;

use crate::placement::{PlacedInstance, PlacementRequest, PlacementSource};

/// Load state of a cell's instance lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellState {
    Unloaded,
    /// Set while `load_vegetation` runs; a cell left here failed mid-load.
    Loading,
    Loaded,
}

/// Errors from reading a cell.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CellError {
    #[error("{0} is not loaded")]
    NotLoaded(CellIndex),
    #[error("{cell} has no model {model}")]
    UnknownModel { cell: CellIndex, model: usize },
}

/// Inputs shared by every cell load in a cycle.
#[derive(Clone, Copy)]
pub struct LoadContext<'a> {
    pub package: &'a VegetationPackage,
    pub placement: &'a dyn PlacementSource,
    pub storage: Option<&'a PersistentVegetationStorage>,
    pub pool: &'a VegetationCachePool,
}

/// The vegetation instances inside one grid cell.
///
/// Instance lists are computed lazily by [`load_vegetation`](Self::load_vegetation)
/// and dropped by [`clear_cache`](Self::clear_cache). Loading takes `&mut self`,
/// so one cell is never loaded by two threads at once, and the lists are only
/// published once every model is computed.
#[derive(Debug)]
pub struct VegetationCell {
    index: CellIndex,
    bounds: Rect,
    state: CellState,
    lists: Vec<Vec<InstanceMatrix>>,
    large_object: Vec<bool>,
    staging: Vec<Option<Vec<u8>>>,
    post_processed: bool,
    load_count: u32,
}

impl VegetationCell {
    pub fn new(index: CellIndex, bounds: Rect, package: &VegetationPackage) -> Self {
        Self {
            index,
            bounds,
            state: CellState::Unloaded,
            lists: Vec::new(),
            large_object: package
                .models
                .iter()
                .map(|m| m.is_tree_or_large_object())
                .collect(),
            staging: Vec::new(),
            post_processed: false,
            load_count: 0,
        }
    }

    pub fn index(&self) -> CellIndex {
        self.index
    }

    pub fn bounds(&self) -> Rect {
        self.bounds
    }

    pub fn state(&self) -> CellState {
        self.state
    }

    pub fn is_loaded(&self) -> bool {
        self.state == CellState::Loaded
    }

    /// True until the lists have been computed since the last cache clear.
    pub fn needs_load_vegetation(&self) -> bool {
        self.state != CellState::Loaded
    }

    /// Number of completed loads over the cell's lifetime.
    pub fn load_count(&self) -> u32 {
        self.load_count
    }

    /// Compute every model's instance list from placement rules and stored overrides.
    pub fn load_vegetation(&mut self, ctx: &LoadContext<'_>) {
        self.state = CellState::Loading;

        let mut placed: Vec<PlacedInstance> = Vec::new();
        let mut lists = Vec::with_capacity(ctx.package.models.len());
        for (model_index, model) in ctx.package.models.iter().enumerate() {
            placed.clear();
            ctx.placement.place(
                &PlacementRequest {
                    cell: self.index,
                    bounds: self.bounds,
                    model_index,
                    model,
                    package_seed: ctx.package.seed,
                },
                &mut placed,
            );

            let overrides = ctx
                .storage
                .and_then(|s| s.overrides(self.index, model_index));
            let added = overrides.map_or(0, |o| o.added.len());
            if placed.is_empty() && added == 0 {
                lists.push(Vec::new());
                continue;
            }

            let mut list = ctx.pool.take_instance_buffer();
            list.reserve(placed.len() + added);
            match overrides {
                Some(o) => {
                    list.extend(
                        placed
                            .iter()
                            .filter(|p| !o.is_removed(p.id))
                            .map(|p| p.matrix),
                    );
                    list.extend(o.added.iter().map(|s| s.transform.to_matrix()));
                }
                None => list.extend(placed.iter().map(|p| p.matrix)),
            }
            lists.push(list);
        }

        let previous = std::mem::replace(&mut self.lists, lists);
        ctx.pool.recycle_instance_buffers(previous);
        self.large_object = ctx
            .package
            .models
            .iter()
            .map(|m| m.is_tree_or_large_object())
            .collect();
        self.staging.clear();
        self.post_processed = false;
        self.load_count += 1;
        self.state = CellState::Loaded;
        tracing::trace!(cell = %self.index, instances = self.instance_count(), "cell loaded");
    }

    /// Finalize a loaded cell. With compute shaders enabled every non-empty
    /// list is packed into a byte staging buffer; returns the staged byte count.
    pub fn post_process(&mut self, use_compute_shaders: bool) -> Result<usize, CellError> {
        if !self.is_loaded() {
            return Err(CellError::NotLoaded(self.index));
        }

        let mut staged = 0;
        if use_compute_shaders {
            self.staging = self
                .lists
                .iter()
                .map(|list| {
                    (!list.is_empty())
                        .then(|| bytemuck::cast_slice::<InstanceMatrix, u8>(list).to_vec())
                })
                .collect();
            staged = self.staging.iter().flatten().map(Vec::len).sum();
        } else {
            self.staging.clear();
        }
        self.post_processed = true;
        Ok(staged)
    }

    pub fn is_post_processed(&self) -> bool {
        self.post_processed
    }

    /// Packed instance bytes for a model, present after a compute-path post-process.
    pub fn compute_buffer(&self, model: usize) -> Option<&[u8]> {
        self.staging.get(model)?.as_deref()
    }

    /// Drop the computed lists. Returns the freed buffers for recycling.
    pub fn clear_cache(&mut self) -> Vec<Vec<InstanceMatrix>> {
        self.state = CellState::Unloaded;
        self.staging.clear();
        self.post_processed = false;
        std::mem::take(&mut self.lists)
    }

    /// Instance list for a model. `Ok(None)` means the model has no instances here.
    pub fn current_vegetation_list(
        &self,
        model: usize,
    ) -> Result<Option<&[InstanceMatrix]>, CellError> {
        if !self.is_loaded() {
            return Err(CellError::NotLoaded(self.index));
        }
        let list = self.lists.get(model).ok_or(CellError::UnknownModel {
            cell: self.index,
            model,
        })?;
        Ok((!list.is_empty()).then_some(list.as_slice()))
    }

    /// Whether the model can extend past this cell and must be drawn even when
    /// the cell itself is culled.
    pub fn is_tree_or_large_object(&self, model: usize) -> bool {
        self.large_object.get(model).copied().unwrap_or(false)
    }

    /// Total instances across all models; zero when not loaded.
    pub fn instance_count(&self) -> usize {
        self.lists.iter().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::placement::{EmptyPlacement, ProceduralPlacement};
    use canopy_common::{InstanceId, Transform, VegetationModel, VegetationType};
    use canopy_persist::InstanceSource;
    use glam::Vec3;

    fn package() -> VegetationPackage {
        VegetationPackage::new(
            "test",
            vec![
                VegetationModel::new("grass", VegetationType::Grass).with_density(30.0),
                VegetationModel::new("oak", VegetationType::Tree).with_density(2.0),
                VegetationModel::new("none", VegetationType::Plant).with_density(0.0),
            ],
        )
    }

    fn cell(package: &VegetationPackage) -> VegetationCell {
        VegetationCell::new(CellIndex(2), Rect::from_xz(0.0, 0.0, 32.0, 32.0), package)
    }

    fn load(
        cell: &mut VegetationCell,
        package: &VegetationPackage,
        storage: Option<&PersistentVegetationStorage>,
    ) {
        let pool = VegetationCachePool::new();
        let placement = ProceduralPlacement::default();
        cell.load_vegetation(&LoadContext {
            package,
            placement: &placement,
            storage,
            pool: &pool,
        });
    }

    #[test]
    fn clear_cache_forces_reload() {
        let package = package();
        let mut cell = cell(&package);
        assert!(cell.needs_load_vegetation());

        load(&mut cell, &package, None);
        assert!(!cell.needs_load_vegetation());
        assert_eq!(cell.state(), CellState::Loaded);

        let freed = cell.clear_cache();
        assert_eq!(freed.len(), 3);
        assert!(cell.needs_load_vegetation());
        assert_eq!(cell.state(), CellState::Unloaded);
        assert_eq!(cell.instance_count(), 0);
    }

    #[test]
    fn unloaded_read_is_an_error() {
        let package = package();
        let cell = cell(&package);
        assert_eq!(
            cell.current_vegetation_list(0),
            Err(CellError::NotLoaded(CellIndex(2)))
        );
    }

    #[test]
    fn empty_model_reads_as_none() {
        let package = package();
        let mut cell = cell(&package);
        load(&mut cell, &package, None);

        assert!(cell.current_vegetation_list(0).unwrap().is_some());
        assert_eq!(cell.current_vegetation_list(2), Ok(None));
        assert_eq!(
            cell.current_vegetation_list(3),
            Err(CellError::UnknownModel {
                cell: CellIndex(2),
                model: 3
            })
        );
    }

    #[test]
    fn loading_is_deterministic() {
        let package = package();
        let mut a = cell(&package);
        let mut b = cell(&package);
        load(&mut a, &package, None);
        load(&mut b, &package, None);
        for model in 0..3 {
            assert_eq!(
                a.current_vegetation_list(model).unwrap(),
                b.current_vegetation_list(model).unwrap()
            );
        }
    }

    #[test]
    fn storage_overrides_are_merged() {
        let package = package();
        let pool = VegetationCachePool::new();
        let placement = ProceduralPlacement::default();

        let mut placed = Vec::new();
        placement.place(
            &PlacementRequest {
                cell: CellIndex(2),
                bounds: Rect::from_xz(0.0, 0.0, 32.0, 32.0),
                model_index: 0,
                model: &package.models[0],
                package_seed: package.seed,
            },
            &mut placed,
        );
        assert!(placed.len() > 2);

        let mut storage = PersistentVegetationStorage::new("test");
        storage.remove_instance(CellIndex(2), 0, placed[0].id);
        storage.remove_instance(CellIndex(2), 0, InstanceId::procedural(u64::MAX >> 1));
        let added = Transform::from_position(Vec3::new(5.0, 0.0, 5.0));
        storage.add_instance(CellIndex(2), 0, added, InstanceSource::Manual);
        storage.add_instance(CellIndex(2), 2, added, InstanceSource::Baked);

        let mut cell = cell(&package);
        cell.load_vegetation(&LoadContext {
            package: &package,
            placement: &placement,
            storage: Some(&storage),
            pool: &pool,
        });

        let grass = cell.current_vegetation_list(0).unwrap().unwrap();
        assert_eq!(grass.len(), placed.len());
        assert!(!grass.contains(&placed[0].matrix));
        assert_eq!(grass.last(), Some(&added.to_matrix()));

        let none = cell.current_vegetation_list(2).unwrap().unwrap();
        assert_eq!(none, &[added.to_matrix()]);
    }

    #[test]
    fn storage_only_cells_use_empty_placement() {
        let package = package();
        let pool = VegetationCachePool::new();
        let mut storage = PersistentVegetationStorage::new("test");
        storage.add_instance(CellIndex(2), 1, Transform::default(), InstanceSource::Manual);

        let mut cell = cell(&package);
        cell.load_vegetation(&LoadContext {
            package: &package,
            placement: &EmptyPlacement,
            storage: Some(&storage),
            pool: &pool,
        });
        assert_eq!(cell.instance_count(), 1);
        assert_eq!(cell.current_vegetation_list(0), Ok(None));
    }

    #[test]
    fn post_process_requires_loaded() {
        let package = package();
        let mut cell = cell(&package);
        assert_eq!(cell.post_process(true), Err(CellError::NotLoaded(CellIndex(2))));

        load(&mut cell, &package, None);
        let staged = cell.post_process(true).unwrap();
        let grass = cell.current_vegetation_list(0).unwrap().unwrap().len();
        let oak = cell.current_vegetation_list(1).unwrap().map_or(0, <[_]>::len);
        assert_eq!(staged, (grass + oak) * std::mem::size_of::<InstanceMatrix>());
        assert!(cell.compute_buffer(0).is_some());
        assert!(cell.compute_buffer(2).is_none());

        assert_eq!(cell.post_process(false), Ok(0));
        assert!(cell.compute_buffer(0).is_none());
        assert!(cell.is_post_processed());
    }

    #[test]
    fn large_object_classification_follows_model_type() {
        let package = package();
        let cell = cell(&package);
        assert!(!cell.is_tree_or_large_object(0));
        assert!(cell.is_tree_or_large_object(1));
        assert!(!cell.is_tree_or_large_object(7));
    }

    #[test]
    fn panic_mid_load_leaves_cell_unloaded() {
        struct Exploding;
        impl PlacementSource for Exploding {
            fn place(&self, _: &PlacementRequest<'_>, _: &mut Vec<PlacedInstance>) {
                panic!("placement failed");
            }
        }

        let package = package();
        let pool = VegetationCachePool::new();
        let mut cell = cell(&package);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            cell.load_vegetation(&LoadContext {
                package: &package,
                placement: &Exploding,
                storage: None,
                pool: &pool,
            });
        }));
        assert!(result.is_err());
        assert!(cell.needs_load_vegetation());
        assert_eq!(cell.current_vegetation_list(0), Err(CellError::NotLoaded(CellIndex(2))));
    }
}
