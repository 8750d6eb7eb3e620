use canopy_common::{
    CellIndex, Fnv1a, InstanceId, InstanceMatrix, Rect, Transform, VegetationModel, splitmix64,
};
use glam::{Quat, Vec3};

/// One rule-placed instance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlacedInstance {
    pub id: InstanceId,
    pub matrix: InstanceMatrix,
}

/// Everything a placement rule needs to fill one model in one cell.
#[derive(Debug, Clone, Copy)]
pub struct PlacementRequest<'a> {
    pub cell: CellIndex,
    pub bounds: Rect,
    pub model_index: usize,
    pub model: &'a VegetationModel,
    pub package_seed: u64,
}

/// Source of rule-based instances for a cell.
///
/// Must be a pure function of the request: loading the same cell twice, on
/// any thread, has to produce the same instances in the same order.
pub trait PlacementSource: Send + Sync {
    fn place(&self, request: &PlacementRequest<'_>, out: &mut Vec<PlacedInstance>);
}

/// Places nothing; every instance comes from persistent storage.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyPlacement;

impl PlacementSource for EmptyPlacement {
    fn place(&self, _request: &PlacementRequest<'_>, _out: &mut Vec<PlacedInstance>) {}
}

/// Seeded scatter over the cell using each model's density and scale range.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProceduralPlacement {
    /// Terrain height instances are placed at.
    pub ground_height: f32,
}

impl ProceduralPlacement {
    pub fn new(ground_height: f32) -> Self {
        Self { ground_height }
    }

    /// Expected instance count before the fractional part is resolved.
    pub fn expected_count(model: &VegetationModel, bounds: &Rect) -> f32 {
        (model.density.max(0.0) * bounds.area() / 100.0).max(0.0)
    }
}

impl PlacementSource for ProceduralPlacement {
    fn place(&self, request: &PlacementRequest<'_>, out: &mut Vec<PlacedInstance>) {
        let model = request.model;
        let mut seed = Fnv1a::new();
        seed.write_u64(request.package_seed);
        seed.write_u64(model.seed);
        seed.write_u64(request.cell.0 as u64);
        seed.write_u64(request.model_index as u64);
        let mut state = seed.finish();

        let expected = Self::expected_count(model, &request.bounds);
        let mut count = expected.floor() as usize;
        if unit(&mut state) < expected.fract() {
            count += 1;
        }

        let size = request.bounds.size();
        let (min_scale, max_scale) = if model.min_scale <= model.max_scale {
            (model.min_scale, model.max_scale)
        } else {
            (model.max_scale, model.min_scale)
        };

        out.reserve(count);
        for i in 0..count {
            let x = request.bounds.min.x + unit(&mut state) * size.x;
            let z = request.bounds.min.y + unit(&mut state) * size.y;
            let yaw = unit(&mut state) * std::f32::consts::TAU;
            let scale = min_scale + unit(&mut state) * (max_scale - min_scale);

            let transform = Transform {
                position: Vec3::new(x, self.ground_height, z),
                rotation: Quat::from_rotation_y(yaw),
                scale: Vec3::splat(scale),
            };

            let mut id = Fnv1a::new();
            id.write_u64(request.cell.0 as u64);
            id.write_u64(request.model_index as u64);
            id.write_u64(i as u64);

            out.push(PlacedInstance {
                id: InstanceId::procedural(id.finish()),
                matrix: transform.to_matrix(),
            });
        }
    }
}

/// Uniform value in `[0, 1)` from the next splitmix step.
fn unit(state: &mut u64) -> f32 {
    *state = splitmix64(*state);
    (*state >> 40) as f32 / (1u64 << 24) as f32
}
