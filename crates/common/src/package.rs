use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::types::Fnv1a;

/// Largest batch a single instanced draw accepts.
pub const DEFAULT_MAX_LIST_SIZE: usize = 1023;

/// Errors from loading a vegetation package description.
#[derive(Debug, thiserror::Error)]
pub enum PackageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("model {name:?} has max_list_size 0")]
    ZeroListSize { name: String },
}

/// Broad classification of a vegetation model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VegetationType {
    #[default]
    Grass,
    Plant,
    Tree,
    Objects,
    LargeObjects,
}

impl VegetationType {
    /// Models whose extent can exceed their owning cell.
    pub fn is_tree_or_large_object(self) -> bool {
        matches!(self, VegetationType::Tree | VegetationType::LargeObjects)
    }

    fn tag(self) -> u8 {
        match self {
            VegetationType::Grass => 0,
            VegetationType::Plant => 1,
            VegetationType::Tree => 2,
            VegetationType::Objects => 3,
            VegetationType::LargeObjects => 4,
        }
    }
}

/// How the renderer draws a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RenderPath {
    /// CPU-built instance batches.
    #[default]
    Instanced,
    /// GPU-driven indirect draws; no CPU batching outside edit mode.
    InstancedIndirect,
}

/// One renderable vegetation model and its placement rule parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VegetationModel {
    pub name: String,
    pub vegetation_type: VegetationType,
    pub render_path: RenderPath,
    /// Batch cap for this model's split lists.
    pub max_list_size: usize,
    /// Instances per 100 square world units.
    pub density: f32,
    pub min_scale: f32,
    pub max_scale: f32,
    pub seed: u64,
}

impl Default for VegetationModel {
    fn default() -> Self {
        Self {
            name: "grass".into(),
            vegetation_type: VegetationType::Grass,
            render_path: RenderPath::Instanced,
            max_list_size: DEFAULT_MAX_LIST_SIZE,
            density: 10.0,
            min_scale: 0.8,
            max_scale: 1.2,
            seed: 0,
        }
    }
}

impl VegetationModel {
    pub fn new(name: impl Into<String>, vegetation_type: VegetationType) -> Self {
        Self {
            name: name.into(),
            vegetation_type,
            ..Self::default()
        }
    }

    pub fn with_density(mut self, density: f32) -> Self {
        self.density = density;
        self
    }

    pub fn with_max_list_size(mut self, max_list_size: usize) -> Self {
        self.max_list_size = max_list_size;
        self
    }

    pub fn with_render_path(mut self, render_path: RenderPath) -> Self {
        self.render_path = render_path;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn is_tree_or_large_object(&self) -> bool {
        self.vegetation_type.is_tree_or_large_object()
    }
}

/// A set of vegetation models placed together over a terrain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VegetationPackage {
    pub name: String,
    pub seed: u64,
    pub models: Vec<VegetationModel>,
}

impl Default for VegetationPackage {
    fn default() -> Self {
        Self {
            name: "default".into(),
            seed: 0,
            models: vec![
                VegetationModel::new("grass", VegetationType::Grass).with_density(40.0),
                VegetationModel::new("fern", VegetationType::Plant).with_density(6.0),
                VegetationModel::new("pine", VegetationType::Tree).with_density(0.5),
                VegetationModel::new("boulder", VegetationType::LargeObjects).with_density(0.1),
            ],
        }
    }
}

impl VegetationPackage {
    pub fn new(name: impl Into<String>, models: Vec<VegetationModel>) -> Self {
        Self {
            name: name.into(),
            seed: 0,
            models,
        }
    }

    /// Load a package description from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, PackageError> {
        let package: Self = serde_json::from_reader(std::fs::File::open(path)?)?;
        package.validate()?;
        Ok(package)
    }

    pub fn validate(&self) -> Result<(), PackageError> {
        if let Some(model) = self.models.iter().find(|m| m.max_list_size == 0) {
            return Err(PackageError::ZeroListSize {
                name: model.name.clone(),
            });
        }
        Ok(())
    }

    pub fn model_count(&self) -> usize {
        self.models.len()
    }

    pub fn model(&self, index: usize) -> Option<&VegetationModel> {
        self.models.get(index)
    }

    /// Fingerprint of everything that affects pooled buffer layout or placement.
    pub fn fingerprint(&self) -> u64 {
        let mut h = Fnv1a::new();
        h.write(self.name.as_bytes());
        h.write_u64(self.seed);
        h.write_u64(self.models.len() as u64);
        for model in &self.models {
            h.write(model.name.as_bytes());
            h.write(&[model.vegetation_type.tag(), model.render_path as u8]);
            h.write_u64(model.max_list_size as u64);
            h.write_f32(model.density);
            h.write_f32(model.min_scale);
            h.write_f32(model.max_scale);
            h.write_u64(model.seed);
        }
        h.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_package_has_large_objects() {
        let package = VegetationPackage::default();
        assert_eq!(package.model_count(), 4);
        assert!(!package.models[0].is_tree_or_large_object());
        assert!(package.models[2].is_tree_or_large_object());
        assert!(package.models[3].is_tree_or_large_object());
    }

    #[test]
    fn fingerprint_tracks_list_size() {
        let a = VegetationPackage::default();
        let mut b = a.clone();
        assert_eq!(a.fingerprint(), b.fingerprint());
        b.models[1].max_list_size = 64;
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn json_roundtrip_with_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("package.json");
        std::fs::write(
            &path,
            r#"{"name":"meadow","models":[
                {"name":"oak","vegetation_type":"tree","max_list_size":500}
            ]}"#,
        )
        .unwrap();

        let package = VegetationPackage::from_json_file(&path).unwrap();
        assert_eq!(package.name, "meadow");
        assert_eq!(package.models[0].vegetation_type, VegetationType::Tree);
        assert_eq!(package.models[0].max_list_size, 500);
        assert_eq!(package.models[0].render_path, RenderPath::Instanced);
    }

    #[test]
    fn zero_list_size_is_rejected() {
        let package = VegetationPackage::new(
            "bad",
            vec![VegetationModel::default().with_max_list_size(0)],
        );
        assert!(matches!(
            package.validate(),
            Err(PackageError::ZeroListSize { .. })
        ));
    }
}
