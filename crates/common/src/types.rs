use glam::{Mat4, Quat, Vec3};
use serde::{Deserialize, Serialize};

/// Per-instance transform matrix handed to the renderer.
pub type InstanceMatrix = Mat4;

/// Stable identity of a vegetation cell.
///
/// Assigned once when the terrain is partitioned; the quad-tree, the
/// persistent storage and the batcher all refer to cells by this index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CellIndex(pub u32);

impl CellIndex {
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for CellIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "cell#{}", self.0)
    }
}

/// Identity of a single placed vegetation instance.
///
/// Rule-generated instances have the top bit clear; instances added through
/// persistent storage have it set, so the two spaces never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceId(pub u64);

impl InstanceId {
    pub const PERSISTENT_BIT: u64 = 1 << 63;

    /// Id for a rule-generated instance.
    pub fn procedural(raw: u64) -> Self {
        Self(raw & !Self::PERSISTENT_BIT)
    }

    /// Id for an instance owned by persistent storage.
    pub fn persistent(serial: u64) -> Self {
        Self(serial | Self::PERSISTENT_BIT)
    }

    pub fn is_persistent(self) -> bool {
        self.0 & Self::PERSISTENT_BIT != 0
    }
}

/// Spatial transform: position, rotation, scale.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Transform {
    pub position: Vec3,
    pub rotation: Quat,
    pub scale: Vec3,
}

impl Transform {
    pub fn from_position(position: Vec3) -> Self {
        Self {
            position,
            ..Self::default()
        }
    }

    /// Column-major matrix as consumed by instanced draws.
    pub fn to_matrix(&self) -> InstanceMatrix {
        Mat4::from_scale_rotation_translation(self.scale, self.rotation, self.position)
    }
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            scale: Vec3::ONE,
        }
    }
}

/// FNV-1a accumulator used for configuration fingerprints and stable ids.
#[derive(Debug, Clone, Copy)]
pub struct Fnv1a(u64);

impl Fnv1a {
    pub fn new() -> Self {
        Self(0xcbf2_9ce4_8422_2325)
    }

    pub fn write(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.0 ^= b as u64;
            self.0 = self.0.wrapping_mul(0x0100_0000_01b3);
        }
    }

    pub fn write_u64(&mut self, value: u64) {
        self.write(&value.to_le_bytes());
    }

    pub fn write_f32(&mut self, value: f32) {
        self.write(&value.to_bits().to_le_bytes());
    }

    pub fn finish(self) -> u64 {
        self.0
    }
}

impl Default for Fnv1a {
    fn default() -> Self {
        Self::new()
    }
}

/// Splitmix64 step. Deterministic across platforms, used by placement rules.
pub fn splitmix64(mut state: u64) -> u64 {
    state = state.wrapping_add(0x9e37_79b9_7f4a_7c15);
    let mut z = state;
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}
