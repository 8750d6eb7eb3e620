use canopy_common::{InstanceMatrix, VegetationPackage};
use parking_lot::Mutex;

use crate::list_pool::{MatrixListPool, PoolStats};

/// Upper bound on recycled cell buffers kept between cycles.
const MAX_RECYCLED_BUFFERS: usize = 4096;

/// Configuration the pooled buffers were sized for.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoolKey {
    pub package_fingerprint: u64,
    pub cell_size: f32,
}

impl PoolKey {
    pub fn new(package: &VegetationPackage, cell_size: f32) -> Self {
        Self {
            package_fingerprint: package.fingerprint(),
            cell_size,
        }
    }
}

/// Snapshot of pool usage for instrumentation.
#[derive(Debug, Clone, Default)]
pub struct CachePoolStats {
    pub generation: u64,
    pub models: Vec<PoolStats>,
    pub recycled_buffers: usize,
}

/// Per-system pool of matrix lists and cell instance buffers.
///
/// Holds one [`MatrixListPool`] per vegetation model plus a shared free-list
/// of instance buffers recycled from cleared cells. Keyed by [`PoolKey`];
/// re-initializing with the same key is a no-op.
#[derive(Debug, Default)]
pub struct VegetationCachePool {
    key: Option<PoolKey>,
    generation: u64,
    model_pools: Vec<MatrixListPool>,
    instance_buffers: Mutex<Vec<Vec<InstanceMatrix>>>,
}

impl VegetationCachePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// (Re)allocate pools for `package` at `cell_size`.
    ///
    /// Returns `true` if the pool was rebuilt. With an unchanged key nothing is
    /// touched, so lists already handed out stay valid and untouched.
    pub fn init_cache_pool(&mut self, package: &VegetationPackage, cell_size: f32) -> bool {
        let key = PoolKey::new(package, cell_size);
        if self.key == Some(key) {
            return false;
        }

        self.model_pools = package
            .models
            .iter()
            .map(|m| MatrixListPool::new(m.max_list_size))
            .collect();
        self.instance_buffers.get_mut().clear();
        self.key = Some(key);
        self.generation += 1;

        tracing::debug!(
            package = %package.name,
            models = self.model_pools.len(),
            cell_size,
            generation = self.generation,
            "cache pool initialized"
        );
        true
    }

    pub fn key(&self) -> Option<PoolKey> {
        self.key
    }

    pub fn is_initialized(&self) -> bool {
        self.key.is_some()
    }

    /// Incremented on every rebuild.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn model_pool(&self, model: usize) -> Option<&MatrixListPool> {
        self.model_pools.get(model)
    }

    pub fn model_pools(&self) -> &[MatrixListPool] {
        &self.model_pools
    }

    /// Shortcut for `model_pool(model)?.get_list()`.
    pub fn get_list(&self, model: usize) -> Option<Vec<InstanceMatrix>> {
        self.model_pools.get(model).map(MatrixListPool::get_list)
    }

    /// An empty buffer for a cell's instance list. Safe to call from load workers.
    pub fn take_instance_buffer(&self) -> Vec<InstanceMatrix> {
        self.instance_buffers.lock().pop().unwrap_or_default()
    }

    /// Return buffers freed by a cache clear.
    pub fn recycle_instance_buffers(&self, buffers: impl IntoIterator<Item = Vec<InstanceMatrix>>) {
        let mut free = self.instance_buffers.lock();
        for mut buffer in buffers {
            if free.len() >= MAX_RECYCLED_BUFFERS {
                break;
            }
            if buffer.capacity() == 0 {
                continue;
            }
            buffer.clear();
            free.push(buffer);
        }
    }

    pub fn recycled_buffer_count(&self) -> usize {
        self.instance_buffers.lock().len()
    }

    /// Drop every pooled list and buffer and forget the key.
    pub fn clear(&mut self) {
        self.model_pools.clear();
        self.instance_buffers.get_mut().clear();
        self.key = None;
    }

    pub fn stats(&self) -> CachePoolStats {
        CachePoolStats {
            generation: self.generation,
            models: self.model_pools.iter().map(MatrixListPool::stats).collect(),
            recycled_buffers: self.recycled_buffer_count(),
        }
    }
}
