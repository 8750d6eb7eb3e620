use std::sync::atomic::{AtomicUsize, Ordering};

use canopy_common::InstanceMatrix;
use parking_lot::Mutex;

/// Allocation counters for a list pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Lists created because the free list was empty.
    pub allocated: usize,
    /// Lists served from the free list.
    pub reused: usize,
    /// Lists currently waiting in the free list.
    pub free: usize,
}

/// Free-list of matrix lists for one vegetation model.
///
/// Lists are handed out by value, so a list can never be held by two
/// workers at once. The free list is behind a mutex; `get_list` is safe to
/// call from any number of threads. An empty free list is not an error, a
/// fresh list is allocated instead.
#[derive(Debug)]
pub struct MatrixListPool {
    max_list_size: usize,
    free: Mutex<Vec<Vec<InstanceMatrix>>>,
    allocated: AtomicUsize,
    reused: AtomicUsize,
}

impl MatrixListPool {
    pub fn new(max_list_size: usize) -> Self {
        Self {
            max_list_size: max_list_size.max(1),
            free: Mutex::new(Vec::new()),
            allocated: AtomicUsize::new(0),
            reused: AtomicUsize::new(0),
        }
    }

    /// Pool with `count` lists allocated up front.
    pub fn with_preallocated(max_list_size: usize, count: usize) -> Self {
        let pool = Self::new(max_list_size);
        {
            let mut free = pool.free.lock();
            free.extend((0..count).map(|_| Vec::with_capacity(pool.max_list_size)));
        }
        pool
    }

    /// Batch cap of the lists this pool serves.
    pub fn max_list_size(&self) -> usize {
        self.max_list_size
    }

    /// An empty list, reused when possible.
    pub fn get_list(&self) -> Vec<InstanceMatrix> {
        let recycled = self.free.lock().pop();
        match recycled {
            Some(mut list) => {
                list.clear();
                self.reused.fetch_add(1, Ordering::Relaxed);
                list
            }
            None => {
                self.allocated.fetch_add(1, Ordering::Relaxed);
                Vec::with_capacity(self.max_list_size)
            }
        }
    }

    /// Give a list back for reuse.
    pub fn return_list(&self, mut list: Vec<InstanceMatrix>) {
        list.clear();
        self.free.lock().push(list);
    }

    /// Give back a set of lists under a single lock.
    pub fn reclaim(&self, lists: impl IntoIterator<Item = Vec<InstanceMatrix>>) {
        let mut free = self.free.lock();
        for mut list in lists {
            list.clear();
            free.push(list);
        }
    }

    pub fn free_count(&self) -> usize {
        self.free.lock().len()
    }

    /// Drop every pooled list.
    pub fn clear(&self) {
        self.free.lock().clear();
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            allocated: self.allocated.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
            free: self.free_count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn exhausted_pool_allocates() {
        let pool = MatrixListPool::new(8);
        let a = pool.get_list();
        let b = pool.get_list();
        assert!(a.is_empty() && b.is_empty());
        assert!(a.capacity() >= 8);
        assert_eq!(pool.stats().allocated, 2);
        assert_eq!(pool.stats().reused, 0);
    }

    #[test]
    fn returned_list_is_reused_empty() {
        let pool = MatrixListPool::new(4);
        let mut list = pool.get_list();
        list.push(InstanceMatrix::IDENTITY);
        let ptr = list.as_ptr();
        pool.return_list(list);

        let again = pool.get_list();
        assert!(again.is_empty());
        assert_eq!(again.as_ptr(), ptr);
        assert_eq!(pool.stats().reused, 1);
    }

    #[test]
    fn preallocated_lists_are_served_first() {
        let pool = MatrixListPool::with_preallocated(16, 3);
        assert_eq!(pool.free_count(), 3);
        let _a = pool.get_list();
        assert_eq!(pool.stats(), PoolStats { allocated: 0, reused: 1, free: 2 });
    }

    #[test]
    fn concurrent_get_list_never_aliases() {
        let pool = MatrixListPool::with_preallocated(32, 64);
        let held = parking_lot::Mutex::new(Vec::new());
        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    let lists: Vec<_> = (0..16).map(|_| pool.get_list()).collect();
                    held.lock().extend(lists);
                });
            }
        });

        // Every list is still alive here, so distinct buffers mean no aliasing.
        let held = held.into_inner();
        assert_eq!(held.len(), 128);
        let unique: HashSet<usize> = held.iter().map(|l| l.as_ptr() as usize).collect();
        assert_eq!(unique.len(), 128);
        assert_eq!(pool.stats().reused, 64);
        assert_eq!(pool.stats().allocated, 64);
    }

    #[test]
    fn reclaim_returns_everything() {
        let pool = MatrixListPool::new(2);
        let lists: Vec<_> = (0..5).map(|_| pool.get_list()).collect();
        pool.reclaim(lists);
        assert_eq!(pool.free_count(), 5);
        pool.clear();
        assert_eq!(pool.free_count(), 0);
    }
}
