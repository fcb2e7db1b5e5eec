//! Point-in-time statistics snapshots.

use crate::slab::{ClassId, PoolId};

/// Snapshot of one allocation class.
#[derive(Debug, Clone)]
pub struct ClassStats {
    pub class_id: ClassId,
    pub alloc_size: u32,
    pub allocs_per_slab: usize,
    /// Slabs installed in the class (including the current one).
    pub allocated_slab_count: usize,
    /// Class-reserved slabs not yet carved.
    pub free_slab_count: usize,
    /// Chunks sitting on the freelist.
    pub free_alloc_count: usize,
    /// Drains currently in progress.
    pub active_releases: u64,
    /// Allocation hint; `false` means the last attempt found no memory.
    pub can_allocate: bool,
}

/// Snapshot of a memory pool and all its classes.
#[derive(Debug, Clone)]
pub struct PoolStats {
    pub pool_id: PoolId,
    pub max_size: usize,
    /// Bytes currently handed out to callers.
    pub curr_alloc_size: usize,
    /// Bytes held in slabs assigned to classes.
    pub curr_slab_alloc_size: usize,
    /// Whole slabs parked on the pool free list.
    pub free_slab_count: usize,
    pub n_slab_resize: u64,
    pub n_slab_rebalance: u64,
    pub n_slab_release_aborted: u64,
    pub class_stats: Vec<ClassStats>,
}

impl PoolStats {
    /// Bytes of slack: slab memory held but not handed out.
    pub fn fragmentation(&self) -> usize {
        self.curr_slab_alloc_size.saturating_sub(self.curr_alloc_size)
    }
}
