//! Top-level allocator facade: one slab arena, many named pools.

use std::ptr::{self, NonNull};
use std::sync::Arc;

use tracing::info;

use crate::error::{MemoryError, Result};
use crate::memory_pool::MemoryPool;
use crate::pool_manager::MemoryPoolManager;
use crate::release::{SlabReleaseContext, SlabReleaseMode};
use crate::slab::{ClassId, PoolId, Slab, INVALID_POOL_ID};
use crate::slab_allocator::SlabAllocator;
use crate::utils::generate_alloc_sizes;

/// Upper bound on allocation classes per pool.
pub const MAX_ALLOC_CLASSES: usize = 128;

/// Allocator-wide configuration: the default allocation class sizes
/// pools are created with.
#[derive(Debug, Clone)]
pub struct AllocatorConfig {
    alloc_sizes: Vec<u32>,
}

impl AllocatorConfig {
    /// Uses `alloc_sizes` (strictly ascending) as the default class
    /// ladder.
    pub fn new(alloc_sizes: Vec<u32>) -> Result<Self> {
        if alloc_sizes.is_empty() || alloc_sizes.len() > MAX_ALLOC_CLASSES {
            return Err(MemoryError::invalid_argument(format!(
                "between 1 and {MAX_ALLOC_CLASSES} allocation class sizes required"
            )));
        }
        Ok(Self { alloc_sizes })
    }

    /// Generates the ladder with [`generate_alloc_sizes`].
    pub fn with_generated_sizes(
        factor: f64,
        max_size: u32,
        min_size: u32,
        reduce_fragmentation: bool,
    ) -> Result<Self> {
        Self::new(generate_alloc_sizes(
            factor,
            max_size,
            min_size,
            reduce_fragmentation,
        )?)
    }

    pub fn alloc_sizes(&self) -> &[u32] {
        &self.alloc_sizes
    }
}

/// Facade over the slab arena and the pool registry.
///
/// `free` and the release accessors route by slab header, so callers
/// only need the pointer or the release context.
pub struct MemoryAllocator {
    config: AllocatorConfig,
    slab_alloc: Arc<SlabAllocator>,
    pools: MemoryPoolManager,
}

impl MemoryAllocator {
    /// Builds an allocator backed by `slab_count` slabs.
    pub fn new(config: AllocatorConfig, slab_count: usize) -> Result<Self> {
        let slab_alloc = Arc::new(SlabAllocator::new(slab_count)?);
        let pools = MemoryPoolManager::new(slab_alloc.clone());
        info!(
            slab_count,
            classes = config.alloc_sizes.len(),
            "memory allocator created"
        );
        Ok(Self {
            config,
            slab_alloc,
            pools,
        })
    }

    /// Total bytes the arena can hand out as slabs.
    pub fn usable_size(&self) -> usize {
        self.slab_alloc.usable_size()
    }

    /// Creates a pool. `alloc_sizes` of `None` uses the configured
    /// default ladder. With `ensure_provisionable`, the budget must fit
    /// at least one slab per allocation class.
    pub fn add_pool(
        &self,
        name: &str,
        size: usize,
        alloc_sizes: Option<&[u32]>,
        ensure_provisionable: bool,
    ) -> Result<PoolId> {
        let sizes = alloc_sizes.unwrap_or(&self.config.alloc_sizes);
        if sizes.len() > MAX_ALLOC_CLASSES {
            return Err(MemoryError::invalid_argument(format!(
                "more than {MAX_ALLOC_CLASSES} allocation classes"
            )));
        }
        if ensure_provisionable && Slab::SIZE * sizes.len() > size {
            return Err(MemoryError::invalid_argument(format!(
                "pool '{name}' cannot hold one slab per allocation class: \
                 {} bytes required, {size} given",
                Slab::SIZE * sizes.len()
            )));
        }
        self.pools.create_new_pool(name, size, sizes)
    }

    /// Id of the pool named `name`, or [`INVALID_POOL_ID`].
    pub fn pool_id(&self, name: &str) -> PoolId {
        self.pools
            .pool_by_name(name)
            .map(|pool| pool.id())
            .unwrap_or(INVALID_POOL_ID)
    }

    pub fn get_pool(&self, id: PoolId) -> Result<Arc<MemoryPool>> {
        self.pools.pool_by_id(id)
    }

    /// Allocates at least `size` bytes from pool `id`.
    pub fn allocate(&self, id: PoolId, size: u32) -> Result<Option<NonNull<u8>>> {
        self.pools.pool_by_id(id)?.allocate(size)
    }

    /// Allocates one whole slab from pool `id`, zero-filled. The pool
    /// must have a class with chunk size `Slab::SIZE`.
    pub fn allocate_zeroed_slab(&self, id: PoolId) -> Result<Option<NonNull<u8>>> {
        let pool = self.pools.pool_by_id(id)?;
        let cid = pool.class_id_for_size(Slab::SIZE as u32)?;
        if pool.get_allocation_class(cid)?.alloc_size() as usize != Slab::SIZE {
            return Err(MemoryError::invalid_argument(
                "pool has no slab-sized allocation class",
            ));
        }
        match pool.allocate(Slab::SIZE as u32)? {
            Some(chunk) => {
                // SAFETY: the chunk spans exactly Slab::SIZE writable
                // bytes owned by the caller.
                unsafe { ptr::write_bytes(chunk.as_ptr(), 0, Slab::SIZE) };
                Ok(Some(chunk))
            }
            None => Ok(None),
        }
    }

    /// Frees `memory`, routing to its pool through the slab header.
    pub fn free(&self, memory: NonNull<u8>) -> Result<()> {
        let header = self
            .slab_alloc
            .get_slab_header(memory.as_ptr())
            .ok_or(MemoryError::ForeignMemory {
                addr: memory.as_ptr() as usize,
            })?;
        self.pools.pool_by_id(header.pool_id())?.free(memory)
    }

    /// Class that would serve `size` in pool `id`.
    pub fn class_id_for_size(&self, id: PoolId, size: u32) -> Result<ClassId> {
        self.pools.pool_by_id(id)?.class_id_for_size(size)
    }

    /// See [`MemoryPool::start_slab_release`].
    pub fn start_slab_release(
        &self,
        id: PoolId,
        victim: ClassId,
        receiver: ClassId,
        mode: SlabReleaseMode,
        hint: Option<NonNull<u8>>,
        abort_fn: impl Fn() -> bool,
    ) -> Result<SlabReleaseContext> {
        self.pools
            .pool_by_id(id)?
            .start_slab_release(victim, receiver, mode, hint, abort_fn)
    }

    /// See [`MemoryPool::complete_slab_release`].
    pub fn complete_slab_release(&self, context: &SlabReleaseContext) -> Result<()> {
        self.pools
            .pool_by_id(context.pool_id())?
            .complete_slab_release(context)
    }

    /// See [`MemoryPool::abort_slab_release`].
    pub fn abort_slab_release(&self, context: &SlabReleaseContext) -> Result<()> {
        self.pools
            .pool_by_id(context.pool_id())?
            .abort_slab_release(context)
    }

    /// Whether the chunk at `memory` was freed back during the drain
    /// described by `context`.
    pub fn is_alloc_freed(&self, context: &SlabReleaseContext, memory: NonNull<u8>) -> Result<bool> {
        self.pools
            .pool_by_id(context.pool_id())?
            .get_allocation_class(context.class_id())?
            .is_alloc_freed(context, memory)
    }

    /// Runs `callback` on `memory` if it is still live in the drain
    /// described by `context`; the check and callback are atomic.
    pub fn process_alloc_for_release(
        &self,
        context: &SlabReleaseContext,
        memory: NonNull<u8>,
        callback: impl FnOnce(NonNull<u8>),
    ) -> Result<()> {
        self.pools
            .pool_by_id(context.pool_id())?
            .get_allocation_class(context.class_id())?
            .process_alloc_for_release(context, memory, callback)
    }

    /// Whether every chunk of the context's slab has been freed back.
    pub fn all_allocs_freed(&self, context: &SlabReleaseContext) -> Result<bool> {
        self.pools
            .pool_by_id(context.pool_id())?
            .get_allocation_class(context.class_id())?
            .all_freed(context.slab())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_validates_class_count() {
        assert!(AllocatorConfig::new(vec![]).is_err());
        assert!(AllocatorConfig::new(vec![64; MAX_ALLOC_CLASSES + 1]).is_err());
        assert!(AllocatorConfig::new(vec![64, 128]).is_ok());
    }

    #[test]
    fn allocate_and_free_round_trip_through_headers() {
        let config = AllocatorConfig::new(vec![64, 256]).unwrap();
        let allocator = MemoryAllocator::new(config, 2).unwrap();
        let pool = allocator.add_pool("main", 2 * Slab::SIZE, None, false).unwrap();

        let chunk = allocator.allocate(pool, 200).unwrap().unwrap();
        assert_eq!(allocator.get_pool(pool).unwrap().get_current_alloc_size(), 256);
        allocator.free(chunk).unwrap();
        assert_eq!(allocator.get_pool(pool).unwrap().get_current_alloc_size(), 0);
    }

    #[test]
    fn pool_id_lookup() {
        let config = AllocatorConfig::new(vec![64]).unwrap();
        let allocator = MemoryAllocator::new(config, 1).unwrap();
        allocator.add_pool("named", Slab::SIZE, None, false).unwrap();
        assert_eq!(allocator.pool_id("named"), 0);
        assert_eq!(allocator.pool_id("missing"), INVALID_POOL_ID);
    }

    #[test]
    fn provisionable_check() {
        let config = AllocatorConfig::new(vec![64, 128]).unwrap();
        let allocator = MemoryAllocator::new(config, 2).unwrap();
        // Two classes need two slabs; one slab of budget is not enough.
        assert!(allocator
            .add_pool("tight", Slab::SIZE, None, true)
            .is_err());
        assert!(allocator
            .add_pool("roomy", 2 * Slab::SIZE, None, true)
            .is_ok());
    }

    #[test]
    fn zeroed_slab_allocation() {
        let config = AllocatorConfig::new(vec![64, Slab::SIZE as u32]).unwrap();
        let allocator = MemoryAllocator::new(config, 2).unwrap();
        let pool = allocator.add_pool("main", 2 * Slab::SIZE, None, false).unwrap();

        let slab_chunk = allocator.allocate_zeroed_slab(pool).unwrap().unwrap();
        // SAFETY: the chunk spans Slab::SIZE readable bytes.
        let bytes = unsafe { std::slice::from_raw_parts(slab_chunk.as_ptr(), Slab::SIZE) };
        assert!(bytes.iter().all(|&b| b == 0));
        allocator.free(slab_chunk).unwrap();
    }

    #[test]
    fn zeroed_slab_requires_slab_sized_class() {
        let config = AllocatorConfig::new(vec![64]).unwrap();
        let allocator = MemoryAllocator::new(config, 1).unwrap();
        let pool = allocator.add_pool("main", Slab::SIZE, None, false).unwrap();
        assert!(allocator.allocate_zeroed_slab(pool).is_err());
    }
}
