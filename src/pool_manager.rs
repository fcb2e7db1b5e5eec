//! Registry of memory pools, addressable by id and by name.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;

use crate::error::{MemoryError, Result};
use crate::memory_pool::MemoryPool;
use crate::slab::PoolId;
use crate::slab_allocator::SlabAllocator;

/// Upper bound on pools per allocator.
pub const MAX_POOLS: usize = 64;

struct Registry {
    /// Pools indexed by their dense ids.
    pools: Vec<Arc<MemoryPool>>,
    ids_by_name: HashMap<String, PoolId>,
}

/// Creates and looks up [`MemoryPool`]s over one shared slab arena.
pub struct MemoryPoolManager {
    slab_alloc: Arc<SlabAllocator>,
    registry: RwLock<Registry>,
}

impl MemoryPoolManager {
    pub fn new(slab_alloc: Arc<SlabAllocator>) -> Self {
        Self {
            slab_alloc,
            registry: RwLock::new(Registry {
                pools: Vec::new(),
                ids_by_name: HashMap::new(),
            }),
        }
    }

    /// Creates a pool named `name` with a `size`-byte budget.
    ///
    /// Fails when the name is taken, the id space is exhausted, or the
    /// combined budgets would exceed the slab arena.
    pub fn create_new_pool(
        &self,
        name: &str,
        size: usize,
        alloc_sizes: &[u32],
    ) -> Result<PoolId> {
        let mut registry = self.registry.write();
        if registry.ids_by_name.contains_key(name) {
            return Err(MemoryError::invalid_argument(format!(
                "pool '{name}' already exists"
            )));
        }
        if registry.pools.len() >= MAX_POOLS {
            return Err(MemoryError::invalid_argument(format!(
                "cannot create more than {MAX_POOLS} pools"
            )));
        }
        let committed: usize = registry.pools.iter().map(|p| p.max_size()).sum();
        let remaining = self.slab_alloc.usable_size().saturating_sub(committed);
        if size > remaining {
            return Err(MemoryError::invalid_argument(format!(
                "pool '{name}' needs {size} bytes but only {remaining} remain unreserved"
            )));
        }

        let id = registry.pools.len() as PoolId;
        let pool = Arc::new(MemoryPool::new(id, size, self.slab_alloc.clone(), alloc_sizes)?);
        registry.pools.push(pool);
        registry.ids_by_name.insert(name.to_owned(), id);
        info!(pool = id, name, size, "pool registered");
        Ok(id)
    }

    pub fn pool_by_id(&self, id: PoolId) -> Result<Arc<MemoryPool>> {
        let registry = self.registry.read();
        if id < 0 || id as usize >= registry.pools.len() {
            return Err(MemoryError::InvalidPoolId(id));
        }
        Ok(registry.pools[id as usize].clone())
    }

    pub fn pool_by_name(&self, name: &str) -> Result<Arc<MemoryPool>> {
        let registry = self.registry.read();
        let id = *registry
            .ids_by_name
            .get(name)
            .ok_or_else(|| MemoryError::invalid_argument(format!("no pool named '{name}'")))?;
        Ok(registry.pools[id as usize].clone())
    }

    /// Number of registered pools.
    pub fn num_pools(&self) -> usize {
        self.registry.read().pools.len()
    }

    /// Total budget committed across all pools.
    pub fn total_pool_size(&self) -> usize {
        self.registry.read().pools.iter().map(|p| p.max_size()).sum()
    }
}
