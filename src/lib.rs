//! # slabpool
//!
//! Slab-based memory allocator for caching systems.
//!
//! A fixed-capacity arena is carved into equal-sized slabs
//! ([`Slab::SIZE`] bytes). Memory pools draw whole slabs from the arena
//! and split them across per-size allocation classes, which hand out
//! fixed-size chunks to callers. Memory moves back in whole slabs too:
//! the release protocol cooperatively drains a slab's outstanding chunks
//! so it can be returned to the arena (resize) or handed to another
//! class (rebalance) while allocation traffic continues.
//!
//! ## Architecture
//!
//! ```text
//! MemoryAllocator
//!   ├─→ SlabAllocator          backing region, slab headers
//!   └─→ MemoryPoolManager
//!         ├─→ MemoryPool("hot")
//!         │     ├─→ AllocationClass(64 B)   → freelist + current slab
//!         │     ├─→ AllocationClass(128 B)
//!         │     └─→ free slabs
//!         └─→ MemoryPool("cold")
//! ```
//!
//! ## Quick start
//!
//! ```no_run
//! use slabpool::{AllocatorConfig, MemoryAllocator, Slab};
//!
//! fn main() -> slabpool::Result<()> {
//!     let config = AllocatorConfig::with_generated_sizes(1.25, 65536, 64, true)?;
//!     let allocator = MemoryAllocator::new(config, 64)?;
//!     let pool = allocator.add_pool("cache", 16 * Slab::SIZE, None, false)?;
//!
//!     if let Some(chunk) = allocator.allocate(pool, 100)? {
//!         // ... use the chunk ...
//!         allocator.free(chunk)?;
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Concurrency
//!
//! Allocate and free run under a short per-class critical section; pool
//! accounting is atomic. Draining a slab serializes at its start, prunes
//! the class freelist in bounded batches so allocators are never starved,
//! and completion blocks until cooperating callers have freed every
//! outstanding chunk. Out-of-memory is reported as `Ok(None)`, never as
//! an error.

#![warn(rust_2018_idioms)]

mod allocation_class;
mod error;
mod memory_allocator;
mod memory_pool;
mod pool_manager;
mod release;
mod slab;
mod slab_allocator;
mod stats;
mod utils;

pub use allocation_class::AllocationClass;
pub use error::{MemoryError, Result};
pub use memory_allocator::{AllocatorConfig, MemoryAllocator, MAX_ALLOC_CLASSES};
pub use memory_pool::MemoryPool;
pub use pool_manager::{MemoryPoolManager, MAX_POOLS};
pub use release::{SlabIterationStatus, SlabReleaseContext, SlabReleaseMode};
pub use slab::{
    AllocInfo, ClassId, PoolId, Slab, SlabHeader, ALLOC_ALIGNMENT, INVALID_CLASS_ID,
    INVALID_POOL_ID,
};
pub use slab_allocator::SlabAllocator;
pub use stats::{ClassStats, PoolStats};
pub use utils::generate_alloc_sizes;

/// Convenient re-exports of the commonly used types.
pub mod prelude {
    pub use crate::error::{MemoryError, Result};
    pub use crate::memory_allocator::{AllocatorConfig, MemoryAllocator};
    pub use crate::memory_pool::MemoryPool;
    pub use crate::release::{SlabIterationStatus, SlabReleaseContext, SlabReleaseMode};
    pub use crate::slab::{ClassId, PoolId, Slab, INVALID_CLASS_ID, INVALID_POOL_ID};
    pub use crate::slab_allocator::SlabAllocator;
}
