//! Error types for pool and slab operations.

use thiserror::Error;

use crate::slab::{ClassId, PoolId};

/// Result type for pool and slab operations.
pub type Result<T> = std::result::Result<T, MemoryError>;

/// Errors surfaced by the allocator.
///
/// Running out of chunk memory is *not* an error: `allocate` returns
/// `Ok(None)` and flips the class's `can_allocate` hint instead.
#[derive(Error, Debug)]
pub enum MemoryError {
    /// Allocation size is zero, out of class range, or an invalid class
    /// size configuration.
    #[error("invalid allocation size {size} (valid range {min}..={max})")]
    InvalidSize { size: u32, min: u32, max: u32 },

    /// Class id unknown to this pool.
    #[error("invalid class id {0}")]
    InvalidClassId(ClassId),

    /// Pool id unknown to this allocator.
    #[error("invalid pool id {0}")]
    InvalidPoolId(PoolId),

    /// Pointer is not owned by the expected pool, class, or slab.
    #[error("memory {addr:#x} does not belong here")]
    ForeignMemory { addr: usize },

    /// A precondition on a public entry point failed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A slab drain was cancelled by the abort callback while the
    /// release map was still being built.
    #[error("slab release aborted")]
    SlabReleaseAborted,

    /// The backing region could not be reserved at construction.
    #[error("out of memory reserving {requested} bytes")]
    OutOfMemory { requested: usize },

    /// A runtime invariant does not hold; the affected pool should not
    /// be used further.
    #[error("corrupt allocator state: {0}")]
    Corruption(String),
}

impl MemoryError {
    pub(crate) fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub(crate) fn corruption(msg: impl Into<String>) -> Self {
        Self::Corruption(msg.into())
    }

    /// True if this error indicates state corruption rather than a bad
    /// argument.
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::Corruption(_))
    }
}
