//! Slab-release protocol types.
//!
//! Releasing a slab is a two-step handshake: `start_slab_release` marks a
//! victim slab and returns a [`SlabReleaseContext`]; the caller then
//! frees every outstanding chunk listed in the context and calls
//! `complete_slab_release`, which blocks until the drain finishes. A
//! context with `is_released() == true` needs no completion — the slab
//! had no live chunks and was reclaimed synchronously.

use std::ptr::NonNull;

use crate::slab::{ClassId, PoolId, Slab, INVALID_CLASS_ID};

/// Why a slab is being released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlabReleaseMode {
    /// The slab leaves the pool (back to the slab arena or the pool free
    /// list) because the pool is shrinking.
    Resize,
    /// The slab stays in the pool but moves to another allocation class.
    Rebalance,
}

/// Outcome of a slab-wide iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlabIterationStatus {
    /// Every chunk was visited.
    FinishedAndContinue,
    /// The slab was not in an iterable state (header mismatch, drain in
    /// progress, or a drain start holding the lock); nothing was visited.
    SkippedAndContinue,
    /// The callback asked to stop.
    AbortIteration,
}

/// Handle for an in-progress (or synchronously finished) slab release.
#[derive(Debug)]
pub struct SlabReleaseContext {
    slab: Slab,
    pool_id: PoolId,
    class_id: ClassId,
    receiver_class_id: ClassId,
    mode: SlabReleaseMode,
    is_released: bool,
    active_allocations: Vec<NonNull<u8>>,
}

// SAFETY: the chunk pointers in the context are owned by the releasing
// caller until it frees them; the context itself carries no aliasing
// state.
unsafe impl Send for SlabReleaseContext {}
unsafe impl Sync for SlabReleaseContext {}

impl SlabReleaseContext {
    /// Context for a slab that was reclaimed synchronously.
    pub(crate) fn released(
        slab: Slab,
        pool_id: PoolId,
        class_id: ClassId,
        mode: SlabReleaseMode,
    ) -> Self {
        Self {
            slab,
            pool_id,
            class_id,
            receiver_class_id: INVALID_CLASS_ID,
            mode,
            is_released: true,
            active_allocations: Vec::new(),
        }
    }

    /// Context for a drain with outstanding chunks.
    pub(crate) fn draining(
        slab: Slab,
        pool_id: PoolId,
        class_id: ClassId,
        mode: SlabReleaseMode,
        active_allocations: Vec<NonNull<u8>>,
    ) -> Self {
        Self {
            slab,
            pool_id,
            class_id,
            receiver_class_id: INVALID_CLASS_ID,
            mode,
            is_released: false,
            active_allocations,
        }
    }

    /// The slab being released.
    pub fn slab(&self) -> Slab {
        self.slab
    }

    pub fn pool_id(&self) -> PoolId {
        self.pool_id
    }

    /// The victim class, or [`INVALID_CLASS_ID`] for a release from the
    /// pool free slabs.
    pub fn class_id(&self) -> ClassId {
        self.class_id
    }

    /// The class receiving the slab on a rebalance, or
    /// [`INVALID_CLASS_ID`].
    pub fn receiver_class_id(&self) -> ClassId {
        self.receiver_class_id
    }

    pub(crate) fn set_receiver(&mut self, receiver: ClassId) {
        self.receiver_class_id = receiver;
    }

    pub fn mode(&self) -> SlabReleaseMode {
        self.mode
    }

    /// True when the slab was already reclaimed and no completion call is
    /// needed.
    pub fn is_released(&self) -> bool {
        self.is_released
    }

    /// Chunks that were live when the drain started. The caller must
    /// free every one of them for `complete_slab_release` to return.
    pub fn active_allocations(&self) -> &[NonNull<u8>] {
        &self.active_allocations
    }
}
