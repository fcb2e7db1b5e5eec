//! Memory pool: routes allocations to classes, tracks slab-level
//! accounting, and orchestrates slab releases.
//!
//! A pool owns one [`AllocationClass`] per configured size, a list of
//! whole free slabs not assigned to any class, and two atomic byte
//! counters: `curr_alloc_size` (handed out to callers) and
//! `curr_slab_alloc_size` (held in slabs by the classes). At any quiet
//! moment `curr_alloc_size <= curr_slab_alloc_size <= max_size`.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::allocation_class::AllocationClass;
use crate::error::{MemoryError, Result};
use crate::release::{SlabIterationStatus, SlabReleaseContext, SlabReleaseMode};
use crate::slab::{AllocInfo, ClassId, PoolId, Slab, INVALID_CLASS_ID};
use crate::slab_allocator::SlabAllocator;
use crate::stats::PoolStats;

/// A fixed-budget pool of slabs split across per-size allocation classes.
pub struct MemoryPool {
    id: PoolId,
    /// Pool budget in bytes; adjustable via [`MemoryPool::resize`].
    max_size: AtomicUsize,
    /// Bytes held in slabs assigned to classes. Excludes `free_slabs`.
    curr_slab_alloc_size: AtomicUsize,
    /// Bytes currently handed out to callers.
    curr_alloc_size: AtomicUsize,
    slab_alloc: Arc<SlabAllocator>,
    /// Whole slabs owned by the pool but not assigned to any class. The
    /// lock also serializes the slab-acquisition slow path.
    free_slabs: Mutex<Vec<Slab>>,
    /// Sorted unique allocation class sizes; `classes[i].alloc_size()
    /// == ac_sizes[i]`. Immutable after construction.
    ac_sizes: Vec<u32>,
    classes: Vec<AllocationClass>,
    n_slab_resize: AtomicU64,
    n_slab_rebalance: AtomicU64,
    n_slab_release_aborted: AtomicU64,
}

impl MemoryPool {
    /// Builds a pool with the given budget and class sizes.
    ///
    /// `alloc_sizes` must be non-empty, strictly ascending, and each
    /// within `[Slab::MIN_ALLOC_SIZE, Slab::SIZE]`. Class ids are the
    /// indices into the sorted sizes.
    pub fn new(
        id: PoolId,
        max_size: usize,
        slab_alloc: Arc<SlabAllocator>,
        alloc_sizes: &[u32],
    ) -> Result<Self> {
        if id < 0 {
            return Err(MemoryError::InvalidPoolId(id));
        }
        if alloc_sizes.is_empty() {
            return Err(MemoryError::invalid_argument(
                "a pool needs at least one allocation class size",
            ));
        }
        if !alloc_sizes.windows(2).all(|w| w[0] < w[1]) {
            return Err(MemoryError::invalid_argument(
                "allocation class sizes must be strictly ascending",
            ));
        }

        let classes = alloc_sizes
            .iter()
            .enumerate()
            .map(|(idx, &size)| {
                AllocationClass::new(idx as ClassId, id, size, slab_alloc.clone())
            })
            .collect::<Result<Vec<_>>>()?;

        info!(
            pool = id,
            max_size,
            classes = classes.len(),
            "memory pool created"
        );
        Ok(Self {
            id,
            max_size: AtomicUsize::new(max_size),
            curr_slab_alloc_size: AtomicUsize::new(0),
            curr_alloc_size: AtomicUsize::new(0),
            slab_alloc,
            free_slabs: Mutex::new(Vec::new()),
            ac_sizes: alloc_sizes.to_vec(),
            classes,
            n_slab_resize: AtomicU64::new(0),
            n_slab_rebalance: AtomicU64::new(0),
            n_slab_release_aborted: AtomicU64::new(0),
        })
    }

    pub fn id(&self) -> PoolId {
        self.id
    }

    /// Configured pool budget.
    pub fn max_size(&self) -> usize {
        self.max_size.load(Ordering::Relaxed)
    }

    /// Adjusts the budget. Shrinking does not release slabs; drive
    /// [`MemoryPool::start_slab_release`] to give memory back.
    pub fn resize(&self, new_max: usize) {
        self.max_size.store(new_max, Ordering::Relaxed);
    }

    /// Bytes currently handed out to callers.
    pub fn get_current_alloc_size(&self) -> usize {
        self.curr_alloc_size.load(Ordering::Relaxed)
    }

    /// Bytes held by the pool: class-assigned slabs plus the pool free
    /// list.
    pub fn get_current_used_size(&self) -> usize {
        let free_slabs = self.free_slabs.lock();
        self.curr_slab_alloc_size.load(Ordering::Acquire) + free_slabs.len() * Slab::SIZE
    }

    /// Whether the pool holds more than its (possibly shrunk) budget.
    pub fn over_limit(&self) -> bool {
        self.get_current_used_size() > self.max_size()
    }

    /// Budget headroom not yet backed by class-assigned slabs.
    pub fn get_unallocated_slab_memory(&self) -> usize {
        self.max_size()
            .saturating_sub(self.curr_slab_alloc_size.load(Ordering::Acquire))
    }

    /// Whether there is no budget room for one more slab.
    pub fn all_slabs_allocated(&self) -> bool {
        self.curr_slab_alloc_size.load(Ordering::Acquire) + Slab::SIZE > self.max_size()
    }

    /// The configured class sizes, ascending.
    pub fn get_alloc_sizes(&self) -> &[u32] {
        &self.ac_sizes
    }

    /// Number of allocation classes; valid class ids are
    /// `0..num_class_ids()`.
    pub fn num_class_ids(&self) -> usize {
        self.classes.len()
    }

    /// The class serving `size`: the smallest class whose chunk size is
    /// at least `size`.
    pub fn class_id_for_size(&self, size: u32) -> Result<ClassId> {
        let max = self.ac_sizes[self.ac_sizes.len() - 1];
        if size == 0 || size > max {
            return Err(MemoryError::InvalidSize {
                size,
                min: 1,
                max,
            });
        }
        let idx = self.ac_sizes.partition_point(|&s| s < size);
        Ok(idx as ClassId)
    }

    /// The class owning `memory`, resolved through the slab header.
    pub fn class_id_for_memory(&self, memory: *const u8) -> Result<ClassId> {
        let header = self
            .slab_alloc
            .get_slab_header(memory)
            .ok_or(MemoryError::ForeignMemory {
                addr: memory as usize,
            })?;
        if header.pool_id() != self.id {
            return Err(MemoryError::ForeignMemory {
                addr: memory as usize,
            });
        }
        let cid = header.class_id();
        if cid == INVALID_CLASS_ID {
            return Err(MemoryError::invalid_argument(
                "memory does not belong to any allocation class",
            ));
        }
        if cid < 0 || cid as usize >= self.classes.len() {
            // The header names a class this pool never had: corruption,
            // and nothing the caller can repair.
            return Err(MemoryError::corruption(format!(
                "slab header names bogus class {cid}"
            )));
        }
        Ok(cid)
    }

    /// The allocation class for `cid`, for inspection and iteration.
    pub fn get_allocation_class(&self, cid: ClassId) -> Result<&AllocationClass> {
        if cid < 0 || cid as usize >= self.classes.len() {
            return Err(MemoryError::InvalidClassId(cid));
        }
        Ok(&self.classes[cid as usize])
    }

    /// Allocates at least `size` bytes, or `Ok(None)` when the pool is
    /// out of memory.
    pub fn allocate(&self, size: u32) -> Result<Option<NonNull<u8>>> {
        let cid = self.class_id_for_size(size)?;
        let ac = &self.classes[cid as usize];
        let alloc_size = ac.alloc_size() as usize;

        if let Some(chunk) = ac.allocate() {
            self.curr_alloc_size.fetch_add(alloc_size, Ordering::Relaxed);
            return Ok(Some(chunk));
        }

        // Cheap pre-check before taking the pool lock. Releases bump the
        // counter down only after the slab is actually reachable again,
        // so a stale read here is safe.
        if self.all_slabs_allocated() {
            return Ok(None);
        }

        let mut free_slabs = self.free_slabs.lock();
        // Another thread may have installed a slab while we waited.
        if let Some(chunk) = ac.allocate() {
            self.curr_alloc_size.fetch_add(alloc_size, Ordering::Relaxed);
            return Ok(Some(chunk));
        }

        let slab = match self.get_slab_locked(&mut free_slabs) {
            Some(slab) => slab,
            None => return Ok(None),
        };
        self.stamp_header(slab, cid, ac.alloc_size());
        let chunk = ac.add_slab_and_allocate(slab);
        self.curr_alloc_size.fetch_add(alloc_size, Ordering::Relaxed);
        Ok(Some(chunk))
    }

    /// Grabs a slab for a class: pool free list first, then the slab
    /// arena. The capacity counter is reserved optimistically and rolled
    /// back on failure.
    fn get_slab_locked(&self, free_slabs: &mut Vec<Slab>) -> Option<Slab> {
        if self.all_slabs_allocated() {
            return None;
        }
        self.curr_slab_alloc_size
            .fetch_add(Slab::SIZE, Ordering::AcqRel);
        if let Some(slab) = free_slabs.pop() {
            return Some(slab);
        }
        match self.slab_alloc.make_new_slab(self.id) {
            Some(slab) => Some(slab),
            None => {
                self.curr_slab_alloc_size
                    .fetch_sub(Slab::SIZE, Ordering::AcqRel);
                None
            }
        }
    }

    fn stamp_header(&self, slab: Slab, cid: ClassId, alloc_size: u32) {
        let header = self.slab_alloc.header_for_slab(slab);
        header.set_pool_id(self.id);
        header.set_class_id(cid);
        header.set_alloc_size(alloc_size);
    }

    /// Returns `memory` to its class.
    pub fn free(&self, memory: NonNull<u8>) -> Result<()> {
        let cid = self.class_id_for_memory(memory.as_ptr())?;
        let ac = &self.classes[cid as usize];
        if ac.free(memory)? {
            // The class reported the slab fully unused; under the
            // conservative policy this never fires, but the resize path
            // stays wired for an eager-reclamation class.
            let slab = self.slab_alloc.get_slab_for_memory(memory.as_ptr());
            self.release_slab(SlabReleaseMode::Resize, slab, INVALID_CLASS_ID)?;
        }
        self.curr_alloc_size
            .fetch_sub(ac.alloc_size() as usize, Ordering::Relaxed);
        Ok(())
    }

    /// Starts releasing a slab.
    ///
    /// `victim` selects the class to drain; [`INVALID_CLASS_ID`] releases
    /// straight from the pool free slabs (resize mode only). A valid
    /// `receiver` requires rebalance mode. When the returned context has
    /// `is_released() == true` the slab has already been reclaimed and no
    /// completion call is needed.
    pub fn start_slab_release(
        &self,
        victim: ClassId,
        receiver: ClassId,
        mode: SlabReleaseMode,
        hint: Option<NonNull<u8>>,
        abort_fn: impl Fn() -> bool,
    ) -> Result<SlabReleaseContext> {
        if receiver != INVALID_CLASS_ID && mode != SlabReleaseMode::Rebalance {
            return Err(MemoryError::invalid_argument(
                "a receiver class requires rebalance mode",
            ));
        }
        if victim == INVALID_CLASS_ID && mode != SlabReleaseMode::Resize {
            return Err(MemoryError::invalid_argument(
                "releasing from the pool free slabs requires resize mode",
            ));
        }

        let mut context = if victim == INVALID_CLASS_ID {
            self.release_from_free_slabs()?
        } else {
            self.get_allocation_class(victim)?
                .start_slab_release(mode, hint, &abort_fn)?
        };
        context.set_receiver(receiver);

        if context.is_released() {
            debug_assert!(context.active_allocations().is_empty());
            self.release_slab(context.mode(), context.slab(), receiver)?;
        }
        Ok(context)
    }

    fn release_from_free_slabs(&self) -> Result<SlabReleaseContext> {
        let mut free_slabs = self.free_slabs.lock();
        let slab = free_slabs.pop().ok_or_else(|| {
            MemoryError::invalid_argument(
                "pool has no free slabs outside of any allocation class",
            )
        })?;
        Ok(SlabReleaseContext::released(
            slab,
            self.id,
            INVALID_CLASS_ID,
            SlabReleaseMode::Resize,
        ))
    }

    /// Finishes a drain: blocks until the context's slab is fully freed,
    /// then reclaims it according to the context's mode.
    pub fn complete_slab_release(&self, context: &SlabReleaseContext) -> Result<()> {
        if context.is_released() {
            return Ok(());
        }
        if context.receiver_class_id() != INVALID_CLASS_ID
            && context.mode() != SlabReleaseMode::Rebalance
        {
            return Err(MemoryError::invalid_argument(
                "a receiver class requires rebalance mode",
            ));
        }
        let ac = self.get_allocation_class(context.class_id())?;
        if ac.complete_slab_release(context)? {
            self.release_slab(context.mode(), context.slab(), context.receiver_class_id())?;
        }
        Ok(())
    }

    /// Abandons a drain with live chunks; see
    /// [`AllocationClass::abort_slab_release`] for the state left behind.
    pub fn abort_slab_release(&self, context: &SlabReleaseContext) -> Result<()> {
        let ac = self.get_allocation_class(context.class_id())?;
        ac.abort_slab_release(context)?;
        self.n_slab_release_aborted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Moves a detached slab to its next home.
    ///
    /// Resize returns the slab to the arena; rebalance hands it to the
    /// receiver class or parks it on the pool free list. In both
    /// counter-decrementing branches the slab is made reachable *before*
    /// the decrement, so any thread acting on the smaller size finds it.
    fn release_slab(&self, mode: SlabReleaseMode, slab: Slab, receiver: ClassId) -> Result<()> {
        match mode {
            SlabReleaseMode::Resize => {
                self.slab_alloc.free_slab(slab);
                self.curr_slab_alloc_size
                    .fetch_sub(Slab::SIZE, Ordering::AcqRel);
                self.n_slab_resize.fetch_add(1, Ordering::Relaxed);
                debug!(pool = self.id, slab = ?slab, "slab released for resize");
            }
            SlabReleaseMode::Rebalance => {
                if receiver != INVALID_CLASS_ID {
                    // The slab changes class but the pool size does not.
                    let ac = self.get_allocation_class(receiver)?;
                    self.stamp_header(slab, receiver, ac.alloc_size());
                    ac.add_slab(slab);
                    debug!(
                        pool = self.id,
                        slab = ?slab,
                        receiver,
                        "slab rebalanced to class"
                    );
                } else {
                    {
                        let mut free_slabs = self.free_slabs.lock();
                        free_slabs.push(slab);
                    }
                    self.curr_slab_alloc_size
                        .fetch_sub(Slab::SIZE, Ordering::AcqRel);
                    debug!(pool = self.id, slab = ?slab, "slab parked on pool free list");
                }
                self.n_slab_rebalance.fetch_add(1, Ordering::Relaxed);
            }
        }
        Ok(())
    }

    /// Delegates a slab-wide walk to the class identified by `cid`.
    pub fn for_each_allocation<F>(
        &self,
        cid: ClassId,
        slab: Slab,
        callback: F,
    ) -> Result<SlabIterationStatus>
    where
        F: FnMut(NonNull<u8>, &AllocInfo) -> bool,
    {
        Ok(self.get_allocation_class(cid)?.for_each_allocation(slab, callback))
    }

    /// The slab containing `memory`.
    pub fn get_slab_for_memory(&self, memory: *const u8) -> Slab {
        self.slab_alloc.get_slab_for_memory(memory)
    }

    pub fn n_slab_resize(&self) -> u64 {
        self.n_slab_resize.load(Ordering::Relaxed)
    }

    pub fn n_slab_rebalance(&self) -> u64 {
        self.n_slab_rebalance.load(Ordering::Relaxed)
    }

    pub fn n_slab_release_aborted(&self) -> u64 {
        self.n_slab_release_aborted.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> PoolStats {
        let free_slab_count = self.free_slabs.lock().len();
        PoolStats {
            pool_id: self.id,
            max_size: self.max_size(),
            curr_alloc_size: self.get_current_alloc_size(),
            curr_slab_alloc_size: self.curr_slab_alloc_size.load(Ordering::Acquire),
            free_slab_count,
            n_slab_resize: self.n_slab_resize(),
            n_slab_rebalance: self.n_slab_rebalance(),
            n_slab_release_aborted: self.n_slab_release_aborted(),
            class_stats: self.classes.iter().map(|ac| ac.stats()).collect(),
        }
    }
}
