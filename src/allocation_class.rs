//! Per-size allocation class: chunk freelist, linear slab carving, and
//! the slab-release (drain) state machine.
//!
//! An `AllocationClass` hands out fixed-size chunks from slabs owned by
//! its pool. The hot allocate/free paths run under one short-lived mutex;
//! draining a slab is a separate, serialized protocol:
//!
//! 1. `start_slab_release` marks the victim slab, builds a release map of
//!    its still-live chunks, and prunes the class freelist in bounded
//!    batches so allocators are never starved.
//! 2. Callers free every chunk listed in the returned context; a `free`
//!    of a chunk in a marked slab flips its release-map entry instead of
//!    touching the freelist.
//! 3. `complete_slab_release` blocks on the drain's condition variable
//!    until every entry reads freed, then detaches the slab.
//!
//! `abort_slab_release` cancels a drain with live chunks; chunks already
//! freed into the release map are not restored to the freelist.

use std::collections::HashMap;
use std::mem;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, trace};

use crate::error::{MemoryError, Result};
use crate::release::{SlabIterationStatus, SlabReleaseContext, SlabReleaseMode};
use crate::slab::{AllocInfo, ClassId, PoolId, Slab, INVALID_CLASS_ID};
use crate::slab_allocator::SlabAllocator;
use crate::stats::ClassStats;
use crate::utils::prefetch_read;

/// Node of the intrusive chunk freelist. A freed chunk's first bytes
/// store the link; `Slab::MIN_ALLOC_SIZE` guarantees the room.
#[repr(C)]
struct FreeChunk {
    next: *mut FreeChunk,
}

/// Intrusive LIFO of freed chunks. Only touched under the class lock, so
/// plain pointers suffice.
struct FreeList {
    head: *mut FreeChunk,
    len: usize,
}

// SAFETY: the list links through chunk memory owned by this class; the
// class lock serializes all access.
unsafe impl Send for FreeList {}

impl FreeList {
    const fn new() -> Self {
        Self {
            head: ptr::null_mut(),
            len: 0,
        }
    }

    fn push(&mut self, chunk: NonNull<u8>) {
        let node = chunk.as_ptr().cast::<FreeChunk>();
        // SAFETY: chunk is a freed allocation of at least
        // Slab::MIN_ALLOC_SIZE bytes owned by this class.
        unsafe { (*node).next = self.head };
        self.head = node;
        self.len += 1;
    }

    fn pop(&mut self) -> Option<NonNull<u8>> {
        let node = NonNull::new(self.head)?;
        // SAFETY: head was pushed by `push` and its link is intact.
        self.head = unsafe { (*node.as_ptr()).next };
        self.len -= 1;
        Some(node.cast())
    }

    fn take_all(&mut self) -> FreeList {
        mem::replace(self, FreeList::new())
    }

    fn append(&mut self, mut other: FreeList) {
        while let Some(chunk) = other.pop() {
            self.push(chunk);
        }
    }

    fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    fn len(&self) -> usize {
        self.len
    }
}

/// Drain bookkeeping for one slab, created by `start_slab_release` and
/// destroyed on completion or abort.
struct ReleaseState {
    /// Indexed by chunk-index-in-slab; `true` means still live.
    chunks: Vec<bool>,
    /// Number of live entries; 0 means drained.
    live: usize,
    /// Chunks ever carved out of the slab when the drain started. The
    /// tail beyond this was never handed out and is born-freed.
    carved: usize,
    /// Signalled when `live` reaches 0.
    cond: Arc<Condvar>,
}

/// Mutable class state, guarded by the class lock.
struct Inner {
    curr_slab: Option<Slab>,
    curr_offset: usize,
    /// Slabs fully installed in the class (the exhausted and the
    /// draining ones). The current slab is tracked separately.
    allocated_slabs: Vec<Slab>,
    /// Class-reserved slabs not yet carved.
    free_slabs: Vec<Slab>,
    freed_allocs: FreeList,
    /// In-progress drains, keyed by slab address.
    releases: HashMap<usize, ReleaseState>,
}

/// Fixed-size chunk allocator over whole slabs.
pub struct AllocationClass {
    class_id: ClassId,
    pool_id: PoolId,
    alloc_size: u32,
    slab_alloc: Arc<SlabAllocator>,
    state: Mutex<Inner>,
    /// Serializes drain starts; `for_each_allocation` try-locks it to
    /// back off from a concurrent drain start.
    start_release_lock: Mutex<()>,
    /// False once linear carving and the freelist are both exhausted.
    /// A hint: reading it outside the lock is racy.
    can_allocate: AtomicBool,
    active_releases: AtomicU64,
}

impl AllocationClass {
    /// Max freelist nodes examined per pruning batch before the class
    /// lock is dropped.
    pub const FREE_ALLOCS_PRUNE_LIMIT: usize = 4096;

    /// Sleep between pruning batches, so allocators are not starved.
    pub const FREE_ALLOCS_PRUNE_SLEEP: Duration = Duration::from_micros(1000);

    /// Chunks prefetched ahead while iterating a slab.
    pub const PREFETCH_OFFSET: usize = 16;

    pub(crate) fn new(
        class_id: ClassId,
        pool_id: PoolId,
        alloc_size: u32,
        slab_alloc: Arc<SlabAllocator>,
    ) -> Result<Self> {
        if class_id < 0 {
            return Err(MemoryError::InvalidClassId(class_id));
        }
        if pool_id < 0 {
            return Err(MemoryError::InvalidPoolId(pool_id));
        }
        if alloc_size < Slab::MIN_ALLOC_SIZE || alloc_size as usize > Slab::SIZE {
            return Err(MemoryError::InvalidSize {
                size: alloc_size,
                min: Slab::MIN_ALLOC_SIZE,
                max: Slab::SIZE as u32,
            });
        }
        Ok(Self {
            class_id,
            pool_id,
            alloc_size,
            slab_alloc,
            state: Mutex::new(Inner {
                curr_slab: None,
                curr_offset: 0,
                allocated_slabs: Vec::new(),
                free_slabs: Vec::new(),
                freed_allocs: FreeList::new(),
                releases: HashMap::new(),
            }),
            start_release_lock: Mutex::new(()),
            can_allocate: AtomicBool::new(true),
            active_releases: AtomicU64::new(0),
        })
    }

    pub fn id(&self) -> ClassId {
        self.class_id
    }

    pub fn pool_id(&self) -> PoolId {
        self.pool_id
    }

    /// Chunk size handed out by this class.
    pub fn alloc_size(&self) -> u32 {
        self.alloc_size
    }

    /// Number of chunks carved out of one slab.
    pub fn allocs_per_slab(&self) -> usize {
        Slab::SIZE / self.alloc_size as usize
    }

    /// Allocation hint: `true` means the last attempt found no memory.
    /// Not a guarantee either way.
    pub fn is_full(&self) -> bool {
        !self.can_allocate.load(Ordering::Relaxed)
    }

    /// Hands out one chunk, or `None` when the class has no memory; the
    /// pool then decides whether to install a fresh slab.
    pub fn allocate(&self) -> Option<NonNull<u8>> {
        let mut state = self.state.lock();
        self.allocate_locked(&mut state)
    }

    fn allocate_locked(&self, state: &mut Inner) -> Option<NonNull<u8>> {
        if let Some(chunk) = state.freed_allocs.pop() {
            return Some(chunk);
        }
        if !self.can_carve_locked(state) {
            let slab = match state.free_slabs.pop() {
                Some(slab) => slab,
                None => {
                    self.can_allocate.store(false, Ordering::Relaxed);
                    return None;
                }
            };
            // The replaced current slab stays owned by the class.
            if let Some(old) = state.curr_slab.replace(slab) {
                state.allocated_slabs.push(old);
            }
            state.curr_offset = 0;
        }
        let slab = state.curr_slab?;
        // SAFETY: can_carve_locked checked curr_offset + alloc_size <=
        // Slab::SIZE, so the chunk is in bounds and non-null.
        let chunk = unsafe { NonNull::new_unchecked(slab.as_ptr().add(state.curr_offset)) };
        state.curr_offset += self.alloc_size as usize;
        Some(chunk)
    }

    /// Whether the current slab can yield another chunk. A slab marked
    /// for release is never carved.
    fn can_carve_locked(&self, state: &Inner) -> bool {
        match state.curr_slab {
            Some(slab) => {
                !self.slab_alloc.header_for_slab(slab).is_marked_for_release()
                    && state.curr_offset + self.alloc_size as usize <= Slab::SIZE
            }
            None => false,
        }
    }

    /// Installs a slab. The header must already carry this pool and
    /// class id (the pool stamps it before handing over).
    pub(crate) fn add_slab(&self, slab: Slab) {
        let mut state = self.state.lock();
        self.add_slab_locked(&mut state, slab);
    }

    fn add_slab_locked(&self, state: &mut Inner, slab: Slab) {
        let header = self.slab_alloc.header_for_slab(slab);
        debug_assert_eq!(header.pool_id(), self.pool_id);
        debug_assert_eq!(header.class_id(), self.class_id);
        debug_assert_eq!(header.alloc_size(), self.alloc_size);

        self.can_allocate.store(true, Ordering::Relaxed);
        if state.curr_slab.is_none() {
            state.curr_slab = Some(slab);
            state.curr_offset = 0;
        } else {
            state.free_slabs.push(slab);
        }
        trace!(class = self.class_id, slab = ?slab, "slab installed");
    }

    /// Installs a slab and returns a chunk from the class right away.
    pub(crate) fn add_slab_and_allocate(&self, slab: Slab) -> NonNull<u8> {
        let mut state = self.state.lock();
        self.add_slab_locked(&mut state, slab);
        match self.allocate_locked(&mut state) {
            Some(chunk) => chunk,
            None => unreachable!("a freshly installed slab always yields a chunk"),
        }
    }

    /// Returns a chunk to the class.
    ///
    /// If the chunk's slab is being drained, the matching release-map
    /// entry flips to freed and any completion waiter is signalled; the
    /// chunk does not rejoin the freelist. Otherwise the chunk is pushed
    /// onto the freelist.
    ///
    /// The returned bool reports whether this free left the slab fully
    /// unused and eligible for eager reclamation; the current policy
    /// never reclaims eagerly, so it is always `false` — slabs leave the
    /// class only through the explicit release protocol.
    pub fn free(&self, memory: NonNull<u8>) -> Result<bool> {
        let mut state = self.state.lock();
        let header = self
            .slab_alloc
            .get_slab_header(memory.as_ptr())
            .ok_or(MemoryError::ForeignMemory {
                addr: memory.as_ptr() as usize,
            })?;
        if header.pool_id() != self.pool_id || header.class_id() != self.class_id {
            return Err(MemoryError::ForeignMemory {
                addr: memory.as_ptr() as usize,
            });
        }
        let slab = self.slab_alloc.get_slab_for_memory(memory.as_ptr());

        if header.is_marked_for_release() {
            let idx = self.chunk_index(slab, memory)?;
            let release = state
                .releases
                .get_mut(&slab.addr())
                .ok_or_else(|| MemoryError::corruption("marked slab has no release map"))?;
            if !release.chunks[idx] {
                return Err(MemoryError::invalid_argument(
                    "chunk already freed during slab release",
                ));
            }
            release.chunks[idx] = false;
            release.live -= 1;
            if release.live == 0 {
                release.cond.notify_all();
            }
            return Ok(false);
        }

        state.freed_allocs.push(memory);
        self.can_allocate.store(true, Ordering::Relaxed);
        Ok(false)
    }

    /// Chunk index of `memory` within `slab`; rejects pointers that do
    /// not sit on a chunk boundary.
    fn chunk_index(&self, slab: Slab, memory: NonNull<u8>) -> Result<usize> {
        let offset = memory.as_ptr() as usize - slab.addr();
        if offset % self.alloc_size as usize != 0 {
            return Err(MemoryError::invalid_argument(
                "pointer is not on a chunk boundary",
            ));
        }
        let idx = offset / self.alloc_size as usize;
        if idx >= self.allocs_per_slab() {
            return Err(MemoryError::invalid_argument(
                "pointer falls in the unusable slab tail",
            ));
        }
        Ok(idx)
    }

    fn chunk_for_index(&self, slab: Slab, idx: usize) -> NonNull<u8> {
        debug_assert!(idx < self.allocs_per_slab());
        // SAFETY: idx * alloc_size + alloc_size <= Slab::SIZE.
        unsafe { NonNull::new_unchecked(slab.as_ptr().add(idx * self.alloc_size as usize)) }
    }

    /// Visits every chunk position in `slab`.
    ///
    /// Backs off with [`SlabIterationStatus::SkippedAndContinue`] when a
    /// drain start holds the start-release lock or the slab header no
    /// longer matches this class (moved, advised, or being drained). The
    /// class lock is only held for the header check, not across callback
    /// invocations; callbacks observe chunk bytes racing with concurrent
    /// allocate/free.
    pub fn for_each_allocation<F>(&self, slab: Slab, mut callback: F) -> SlabIterationStatus
    where
        F: FnMut(NonNull<u8>, &AllocInfo) -> bool,
    {
        let _start_guard = match self.start_release_lock.try_lock() {
            Some(guard) => guard,
            None => return SlabIterationStatus::SkippedAndContinue,
        };

        let alloc_info = {
            let _state = self.state.lock();
            let header = match self.slab_alloc.get_slab_header(slab.as_ptr()) {
                Some(header) => header,
                None => return SlabIterationStatus::SkippedAndContinue,
            };
            if header.class_id() != self.class_id
                || header.pool_id() != self.pool_id
                || header.is_advised()
                || header.is_marked_for_release()
            {
                return SlabIterationStatus::SkippedAndContinue;
            }
            AllocInfo {
                pool_id: header.pool_id(),
                class_id: header.class_id(),
                alloc_size: header.alloc_size(),
            }
        };

        let step = self.alloc_size as usize;
        let base = slab.as_ptr().cast_const();
        for i in 1..=Self::PREFETCH_OFFSET {
            prefetch_read(base.wrapping_add(i * step));
        }
        for i in 0..self.allocs_per_slab() {
            prefetch_read(base.wrapping_add((i + 1 + Self::PREFETCH_OFFSET) * step));
            if !callback(self.chunk_for_index(slab, i), &alloc_info) {
                return SlabIterationStatus::AbortIteration;
            }
        }
        SlabIterationStatus::FinishedAndContinue
    }

    /// Starts releasing one slab of this class.
    ///
    /// With a `hint`, the slab containing it is drained; without one the
    /// victim is picked LIFO from the class free slabs, then the
    /// allocated slabs, then the current slab. A victim with no live
    /// chunks is reclaimed synchronously and the returned context has
    /// `is_released() == true`; otherwise the context lists the live
    /// chunks the caller must free before `complete_slab_release` can
    /// return.
    ///
    /// `abort_fn` is polled between freelist pruning batches; returning
    /// `true` undoes the partial drain and fails with
    /// [`MemoryError::SlabReleaseAborted`].
    pub(crate) fn start_slab_release(
        &self,
        mode: SlabReleaseMode,
        hint: Option<NonNull<u8>>,
        abort_fn: &dyn Fn() -> bool,
    ) -> Result<SlabReleaseContext> {
        let _start_guard = self.start_release_lock.lock();
        let mut state = self.state.lock();

        let slab = self.pick_release_slab_locked(&state, hint)?;

        // Synchronous cases first: a class-reserved free slab or an
        // untouched current slab has no chunks to wait for.
        if let Some(pos) = state.free_slabs.iter().position(|s| *s == slab) {
            state.free_slabs.remove(pos);
            self.retire_header(slab);
            debug!(class = self.class_id, slab = ?slab, "released reserved free slab");
            return Ok(SlabReleaseContext::released(
                slab,
                self.pool_id,
                self.class_id,
                mode,
            ));
        }
        if state.curr_slab == Some(slab) && state.curr_offset == 0 {
            state.curr_slab = None;
            self.retire_header(slab);
            debug!(class = self.class_id, slab = ?slab, "released untouched current slab");
            return Ok(SlabReleaseContext::released(
                slab,
                self.pool_id,
                self.class_id,
                mode,
            ));
        }

        let header = self.slab_alloc.header_for_slab(slab);
        header.set_marked_for_release(true);

        // Build the release map before pruning: a concurrent free during
        // a pruning sleep must find an entry to flip.
        let allocs = self.allocs_per_slab();
        let carved = if state.curr_slab == Some(slab) {
            state.curr_offset / self.alloc_size as usize
        } else {
            allocs
        };
        let mut chunks = vec![true; carved];
        chunks.resize(allocs, false);
        state.releases.insert(
            slab.addr(),
            ReleaseState {
                chunks,
                live: carved,
                carved,
                cond: Arc::new(Condvar::new()),
            },
        );

        let mut state = self.prune_freed_allocs(state, slab, abort_fn)?;

        let active: Vec<NonNull<u8>> = {
            let release = state
                .releases
                .get(&slab.addr())
                .ok_or_else(|| MemoryError::corruption("release map vanished during prune"))?;
            release
                .chunks
                .iter()
                .enumerate()
                .filter(|(_, live)| **live)
                .map(|(idx, _)| self.chunk_for_index(slab, idx))
                .collect()
        };
        if active.is_empty() {
            // Every chunk was already free; reclaim synchronously.
            state.releases.remove(&slab.addr());
            self.detach_slab_locked(&mut state, slab);
            header.set_marked_for_release(false);
            self.retire_header(slab);
            debug!(class = self.class_id, slab = ?slab, "slab drained during start");
            return Ok(SlabReleaseContext::released(
                slab,
                self.pool_id,
                self.class_id,
                mode,
            ));
        }
        self.active_releases.fetch_add(1, Ordering::Relaxed);
        debug!(
            class = self.class_id,
            slab = ?slab,
            live = active.len(),
            "slab drain started"
        );
        Ok(SlabReleaseContext::draining(
            slab,
            self.pool_id,
            self.class_id,
            mode,
            active,
        ))
    }

    fn pick_release_slab_locked(&self, state: &Inner, hint: Option<NonNull<u8>>) -> Result<Slab> {
        if let Some(hint) = hint {
            let header = self
                .slab_alloc
                .get_slab_header(hint.as_ptr())
                .ok_or(MemoryError::ForeignMemory {
                    addr: hint.as_ptr() as usize,
                })?;
            if header.pool_id() != self.pool_id || header.class_id() != self.class_id {
                return Err(MemoryError::ForeignMemory {
                    addr: hint.as_ptr() as usize,
                });
            }
            if header.is_marked_for_release() {
                return Err(MemoryError::invalid_argument(
                    "slab is already being released",
                ));
            }
            return Ok(self.slab_alloc.get_slab_for_memory(hint.as_ptr()));
        }

        if let Some(slab) = state.free_slabs.last() {
            return Ok(*slab);
        }
        if let Some(slab) = state
            .allocated_slabs
            .iter()
            .rev()
            .find(|s| !self.slab_alloc.header_for_slab(**s).is_marked_for_release())
        {
            return Ok(*slab);
        }
        if let Some(slab) = state.curr_slab {
            if !self.slab_alloc.header_for_slab(slab).is_marked_for_release() {
                return Ok(slab);
            }
        }
        Err(MemoryError::invalid_argument(
            "class has no slab available for release",
        ))
    }

    /// Walks the freelist removing chunks of `slab` and marking their
    /// release-map entries freed. Works on a detached copy of the list
    /// in batches of [`Self::FREE_ALLOCS_PRUNE_LIMIT`], dropping the
    /// class lock and sleeping between batches; `abort_fn` is consulted
    /// before each batch.
    fn prune_freed_allocs<'a>(
        &'a self,
        mut state: MutexGuard<'a, Inner>,
        slab: Slab,
        abort_fn: &dyn Fn() -> bool,
    ) -> Result<MutexGuard<'a, Inner>> {
        let mut pending = state.freed_allocs.take_all();
        let mut keep = FreeList::new();

        loop {
            if abort_fn() {
                self.undo_release_start_locked(&mut state, slab, pending, keep);
                return Err(MemoryError::SlabReleaseAborted);
            }
            let mut examined = 0;
            while examined < Self::FREE_ALLOCS_PRUNE_LIMIT {
                let chunk = match pending.pop() {
                    Some(chunk) => chunk,
                    None => break,
                };
                examined += 1;
                if slab.contains(chunk.as_ptr()) {
                    // Freelist entries were boundary-checked when freed.
                    let idx = (chunk.as_ptr() as usize - slab.addr()) / self.alloc_size as usize;
                    if let Some(release) = state.releases.get_mut(&slab.addr()) {
                        if release.chunks[idx] {
                            release.chunks[idx] = false;
                            release.live -= 1;
                        }
                    } else {
                        debug_assert!(false, "release map missing during prune");
                    }
                } else {
                    keep.push(chunk);
                }
            }
            if pending.is_empty() {
                break;
            }
            // Let allocators make progress while the rest of the list
            // waits.
            drop(state);
            std::thread::sleep(Self::FREE_ALLOCS_PRUNE_SLEEP);
            state = self.state.lock();
        }

        state.freed_allocs.append(keep);
        Ok(state)
    }

    /// Reverts a drain cancelled while pruning: unprocessed freelist
    /// chunks go back verbatim, and chunks recorded freed in the map
    /// (pruned, or freed concurrently through the marked path) rejoin
    /// the freelist. The never-carved tail of a current slab stays out.
    fn undo_release_start_locked(
        &self,
        state: &mut Inner,
        slab: Slab,
        pending: FreeList,
        keep: FreeList,
    ) {
        state.freed_allocs.append(keep);
        state.freed_allocs.append(pending);
        if let Some(release) = state.releases.remove(&slab.addr()) {
            for idx in 0..release.carved {
                if !release.chunks[idx] {
                    state.freed_allocs.push(self.chunk_for_index(slab, idx));
                }
            }
        }
        self.slab_alloc
            .header_for_slab(slab)
            .set_marked_for_release(false);
        self.can_allocate.store(true, Ordering::Relaxed);
        debug!(class = self.class_id, slab = ?slab, "slab drain aborted during start");
    }

    /// Blocks until every chunk of the context's slab is freed, then
    /// detaches the slab from the class. Returns `true` when the caller
    /// (the pool) should reclaim the slab; `false` when the context was
    /// already released.
    pub(crate) fn complete_slab_release(&self, ctx: &SlabReleaseContext) -> Result<bool> {
        if ctx.is_released() {
            return Ok(false);
        }
        if ctx.class_id() != self.class_id || ctx.pool_id() != self.pool_id {
            return Err(MemoryError::invalid_argument(
                "release context does not belong to this class",
            ));
        }
        let slab = ctx.slab();
        let mut state = self.state.lock();
        loop {
            let cond = {
                let release = state
                    .releases
                    .get(&slab.addr())
                    .ok_or_else(|| MemoryError::corruption("no release in progress for slab"))?;
                if release.live == 0 {
                    break;
                }
                release.cond.clone()
            };
            cond.wait(&mut state);
        }

        state.releases.remove(&slab.addr());
        self.detach_slab_locked(&mut state, slab);
        let header = self.slab_alloc.header_for_slab(slab);
        header.set_marked_for_release(false);
        self.retire_header(slab);
        self.active_releases.fetch_sub(1, Ordering::Relaxed);
        debug!(class = self.class_id, slab = ?slab, "slab drain complete");
        Ok(true)
    }

    /// Cancels a drain that still has live chunks. Chunks freed while
    /// the drain was active are permanently lost to the freelist; the
    /// slab stays in the class and resumes normal service.
    pub(crate) fn abort_slab_release(&self, ctx: &SlabReleaseContext) -> Result<()> {
        if ctx.is_released() {
            return Err(MemoryError::invalid_argument(
                "cannot abort an already-released slab",
            ));
        }
        if ctx.class_id() != self.class_id || ctx.pool_id() != self.pool_id {
            return Err(MemoryError::invalid_argument(
                "release context does not belong to this class",
            ));
        }
        let slab = ctx.slab();
        let mut state = self.state.lock();
        let release = state
            .releases
            .get(&slab.addr())
            .ok_or_else(|| MemoryError::invalid_argument("no release in progress for slab"))?;
        if release.live == 0 {
            return Err(MemoryError::invalid_argument(
                "all chunks already freed; complete the release instead",
            ));
        }
        state.releases.remove(&slab.addr());
        self.slab_alloc
            .header_for_slab(slab)
            .set_marked_for_release(false);
        self.active_releases.fetch_sub(1, Ordering::Relaxed);
        debug!(class = self.class_id, slab = ?slab, "slab drain aborted");
        Ok(())
    }

    /// Whether the chunk at `memory` has been freed back during the
    /// drain described by `ctx`.
    pub fn is_alloc_freed(&self, ctx: &SlabReleaseContext, memory: NonNull<u8>) -> Result<bool> {
        let state = self.state.lock();
        let (slab, idx) = self.check_slab_in_release_locked(ctx, memory)?;
        let release = state
            .releases
            .get(&slab.addr())
            .ok_or_else(|| MemoryError::corruption("release map missing for slab in release"))?;
        Ok(!release.chunks[idx])
    }

    /// Runs `callback` on `memory` exactly once if the chunk is still
    /// live in the drain described by `ctx`. The check and the callback
    /// run under the class lock.
    pub fn process_alloc_for_release(
        &self,
        ctx: &SlabReleaseContext,
        memory: NonNull<u8>,
        callback: impl FnOnce(NonNull<u8>),
    ) -> Result<()> {
        let state = self.state.lock();
        let (slab, idx) = self.check_slab_in_release_locked(ctx, memory)?;
        let release = state
            .releases
            .get(&slab.addr())
            .ok_or_else(|| MemoryError::corruption("release map missing for slab in release"))?;
        if release.chunks[idx] {
            callback(memory);
        }
        Ok(())
    }

    /// Whether every chunk of `slab` has been freed back. The slab must
    /// have an active release.
    pub fn all_freed(&self, slab: Slab) -> Result<bool> {
        let state = self.state.lock();
        let release = state
            .releases
            .get(&slab.addr())
            .ok_or_else(|| MemoryError::corruption("slab has no active release"))?;
        Ok(release.chunks.iter().all(|live| !live))
    }

    /// Validates that `memory` belongs to this class, its slab is being
    /// drained, and the drain matches `ctx`.
    fn check_slab_in_release_locked(
        &self,
        ctx: &SlabReleaseContext,
        memory: NonNull<u8>,
    ) -> Result<(Slab, usize)> {
        let header = self
            .slab_alloc
            .get_slab_header(memory.as_ptr())
            .ok_or(MemoryError::ForeignMemory {
                addr: memory.as_ptr() as usize,
            })?;
        if header.pool_id() != self.pool_id || header.class_id() != self.class_id {
            return Err(MemoryError::ForeignMemory {
                addr: memory.as_ptr() as usize,
            });
        }
        if !header.is_marked_for_release() {
            return Err(MemoryError::invalid_argument(
                "slab is not actively being released",
            ));
        }
        let slab = self.slab_alloc.get_slab_for_memory(memory.as_ptr());
        if slab != ctx.slab() {
            return Err(MemoryError::invalid_argument(
                "release context belongs to a different slab",
            ));
        }
        let idx = self.chunk_index(slab, memory)?;
        Ok((slab, idx))
    }

    /// Removes `slab` from the class after a completed drain.
    fn detach_slab_locked(&self, state: &mut Inner, slab: Slab) {
        if state.curr_slab == Some(slab) {
            state.curr_slab = None;
            state.curr_offset = 0;
        } else if let Some(pos) = state.allocated_slabs.iter().position(|s| *s == slab) {
            state.allocated_slabs.remove(pos);
        } else {
            debug_assert!(false, "released slab was not attached to the class");
        }
    }

    /// Clears class ownership from the header; the pool id stays.
    fn retire_header(&self, slab: Slab) {
        let header = self.slab_alloc.header_for_slab(slab);
        header.set_class_id(INVALID_CLASS_ID);
        header.set_alloc_size(0);
    }

    pub fn active_releases(&self) -> u64 {
        self.active_releases.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> ClassStats {
        let state = self.state.lock();
        ClassStats {
            class_id: self.class_id,
            alloc_size: self.alloc_size,
            allocs_per_slab: self.allocs_per_slab(),
            allocated_slab_count: state.allocated_slabs.len()
                + usize::from(state.curr_slab.is_some()),
            free_slab_count: state.free_slabs.len(),
            free_alloc_count: state.freed_allocs.len(),
            active_releases: self.active_releases.load(Ordering::Relaxed),
            can_allocate: self.can_allocate.load(Ordering::Relaxed),
        }
    }
}
