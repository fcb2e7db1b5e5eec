//! Integration tests for the slab-release protocol: rebalance, resize,
//! aborts, and races with iteration.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use slabpool::{
    AllocatorConfig, MemoryAllocator, MemoryError, MemoryPool, Slab, SlabAllocator,
    SlabIterationStatus, SlabReleaseMode, INVALID_CLASS_ID,
};

fn make_pool(slab_budget: usize, arena_slabs: usize, sizes: &[u32]) -> Arc<MemoryPool> {
    let slab_alloc = Arc::new(SlabAllocator::new(arena_slabs).unwrap());
    Arc::new(MemoryPool::new(0, slab_budget * Slab::SIZE, slab_alloc, sizes).unwrap())
}

fn alloc(pool: &MemoryPool, size: u32) -> NonNull<u8> {
    pool.allocate(size).unwrap().expect("pool out of memory")
}

#[test]
fn rebalance_moves_a_slab_between_classes() {
    let pool = make_pool(2, 2, &[64, 128]);
    let per_slab_64 = Slab::SIZE / 64;

    // Fill the 64-byte class: exactly one slab.
    let chunks: Vec<NonNull<u8>> = (0..per_slab_64).map(|_| alloc(&pool, 64)).collect();
    let slab_size_before = pool.stats().curr_slab_alloc_size;

    let ctx = pool
        .start_slab_release(
            0,
            1,
            SlabReleaseMode::Rebalance,
            Some(chunks[0]),
            || false,
        )
        .unwrap();
    assert!(!ctx.is_released());
    assert_eq!(ctx.receiver_class_id(), 1);
    assert_eq!(ctx.active_allocations().len(), per_slab_64);

    // Cooperatively drain from another thread while completion blocks.
    let addrs: Vec<usize> = chunks.iter().map(|c| c.as_ptr() as usize).collect();
    let freer = {
        let pool = Arc::clone(&pool);
        thread::spawn(move || {
            for addr in addrs {
                pool.free(NonNull::new(addr as *mut u8).unwrap()).unwrap();
            }
        })
    };
    pool.complete_slab_release(&ctx).unwrap();
    freer.join().unwrap();

    assert_eq!(pool.n_slab_rebalance(), 1);
    assert_eq!(pool.stats().curr_slab_alloc_size, slab_size_before);
    assert_eq!(pool.get_current_alloc_size(), 0);

    // The slab now serves the 128-byte class without new slab traffic.
    let per_slab_128 = Slab::SIZE / 128;
    let moved: Vec<NonNull<u8>> = (0..per_slab_128).map(|_| alloc(&pool, 128)).collect();
    assert_eq!(pool.stats().curr_slab_alloc_size, slab_size_before);
    for chunk in moved {
        pool.free(chunk).unwrap();
    }
}

#[test]
fn rebalance_round_trip_restores_accounting() {
    let pool = make_pool(2, 2, &[256, 512]);
    let chunk = alloc(&pool, 256);
    let used_before = pool.get_current_used_size();

    // A -> B.
    let ctx = pool
        .start_slab_release(0, 1, SlabReleaseMode::Rebalance, Some(chunk), || false)
        .unwrap();
    pool.free(chunk).unwrap();
    pool.complete_slab_release(&ctx).unwrap();
    let slab = ctx.slab();

    let header_class = {
        let probe = alloc(&pool, 512);
        assert!(slab.contains(probe.as_ptr()));
        let cid = pool.class_id_for_memory(probe.as_ptr()).unwrap();
        pool.free(probe).unwrap();
        cid
    };
    assert_eq!(header_class, 1);

    // B -> A.
    let ctx = pool
        .start_slab_release(1, 0, SlabReleaseMode::Rebalance, None, || false)
        .unwrap();
    if !ctx.is_released() {
        pool.complete_slab_release(&ctx).unwrap();
    }
    assert_eq!(pool.get_current_used_size(), used_before);
    assert_eq!(pool.n_slab_rebalance(), 2);

    let probe = alloc(&pool, 256);
    assert_eq!(pool.class_id_for_memory(probe.as_ptr()).unwrap(), 0);
    pool.free(probe).unwrap();
}

#[test]
fn resize_release_from_pool_free_slabs() {
    let pool = make_pool(2, 2, &[256]);
    let per_slab = Slab::SIZE / 256;

    // Two slabs in the class; drain the second to the pool free list.
    let first: Vec<NonNull<u8>> = (0..per_slab).map(|_| alloc(&pool, 256)).collect();
    let extra = alloc(&pool, 256);
    assert_eq!(pool.stats().curr_slab_alloc_size, 2 * Slab::SIZE);

    let ctx = pool
        .start_slab_release(
            0,
            INVALID_CLASS_ID,
            SlabReleaseMode::Rebalance,
            Some(extra),
            || false,
        )
        .unwrap();
    pool.free(extra).unwrap();
    pool.complete_slab_release(&ctx).unwrap();
    assert_eq!(pool.stats().free_slab_count, 1);
    let slab_size_before = pool.stats().curr_slab_alloc_size;

    // Now the release under test: straight from the pool free slabs.
    let ctx = pool
        .start_slab_release(
            INVALID_CLASS_ID,
            INVALID_CLASS_ID,
            SlabReleaseMode::Resize,
            None,
            || false,
        )
        .unwrap();
    assert!(ctx.is_released());
    assert_eq!(ctx.class_id(), INVALID_CLASS_ID);
    assert_eq!(pool.stats().free_slab_count, 0);
    assert_eq!(
        pool.stats().curr_slab_alloc_size,
        slab_size_before - Slab::SIZE
    );
    assert_eq!(pool.n_slab_resize(), 1);

    for chunk in first {
        pool.free(chunk).unwrap();
    }
}

#[test]
fn abort_during_prune_restores_the_freelist() {
    let pool = make_pool(1, 1, &[65536]);
    let per_slab = Slab::SIZE / 65536;

    let chunks: Vec<NonNull<u8>> = (0..per_slab).map(|_| alloc(&pool, 65536)).collect();
    for chunk in &chunks[..per_slab / 2] {
        pool.free(*chunk).unwrap();
    }
    let freelist_before = pool.stats().class_stats[0].free_alloc_count;
    assert_eq!(freelist_before, per_slab / 2);

    let err = pool
        .start_slab_release(
            0,
            INVALID_CLASS_ID,
            SlabReleaseMode::Resize,
            Some(chunks[per_slab - 1]),
            || true,
        )
        .unwrap_err();
    assert!(matches!(err, MemoryError::SlabReleaseAborted));

    // Freed chunks are back on the freelist and the slab serves again.
    assert_eq!(
        pool.stats().class_stats[0].free_alloc_count,
        freelist_before
    );
    let refill = alloc(&pool, 65536);
    pool.free(refill).unwrap();
    for chunk in &chunks[per_slab / 2..] {
        pool.free(*chunk).unwrap();
    }
    assert_eq!(pool.get_current_alloc_size(), 0);
}

#[test]
fn context_abort_counts_and_keeps_the_slab() {
    let pool = make_pool(1, 1, &[65536]);
    let a = alloc(&pool, 65536);
    let b = alloc(&pool, 65536);

    let ctx = pool
        .start_slab_release(0, INVALID_CLASS_ID, SlabReleaseMode::Resize, Some(a), || {
            false
        })
        .unwrap();
    assert_eq!(ctx.active_allocations().len(), 2);

    // One chunk drains, then the release is abandoned.
    pool.free(a).unwrap();
    pool.abort_slab_release(&ctx).unwrap();
    assert_eq!(pool.n_slab_release_aborted(), 1);

    // The drained chunk is lost to the freelist; the still-live one
    // frees normally.
    assert_eq!(pool.stats().class_stats[0].free_alloc_count, 0);
    pool.free(b).unwrap();
    assert_eq!(pool.stats().class_stats[0].free_alloc_count, 1);
}

#[test]
fn iteration_skips_while_a_release_start_is_in_flight() {
    let pool = make_pool(1, 1, &[65536]);
    let chunk = alloc(&pool, 65536);
    let slab = pool.get_slab_for_memory(chunk.as_ptr());

    let entered = Arc::new(AtomicBool::new(false));
    let proceed = Arc::new(AtomicBool::new(false));

    let starter = {
        let pool = Arc::clone(&pool);
        let entered = Arc::clone(&entered);
        let proceed = Arc::clone(&proceed);
        let hint = chunk.as_ptr() as usize;
        thread::spawn(move || {
            // The abort callback parks the drain start while holding the
            // start-release lock.
            let ctx = pool
                .start_slab_release(
                    0,
                    INVALID_CLASS_ID,
                    SlabReleaseMode::Resize,
                    NonNull::new(hint as *mut u8),
                    || {
                        entered.store(true, Ordering::Release);
                        while !proceed.load(Ordering::Acquire) {
                            thread::yield_now();
                        }
                        false
                    },
                )
                .unwrap();
            pool.abort_slab_release(&ctx).unwrap();
        })
    };

    while !entered.load(Ordering::Acquire) {
        thread::yield_now();
    }
    // The drain start is parked inside the class: iteration must back
    // off without running the callback.
    let status = pool
        .for_each_allocation(0, slab, |_, _| panic!("callback must not run"))
        .unwrap();
    assert_eq!(status, SlabIterationStatus::SkippedAndContinue);

    proceed.store(true, Ordering::Release);
    starter.join().unwrap();

    // With the drain gone, iteration visits every chunk position.
    let mut count = 0usize;
    let status = pool
        .for_each_allocation(0, slab, |_, _| {
            count += 1;
            true
        })
        .unwrap();
    assert_eq!(status, SlabIterationStatus::FinishedAndContinue);
    assert_eq!(count, Slab::SIZE / 65536);
    pool.free(chunk).unwrap();
}

#[test]
fn release_accessors_track_the_drain() {
    let pool = make_pool(1, 1, &[65536]);
    let a = alloc(&pool, 65536);
    let b = alloc(&pool, 65536);

    let ctx = pool
        .start_slab_release(0, INVALID_CLASS_ID, SlabReleaseMode::Resize, Some(a), || {
            false
        })
        .unwrap();
    let ac = pool.get_allocation_class(0).unwrap();

    assert!(!ac.is_alloc_freed(&ctx, a).unwrap());
    assert!(!ac.all_freed(ctx.slab()).unwrap());

    let mut processed = Vec::new();
    ac.process_alloc_for_release(&ctx, a, |p| processed.push(p)).unwrap();
    assert_eq!(processed, vec![a]);

    pool.free(a).unwrap();
    assert!(ac.is_alloc_freed(&ctx, a).unwrap());
    // Already freed: the callback must not run again.
    ac.process_alloc_for_release(&ctx, a, |_| panic!("chunk already freed"))
        .unwrap();

    pool.free(b).unwrap();
    assert!(ac.all_freed(ctx.slab()).unwrap());
    pool.complete_slab_release(&ctx).unwrap();

    // The drain is gone; the accessors reject the stale context.
    assert!(ac.is_alloc_freed(&ctx, a).is_err());
}

#[test]
fn completion_blocks_until_the_last_free() {
    let pool = make_pool(1, 1, &[Slab::SIZE as u32]);
    let chunk = alloc(&pool, Slab::SIZE as u32);

    let ctx = pool
        .start_slab_release(
            0,
            INVALID_CLASS_ID,
            SlabReleaseMode::Resize,
            Some(chunk),
            || false,
        )
        .unwrap();
    assert_eq!(ctx.active_allocations().len(), 1);

    let done = Arc::new(AtomicBool::new(false));
    let completer = {
        let pool = Arc::clone(&pool);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            pool.complete_slab_release(&ctx).unwrap();
            done.store(true, Ordering::Release);
        })
    };

    // Completion must not finish while the chunk is live.
    thread::sleep(Duration::from_millis(50));
    assert!(!done.load(Ordering::Acquire));

    pool.free(chunk).unwrap();
    completer.join().unwrap();
    assert!(done.load(Ordering::Acquire));
    assert_eq!(pool.n_slab_resize(), 1);
    assert_eq!(pool.stats().curr_slab_alloc_size, 0);
}

#[test]
fn facade_routes_release_operations_by_context() {
    let config = AllocatorConfig::new(vec![65536]).unwrap();
    let allocator = MemoryAllocator::new(config, 1).unwrap();
    let pool = allocator.add_pool("cache", Slab::SIZE, None, true).unwrap();

    let a = allocator.allocate(pool, 65536).unwrap().unwrap();
    let b = allocator.allocate(pool, 65536).unwrap().unwrap();

    let ctx = allocator
        .start_slab_release(
            pool,
            0,
            INVALID_CLASS_ID,
            SlabReleaseMode::Resize,
            Some(a),
            || false,
        )
        .unwrap();
    assert!(!allocator.all_allocs_freed(&ctx).unwrap());
    assert!(!allocator.is_alloc_freed(&ctx, a).unwrap());

    let mut live = Vec::new();
    allocator
        .process_alloc_for_release(&ctx, b, |p| live.push(p))
        .unwrap();
    assert_eq!(live, vec![b]);

    allocator.free(a).unwrap();
    allocator.free(b).unwrap();
    assert!(allocator.all_allocs_freed(&ctx).unwrap());
    allocator.complete_slab_release(&ctx).unwrap();
    assert_eq!(allocator.get_pool(pool).unwrap().n_slab_resize(), 1);
}

#[test]
fn draining_slab_rejects_new_carving_but_accepts_frees() {
    let pool = make_pool(2, 2, &[Slab::SIZE as u32 / 4]);
    let quarter = Slab::SIZE as u32 / 4;

    // Two chunks carved from the current slab, two positions untouched.
    let a = alloc(&pool, quarter);
    let b = alloc(&pool, quarter);

    let ctx = pool
        .start_slab_release(0, INVALID_CLASS_ID, SlabReleaseMode::Resize, Some(a), || {
            false
        })
        .unwrap();
    // Only the carved chunks count as live.
    assert_eq!(ctx.active_allocations().len(), 2);

    // New allocations come from a fresh slab, not the draining one.
    let c = alloc(&pool, quarter);
    let draining_slab = ctx.slab();
    assert!(!draining_slab.contains(c.as_ptr()));

    pool.free(a).unwrap();
    pool.free(b).unwrap();
    pool.complete_slab_release(&ctx).unwrap();
    assert_eq!(pool.n_slab_resize(), 1);
    pool.free(c).unwrap();
}
