//! Integration tests for the dynamic-block pool: splitting, best-fit
//! recycling and coalescing.

use std::mem;
use std::ptr::NonNull;
use std::slice;

use bufpool::{DynamicPool, Pool, PoolConfig, PoolError};

const OH: usize = DynamicPool::OVERHEAD;
const MIN_PAYLOAD: usize = mem::size_of::<*mut u8>();

/// Pointer-aligned byte view over u64 words.
fn byte_buffer(words: &mut Vec<u64>) -> &mut [u8] {
    // SAFETY: u64 storage is valid for byte-level reuse and at least
    // pointer-aligned.
    unsafe {
        slice::from_raw_parts_mut(
            words.as_mut_ptr().cast::<u8>(),
            words.len() * mem::size_of::<u64>(),
        )
    }
}

#[test]
fn first_allocation_splits_the_main_block() {
    let mut words = vec![0u64; 512 / 8];
    let mut pool = DynamicPool::new(byte_buffer(&mut words), "split").unwrap();
    let base = pool.base_ptr().as_ptr() as usize;

    let ptr = pool.allocate(200).unwrap();
    assert_eq!(ptr.as_ptr() as usize, base + OH, "payload sits right after the first header");
    assert_eq!(pool.block_count(), 2);
    assert_eq!(pool.allocation_count(), 1);
    assert_eq!(pool.total_allocated(), 200);
    assert_eq!(pool.main_block_size(), Some(512 - 2 * OH - 200));

    let blocks = pool.physical_blocks();
    assert_eq!(blocks.len(), 2);
    assert_eq!(blocks[0].offset, 0);
    assert_eq!(blocks[0].alloc_size, 200);
    assert!(blocks[0].is_allocated);
    assert_eq!(blocks[1].offset, OH + 200, "new main block starts right after the payload");
    assert!(!blocks[1].is_allocated);
    pool.assert_invariants();
}

#[test]
fn tight_remainder_consumes_main_whole() {
    let mut words = vec![0u64; 512 / 8];
    let mut pool = DynamicPool::new(byte_buffer(&mut words), "whole").unwrap();

    // The free payload is 512 - OH bytes; ask for enough that the
    // remainder (exactly OH) cannot carry a header plus a minimum
    // payload.
    let free_payload = 512 - OH;
    let request = free_payload - OH;
    let ptr = pool.allocate(request).unwrap();

    assert_eq!(pool.main_block_size(), None);
    assert_eq!(pool.block_count(), 1);
    // The whole tail was handed out; the pool accounts for all of it.
    assert_eq!(pool.total_allocated(), free_payload);
    pool.assert_invariants();

    unsafe { pool.deallocate(ptr).unwrap() };
    assert_eq!(pool.main_block_size(), Some(free_payload));
    assert_eq!(pool.block_count(), 1);
    assert_eq!(pool.total_allocated(), 0);
    pool.assert_invariants();
}

#[test]
fn free_restores_single_block_state() {
    let mut words = vec![0u64; 512 / 8];
    let mut pool = DynamicPool::new(byte_buffer(&mut words), "restore").unwrap();

    let ptr = pool.allocate(200).unwrap();
    assert_eq!(pool.block_count(), 2);

    unsafe { pool.deallocate(ptr).unwrap() };
    assert_eq!(pool.block_count(), 1);
    assert_eq!(pool.allocation_count(), 0);
    assert_eq!(pool.total_allocated(), 0);
    assert_eq!(pool.total_overhead(), OH);
    assert_eq!(pool.main_block_size(), Some(512 - OH));
    pool.assert_invariants();
}

#[test]
fn best_fit_picks_smallest_fitting_block() {
    let mut words = vec![0u64; 1024 / 8];
    let mut pool = DynamicPool::new(byte_buffer(&mut words), "bestfit").unwrap();

    // Guards pin the freed blocks apart so they cannot coalesce.
    let a = pool.allocate(40).unwrap();
    let _g1 = pool.allocate(8).unwrap();
    let b = pool.allocate(96).unwrap();
    let _g2 = pool.allocate(8).unwrap();
    let c = pool.allocate(40).unwrap();
    let _g3 = pool.allocate(8).unwrap();

    unsafe {
        pool.deallocate(a).unwrap();
        pool.deallocate(b).unwrap();
        pool.deallocate(c).unwrap();
    }
    let mut free_sizes = pool.recycled_sizes();
    free_sizes.sort_unstable();
    assert_eq!(free_sizes, vec![40, 40, 96]);

    let before = pool.total_allocated();
    let ptr = pool.allocate(32).unwrap();

    // The 32-byte request recycles one of the 40-byte holes, not the
    // 96-byte one, and the hole is too tight to split.
    assert!(ptr == a || ptr == c, "best fit must choose a 40-byte block");
    assert_eq!(pool.total_allocated(), before + 40);
    let mut free_sizes = pool.recycled_sizes();
    free_sizes.sort_unstable();
    assert_eq!(free_sizes, vec![40, 96]);
    pool.assert_invariants();
}

#[test]
fn exact_fit_is_recycled_at_its_old_address() {
    let mut words = vec![0u64; 1024 / 8];
    let mut pool = DynamicPool::new(byte_buffer(&mut words), "exact").unwrap();

    let a = pool.allocate(40).unwrap();
    let _g1 = pool.allocate(8).unwrap();
    let b = pool.allocate(96).unwrap();
    let _g2 = pool.allocate(8).unwrap();
    let c = pool.allocate(40).unwrap();
    let _g3 = pool.allocate(8).unwrap();

    unsafe {
        pool.deallocate(a).unwrap();
        pool.deallocate(b).unwrap();
        pool.deallocate(c).unwrap();
    }

    let first = pool.allocate(40).unwrap();
    assert!(first == a || first == c);
    let second = pool.allocate(40).unwrap();
    assert!(second == a || second == c);
    assert_ne!(first, second);

    assert_eq!(pool.recycled_sizes(), vec![96]);
    pool.assert_invariants();
}

#[test]
fn free_coalesces_with_predecessor() {
    let mut words = vec![0u64; 1024 / 8];
    let mut pool = DynamicPool::new(byte_buffer(&mut words), "merge-prev").unwrap();

    let a = pool.allocate(64).unwrap();
    let b = pool.allocate(64).unwrap();
    let _c = pool.allocate(64).unwrap();
    assert_eq!(pool.block_count(), 4);

    unsafe { pool.deallocate(a).unwrap() };
    assert_eq!(pool.recycled_sizes(), vec![64]);
    assert_eq!(pool.block_count(), 4);

    unsafe { pool.deallocate(b).unwrap() };
    // The two holes fused: one recycled block spanning both payloads
    // plus the swallowed header.
    assert_eq!(pool.recycled_sizes(), vec![64 + OH + 64]);
    assert_eq!(pool.block_count(), 3);
    assert_eq!(pool.allocation_count(), 1);
    assert_eq!(pool.total_allocated(), 64);
    pool.assert_invariants();
}

#[test]
fn free_coalesces_with_recycled_successor() {
    let mut words = vec![0u64; 1024 / 8];
    let mut pool = DynamicPool::new(byte_buffer(&mut words), "merge-next").unwrap();

    let a = pool.allocate(64).unwrap();
    let b = pool.allocate(64).unwrap();
    let _guard = pool.allocate(8).unwrap();
    assert_eq!(pool.block_count(), 4);

    unsafe { pool.deallocate(b).unwrap() };
    assert_eq!(pool.recycled_sizes(), vec![64]);

    // Freeing a finds its free upper neighbour and absorbs it.
    unsafe { pool.deallocate(a).unwrap() };
    assert_eq!(pool.recycled_sizes(), vec![64 + OH + 64]);
    assert_eq!(pool.block_count(), 3);
    pool.assert_invariants();
}

#[test]
fn no_space_leaves_state_untouched() {
    let mut words = vec![0u64; 1024 / 8];
    let mut pool = DynamicPool::new(byte_buffer(&mut words), "fragmented").unwrap();

    let a = pool.allocate(64).unwrap();
    let _g1 = pool.allocate(8).unwrap();
    let b = pool.allocate(64).unwrap();
    let _g2 = pool.allocate(8).unwrap();

    // Consume the rest of the main block exactly.
    let rest = pool.main_block_size().unwrap();
    let _tail = pool.allocate(rest).unwrap();
    assert_eq!(pool.main_block_size(), None);

    unsafe {
        pool.deallocate(a).unwrap();
        pool.deallocate(b).unwrap();
    }

    // 128 bytes are free in total, but no single hole holds 160.
    let before = pool.stats();
    let err = pool.allocate(160).unwrap_err();
    assert!(err.is_no_space());
    assert_eq!(pool.stats(), before, "a failed allocation must not mutate state");
    pool.assert_invariants();
}

#[test]
fn construction_rejects_bad_buffers() {
    // Too small to hold a header plus a minimum payload.
    let mut words = vec![0u64; (OH + MIN_PAYLOAD) / 8];
    let err = DynamicPool::new(byte_buffer(&mut words), "tiny").unwrap_err();
    assert!(matches!(err, PoolError::BadConfig { .. }));

    // Misaligned base address.
    let mut words = vec![0u64; 512 / 8];
    let buffer = byte_buffer(&mut words);
    let err = DynamicPool::new(&mut buffer[1..], "misaligned").unwrap_err();
    assert!(matches!(err, PoolError::BadConfig { .. }));
}

#[test]
fn foreign_pointer_is_rejected() {
    let mut words = vec![0u64; 512 / 8];
    let mut pool =
        DynamicPool::with_config(byte_buffer(&mut words), "strict", PoolConfig::debug()).unwrap();
    let _live = pool.allocate(64).unwrap();

    let mut outside = 0u8;
    let err = unsafe { pool.deallocate(NonNull::from(&mut outside)).unwrap_err() };
    assert!(err.is_bad_pointer());
    assert_eq!(pool.allocation_count(), 1);
    pool.assert_invariants();
}

#[test]
fn odd_sizes_round_to_pointer_alignment() {
    let mut words = vec![0u64; 1024 / 8];
    let mut pool = DynamicPool::new(byte_buffer(&mut words), "round").unwrap();

    let a = pool.allocate(13).unwrap();
    assert_eq!(a.as_ptr() as usize % mem::align_of::<*mut u8>(), 0);
    assert_eq!(pool.total_allocated(), 16);

    let b = pool.allocate(1).unwrap();
    assert_eq!(b.as_ptr() as usize % mem::align_of::<*mut u8>(), 0);
    assert_eq!(pool.total_allocated(), 24);

    for block in pool.physical_blocks() {
        assert_eq!(block.offset % mem::align_of::<*mut u8>(), 0);
    }
    pool.assert_invariants();
}

#[test]
fn payload_survives_neighbouring_churn() {
    let mut words = vec![0u64; 2048 / 8];
    let mut pool = DynamicPool::new(byte_buffer(&mut words), "integrity").unwrap();

    let keep = pool.allocate(64).unwrap();
    let a = pool.allocate(128).unwrap();
    let b = pool.allocate(32).unwrap();

    unsafe {
        std::ptr::write_bytes(keep.as_ptr(), 0x5A, 64);

        pool.deallocate(a).unwrap();
        let c = pool.allocate(96).unwrap(); // recycles the 128-byte hole
        pool.deallocate(b).unwrap();
        pool.deallocate(c).unwrap();

        for offset in 0..64 {
            assert_eq!(*keep.as_ptr().add(offset), 0x5A, "live payload was clobbered");
        }
        pool.deallocate(keep).unwrap();
    }
    pool.assert_invariants();
}

#[test]
fn getters_and_overhead_accounting() {
    let mut words = vec![0u64; 1024 / 8];
    let mut pool = DynamicPool::new(byte_buffer(&mut words), "meta").unwrap();

    assert_eq!(pool.pool_id(), "meta");
    assert_eq!(pool.pool_type(), "dynamic-block");
    assert_eq!(pool.pool_size(), 1024);
    assert_eq!(pool.total_overhead(), OH);

    let a = pool.allocate(64).unwrap();
    let _b = pool.allocate(64).unwrap();
    assert_eq!(pool.total_overhead(), OH * pool.block_count());
    assert!(pool.is_within_pool(a.as_ptr()));

    let stats = pool.stats();
    assert_eq!(stats.allocation_count, 2);
    assert_eq!(stats.total_allocated, 128);
    assert_eq!(stats.block_count, 3);
}

#[test]
fn interleaved_churn_holds_invariants() {
    let mut words = vec![0u64; 4096 / 8];
    let mut pool =
        DynamicPool::with_config(byte_buffer(&mut words), "churn", PoolConfig::debug()).unwrap();

    let mut live: Vec<NonNull<u8>> = Vec::new();
    let sizes = [24usize, 200, 8, 88, 40, 16, 120, 64, 32, 56];

    for (round, &size) in sizes.iter().cycle().take(60).enumerate() {
        if round % 3 == 2 && !live.is_empty() {
            let victim = live.swap_remove(round % live.len());
            unsafe { pool.deallocate(victim).unwrap() };
        } else {
            match pool.allocate(size) {
                Ok(ptr) => live.push(ptr),
                Err(err) => assert!(err.is_no_space()),
            }
        }
        pool.assert_invariants();
    }

    for ptr in live.drain(..) {
        unsafe { pool.deallocate(ptr).unwrap() };
        pool.assert_invariants();
    }
    assert_eq!(pool.block_count(), 1);
    assert_eq!(pool.main_block_size(), Some(4096 - OH));
}
