//! The dynamic pool: variable-sized allocation with splitting, best-fit
//! recycling and dual-sided coalescing.
//!
//! # Memory layout
//!
//! ```text
//! [hdr|payload][hdr|payload][hdr|payload][hdr|   free tail   ]
//!      used         free         used          main block
//!                     │
//!              recycled list
//! ```
//!
//! The buffer starts as one free block, the *main block*, covering
//! everything. Allocations carve its front off; freed blocks go onto the
//! *recycled list* and are preferred for reuse, best fit first. Freeing
//! merges a block with any free physical neighbour, so two adjacent free
//! blocks never exist, and a free that reaches the buffer tail turns
//! back into (or merges with) the main block.
//!
//! ## Invariants
//!
//! - The physical chain from the buffer base covers the whole buffer:
//!   the `OVERHEAD + alloc_size` spans sum to `pool_size`.
//! - Every block on the recycled list is free and reachable through the
//!   physical chain; the main block is never on the list.
//! - The main block, when present, is the unique last-by-address block.
//! - `total_overhead == OVERHEAD * num_blocks`.

use core::marker::PhantomData;
use core::mem;
use core::ptr::{self, NonNull};

use crate::config::PoolConfig;
use crate::error::{PoolError, PoolResult};
use crate::pool::Pool;
use crate::utils::{align_up, is_aligned_ptr};

use super::block::{BlockHeader, OVERHEAD};
use super::free_list::RecycledList;

/// Smallest payload a split may leave behind. A free block must be able
/// to hold pointer-sized link fields once its payload is reused for
/// bookkeeping.
const MIN_PAYLOAD: usize = mem::size_of::<*mut u8>();

/// Pool serving variable-sized allocations out of a caller-owned buffer.
///
/// All metadata lives inside the buffer as in-band [`BlockHeader`]s; the
/// pool value holds only root pointers and counters. Allocation is
/// O(k) in the recycled-list length (best-fit sweep), deallocation is
/// O(1).
#[derive(Debug)]
pub struct DynamicPool<'buf> {
    base: NonNull<u8>,
    pool_size: usize,
    /// The single free block at the high-address end, or null once an
    /// allocation has consumed it whole.
    main_block: *mut BlockHeader,
    recycled: RecycledList,
    num_allocations: usize,
    num_blocks: usize,
    total_allocated: usize,
    total_overhead: usize,
    pool_id: String,
    config: PoolConfig,
    _buffer: PhantomData<&'buf mut [u8]>,
}

impl<'buf> DynamicPool<'buf> {
    /// Bytes of in-band overhead paid per block.
    pub const OVERHEAD: usize = super::block::OVERHEAD;

    /// Creates a pool over `buffer` with the default configuration. The
    /// whole slice becomes the pool.
    ///
    /// # Errors
    /// [`BadConfig`](PoolError::BadConfig) when the buffer cannot hold a
    /// header plus a minimum payload, or its base is not
    /// pointer-aligned.
    pub fn new(buffer: &'buf mut [u8], pool_id: impl Into<String>) -> PoolResult<Self> {
        Self::with_config(buffer, pool_id, PoolConfig::default())
    }

    /// Creates a pool with an explicit configuration.
    ///
    /// # Errors
    /// Same as [`new`](Self::new).
    pub fn with_config(
        buffer: &'buf mut [u8],
        pool_id: impl Into<String>,
        config: PoolConfig,
    ) -> PoolResult<Self> {
        let pool_size = buffer.len();
        if pool_size <= OVERHEAD + MIN_PAYLOAD {
            return Err(PoolError::bad_config(
                "buffer cannot hold a block header and a minimum payload",
            ));
        }
        if !is_aligned_ptr(buffer.as_ptr(), mem::align_of::<BlockHeader>()) {
            return Err(PoolError::bad_config("buffer base must be pointer-aligned"));
        }
        let base = NonNull::new(buffer.as_mut_ptr())
            .ok_or_else(|| PoolError::bad_config("null buffer"))?;
        let pool_id = pool_id.into();

        // SAFETY: the buffer spans pool_size > OVERHEAD bytes, its base
        // is aligned (both checked above), and it is exclusively
        // borrowed for 'buf.
        let main = unsafe { BlockHeader::init_at(base.as_ptr(), pool_size - OVERHEAD) };

        #[cfg(feature = "logging")]
        tracing::debug!(pool_id = %pool_id, pool_size, "dynamic pool initialised");

        Ok(Self {
            base,
            pool_size,
            main_block: main,
            recycled: RecycledList::new(),
            num_allocations: 0,
            num_blocks: 1,
            total_allocated: 0,
            total_overhead: OVERHEAD,
            pool_id,
            config,
            _buffer: PhantomData,
        })
    }

    /// Total in-band overhead currently paid, one header per block.
    pub fn total_overhead(&self) -> usize {
        self.total_overhead
    }

    /// Payload bytes of the trailing free region, when one exists.
    pub fn main_block_size(&self) -> Option<usize> {
        if self.main_block.is_null() {
            None
        } else {
            // SAFETY: main_block is a live header of this pool.
            Some(unsafe { (*self.main_block).alloc_size })
        }
    }

    /// Bidirectional best-fit sweep over the recycled list.
    ///
    /// Walks from both ends toward the middle, returning immediately on
    /// an exact size match and otherwise tracking the smallest block
    /// that fits. The sweep stops once the walkers meet (the meeting
    /// node is considered once) or become adjacent, at which point every
    /// node has been examined. Returns null when nothing fits.
    fn find_best_fit(&self, requested: usize) -> *mut BlockHeader {
        // Picks `candidate` over the best so far when it fits tighter.
        // SAFETY inside: both arguments are live headers on the list or
        // null.
        let better = |best: *mut BlockHeader, candidate: *mut BlockHeader| unsafe {
            if best.is_null() || (*best).alloc_size > (*candidate).alloc_size {
                candidate
            } else {
                best
            }
        };

        let mut front = self.recycled.first();
        let mut back = self.recycled.last();
        let mut best: *mut BlockHeader = ptr::null_mut();

        while !front.is_null() {
            // SAFETY: front and back are live headers; while the list is
            // non-empty neither end pointer is null, and the walkers stay
            // on the list.
            unsafe {
                if (*front).alloc_size == requested {
                    return front;
                }
                if (*back).alloc_size == requested {
                    return back;
                }

                // The walkers met: consider the meeting node once, done.
                if front == back {
                    if (*front).alloc_size >= requested {
                        best = better(best, front);
                    }
                    return best;
                }

                let front_fits = (*front).alloc_size >= requested;
                let back_fits = (*back).alloc_size >= requested;
                if front_fits && back_fits {
                    // Both fit: keep the tighter of the pair.
                    if (*front).alloc_size > (*back).alloc_size {
                        best = better(best, back);
                    } else {
                        best = better(best, front);
                    }
                } else if front_fits {
                    best = better(best, front);
                } else if back_fits {
                    best = better(best, back);
                }

                // Adjacent walkers have now covered every node.
                if (*front).logical_next == back {
                    return best;
                }

                front = (*front).logical_next;
                back = (*back).logical_prev;
            }
        }

        best
    }

    /// Reuses `block` from the recycled list for a `size`-byte
    /// allocation, splitting off the tail when the remainder can carry
    /// its own header plus a minimum payload. A remainder too small to
    /// split is handed out whole; the pool accounts for the full block.
    ///
    /// # Safety
    /// `block` must be on the recycled list with `alloc_size >= size`.
    unsafe fn recycle_block(&mut self, block: *mut BlockHeader, size: usize) -> NonNull<u8> {
        // SAFETY: block is on the list per the contract; afterwards it
        // is a live header this pool exclusively manages.
        unsafe {
            self.recycled.remove(block);

            if (*block).alloc_size >= size + OVERHEAD + MIN_PAYLOAD {
                let remainder = (*block).alloc_size - size - OVERHEAD;
                let split_addr = block.cast::<u8>().add(OVERHEAD + size);
                let split = BlockHeader::init_at(split_addr, remainder);

                (*split).physical_prev = block;
                (*split).physical_next = (*block).physical_next;
                if !(*split).physical_next.is_null() {
                    (*(*split).physical_next).physical_prev = split;
                }
                self.recycled.insert(split);

                (*block).physical_next = split;
                (*block).alloc_size = size;

                self.num_blocks += 1;
                self.total_overhead += OVERHEAD;
            }

            (*block).is_allocated = true;
            self.num_allocations += 1;
            self.total_allocated += (*block).alloc_size;

            let payload = BlockHeader::payload(block);
            if let Some(pattern) = self.config.alloc_pattern {
                ptr::write_bytes(payload, pattern, (*block).alloc_size);
            }
            NonNull::new_unchecked(payload)
        }
    }

    /// Carves a `size`-byte allocation out of the trailing main block.
    /// When the remainder cannot carry a header plus a minimum payload,
    /// the whole tail is consumed and the pool runs on recycled blocks
    /// alone until a free reaches the tail again.
    ///
    /// # Safety
    /// `main_block` must be non-null.
    unsafe fn carve_from_main(&mut self, size: usize) -> PoolResult<NonNull<u8>> {
        let main = self.main_block;
        // SAFETY: main is the live tail header per the contract; the new
        // block carved behind it stays inside the buffer because the
        // split condition reserves room for it.
        unsafe {
            debug_assert!(
                (*main).physical_next.is_null(),
                "main block must be the buffer tail"
            );

            if (*main).alloc_size >= size + OVERHEAD + MIN_PAYLOAD {
                // The current main block becomes the allocation; a fresh
                // main block takes over the remaining tail.
                let tail_size = (*main).alloc_size - OVERHEAD - size;
                let tail_addr = main.cast::<u8>().add(OVERHEAD + size);

                (*main).alloc_size = size;

                let new_main = BlockHeader::init_at(tail_addr, tail_size);
                (*new_main).physical_prev = main;
                (*main).physical_next = new_main;
                self.main_block = new_main;

                self.num_blocks += 1;
                self.total_overhead += OVERHEAD;
            } else if (*main).alloc_size >= size {
                self.main_block = ptr::null_mut();
            } else {
                return Err(PoolError::no_space(size));
            }

            (*main).is_allocated = true;
            self.num_allocations += 1;
            self.total_allocated += (*main).alloc_size;

            let payload = BlockHeader::payload(main);
            if let Some(pattern) = self.config.alloc_pattern {
                ptr::write_bytes(payload, pattern, (*main).alloc_size);
            }
            Ok(NonNull::new_unchecked(payload))
        }
    }
}

impl Pool for DynamicPool<'_> {
    fn allocate(&mut self, size: usize) -> PoolResult<NonNull<u8>> {
        debug_assert!(size > 0, "zero-byte allocations are not supported");

        // Round up so every header placed after this payload stays
        // pointer-aligned. The rounded size is what the pool accounts
        // for.
        let size = align_up(size, mem::align_of::<BlockHeader>());

        let candidate = self.find_best_fit(size);
        let result = if !candidate.is_null() {
            // SAFETY: candidate came off the recycled list and fits.
            Ok(unsafe { self.recycle_block(candidate, size) })
        } else if !self.main_block.is_null() {
            // SAFETY: main_block checked non-null.
            unsafe { self.carve_from_main(size) }
        } else {
            Err(PoolError::no_space(size))
        };

        #[cfg(feature = "logging")]
        if let Ok(payload) = &result {
            tracing::trace!(
                pool_id = %self.pool_id,
                size,
                addr = payload.as_ptr() as usize,
                "allocated"
            );
        }

        result
    }

    unsafe fn deallocate(&mut self, ptr: NonNull<u8>) -> PoolResult<()> {
        if self.config.validate_frees && !self.is_within_pool(ptr.as_ptr()) {
            return Err(PoolError::bad_pointer(ptr.as_ptr() as usize));
        }

        // SAFETY: per the caller contract ptr is a live payload of this
        // pool, so a header sits immediately below it.
        let mut block = unsafe { BlockHeader::from_payload(ptr.as_ptr()) };

        // SAFETY: block and every physical/logical neighbour touched
        // below are live headers inside the buffer; the physical chain
        // and the recycled list are consistent on entry and restored by
        // each branch.
        unsafe {
            debug_assert!((*block).is_allocated, "double free");
            (*block).is_allocated = false;
            let size_returned = (*block).alloc_size;

            if let Some(pattern) = self.config.dealloc_pattern {
                ptr::write_bytes(BlockHeader::payload(block), pattern, size_returned);
            }

            // Merge with the lower neighbour first. The freed header is
            // abandoned in place; its bytes join the neighbour's
            // payload.
            let prev = (*block).physical_prev;
            if !prev.is_null() && !(*prev).is_allocated {
                self.recycled.remove(prev);

                (*prev).alloc_size += (*block).alloc_size + OVERHEAD;
                (*prev).physical_next = (*block).physical_next;
                if !(*prev).physical_next.is_null() {
                    (*(*prev).physical_next).physical_prev = prev;
                }

                self.num_blocks -= 1;
                self.total_overhead -= OVERHEAD;
                block = prev;
            }

            let next = (*block).physical_next;
            if next.is_null() && self.main_block.is_null() {
                // The freed block is the buffer tail and no main block
                // exists: it becomes the main block.
                self.main_block = block;
            } else if next == self.main_block {
                // Absorb the main block; the merged block is the new
                // tail. The main block is never on the recycled list, so
                // there is nothing to unlink.
                (*block).alloc_size += (*next).alloc_size + OVERHEAD;
                (*block).physical_next = ptr::null_mut();
                self.main_block = block;

                self.num_blocks -= 1;
                self.total_overhead -= OVERHEAD;
            } else if !next.is_null() && !(*next).is_allocated {
                // Absorb the free upper neighbour, then recycle the
                // merged block.
                self.recycled.remove(next);

                (*block).alloc_size += (*next).alloc_size + OVERHEAD;
                (*block).physical_next = (*next).physical_next;
                if !(*block).physical_next.is_null() {
                    (*(*block).physical_next).physical_prev = block;
                }
                self.recycled.insert(block);

                self.num_blocks -= 1;
                self.total_overhead -= OVERHEAD;
            } else {
                // No mergeable neighbour; recycle as-is.
                debug_assert!(
                    !next.is_null(),
                    "a free tail block cannot coexist with a main block"
                );
                self.recycled.insert(block);
            }

            self.num_allocations -= 1;
            self.total_allocated -= size_returned;
        }

        #[cfg(feature = "logging")]
        tracing::trace!(
            pool_id = %self.pool_id,
            addr = ptr.as_ptr() as usize,
            "deallocated"
        );

        Ok(())
    }

    fn pool_size(&self) -> usize {
        self.pool_size
    }

    fn pool_id(&self) -> &str {
        &self.pool_id
    }

    fn pool_type(&self) -> &'static str {
        "dynamic-block"
    }

    fn base_ptr(&self) -> NonNull<u8> {
        self.base
    }

    fn allocation_count(&self) -> usize {
        self.num_allocations
    }

    fn total_allocated(&self) -> usize {
        self.total_allocated
    }

    fn block_count(&self) -> usize {
        self.num_blocks
    }
}

/// Offset, size and state of one physical block (diagnostics).
#[doc(hidden)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockAudit {
    /// Header offset from the buffer base.
    pub offset: usize,
    /// Payload bytes of the block.
    pub alloc_size: usize,
    /// Whether the block is live.
    pub is_allocated: bool,
}

impl DynamicPool<'_> {
    /// Walks the physical chain from the buffer base (diagnostics;
    /// intended for tests).
    #[doc(hidden)]
    pub fn physical_blocks(&self) -> Vec<BlockAudit> {
        let base = self.base.as_ptr() as usize;
        let mut out = Vec::new();
        let mut block = self.base.as_ptr().cast::<BlockHeader>();
        while !block.is_null() {
            // SAFETY: the walk starts at the base block and follows
            // physical links, which only ever point at live headers.
            unsafe {
                out.push(BlockAudit {
                    offset: block as usize - base,
                    alloc_size: (*block).alloc_size,
                    is_allocated: (*block).is_allocated,
                });
                block = (*block).physical_next;
            }
        }
        out
    }

    /// Payload sizes on the recycled list, head to tail (diagnostics;
    /// intended for tests).
    #[doc(hidden)]
    pub fn recycled_sizes(&self) -> Vec<usize> {
        let mut out = Vec::new();
        let mut node = self.recycled.first();
        while !node.is_null() {
            // SAFETY: the recycled list threads through live headers.
            unsafe {
                out.push((*node).alloc_size);
                node = (*node).logical_next;
            }
        }
        out
    }

    /// Panics unless every structural invariant holds (diagnostics;
    /// intended for tests).
    #[doc(hidden)]
    pub fn assert_invariants(&self) {
        let base = self.base.as_ptr() as usize;
        let mut covered = 0usize;
        let mut count = 0usize;
        let mut allocated_count = 0usize;
        let mut allocated_bytes = 0usize;
        let mut free_non_main: Vec<usize> = Vec::new();
        let mut prev: *mut BlockHeader = ptr::null_mut();
        let mut prev_free = false;
        let mut last: *mut BlockHeader = ptr::null_mut();

        let mut block = self.base.as_ptr().cast::<BlockHeader>();
        // SAFETY: the walk covers exactly the headers this pool laid out
        // in its buffer; links are audited as they are followed.
        unsafe {
            while !block.is_null() {
                assert_eq!((*block).physical_prev, prev, "physical back-link mismatch");
                let addr = block as usize;
                assert!(
                    addr >= base && addr + OVERHEAD + (*block).alloc_size <= base + self.pool_size,
                    "block out of bounds"
                );

                covered += OVERHEAD + (*block).alloc_size;
                count += 1;
                assert!(count <= self.pool_size / OVERHEAD + 1, "physical chain cycle");

                let is_free = !(*block).is_allocated;
                assert!(!(prev_free && is_free), "adjacent free blocks survived a free");
                if is_free && block != self.main_block {
                    free_non_main.push(addr);
                }
                if !is_free {
                    allocated_count += 1;
                    allocated_bytes += (*block).alloc_size;
                }

                prev_free = is_free;
                prev = block;
                last = block;
                block = (*block).physical_next;
            }

            assert_eq!(covered, self.pool_size, "physical chain does not cover the buffer");
            assert_eq!(count, self.num_blocks, "block counter drifted");
            assert_eq!(self.total_overhead, OVERHEAD * self.num_blocks);
            assert_eq!(allocated_count, self.num_allocations, "allocation counter drifted");
            assert_eq!(allocated_bytes, self.total_allocated, "byte counter drifted");

            if !self.main_block.is_null() {
                assert_eq!(self.main_block, last, "main block must be the tail");
                assert!(!(*self.main_block).is_allocated, "main block marked allocated");
            }

            let mut on_list: Vec<usize> = Vec::new();
            let mut link_prev: *mut BlockHeader = ptr::null_mut();
            let mut node = self.recycled.first();
            while !node.is_null() {
                assert_eq!((*node).logical_prev, link_prev, "logical back-link mismatch");
                assert!(!(*node).is_allocated, "allocated block on the recycled list");
                assert_ne!(node, self.main_block, "main block on the recycled list");
                on_list.push(node as usize);
                assert!(on_list.len() <= count, "recycled list cycle");
                link_prev = node;
                node = (*node).logical_next;
            }
            assert_eq!(self.recycled.last(), link_prev, "list tail out of sync");

            free_non_main.sort_unstable();
            on_list.sort_unstable();
            assert_eq!(
                free_non_main, on_list,
                "recycled list does not match the free non-trailing blocks"
            );
        }
    }
}
