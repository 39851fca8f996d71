//! Fixed-block pool: equal-sized slots over a caller-owned buffer.
//!
//! The buffer is carved into `block_count` contiguous slots of
//! `block_size` bytes. Free slots form a singly linked intrusive list:
//! the first machine word of a free slot holds a pointer to the next
//! free slot, and an allocated slot is user payload in its entirety.
//! Allocation pops the head, deallocation pushes onto it; both are O(1)
//! pointer swaps. List order is last-slot-first after construction and
//! carries no meaning.
//!
//! ## Invariants
//!
//! - `block_size` is at least one machine word and a multiple of pointer
//!   alignment, so every slot can carry the intrusive link and every
//!   returned payload is pointer-aligned.
//! - `allocation_count + free_count == block_count` at all times.
//! - The free list only ever threads through slots of this buffer.

use core::marker::PhantomData;
use core::mem;
use core::ptr::{self, NonNull};

use crate::config::PoolConfig;
use crate::error::{PoolError, PoolResult};
use crate::pool::Pool;
use crate::utils::{is_aligned, is_aligned_ptr};

/// Intrusive link living in the first word of a free slot.
#[repr(C)]
struct FreeSlot {
    next: *mut FreeSlot,
}

/// Pool of equal-sized slots with a singly linked intrusive free list.
///
/// Construction lays the free list over the buffer; afterwards no slot
/// metadata exists outside the free slots themselves.
#[derive(Debug)]
pub struct FixedPool<'buf> {
    base: NonNull<u8>,
    pool_size: usize,
    block_size: usize,
    block_count: usize,
    free_head: *mut FreeSlot,
    free_count: usize,
    num_allocations: usize,
    total_allocated: usize,
    pool_id: String,
    config: PoolConfig,
    _buffer: PhantomData<&'buf mut [u8]>,
}

impl<'buf> FixedPool<'buf> {
    /// Creates a pool of `block_count` slots of `block_size` bytes each
    /// over `buffer`, with the default configuration.
    ///
    /// # Errors
    /// [`BadConfig`](PoolError::BadConfig) when `block_size` cannot hold
    /// a pointer or is not a multiple of pointer alignment, when
    /// `block_count` is zero, when the buffer is shorter than
    /// `block_count * block_size`, or when its base is not
    /// pointer-aligned.
    pub fn new(
        buffer: &'buf mut [u8],
        block_count: usize,
        block_size: usize,
        pool_id: impl Into<String>,
    ) -> PoolResult<Self> {
        Self::with_config(buffer, block_count, block_size, pool_id, PoolConfig::default())
    }

    /// Creates a pool with an explicit configuration.
    ///
    /// # Errors
    /// Same as [`new`](Self::new).
    pub fn with_config(
        buffer: &'buf mut [u8],
        block_count: usize,
        block_size: usize,
        pool_id: impl Into<String>,
        config: PoolConfig,
    ) -> PoolResult<Self> {
        if block_size < mem::size_of::<*mut u8>() {
            return Err(PoolError::bad_config("block size cannot hold a free-list link"));
        }
        if !is_aligned(block_size, mem::align_of::<*mut u8>()) {
            return Err(PoolError::bad_config(
                "block size must be a multiple of pointer alignment",
            ));
        }
        if block_count == 0 {
            return Err(PoolError::bad_config("pool needs at least one block"));
        }
        let pool_size = block_count
            .checked_mul(block_size)
            .ok_or_else(|| PoolError::bad_config("pool size overflows"))?;
        if buffer.len() < pool_size {
            return Err(PoolError::bad_config(
                "buffer is shorter than block_count * block_size",
            ));
        }
        if !is_aligned_ptr(buffer.as_ptr(), mem::align_of::<*mut u8>()) {
            return Err(PoolError::bad_config("buffer base must be pointer-aligned"));
        }
        let base = NonNull::new(buffer.as_mut_ptr())
            .ok_or_else(|| PoolError::bad_config("null buffer"))?;

        let mut pool = Self {
            base,
            pool_size,
            block_size,
            block_count,
            free_head: ptr::null_mut(),
            free_count: 0,
            num_allocations: 0,
            total_allocated: 0,
            pool_id: pool_id.into(),
            config,
            _buffer: PhantomData,
        };
        pool.initialize_free_list();

        #[cfg(feature = "logging")]
        tracing::debug!(
            pool_id = %pool.pool_id,
            block_count,
            block_size,
            "fixed pool initialised"
        );

        Ok(pool)
    }

    /// Threads the free list through every slot, last slot first.
    fn initialize_free_list(&mut self) {
        let mut head: *mut FreeSlot = ptr::null_mut();
        for i in 0..self.block_count {
            // SAFETY: i < block_count, so the slot lies inside the
            // buffer; base and block_size are pointer-aligned (checked
            // at construction) and no payload is live during setup.
            unsafe {
                let slot = self.base.as_ptr().add(i * self.block_size).cast::<FreeSlot>();
                (*slot).next = head;
                head = slot;
            }
        }
        self.free_head = head;
        self.free_count = self.block_count;
    }

    /// Size of each slot in bytes.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Number of slots currently free.
    pub fn free_blocks(&self) -> usize {
        self.free_count
    }

    /// True when every slot is allocated.
    pub fn is_full(&self) -> bool {
        self.free_head.is_null()
    }

    /// Panics unless the free list and counters are consistent
    /// (diagnostics; intended for tests).
    #[doc(hidden)]
    pub fn assert_invariants(&self) {
        assert_eq!(
            self.num_allocations + self.free_count,
            self.block_count,
            "free and live slots must partition the pool"
        );
        assert_eq!(self.total_allocated, self.num_allocations * self.block_size);

        let base = self.base.as_ptr() as usize;
        let mut seen = 0usize;
        let mut slot = self.free_head;
        while !slot.is_null() {
            let addr = slot as usize;
            assert!(addr >= base && addr < base + self.pool_size, "free slot out of bounds");
            assert_eq!((addr - base) % self.block_size, 0, "free slot off the slot grid");
            seen += 1;
            assert!(seen <= self.block_count, "free list cycle");
            // SAFETY: slot came off the free list, which only threads
            // through live FreeSlot links inside the buffer.
            slot = unsafe { (*slot).next };
        }
        assert_eq!(seen, self.free_count);
    }
}

impl Pool for FixedPool<'_> {
    fn allocate(&mut self, size: usize) -> PoolResult<NonNull<u8>> {
        if size > self.block_size {
            return Err(PoolError::size_too_large(size, self.block_size));
        }
        let slot = self.free_head;
        if slot.is_null() {
            return Err(PoolError::no_space(size));
        }

        // SAFETY: slot came off the free list, so it is a live FreeSlot
        // written by initialize_free_list or deallocate.
        self.free_head = unsafe { (*slot).next };
        self.free_count -= 1;

        let payload = slot.cast::<u8>();
        if let Some(pattern) = self.config.alloc_pattern {
            // SAFETY: the slot spans block_size bytes inside the buffer
            // and is no longer on the free list.
            unsafe { ptr::write_bytes(payload, pattern, self.block_size) };
        }

        self.num_allocations += 1;
        self.total_allocated += self.block_size;

        #[cfg(feature = "logging")]
        tracing::trace!(pool_id = %self.pool_id, addr = payload as usize, "slot allocated");

        // SAFETY: slot was non-null when popped.
        Ok(unsafe { NonNull::new_unchecked(payload) })
    }

    unsafe fn deallocate(&mut self, ptr: NonNull<u8>) -> PoolResult<()> {
        if self.config.validate_frees && !self.is_within_pool(ptr.as_ptr()) {
            return Err(PoolError::bad_pointer(ptr.as_ptr() as usize));
        }
        debug_assert!(self.num_allocations > 0, "deallocate with nothing live");

        if let Some(pattern) = self.config.dealloc_pattern {
            // SAFETY: per the caller contract ptr is a live slot of this
            // pool, so it spans block_size bytes the caller no longer
            // uses.
            unsafe { ptr::write_bytes(ptr.as_ptr(), pattern, self.block_size) };
        }

        let slot = ptr.as_ptr().cast::<FreeSlot>();
        // SAFETY: slots are handed out pointer-aligned and the payload
        // is dead, so its first word can carry the free-list link again.
        unsafe { (*slot).next = self.free_head };
        self.free_head = slot;
        self.free_count += 1;

        self.num_allocations -= 1;
        self.total_allocated -= self.block_size;

        #[cfg(feature = "logging")]
        tracing::trace!(pool_id = %self.pool_id, addr = ptr.as_ptr() as usize, "slot freed");

        Ok(())
    }

    fn pool_size(&self) -> usize {
        self.pool_size
    }

    fn pool_id(&self) -> &str {
        &self.pool_id
    }

    fn pool_type(&self) -> &'static str {
        "fixed-block"
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
        self.block_count
    }
}
