//! In-band block header for the dynamic pool.
//!
//! Every block in the buffer is a header followed by payload bytes. The
//! header carries two link pairs through the same storage: `physical_*`
//! chain the blocks by address and partition the entire buffer, while
//! `logical_*` thread the subset of free, non-trailing blocks into the
//! recycled list. Headers are placed by address arithmetic into raw
//! bytes the pool does not own; this module is the narrow unsafe core
//! that the allocator builds on.

use core::mem;
use core::ptr;

/// Boundary-tag header preceding every payload in a dynamic pool.
///
/// `#[repr(C)]` keeps the layout pointer-aligned with a size that is a
/// multiple of pointer alignment, so a payload computed as
/// `header + OVERHEAD` is pointer-aligned whenever the header is.
#[repr(C)]
pub(crate) struct BlockHeader {
    /// Next block on the recycled list; meaningful only while free.
    pub logical_next: *mut BlockHeader,
    /// Previous block on the recycled list; meaningful only while free.
    pub logical_prev: *mut BlockHeader,
    /// Neighbour at the next-higher address; null iff this block is the
    /// buffer tail.
    pub physical_next: *mut BlockHeader,
    /// Neighbour at the next-lower address; null iff this block sits at
    /// the buffer base.
    pub physical_prev: *mut BlockHeader,
    /// Payload bytes following this header, excluding the header.
    pub alloc_size: usize,
    /// Whether the payload is currently owned by the caller.
    pub is_allocated: bool,
}

/// In-band header size; every block costs this much overhead.
pub(crate) const OVERHEAD: usize = mem::size_of::<BlockHeader>();

const _: () = assert!(mem::align_of::<BlockHeader>() == mem::align_of::<*mut u8>());

impl BlockHeader {
    /// Writes a fresh free block at `addr`: `alloc_size` payload bytes,
    /// no links, not allocated.
    ///
    /// # Safety
    /// `addr` must be aligned to `align_of::<BlockHeader>()` and point
    /// at `OVERHEAD + alloc_size` writable bytes overlapping no live
    /// block.
    pub unsafe fn init_at(addr: *mut u8, alloc_size: usize) -> *mut BlockHeader {
        let block = addr.cast::<BlockHeader>();
        // SAFETY: the destination is writable, aligned and exclusively
        // ours per this function's contract.
        unsafe {
            block.write(BlockHeader {
                logical_next: ptr::null_mut(),
                logical_prev: ptr::null_mut(),
                physical_next: ptr::null_mut(),
                physical_prev: ptr::null_mut(),
                alloc_size,
                is_allocated: false,
            });
        }
        block
    }

    /// Address of the payload that follows `block`'s header.
    ///
    /// # Safety
    /// `block` must point at a live header.
    pub unsafe fn payload(block: *mut BlockHeader) -> *mut u8 {
        // SAFETY: one past the header stays inside the block's span.
        unsafe { block.add(1).cast::<u8>() }
    }

    /// Recovers the header from a payload address produced by
    /// [`payload`](Self::payload).
    ///
    /// # Safety
    /// `ptr` must be a payload address of a live header.
    pub unsafe fn from_payload(ptr: *mut u8) -> *mut BlockHeader {
        // SAFETY: inverse of `payload`.
        unsafe { ptr.cast::<BlockHeader>().sub(1) }
    }
}
