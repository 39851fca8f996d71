//! Intrusive doubly linked list of recyclable blocks.
//!
//! Holds exactly the free blocks that are not the trailing main block.
//! Links live inside the blocks themselves, so insertion and removal
//! are pointer surgery with no allocation. Order within the list carries
//! no meaning; insertion appends at the tail.

use core::ptr;

use super::block::BlockHeader;

#[derive(Debug)]
pub(crate) struct RecycledList {
    head: *mut BlockHeader,
    tail: *mut BlockHeader,
}

impl RecycledList {
    pub const fn new() -> Self {
        Self {
            head: ptr::null_mut(),
            tail: ptr::null_mut(),
        }
    }

    pub fn first(&self) -> *mut BlockHeader {
        self.head
    }

    pub fn last(&self) -> *mut BlockHeader {
        self.tail
    }

    /// Appends `block` at the tail.
    ///
    /// # Safety
    /// `block` must be a live header that is not on the list, with both
    /// logical links null.
    pub unsafe fn insert(&mut self, block: *mut BlockHeader) {
        if self.tail.is_null() {
            self.head = block;
            self.tail = block;
        } else {
            // SAFETY: tail is a live header on the list and block is
            // live per the contract.
            unsafe {
                (*self.tail).logical_next = block;
                (*block).logical_prev = self.tail;
            }
            self.tail = block;
        }
    }

    /// Unlinks `block` and clears its logical links.
    ///
    /// # Safety
    /// `block` must currently be on this list.
    pub unsafe fn remove(&mut self, block: *mut BlockHeader) {
        // SAFETY: block and its logical neighbours are live headers on
        // this list.
        unsafe {
            let prev = (*block).logical_prev;
            let next = (*block).logical_next;
            (*block).logical_next = ptr::null_mut();
            (*block).logical_prev = ptr::null_mut();

            if prev.is_null() {
                self.head = next;
            } else {
                (*prev).logical_next = next;
            }
            if next.is_null() {
                self.tail = prev;
            } else {
                (*next).logical_prev = prev;
            }
        }
    }
}
