//! Call-site allocation tracking for leak hunting.
//!
//! The tracker is a collaborator, not part of either allocator: feed it
//! `on_allocate`/`on_deallocate` from the call sites you want audited
//! and ask it for the survivors. Records capture the caller's source
//! location, so a leak report points at the allocation site, not at the
//! pool internals.
//!
//! ```
//! use bufpool::AllocationTracker;
//! use std::ptr::NonNull;
//!
//! let mut tracker = AllocationTracker::new("scratch");
//! let ptr = NonNull::new(0x1000 as *mut u8).unwrap();
//! tracker.on_allocate(ptr, 64);
//! assert!(tracker.has_leaks());
//! tracker.on_deallocate(ptr);
//! assert!(!tracker.has_leaks());
//! ```

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::panic::Location;
use std::path::Path;
use std::ptr::NonNull;

/// Call-site record for one live allocation.
#[derive(Debug, Clone, Copy)]
pub struct AllocationRecord {
    /// Bytes requested at the allocation site.
    pub size: usize,
    /// Source location of the `on_allocate` call.
    pub location: &'static Location<'static>,
}

/// Book-keeps live allocations for one pool and reports leaks.
#[derive(Debug)]
pub struct AllocationTracker {
    pool_id: String,
    live: HashMap<usize, AllocationRecord>,
}

impl AllocationTracker {
    /// Creates a tracker labelled with the pool it observes.
    pub fn new(pool_id: impl Into<String>) -> Self {
        Self {
            pool_id: pool_id.into(),
            live: HashMap::new(),
        }
    }

    /// Records a fresh allocation under the caller's source location.
    #[track_caller]
    pub fn on_allocate(&mut self, ptr: NonNull<u8>, size: usize) {
        self.live.insert(
            ptr.as_ptr() as usize,
            AllocationRecord {
                size,
                location: Location::caller(),
            },
        );
    }

    /// Drops the record for `ptr`. Unknown pointers are ignored; the
    /// pool's own validation owns that failure mode.
    pub fn on_deallocate(&mut self, ptr: NonNull<u8>) {
        self.live.remove(&(ptr.as_ptr() as usize));
    }

    /// Number of allocations still outstanding.
    pub fn live_allocations(&self) -> usize {
        self.live.len()
    }

    /// True when at least one allocation was never returned.
    pub fn has_leaks(&self) -> bool {
        !self.live.is_empty()
    }

    /// Iterates outstanding allocations as `(payload address, record)`.
    pub fn leaks(&self) -> impl Iterator<Item = (usize, &AllocationRecord)> {
        self.live.iter().map(|(addr, record)| (*addr, record))
    }

    /// Writes one stanza per outstanding allocation to `path`. An empty
    /// file means nothing leaked.
    pub fn dump_leaks(&self, path: impl AsRef<Path>) -> io::Result<()> {
        #[cfg(feature = "logging")]
        if self.has_leaks() {
            tracing::warn!(
                pool_id = %self.pool_id,
                leaks = self.live.len(),
                "dumping leaked allocations"
            );
        }

        let mut out = BufWriter::new(File::create(path)?);
        for (addr, record) in self.leaks() {
            writeln!(out, "Pool:\t{}", self.pool_id)?;
            writeln!(out, "Address:\t{addr:#x}")?;
            writeln!(out, "File:\t{}", record.location.file())?;
            writeln!(out, "Line:\t{}", record.location.line())?;
            writeln!(out, "Size:\t{}", record.size)?;
            writeln!(out)?;
        }
        out.flush()
    }
}
