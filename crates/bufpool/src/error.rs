//! Error types for pool operations.
//!
//! Every failure surfaces at the call boundary as a [`PoolError`]. The
//! pools recover nothing internally, and a failed call leaves pool state
//! untouched. With the `logging` feature enabled, the constructors emit
//! an event at a severity matched to the error.

use thiserror::Error;

/// Result type for pool operations.
pub type PoolResult<T> = Result<T, PoolError>;

/// Errors surfaced by pool construction, allocation and deallocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PoolError {
    /// No free region can satisfy the request.
    #[error("pool exhausted: no free region can hold {requested} bytes")]
    NoSpace {
        /// Bytes the caller asked for.
        requested: usize,
    },

    /// The request exceeds the slot size of a fixed-block pool.
    #[error("requested {requested} bytes from a pool of {block_size}-byte slots")]
    SizeTooLarge {
        /// Bytes the caller asked for.
        requested: usize,
        /// Size of every slot in the pool.
        block_size: usize,
    },

    /// The pointer handed to `deallocate` is not inside the pool buffer.
    #[error("pointer {addr:#x} does not belong to this pool")]
    BadPointer {
        /// The offending address.
        addr: usize,
    },

    /// Construction parameters cannot form a valid pool.
    #[error("invalid pool configuration: {reason}")]
    BadConfig {
        /// What was wrong with the parameters.
        reason: &'static str,
    },
}

impl PoolError {
    pub(crate) fn no_space(requested: usize) -> Self {
        #[cfg(feature = "logging")]
        tracing::warn!(requested, "pool exhausted");
        Self::NoSpace { requested }
    }

    pub(crate) fn size_too_large(requested: usize, block_size: usize) -> Self {
        #[cfg(feature = "logging")]
        tracing::warn!(requested, block_size, "request exceeds slot size");
        Self::SizeTooLarge {
            requested,
            block_size,
        }
    }

    pub(crate) fn bad_pointer(addr: usize) -> Self {
        #[cfg(feature = "logging")]
        tracing::warn!(addr, "deallocate called with a foreign pointer");
        Self::BadPointer { addr }
    }

    pub(crate) fn bad_config(reason: &'static str) -> Self {
        #[cfg(feature = "logging")]
        tracing::error!(reason, "pool construction rejected");
        Self::BadConfig { reason }
    }

    /// Returns true for an exhaustion failure, the one error a caller
    /// can usually react to by freeing memory and retrying.
    pub const fn is_no_space(&self) -> bool {
        matches!(self, Self::NoSpace { .. })
    }

    /// Returns true when a foreign pointer was rejected.
    pub const fn is_bad_pointer(&self) -> bool {
        matches!(self, Self::BadPointer { .. })
    }
}
