use thiserror::Error;

/// Errors that can occur when allocating from or returning slots to a block pool.
#[derive(Debug, Error, Eq, PartialEq)]
#[non_exhaustive]
pub enum Error {
    /// A single block cannot provide a contiguous run of the requested length, either because
    /// it does not have enough free slots or because its free slots are fragmented.
    ///
    /// This is only produced by individual blocks. The pool recovers from it by trying the next
    /// block or by growing, so callers of [`Memory`][crate::Memory] never observe it.
    #[error("block cannot provide {requested} contiguous slots ({available} slots free)")]
    OutOfSpace {
        /// Number of contiguous slots that were requested.
        requested: usize,

        /// Number of free slots in the block, regardless of fragmentation.
        available: usize,
    },

    /// The pool could not create a new block big enough for the request, either because the
    /// storage size does not fit in the address space or because the system allocator failed.
    #[error("out of memory: unable to create a block of {requested} slots")]
    OutOfMemory {
        /// Number of slots in the block that could not be created.
        requested: usize,
    },

    /// The caller tried to return slots that do not match anything the block could have
    /// handed out. This indicates a mismatched pointer/size pair in the calling code.
    #[error("invalid deallocation: {reason}")]
    InvalidDeallocation {
        /// A human-readable description of the problem.
        reason: String,
    },

    /// The caller tried to return a pointer that does not belong to any block of the pool.
    #[error("pointer {address:#x} does not belong to any block in the pool")]
    UnknownPointer {
        /// The address that was passed in.
        address: usize,
    },
}

/// A specialized `Result` type for block pool operations, returning the crate's
/// [`Error`] type as the error value.
pub type Result<T> = std::result::Result<T, Error>;
