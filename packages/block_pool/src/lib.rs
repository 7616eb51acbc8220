#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! A typed memory pool that batches many small allocations of the same type into large
//! contiguous blocks, usable as the backing allocator of containers.
//!
//! This package provides [`Memory`], a pool of slots for values of one type `T`. The pool hands
//! out contiguous runs of slots as raw pointers and takes them back by `(pointer, count)`.
//! Storage is carved out of blocks whose sizes are multiples of a configured base block size,
//! so many small requests share a few system allocations.
//!
//! ```text
//! BlockVec<T, A> / BlockMap<K, V, A> (growable array / ordered map, one node per entry)
//! └── A: SlotAllocator<T>             (allocate / deallocate / construct / destroy)
//!     └── BlockAllocator<T, BLOCK_SIZE>
//!         └── Memory<T>               (first fit across blocks, growth, pointer routing)
//!             └── Block<T> × n        (fixed capacity, reservation flag per slot)
//! ```
//!
//! # Key Features
//!
//! - **First-fit allocation**: each request is served by the first block, in creation order,
//!   that has a long enough run of free slots; within a block the search starts from a hint.
//! - **Predictable growth**: a new block is created only when no existing block fits and is
//!   sized to the smallest multiple of the base block size that fits the request.
//! - **Stable addresses**: blocks never move or shrink, so pointers stay valid until released.
//! - **Misuse detection**: releasing a pointer the pool does not own, or a mismatched count,
//!   is reported as an [`Error`] instead of corrupting the bookkeeping.
//!
//! # Example
//!
//! ```rust
//! use block_pool::{BlockAllocator, BlockVec, Memory};
//! use new_zealand::nz;
//!
//! // Use the pool directly.
//! let mut memory = Memory::<u64>::with_base_block_size(nz!(5));
//!
//! let a = memory.allocate(3)?;
//! let b = memory.allocate(4)?;
//!
//! // The second request did not fit in the 2 free slots of the first block.
//! assert_eq!(memory.block_count(), 2);
//!
//! memory.deallocate(a, 3)?;
//! memory.deallocate(b, 4)?;
//!
//! // Or let a container use it.
//! let mut numbers = BlockVec::<u64, BlockAllocator<u64, 16>>::new();
//! numbers.push(1);
//! numbers.push(2);
//!
//! assert_eq!(numbers.iter().sum::<u64>(), 3);
//! # Ok::<(), block_pool::Error>(())
//! ```
//!
//! # Thread safety
//!
//! The pool is single-threaded. It can be moved between threads if `T` can, but it cannot be
//! shared between threads.

mod allocator;
mod block;
mod block_map;
mod block_vec;
mod builder;
mod error;
mod memory;
mod release_policy;

pub use allocator::*;
pub(crate) use block::*;
pub use block_map::*;
pub use block_vec::*;
pub use builder::*;
pub use error::*;
pub use memory::*;
pub use release_policy::*;
