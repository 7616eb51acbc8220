use std::any::type_name;
use std::fmt;
use std::num::NonZero;
use std::ptr::NonNull;

use new_zealand::nz;
use tracing::{debug, warn};

use crate::{Block, Error, MemoryBuilder, ReleasePolicy, Result};

/// The base block size used by [`Memory::new()`] if no other size is configured.
pub const DEFAULT_BASE_BLOCK_SIZE: NonZero<usize> = nz!(10);

/// A memory pool for items of type `T` that hands out contiguous runs of slots from a growing
/// collection of fixed-capacity blocks.
///
/// Each allocation request is served by the first block (in creation order) that has a
/// contiguous run of free slots long enough for it. If no block can serve the request, the pool
/// creates a new block whose capacity is the smallest multiple of the base block size that fits
/// the request. Blocks are never removed, so the capacity of the pool only ever grows.
///
/// The pool hands out raw pointers and keeps no record of them. To release slots, pass back
/// exactly the pointer and count you received from [`allocate()`][Self::allocate]. The pool
/// finds the owning block by address.
///
/// The pool tracks slots, not values. It never initializes, reads or drops values of `T`;
/// use the pointers to write and drop values yourself (or use a [`BlockAllocator`][1] which
/// offers `construct()` and `destroy()` helpers).
///
/// # Out of band access
///
/// The pool does not create references to the slots it hands out, so you may create your own
/// references from the pointers, as long as you do not alias them in ways Rust forbids. Moving
/// the pool does not move the blocks, so pointers remain valid until the slots are released or
/// the pool is dropped.
///
/// # Example
///
/// ```
/// use block_pool::Memory;
/// use new_zealand::nz;
///
/// let mut memory = Memory::<u64>::with_base_block_size(nz!(5));
///
/// let ptr = memory.allocate(3)?;
///
/// // SAFETY: The pointer is valid for writes of 3 items.
/// unsafe {
///     ptr.write(1);
///     ptr.add(1).write(2);
///     ptr.add(2).write(3);
/// }
///
/// assert_eq!(memory.len(), 3);
/// assert_eq!(memory.capacity(), 5);
///
/// memory.deallocate(ptr, 3)?;
/// assert!(memory.is_empty());
/// # Ok::<(), block_pool::Error>(())
/// ```
///
/// [1]: crate::BlockAllocator
pub struct Memory<T> {
    /// The blocks in creation order. A block's position never changes once it is pushed.
    blocks: Vec<Block<T>>,

    base_block_size: NonZero<usize>,

    release_policy: ReleasePolicy,
}

impl<T> Memory<T> {
    /// # Panics
    ///
    /// Panics if `T` is zero-sized.
    #[must_use]
    pub(crate) fn new_inner(base_block_size: NonZero<usize>, release_policy: ReleasePolicy) -> Self {
        assert!(size_of::<T>() > 0, "Memory must have non-zero item size");

        Self {
            blocks: Vec::new(),
            base_block_size,
            release_policy,
        }
    }

    /// Creates a new, empty pool with the default configuration.
    ///
    /// No storage is allocated until the first allocation request.
    ///
    /// # Example
    ///
    /// ```
    /// use block_pool::{DEFAULT_BASE_BLOCK_SIZE, Memory};
    ///
    /// let memory = Memory::<u32>::new();
    ///
    /// assert_eq!(memory.base_block_size(), DEFAULT_BASE_BLOCK_SIZE);
    /// assert_eq!(memory.capacity(), 0);
    /// ```
    ///
    /// # Panics
    ///
    /// Panics if `T` is zero-sized.
    #[must_use]
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Creates a new, empty pool that creates blocks in multiples of `base_block_size` slots.
    ///
    /// # Panics
    ///
    /// Panics if `T` is zero-sized.
    #[must_use]
    pub fn with_base_block_size(base_block_size: NonZero<usize>) -> Self {
        Self::builder().base_block_size(base_block_size).build()
    }

    /// Starts building a new [`Memory`].
    ///
    /// Use this when you want to customize the pool configuration beyond the defaults.
    ///
    /// # Example
    ///
    /// ```
    /// use block_pool::{Memory, ReleasePolicy};
    /// use new_zealand::nz;
    ///
    /// let memory = Memory::<u32>::builder()
    ///     .base_block_size(nz!(64))
    ///     .release_policy(ReleasePolicy::MustNotReleaseReserved)
    ///     .build();
    ///
    /// assert_eq!(memory.base_block_size().get(), 64);
    /// ```
    pub fn builder() -> MemoryBuilder<T> {
        MemoryBuilder::new()
    }

    /// The granularity in which new blocks are sized.
    #[must_use]
    pub fn base_block_size(&self) -> NonZero<usize> {
        self.base_block_size
    }

    /// The number of blocks the pool has created so far.
    #[must_use]
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// The capacities of all blocks, in creation order.
    ///
    /// # Example
    ///
    /// ```
    /// use block_pool::Memory;
    /// use new_zealand::nz;
    ///
    /// let mut memory = Memory::<u32>::with_base_block_size(nz!(4));
    ///
    /// let small = memory.allocate(3)?;
    /// let large = memory.allocate(6)?;
    ///
    /// assert_eq!(memory.block_capacities().collect::<Vec<_>>(), [4, 8]);
    /// # memory.deallocate(small, 3)?;
    /// # memory.deallocate(large, 6)?;
    /// # Ok::<(), block_pool::Error>(())
    /// ```
    pub fn block_capacities(&self) -> impl Iterator<Item = usize> + '_ {
        self.blocks.iter().map(Block::capacity)
    }

    /// The total number of slots in all blocks, reserved or not.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.blocks.iter().map(Block::capacity).sum()
    }

    /// The number of reserved slots across all blocks.
    #[must_use]
    #[cfg_attr(test, mutants::skip)] // Only used for reporting.
    pub fn len(&self) -> usize {
        self.blocks.iter().map(Block::len).sum()
    }

    /// Whether no slots are reserved.
    ///
    /// An empty pool may still be holding blocks.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blocks.iter().all(Block::is_empty)
    }

    /// Whether an allocation of `count` slots can be served by an existing block, without
    /// creating a new one.
    #[must_use]
    pub fn fits_without_growth(&self, count: usize) -> bool {
        count == 0 || self.blocks.iter().any(|block| block.can_allocate(count))
    }

    /// The index (in creation order) of the block that owns `ptr`, if any.
    ///
    /// This only checks addresses. It does not say whether the slot is currently reserved.
    #[must_use]
    pub fn owner_of(&self, ptr: NonNull<T>) -> Option<usize> {
        self.blocks.iter().position(|block| block.is_inside(ptr))
    }

    /// Reserves `count` contiguous slots and returns a pointer to the first of them.
    ///
    /// The slots contain zeroes the first time they are handed out and whatever the caller
    /// left in them afterwards. Treat them as uninitialized memory for the purposes of `T`.
    ///
    /// A request for zero slots returns a dangling, well-aligned pointer without touching any
    /// block. It is valid to pass it back to [`deallocate()`][Self::deallocate] with a count
    /// of zero.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfMemory`] if no existing block can serve the request and a new
    /// block cannot be created, either because its size does not fit in the address space or
    /// because the system allocator failed.
    pub fn allocate(&mut self, count: usize) -> Result<NonNull<T>> {
        if count == 0 {
            return Ok(NonNull::dangling());
        }

        for block in &mut self.blocks {
            match block.allocate(count) {
                Ok(ptr) => return Ok(ptr),
                // This block cannot serve the request, maybe the next one can.
                Err(Error::OutOfSpace { .. }) => {}
                Err(error) => return Err(error),
            }
        }

        let block = self.add_block_for(count)?;

        Ok(block.allocate(count).expect(
            "the new block was sized for this request and is empty, so the request must fit",
        ))
    }

    /// Releases `count` slots starting at `ptr`, which must have been returned by
    /// [`allocate()`][Self::allocate] of this pool with the same `count`.
    ///
    /// Releasing zero slots does nothing, whatever the pointer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownPointer`] if `ptr` is not inside any block of this pool.
    ///
    /// Returns [`Error::InvalidDeallocation`] if the pointer and count do not describe reserved
    /// slots of the owning block, which means the caller passed a mismatched pair.
    ///
    /// The pool is unchanged on error.
    pub fn deallocate(&mut self, ptr: NonNull<T>, count: usize) -> Result<()> {
        if count == 0 {
            return Ok(());
        }

        let address = ptr.as_ptr().addr();

        let Some(block) = self.blocks.iter_mut().find(|block| block.is_inside(ptr)) else {
            warn!(
                address,
                count,
                item_type = type_name::<T>(),
                "tried to release a pointer that does not belong to the pool"
            );

            return Err(Error::UnknownPointer { address });
        };

        block.deallocate(ptr, count).inspect_err(|error| {
            warn!(
                address,
                count,
                item_type = type_name::<T>(),
                %error,
                "rejected invalid deallocation"
            );
        })
    }

    fn add_block_for(&mut self, count: usize) -> Result<&mut Block<T>> {
        let Some(capacity) = count
            .checked_next_multiple_of(self.base_block_size.get())
            .and_then(NonZero::new)
        else {
            return Err(Error::OutOfMemory { requested: count });
        };

        let block = Block::new(capacity, self.release_policy)?;

        debug!(
            block_index = self.blocks.len(),
            capacity = capacity.get(),
            requested = count,
            item_type = type_name::<T>(),
            "adding block to pool"
        );

        self.blocks.push(block);

        Ok(self
            .blocks
            .last_mut()
            .expect("we just pushed a block, so there must be a last one"))
    }
}

impl<T> Default for Memory<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Memory<T> {
    #[cfg_attr(test, mutants::skip)] // No API contract to test.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("blocks", &self.blocks)
            .field("base_block_size", &self.base_block_size)
            .field("release_policy", &self.release_policy)
            .finish()
    }
}
