use std::alloc::{Layout, alloc, dealloc};
use std::any::type_name;
use std::fmt;
use std::marker::PhantomData;
use std::ptr::NonNull;

use new_zealand::nz;
use tracing::trace;

use crate::{DEFAULT_BASE_BLOCK_SIZE, Error, Memory, Result};

/// The shape of an allocator that containers such as [`BlockVec`][crate::BlockVec] obtain their
/// storage from.
///
/// An allocator hands out storage for runs of `T` and takes it back. Placing values into that
/// storage and dropping them again is a separate concern, covered by [`construct()`][1] and
/// [`destroy()`][2], which operate on a single item and are independent of the bookkeeping of
/// the storage.
///
/// An exclusive reference to an allocator is itself an allocator, so a container can borrow an
/// allocator that outlives it.
///
/// # Safety
///
/// Containers write to and read from the storage they obtain without further checks, so
/// implementations must uphold the following:
///
/// * A successful [`allocate(count)`][3] returns a pointer that is aligned for `T` and valid for
///   reads and writes of `count` contiguous items of `T`.
/// * The storage does not overlap any other storage handed out by the allocator that has not
///   been returned yet.
/// * The storage stays valid until it is passed to [`deallocate()`][4] or the allocator is
///   dropped, even if the allocator itself is moved.
///
/// An allocator that cannot be trusted with this cannot be used with containers of this crate:
///
/// ```compile_fail
/// use std::ptr::NonNull;
///
/// use block_pool::{Result, SlotAllocator};
///
/// struct Unchecked;
///
/// impl SlotAllocator<u64> for Unchecked {
///     fn allocate(&mut self, _count: usize) -> Result<NonNull<u64>> {
///         Ok(NonNull::dangling())
///     }
///
///     unsafe fn deallocate(&mut self, _ptr: NonNull<u64>, _count: usize) -> Result<()> {
///         Ok(())
///     }
/// }
/// ```
///
/// [1]: Self::construct
/// [2]: Self::destroy
/// [3]: Self::allocate
/// [4]: Self::deallocate
pub unsafe trait SlotAllocator<T> {
    /// Obtains storage for `count` contiguous items of `T`.
    ///
    /// A request for zero items returns a dangling, well-aligned pointer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfMemory`] if the storage cannot be provided.
    fn allocate(&mut self, count: usize) -> Result<NonNull<T>>;

    /// Returns storage for `count` contiguous items of `T` to the allocator.
    ///
    /// # Errors
    ///
    /// Returns an error if the allocator detects that the pointer and count do not match an
    /// earlier allocation. Not every allocator is able to detect this.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by [`allocate()`][Self::allocate] of this allocator with
    /// the same `count` and must not have been returned already. Any values in the storage must
    /// have been destroyed or moved out; the storage must not be used after this call.
    unsafe fn deallocate(&mut self, ptr: NonNull<T>, count: usize) -> Result<()>;

    /// Moves `value` into the item slot at `ptr` without reading or dropping what was there.
    ///
    /// # Safety
    ///
    /// `ptr` must point into storage obtained from this allocator that has not been returned
    /// yet, and the slot must not hold a value that still needs to be dropped.
    unsafe fn construct(&mut self, ptr: NonNull<T>, value: T) {
        // SAFETY: Forwarding the safety requirements of the caller.
        unsafe {
            ptr.write(value);
        }
    }

    /// Drops the value in the item slot at `ptr` in place, leaving the slot uninitialized.
    ///
    /// # Safety
    ///
    /// `ptr` must point to a valid, initialized value of `T` that is not used after this call.
    unsafe fn destroy(&mut self, ptr: NonNull<T>) {
        // SAFETY: Forwarding the safety requirements of the caller.
        unsafe {
            ptr.drop_in_place();
        }
    }
}

// SAFETY: Every call is forwarded to `A`, which upholds the storage guarantees. The storage of
// `A` does not move when the reference is moved.
unsafe impl<T, A: SlotAllocator<T> + ?Sized> SlotAllocator<T> for &mut A {
    fn allocate(&mut self, count: usize) -> Result<NonNull<T>> {
        (**self).allocate(count)
    }

    unsafe fn deallocate(&mut self, ptr: NonNull<T>, count: usize) -> Result<()> {
        // SAFETY: Forwarding the safety requirements of the caller.
        unsafe { (**self).deallocate(ptr, count) }
    }

    unsafe fn construct(&mut self, ptr: NonNull<T>, value: T) {
        // SAFETY: Forwarding the safety requirements of the caller.
        unsafe { (**self).construct(ptr, value) }
    }

    unsafe fn destroy(&mut self, ptr: NonNull<T>) {
        // SAFETY: Forwarding the safety requirements of the caller.
        unsafe { (**self).destroy(ptr) }
    }
}

/// An allocator that draws its storage from a [`Memory`] pool with a base block size of
/// `BLOCK_SIZE` items.
///
/// This is the adapter that lets containers use a block pool as their backing storage. Each
/// allocator owns its own pool, so storage obtained from one allocator must be returned to the
/// same allocator.
///
/// A `BLOCK_SIZE` of zero is rejected at compile time.
///
/// # Example
///
/// ```
/// use block_pool::{BlockAllocator, SlotAllocator};
///
/// let mut allocator = BlockAllocator::<String, 16>::new();
///
/// let ptr = allocator.allocate(2)?;
///
/// // SAFETY: The storage was just obtained from this allocator and holds no values yet.
/// unsafe {
///     allocator.construct(ptr, "hello".to_string());
///     allocator.construct(ptr.add(1), "world".to_string());
/// }
///
/// // SAFETY: Both slots hold values we constructed above.
/// unsafe {
///     assert_eq!(ptr.as_ref(), "hello");
///     assert_eq!(ptr.add(1).as_ref(), "world");
///
///     allocator.destroy(ptr);
///     allocator.destroy(ptr.add(1));
/// }
///
/// // SAFETY: Same pointer and count as returned by allocate(), values destroyed above.
/// unsafe { allocator.deallocate(ptr, 2)? };
///
/// assert!(allocator.memory().is_empty());
/// # Ok::<(), block_pool::Error>(())
/// ```
pub struct BlockAllocator<T, const BLOCK_SIZE: usize = { DEFAULT_BASE_BLOCK_SIZE.get() }> {
    memory: Memory<T>,
}

impl<T, const BLOCK_SIZE: usize> BlockAllocator<T, BLOCK_SIZE> {
    /// Creates an allocator with an empty pool.
    ///
    /// # Panics
    ///
    /// Panics if `T` is zero-sized.
    #[must_use]
    pub fn new() -> Self {
        Self {
            memory: Memory::with_base_block_size(nz!(BLOCK_SIZE)),
        }
    }

    /// The pool that backs this allocator.
    #[must_use]
    pub fn memory(&self) -> &Memory<T> {
        &self.memory
    }
}

// SAFETY: `Memory` hands out runs of reserved slots inside blocks it owns. A reserved slot is
// never handed out again until it is released and blocks are neither moved nor freed while the
// pool is alive.
unsafe impl<T, const BLOCK_SIZE: usize> SlotAllocator<T> for BlockAllocator<T, BLOCK_SIZE> {
    fn allocate(&mut self, count: usize) -> Result<NonNull<T>> {
        trace!(count, item_type = type_name::<T>(), "allocate");

        self.memory.allocate(count)
    }

    unsafe fn deallocate(&mut self, ptr: NonNull<T>, count: usize) -> Result<()> {
        trace!(count, item_type = type_name::<T>(), "deallocate");

        self.memory.deallocate(ptr, count)
    }

    unsafe fn construct(&mut self, ptr: NonNull<T>, value: T) {
        trace!(item_type = type_name::<T>(), "construct");

        // SAFETY: Forwarding the safety requirements of the caller.
        unsafe {
            ptr.write(value);
        }
    }

    unsafe fn destroy(&mut self, ptr: NonNull<T>) {
        trace!(item_type = type_name::<T>(), "destroy");

        // SAFETY: Forwarding the safety requirements of the caller.
        unsafe {
            ptr.drop_in_place();
        }
    }
}

impl<T, const BLOCK_SIZE: usize> Default for BlockAllocator<T, BLOCK_SIZE> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, const BLOCK_SIZE: usize> fmt::Debug for BlockAllocator<T, BLOCK_SIZE> {
    #[cfg_attr(test, mutants::skip)] // No API contract to test.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("memory", &self.memory)
            .finish()
    }
}

/// An allocator that obtains storage for every request directly from the global allocator.
///
/// This is the default allocator of [`BlockVec`][crate::BlockVec] and the baseline that block
/// pools are compared against.
pub struct SystemAllocator<T> {
    _item: PhantomData<T>,
}

impl<T> SystemAllocator<T> {
    /// Creates a new system allocator.
    #[must_use]
    pub fn new() -> Self {
        Self { _item: PhantomData }
    }

    fn layout(count: usize) -> Option<Layout> {
        Layout::array::<T>(count).ok()
    }
}

// SAFETY: Every non-empty request is a separate allocation from the global allocator with the
// layout of `count` items of `T`, which stays valid until deallocated with the same layout.
unsafe impl<T> SlotAllocator<T> for SystemAllocator<T> {
    fn allocate(&mut self, count: usize) -> Result<NonNull<T>> {
        let layout = Self::layout(count).ok_or(Error::OutOfMemory { requested: count })?;

        if layout.size() == 0 {
            return Ok(NonNull::dangling());
        }

        // SAFETY: The layout is valid for an array of `count` items and is not zero-sized.
        let ptr = unsafe { alloc(layout) };

        NonNull::new(ptr.cast::<T>()).ok_or(Error::OutOfMemory { requested: count })
    }

    unsafe fn deallocate(&mut self, ptr: NonNull<T>, count: usize) -> Result<()> {
        let Some(layout) = Self::layout(count) else {
            return Err(Error::InvalidDeallocation {
                reason: format!("{count} items cannot have been allocated"),
            });
        };

        if layout.size() == 0 {
            return Ok(());
        }

        // SAFETY: The caller guarantees that the pointer came from `allocate()` with the same
        // count, so the layout matches the one we allocated with.
        unsafe {
            dealloc(ptr.as_ptr().cast(), layout);
        }

        Ok(())
    }
}

impl<T> Default for SystemAllocator<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for SystemAllocator<T> {
    #[cfg_attr(test, mutants::skip)] // No API contract to test.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>()).finish()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;

    use super::*;

    struct Droppable {
        drops: Rc<Cell<usize>>,
    }

    impl Drop for Droppable {
        fn drop(&mut self) {
            self.drops.set(self.drops.get() + 1);
        }
    }

    fn construct_and_destroy(allocator: &mut impl SlotAllocator<Droppable>) {
        let drops = Rc::new(Cell::new(0));

        let ptr = allocator.allocate(3).unwrap();

        for index in 0..3 {
            // SAFETY: The storage is fresh and has room for 3 items.
            unsafe {
                allocator.construct(
                    ptr.add(index),
                    Droppable {
                        drops: Rc::clone(&drops),
                    },
                );
            }
        }

        assert_eq!(drops.get(), 0);

        for index in 0..3 {
            // SAFETY: Every slot holds a value constructed above.
            unsafe {
                allocator.destroy(ptr.add(index));
            }
        }

        assert_eq!(drops.get(), 3);

        // SAFETY: Same pointer and count as returned by allocate(), values destroyed above.
        unsafe { allocator.deallocate(ptr, 3) }.unwrap();
    }

    #[test]
    fn block_allocator_construct_destroy() {
        let mut allocator = BlockAllocator::<Droppable, 4>::new();

        construct_and_destroy(&mut allocator);

        assert!(allocator.memory().is_empty());
        assert_eq!(allocator.memory().capacity(), 4);
    }

    #[test]
    fn system_allocator_construct_destroy() {
        construct_and_destroy(&mut SystemAllocator::new());
    }

    #[test]
    fn block_allocator_uses_block_size() {
        let mut allocator = BlockAllocator::<u32, 5>::new();

        let a = allocator.allocate(3).unwrap();
        let b = allocator.allocate(4).unwrap();
        let c = allocator.allocate(5).unwrap();

        assert_eq!(allocator.memory().base_block_size().get(), 5);
        assert_eq!(allocator.memory().block_count(), 3);
        assert_eq!(allocator.memory().len(), 12);

        // SAFETY: Same pointers and counts as returned by allocate().
        unsafe {
            allocator.deallocate(a, 3).unwrap();
            allocator.deallocate(b, 4).unwrap();
            allocator.deallocate(c, 5).unwrap();
        }

        assert!(allocator.memory().is_empty());
    }

    #[test]
    fn block_allocator_default_block_size() {
        let allocator = BlockAllocator::<u64>::default();

        assert_eq!(allocator.memory().base_block_size(), DEFAULT_BASE_BLOCK_SIZE);
    }

    #[test]
    fn block_allocator_reports_mismatched_deallocation() {
        let mut allocator = BlockAllocator::<u64, 4>::new();

        let ptr = allocator.allocate(2).unwrap();

        // SAFETY: The block pool validates the pair, so a wrong count is reported, not UB.
        let result = unsafe { allocator.deallocate(ptr, 4) };
        assert!(matches!(result, Err(Error::InvalidDeallocation { .. })));

        // SAFETY: Same pointer and count as returned by allocate().
        unsafe { allocator.deallocate(ptr, 2) }.unwrap();
    }

    #[test]
    fn zero_count_round_trip() {
        let mut system = SystemAllocator::<u64>::new();
        let ptr = system.allocate(0).unwrap();
        // SAFETY: Same pointer and count as returned by allocate().
        unsafe { system.deallocate(ptr, 0) }.unwrap();

        let mut block = BlockAllocator::<u64>::new();
        let ptr = block.allocate(0).unwrap();
        // SAFETY: Same pointer and count as returned by allocate().
        unsafe { block.deallocate(ptr, 0) }.unwrap();
        assert_eq!(block.memory().block_count(), 0);
    }

    /// Forwards to the system allocator and counts outstanding runs.
    #[derive(Default)]
    struct Counting {
        inner: SystemAllocator<u64>,
        outstanding: usize,
    }

    // SAFETY: Every call is forwarded to the system allocator.
    unsafe impl SlotAllocator<u64> for Counting {
        fn allocate(&mut self, count: usize) -> Result<NonNull<u64>> {
            let ptr = self.inner.allocate(count)?;
            self.outstanding += 1;
            Ok(ptr)
        }

        unsafe fn deallocate(&mut self, ptr: NonNull<u64>, count: usize) -> Result<()> {
            self.outstanding -= 1;

            // SAFETY: Forwarding the safety requirements of the caller.
            unsafe { self.inner.deallocate(ptr, count) }
        }
    }

    #[test]
    fn custom_allocator_backs_block_vec() {
        let mut allocator = Counting::default();

        {
            let mut vec = crate::BlockVec::new_in(&mut allocator);

            for i in 0..100 {
                vec.push(i);
            }

            assert_eq!(vec.iter().sum::<u64>(), 4950);
            assert_eq!(vec.allocator().outstanding, 1);
        }

        assert_eq!(allocator.outstanding, 0);
    }

    #[test]
    fn system_allocator_rejects_impossible_sizes() {
        let mut system = SystemAllocator::<u64>::new();

        assert_eq!(
            system.allocate(usize::MAX),
            Err(Error::OutOfMemory {
                requested: usize::MAX
            })
        );
    }
}
