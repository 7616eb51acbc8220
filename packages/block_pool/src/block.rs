use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::any::type_name;
use std::fmt;
use std::num::NonZero;
use std::ptr::NonNull;
use std::thread;

use num_integer::Integer;

use crate::{Error, ReleasePolicy, Result};

/// This is the backing storage of a [`Memory`][crate::Memory]: a fixed-capacity slab of
/// `capacity` slots of `T`, allocated once and never resized, plus one reservation flag per slot.
///
/// The block hands out contiguous runs of slots as raw pointers and takes them back by
/// `(pointer, count)`. It never reads, writes or drops values of `T` - what the caller places in
/// a slot is the caller's business. The pool tracks slots, not object lifetimes.
///
/// # Finding free runs
///
/// Allocation is first-fit, scanning from `first_free_hint`. The hint is a lower bound on the
/// index of the first free slot: every slot before it is reserved, but the slot at the hint may
/// itself be reserved if the hint has gone stale. A search therefore always scans from the hint
/// to the end of the block instead of only probing the hint slot.
///
/// The hint moves forward only when an allocation started exactly at it (there is no earlier
/// free run) and moves back whenever a run earlier than it is released.
pub(crate) struct Block<T> {
    first_slot_ptr: NonNull<T>,

    capacity: NonZero<usize>,

    /// Number of slots currently reserved. Always equal to the number of `true` entries in
    /// `reserved`.
    occupied: usize,

    reserved: Vec<bool>,

    /// Lowest index that may be free. Equal to `capacity` when the block is known to be full.
    first_free_hint: usize,

    release_policy: ReleasePolicy,
}

impl<T> Block<T> {
    /// Creates a new block with room for `capacity` items of `T`, all of them free.
    ///
    /// The storage is zero-filled.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfMemory`] if the storage size does not fit in the address space or
    /// if the system allocator cannot provide the storage.
    ///
    /// # Panics
    ///
    /// Panics if `T` is zero-sized.
    pub(crate) fn new(capacity: NonZero<usize>, release_policy: ReleasePolicy) -> Result<Self> {
        assert!(size_of::<T>() > 0, "Block must have non-zero item size");

        let out_of_memory = Error::OutOfMemory {
            requested: capacity.get(),
        };

        let Some(layout) = Self::layout(capacity) else {
            return Err(out_of_memory);
        };

        // The flags come first so a failure here leaves no storage to clean up.
        let mut reserved = Vec::new();
        if reserved.try_reserve_exact(capacity.get()).is_err() {
            return Err(out_of_memory);
        }
        reserved.resize(capacity.get(), false);

        // SAFETY: The layout is valid for an array of `capacity` items of `T` and is not
        // zero-sized because both the capacity and the item size are non-zero.
        let ptr = unsafe { alloc_zeroed(layout) };

        let Some(first_slot_ptr) = NonNull::new(ptr.cast::<T>()) else {
            return Err(out_of_memory);
        };

        Ok(Self {
            first_slot_ptr,
            capacity,
            occupied: 0,
            reserved,
            first_free_hint: 0,
            release_policy,
        })
    }

    #[must_use]
    fn layout(capacity: NonZero<usize>) -> Option<Layout> {
        Layout::array::<T>(capacity.get()).ok()
    }

    #[must_use]
    pub(crate) fn capacity(&self) -> usize {
        self.capacity.get()
    }

    /// Number of reserved slots.
    #[must_use]
    #[cfg_attr(test, mutants::skip)] // Mutating this only affects reporting and Drop-time checks.
    pub(crate) fn len(&self) -> usize {
        self.occupied
    }

    #[must_use]
    pub(crate) fn is_empty(&self) -> bool {
        self.occupied == 0
    }

    /// Number of free slots, regardless of whether they are contiguous.
    #[must_use]
    pub(crate) fn available(&self) -> usize {
        self.capacity()
            .checked_sub(self.occupied)
            .expect("occupied can never exceed capacity")
    }

    /// Whether the slot at `index` is reserved.
    ///
    /// # Panics
    ///
    /// Panics if the index is out of bounds.
    #[must_use]
    #[cfg(test)]
    pub(crate) fn is_reserved(&self, index: usize) -> bool {
        *self.reserved.get(index).unwrap_or_else(|| {
            panic!(
                "slot {index} index out of bounds in block of {}",
                type_name::<T>()
            )
        })
    }

    /// Whether a contiguous run of `count` free slots exists in this block.
    #[must_use]
    pub(crate) fn can_allocate(&self, count: usize) -> bool {
        self.find_free_run(count).is_some()
    }

    /// Whether `ptr` points at one of the slots of this block.
    ///
    /// This is an address range check only. It is used to find the block that owns a pointer
    /// and says nothing about whether the slot is reserved.
    #[must_use]
    pub(crate) fn is_inside(&self, ptr: NonNull<T>) -> bool {
        let start = self.first_slot_ptr.as_ptr().addr();

        let Some(offset) = ptr.as_ptr().addr().checked_sub(start) else {
            return false;
        };

        offset <= self.last_slot_offset()
    }

    /// Reserves `count` contiguous slots and returns a pointer to the first of them.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfSpace`] if `count` is zero, if it exceeds the number of free slots
    /// or if the free slots are too fragmented to provide a single run of this length.
    pub(crate) fn allocate(&mut self, count: usize) -> Result<NonNull<T>> {
        #[cfg(debug_assertions)]
        self.integrity_check();

        let Some(start) = self.find_free_run(count) else {
            return Err(Error::OutOfSpace {
                requested: count,
                available: self.available(),
            });
        };

        let end = start
            .checked_add(count)
            .expect("the run was found inside the block so its end cannot overflow");

        self.reserved
            .get_mut(start..end)
            .expect("the run was found inside the block")
            .fill(true);

        // Only an allocation at the hint can make the hint stale. An allocation anywhere else
        // leaves the slots before it untouched, so the hint is still a valid lower bound.
        if start == self.first_free_hint {
            self.first_free_hint = self.first_free_at_or_after(end);
        }

        self.occupied = self
            .occupied
            .checked_add(count)
            .expect("guarded by the free run check above, occupied cannot exceed capacity");

        Ok(self.slot_ptr(start))
    }

    /// Releases `count` contiguous slots starting at the slot `ptr` points to.
    ///
    /// The caller is expected to pass back exactly the pointer and count it received from
    /// [`allocate()`][Self::allocate]. The block does not remember allocation boundaries, so
    /// releasing two adjacent allocations in one call is not detected.
    ///
    /// Releasing zero slots does nothing.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidDeallocation`] if `count` exceeds the number of reserved slots,
    /// if `ptr` is not the address of a slot in this block, if the range runs past the end of
    /// the block or if any slot in the range is not reserved. The block is unchanged on error.
    pub(crate) fn deallocate(&mut self, ptr: NonNull<T>, count: usize) -> Result<()> {
        if count == 0 {
            return Ok(());
        }

        if count > self.occupied {
            return Err(Error::InvalidDeallocation {
                reason: format!(
                    "cannot release {count} slots from a block that has only {} reserved",
                    self.occupied
                ),
            });
        }

        let Some(start) = self.index_of(ptr) else {
            return Err(Error::InvalidDeallocation {
                reason: format!(
                    "pointer {:#x} is not the address of a slot in this block",
                    ptr.as_ptr().addr()
                ),
            });
        };

        let Some(slots) = start
            .checked_add(count)
            .and_then(|end| self.reserved.get_mut(start..end))
        else {
            return Err(Error::InvalidDeallocation {
                reason: format!(
                    "releasing {count} slots from slot {start} runs past the block capacity of {}",
                    self.capacity
                ),
            });
        };

        if slots.contains(&false) {
            return Err(Error::InvalidDeallocation {
                reason: format!(
                    "the {count} slots starting at slot {start} are not all reserved"
                ),
            });
        }

        slots.fill(false);

        self.occupied = self
            .occupied
            .checked_sub(count)
            .expect("guarded by the count check above");

        if start < self.first_free_hint {
            self.first_free_hint = start;
        }

        Ok(())
    }

    /// Returns the start of the first run of `count` free slots, searching from the hint.
    fn find_free_run(&self, count: usize) -> Option<usize> {
        if count == 0 || count > self.available() {
            return None;
        }

        let search_from = if self.occupied == 0 {
            0
        } else {
            self.first_free_hint
        };

        let mut run_start = search_from;
        let mut run_len: usize = 0;

        for (index, is_reserved) in self.reserved.iter().enumerate().skip(search_from) {
            if *is_reserved {
                run_len = 0;
                continue;
            }

            if run_len == 0 {
                run_start = index;
            }

            run_len = run_len
                .checked_add(1)
                .expect("a run cannot be longer than the block");

            if run_len == count {
                return Some(run_start);
            }
        }

        None
    }

    fn first_free_at_or_after(&self, index: usize) -> usize {
        self.reserved
            .iter()
            .skip(index)
            .position(|is_reserved| !is_reserved)
            .and_then(|position| index.checked_add(position))
            .unwrap_or(self.capacity())
    }

    fn index_of(&self, ptr: NonNull<T>) -> Option<usize> {
        if !self.is_inside(ptr) {
            return None;
        }

        let offset = ptr
            .as_ptr()
            .addr()
            .checked_sub(self.first_slot_ptr.as_ptr().addr())
            .expect("guarded by is_inside() above");

        let (index, remainder) = offset.div_rem(&size_of::<T>());

        (remainder == 0).then_some(index)
    }

    fn last_slot_offset(&self) -> usize {
        self.capacity()
            .checked_sub(1)
            .and_then(|last_index| last_index.checked_mul(size_of::<T>()))
            .expect("the storage layout was valid so the offset of the last slot must fit")
    }

    fn slot_ptr(&self, index: usize) -> NonNull<T> {
        assert!(
            index < self.capacity(),
            "slot {index} index out of bounds in block of {}",
            type_name::<T>()
        );

        // SAFETY: Guarded by the bounds check above, so the pointer stays within the storage
        // we allocated in the ctor.
        unsafe { self.first_slot_ptr.add(index) }
    }

    #[cfg_attr(test, mutants::skip)] // This is essentially test logic, mutation is meaningless.
    #[cfg(debug_assertions)]
    pub(crate) fn integrity_check(&self) {
        let observed_occupied = self.reserved.iter().filter(|is_reserved| **is_reserved).count();

        assert!(
            self.occupied == observed_occupied,
            "self.occupied {} does not match the observed reserved count {} in block of {}",
            self.occupied,
            observed_occupied,
            type_name::<T>()
        );

        assert!(
            self.first_free_hint <= self.capacity(),
            "self.first_free_hint {} is beyond the capacity {} of block of {}",
            self.first_free_hint,
            self.capacity,
            type_name::<T>()
        );

        assert!(
            self.reserved
                .iter()
                .take(self.first_free_hint)
                .all(|is_reserved| *is_reserved),
            "a slot before self.first_free_hint {} is free in block of {}",
            self.first_free_hint,
            type_name::<T>()
        );
    }
}

impl<T> fmt::Debug for Block<T> {
    #[cfg_attr(test, mutants::skip)] // No API contract to test.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("first_slot_ptr", &self.first_slot_ptr)
            .field("capacity", &self.capacity)
            .field("occupied", &self.occupied)
            .field("first_free_hint", &self.first_free_hint)
            .field("release_policy", &self.release_policy)
            .finish_non_exhaustive()
    }
}

impl<T> Drop for Block<T> {
    fn drop(&mut self) {
        let was_empty = self.is_empty();

        let layout =
            Self::layout(self.capacity).expect("the layout was calculable when the block was created");

        // SAFETY: The layout must match between alloc and dealloc. It does.
        unsafe {
            dealloc(self.first_slot_ptr.as_ptr().cast(), layout);
        }

        // We do this check at the end so we clean up the memory first.
        //
        // If we are already panicking, we do not want to panic again because that will
        // simply obscure whatever the original panic was, leading to debug difficulties.
        if self.release_policy == ReleasePolicy::MustNotReleaseReserved && !thread::panicking() {
            assert!(
                was_empty,
                "dropped a block of {} with reserved slots under a policy that says it must be empty when dropped",
                type_name::<T>()
            );
        }
    }
}

// SAFETY: Yes, there are raw pointers involved here but nothing inherently non-thread-mobile
// about it, so as long as T itself can move between threads, the block can do so, too.
unsafe impl<T: Send> Send for Block<T> {}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use new_zealand::nz;

    use super::*;

    fn block<T>(capacity: NonZero<usize>) -> Block<T> {
        Block::new(capacity, ReleasePolicy::MayReleaseReserved).unwrap()
    }

    fn index_of<T>(block: &Block<T>, ptr: NonNull<T>) -> usize {
        block.index_of(ptr).unwrap()
    }

    #[test]
    fn smoke_test() {
        let mut block = block::<u32>(nz!(10));

        let a = block.allocate(3).unwrap();
        let b = block.allocate(4).unwrap();

        assert_eq!(index_of(&block, a), 0);
        assert_eq!(index_of(&block, b), 3);
        assert_eq!(block.len(), 7);
        assert_eq!(block.available(), 3);

        block.deallocate(a, 3).unwrap();
        assert_eq!(block.len(), 4);

        block.deallocate(b, 4).unwrap();
        assert!(block.is_empty());
    }

    #[test]
    fn any_size_up_to_capacity_fits_in_empty_block() {
        for count in 1..=8 {
            let mut block = block::<u64>(nz!(8));

            let ptr = block.allocate(count).unwrap();

            assert!(block.is_inside(ptr));
            assert_eq!(block.len(), count);
            assert!((0..count).all(|index| block.is_reserved(index)));
            assert!((count..8).all(|index| !block.is_reserved(index)));
        }
    }

    #[test]
    fn storage_is_zeroed() {
        let mut block = block::<u64>(nz!(4));

        let ptr = block.allocate(4).unwrap();

        for index in 0..4 {
            // SAFETY: The slot is inside the run we just allocated and u64 is valid when zeroed.
            let value = unsafe { ptr.add(index).read() };
            assert_eq!(value, 0);
        }
    }

    #[test]
    fn deallocate_restores_state() {
        let mut block = block::<u16>(nz!(6));

        let keep = block.allocate(2).unwrap();
        let ptr = block.allocate(3).unwrap();
        assert_eq!(block.len(), 5);

        block.deallocate(ptr, 3).unwrap();

        assert_eq!(block.len(), 2);
        assert!(block.is_reserved(0));
        assert!(block.is_reserved(1));
        assert!((2..6).all(|index| !block.is_reserved(index)));

        block.deallocate(keep, 2).unwrap();
    }

    #[test]
    fn too_large_request_fails() {
        let mut block = block::<u32>(nz!(4));

        _ = block.allocate(3).unwrap();

        assert!(!block.can_allocate(2));
        assert_eq!(
            block.allocate(2),
            Err(Error::OutOfSpace {
                requested: 2,
                available: 1
            })
        );
        assert_eq!(block.len(), 3);
    }

    #[test]
    fn fragmented_request_fails() {
        let mut block = block::<u32>(nz!(6));

        // Fill the block with 1-slot allocations, then free every other one.
        let ptrs = (0..6)
            .map(|_| block.allocate(1).unwrap())
            .collect::<Vec<_>>();

        for ptr in ptrs.iter().step_by(2) {
            block.deallocate(*ptr, 1).unwrap();
        }

        // Three slots are free but no two of them are adjacent.
        assert_eq!(block.available(), 3);
        assert!(block.can_allocate(1));
        assert!(!block.can_allocate(2));
        assert!(matches!(block.allocate(2), Err(Error::OutOfSpace { .. })));
        assert!(matches!(block.allocate(3), Err(Error::OutOfSpace { .. })));
    }

    #[test]
    fn zero_count_allocation_fails() {
        let mut block = block::<u32>(nz!(4));

        assert!(!block.can_allocate(0));
        assert!(matches!(block.allocate(0), Err(Error::OutOfSpace { .. })));
    }

    #[test]
    fn freed_range_is_reused_first() {
        let mut block = block::<u32>(nz!(10));

        let first = block.allocate(3).unwrap();
        let _rest = block.allocate(7).unwrap();

        block.deallocate(first, 3).unwrap();

        let again = block.allocate(3).unwrap();
        assert_eq!(again, first);
        assert_eq!(block.available(), 0);
    }

    #[test]
    fn hint_advances_past_allocation_at_hint() {
        let mut block = block::<u32>(nz!(8));

        _ = block.allocate(2).unwrap();
        assert_eq!(block.first_free_hint, 2);

        _ = block.allocate(2).unwrap();
        assert_eq!(block.first_free_hint, 4);
    }

    #[test]
    fn hint_skips_reserved_slots_after_the_run() {
        let mut block = block::<u32>(nz!(8));

        let a = block.allocate(2).unwrap();
        let _b = block.allocate(2).unwrap();
        block.deallocate(a, 2).unwrap();
        assert_eq!(block.first_free_hint, 0);

        // Filling the hole lands right before the still-reserved slots 2 and 3.
        _ = block.allocate(2).unwrap();
        assert_eq!(block.first_free_hint, 4);
    }

    #[test]
    fn hint_stays_when_allocation_is_not_at_hint() {
        let mut block = block::<u32>(nz!(8));

        let a = block.allocate(1).unwrap();
        let _b = block.allocate(1).unwrap();
        block.deallocate(a, 1).unwrap();
        assert_eq!(block.first_free_hint, 0);

        // Does not fit in the hole at slot 0, so it goes after slot 1 and the hint stays.
        let c = block.allocate(3).unwrap();
        assert_eq!(index_of(&block, c), 2);
        assert_eq!(block.first_free_hint, 0);

        // The hole at the hint is still found.
        let d = block.allocate(1).unwrap();
        assert_eq!(index_of(&block, d), 0);
    }

    #[test]
    fn hint_is_capacity_when_full() {
        let mut block = block::<u32>(nz!(4));

        _ = block.allocate(4).unwrap();

        assert_eq!(block.first_free_hint, 4);
        assert!(!block.can_allocate(1));
    }

    #[test]
    fn deallocate_more_than_occupied_fails() {
        let mut block = block::<u32>(nz!(4));

        let ptr = block.allocate(2).unwrap();

        assert!(matches!(
            block.deallocate(ptr, 3),
            Err(Error::InvalidDeallocation { .. })
        ));
        assert_eq!(block.len(), 2);
    }

    #[test]
    fn deallocate_past_capacity_fails() {
        let mut block = block::<u32>(nz!(4));

        _ = block.allocate(2).unwrap();
        let last = block.allocate(2).unwrap();

        // SAFETY: Slot 3 is inside the block.
        let last_slot = unsafe { last.add(1) };

        assert!(matches!(
            block.deallocate(last_slot, 2),
            Err(Error::InvalidDeallocation { .. })
        ));
        assert_eq!(block.len(), 4);
    }

    #[test]
    fn deallocate_free_slots_fails() {
        let mut block = block::<u32>(nz!(4));

        let a = block.allocate(2).unwrap();
        block.deallocate(a, 1).unwrap();

        // Slot 0 is already free.
        assert!(matches!(
            block.deallocate(a, 1),
            Err(Error::InvalidDeallocation { .. })
        ));
        assert_eq!(block.len(), 1);
    }

    #[test]
    fn deallocate_misaligned_pointer_fails() {
        let mut block = block::<u32>(nz!(4));

        let ptr = block.allocate(2).unwrap();
        let misaligned =
            NonNull::new(ptr.as_ptr().cast::<u8>().wrapping_add(1).cast::<u32>()).unwrap();

        assert!(matches!(
            block.deallocate(misaligned, 1),
            Err(Error::InvalidDeallocation { .. })
        ));
    }

    #[test]
    fn deallocate_zero_is_noop() {
        let mut block = block::<u32>(nz!(4));

        let ptr = block.allocate(2).unwrap();
        block.deallocate(ptr, 0).unwrap();

        assert_eq!(block.len(), 2);
    }

    #[test]
    fn is_inside_covers_exactly_the_slots() {
        let mut block = block::<u64>(nz!(4));

        let first = block.allocate(1).unwrap();

        // SAFETY: Slot 3 is the last slot of the block.
        let last = unsafe { first.add(3) };
        let past_end = NonNull::new(last.as_ptr().wrapping_add(1)).unwrap();
        let before_start = NonNull::new(first.as_ptr().wrapping_sub(1)).unwrap();

        assert!(block.is_inside(first));
        assert!(block.is_inside(last));
        assert!(!block.is_inside(past_end));
        assert!(!block.is_inside(before_start));
    }

    #[test]
    fn pointer_from_other_block_is_not_inside() {
        let mut a = block::<u32>(nz!(4));
        let mut b = block::<u32>(nz!(4));

        let ptr = b.allocate(1).unwrap();

        assert!(!a.is_inside(ptr));
        assert!(matches!(
            a.deallocate(ptr, 1),
            Err(Error::InvalidDeallocation { .. })
        ));
        assert!(a.is_empty());
    }

    #[test]
    fn values_written_to_slots_survive() {
        let mut block = block::<u32>(nz!(4));

        let ptr = block.allocate(2).unwrap();

        // SAFETY: Both slots are inside the run we allocated.
        unsafe {
            ptr.write(42);
            ptr.add(1).write(43);
        }

        let other = block.allocate(2).unwrap();

        // SAFETY: Both slots are inside the run we allocated.
        unsafe {
            other.write(1);
            other.add(1).write(2);
        }

        // SAFETY: Still reserved, still initialized.
        unsafe {
            assert_eq!(ptr.read(), 42);
            assert_eq!(ptr.add(1).read(), 43);
        }
    }

    #[test]
    fn capacity_overflow_is_out_of_memory() {
        let result = Block::<u64>::new(nz!(usize::MAX), ReleasePolicy::MayReleaseReserved);

        assert_eq!(
            result.err(),
            Some(Error::OutOfMemory {
                requested: usize::MAX
            })
        );
    }

    #[test]
    fn unobtainable_reservation_flags_are_out_of_memory() {
        // The storage layout is valid for bytes, but neither the storage nor the flags fit in
        // any real address space.
        let capacity = NonZero::new(usize::try_from(isize::MAX).unwrap()).unwrap();

        let result = Block::<u8>::new(capacity, ReleasePolicy::MayReleaseReserved);

        assert_eq!(
            result.err(),
            Some(Error::OutOfMemory {
                requested: capacity.get()
            })
        );
    }

    #[test]
    #[should_panic]
    fn zst_is_panic() {
        drop(Block::<()>::new(nz!(3), ReleasePolicy::MayReleaseReserved));
    }

    #[test]
    #[should_panic]
    fn drop_reserved_with_forbidden_policy_panics() {
        let mut block =
            Block::<u32>::new(nz!(3), ReleasePolicy::MustNotReleaseReserved).unwrap();
        _ = block.allocate(1).unwrap();
    }

    #[test]
    fn drop_empty_with_forbidden_policy_ok() {
        let mut block =
            Block::<u32>::new(nz!(3), ReleasePolicy::MustNotReleaseReserved).unwrap();

        let ptr = block.allocate(3).unwrap();
        block.deallocate(ptr, 3).unwrap();
    }

    #[test]
    fn moves_between_threads() {
        let mut block = block::<u32>(nz!(4));
        _ = block.allocate(2).unwrap();

        let block = std::thread::spawn(move || {
            assert_eq!(block.len(), 2);
            block
        })
        .join()
        .unwrap();

        assert_eq!(block.available(), 2);
    }
}
