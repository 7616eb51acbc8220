use std::any::type_name;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::ptr::{self, NonNull};
use std::slice;

use crate::{Result, SlotAllocator, SystemAllocator};

/// Capacity of the first storage a `BlockVec` obtains when it needs to grow from nothing.
const START_CAPACITY: usize = 8;

/// A growable array that obtains its storage from a [`SlotAllocator`].
///
/// This works like a minimal `Vec`: items are stored contiguously and the storage doubles in
/// size when it runs out of room. The difference is that every storage request goes through the
/// allocator `A`, which makes it easy to back the array with a
/// [`BlockAllocator`][crate::BlockAllocator].
///
/// Items are accessed through the slice API (`BlockVec<T>` dereferences to `[T]`), which also
/// provides iteration, indexing and bounds-checked [`get()`][slice::get].
///
/// The array writes items into the storage it receives and hands out slices over it without
/// further checks. This is sound because [`SlotAllocator`] is an `unsafe` trait whose
/// implementations guarantee that the storage is valid for the requested number of items until
/// it is returned.
///
/// # Example
///
/// ```
/// use block_pool::{BlockAllocator, BlockVec};
///
/// let mut numbers = BlockVec::<u32, BlockAllocator<u32, 10>>::new();
///
/// for i in 0..10 {
///     numbers.push(i);
/// }
///
/// assert_eq!(numbers.len(), 10);
/// assert_eq!(numbers[3], 3);
/// assert_eq!(numbers.get(10), None);
/// assert_eq!(numbers.iter().sum::<u32>(), 45);
/// ```
pub struct BlockVec<T, A: SlotAllocator<T> = SystemAllocator<T>> {
    /// Dangling while `capacity` is zero.
    storage: NonNull<T>,

    /// The first `len` slots of the storage hold initialized items.
    len: usize,

    capacity: usize,

    allocator: A,
}

impl<T, A: SlotAllocator<T> + Default> BlockVec<T, A> {
    /// Creates an empty array with a default-constructed allocator.
    ///
    /// No storage is obtained until the first item is added.
    #[must_use]
    pub fn new() -> Self {
        Self::new_in(A::default())
    }

    /// Creates an array of `len` clones of `value` with a default-constructed allocator.
    ///
    /// # Panics
    ///
    /// Panics if the allocator cannot provide the storage.
    #[must_use]
    pub fn with_len(len: usize, value: &T) -> Self
    where
        T: Clone,
    {
        Self::with_len_in(len, value, A::default())
    }
}

impl<T, A: SlotAllocator<T>> BlockVec<T, A> {
    /// Creates an empty array that obtains its storage from `allocator`.
    #[must_use]
    pub fn new_in(allocator: A) -> Self {
        Self {
            storage: NonNull::dangling(),
            len: 0,
            capacity: 0,
            allocator,
        }
    }

    /// Creates an array of `len` clones of `value` that obtains its storage from `allocator`.
    ///
    /// The capacity is `len` or the starting capacity of 8, whichever is larger.
    ///
    /// # Panics
    ///
    /// Panics if the allocator cannot provide the storage.
    #[must_use]
    pub fn with_len_in(len: usize, value: &T, allocator: A) -> Self
    where
        T: Clone,
    {
        let mut result = Self::new_in(allocator);
        result.reserve(len.max(START_CAPACITY));
        result.resize(len, value);
        result
    }

    /// The number of items in the array.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the array holds no items.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The number of items the array can hold without obtaining new storage.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The allocator the array obtains its storage from.
    #[must_use]
    pub fn allocator(&self) -> &A {
        &self.allocator
    }

    /// Appends an item to the end of the array, growing the storage if it is full.
    ///
    /// # Panics
    ///
    /// Panics if the allocator cannot provide the storage.
    pub fn push(&mut self, value: T) {
        self.try_push(value)
            .expect("allocator failed to provide storage for BlockVec");
    }

    /// Appends an item to the end of the array, growing the storage if it is full.
    ///
    /// # Errors
    ///
    /// Returns the allocator error if the storage needed to grow and could not be obtained.
    /// The array is unchanged in that case and `value` is dropped.
    pub fn try_push(&mut self, value: T) -> Result<()> {
        if self.len == self.capacity {
            let new_capacity = if self.capacity == 0 {
                START_CAPACITY
            } else {
                self.capacity
                    .checked_mul(2)
                    .expect("capacity cannot overflow before the address space runs out")
            };

            self.try_reserve(new_capacity)?;
        }

        // SAFETY: The slot at `len` is inside the storage (len < capacity) and holds no value.
        unsafe {
            self.allocator.construct(self.slot_ptr(self.len), value);
        }

        self.len = self
            .len
            .checked_add(1)
            .expect("guarded by len < capacity above");

        Ok(())
    }

    /// Grows the storage so it can hold `new_capacity` items. Does nothing if the capacity is
    /// already at least `new_capacity`.
    ///
    /// # Panics
    ///
    /// Panics if the allocator cannot provide the storage.
    pub fn reserve(&mut self, new_capacity: usize) {
        self.try_reserve(new_capacity)
            .expect("allocator failed to provide storage for BlockVec");
    }

    /// Grows the storage so it can hold `new_capacity` items. Does nothing if the capacity is
    /// already at least `new_capacity`.
    ///
    /// The items are moved into the new storage and the old storage is returned to the
    /// allocator.
    ///
    /// # Errors
    ///
    /// Returns the allocator error if the new storage cannot be obtained, in which case the
    /// array is unchanged, or if the allocator rejects the return of the old storage, in which
    /// case the array already uses the new storage.
    pub fn try_reserve(&mut self, new_capacity: usize) -> Result<()> {
        if new_capacity <= self.capacity {
            return Ok(());
        }

        let new_storage = self.allocator.allocate(new_capacity)?;

        // SAFETY: The new storage has room for `new_capacity > len` items and cannot overlap
        // the old storage, which is still reserved. The items are moved, so the old slots are
        // treated as uninitialized from here on.
        unsafe {
            ptr::copy_nonoverlapping(self.storage.as_ptr(), new_storage.as_ptr(), self.len);
        }

        let old_storage = self.storage;
        let old_capacity = self.capacity;

        self.storage = new_storage;
        self.capacity = new_capacity;

        if old_capacity == 0 {
            return Ok(());
        }

        // SAFETY: The old storage came from this allocator with this capacity and its items
        // were moved out.
        unsafe { self.allocator.deallocate(old_storage, old_capacity) }
    }

    /// Changes the number of items to `new_len`, appending clones of `value` or dropping items
    /// from the end as needed.
    ///
    /// # Panics
    ///
    /// Panics if the allocator cannot provide the storage.
    pub fn resize(&mut self, new_len: usize, value: &T)
    where
        T: Clone,
    {
        self.reserve(new_len);

        while self.len < new_len {
            // SAFETY: `len < new_len <= capacity`, and the slot at `len` holds no value.
            unsafe {
                self.allocator
                    .construct(self.slot_ptr(self.len), value.clone());
            }

            self.len = self
                .len
                .checked_add(1)
                .expect("guarded by len < new_len above");
        }

        while self.len > new_len {
            self.len = self
                .len
                .checked_sub(1)
                .expect("guarded by len > new_len above");

            // SAFETY: The slot held the last item, which we just removed from the array.
            unsafe {
                self.allocator.destroy(self.slot_ptr(self.len));
            }
        }
    }

    /// Drops all items, keeping the storage.
    pub fn clear(&mut self) {
        while let Some(last) = self.len.checked_sub(1) {
            self.len = last;

            // SAFETY: The slot held the last item, which we just removed from the array.
            unsafe {
                self.allocator.destroy(self.slot_ptr(last));
            }
        }
    }

    fn slot_ptr(&self, index: usize) -> NonNull<T> {
        assert!(
            index < self.capacity,
            "slot {index} index out of bounds in BlockVec of {}",
            type_name::<T>()
        );

        // SAFETY: Guarded by the bounds check above, so the pointer stays within the storage.
        unsafe { self.storage.add(index) }
    }
}

impl<T, A: SlotAllocator<T> + Default> Default for BlockVec<T, A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, A: SlotAllocator<T>> Deref for BlockVec<T, A> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        // SAFETY: The first `len` slots hold initialized items and the storage is well-aligned
        // (or dangling with `len == 0`).
        unsafe { slice::from_raw_parts(self.storage.as_ptr(), self.len) }
    }
}

impl<T, A: SlotAllocator<T>> DerefMut for BlockVec<T, A> {
    fn deref_mut(&mut self) -> &mut [T] {
        // SAFETY: The first `len` slots hold initialized items and the storage is well-aligned
        // (or dangling with `len == 0`). We hold an exclusive reference to the array.
        unsafe { slice::from_raw_parts_mut(self.storage.as_ptr(), self.len) }
    }
}

impl<'a, T, A: SlotAllocator<T>> IntoIterator for &'a BlockVec<T, A> {
    type Item = &'a T;
    type IntoIter = slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<'a, T, A: SlotAllocator<T>> IntoIterator for &'a mut BlockVec<T, A> {
    type Item = &'a mut T;
    type IntoIter = slice::IterMut<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter_mut()
    }
}

impl<T: Clone, A: SlotAllocator<T> + Default> Clone for BlockVec<T, A> {
    fn clone(&self) -> Self {
        let mut result = Self::new();
        result.reserve(self.capacity);

        for item in self {
            result.push(item.clone());
        }

        result
    }
}

impl<T: fmt::Debug, A: SlotAllocator<T>> fmt::Debug for BlockVec<T, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

impl<T, A: SlotAllocator<T>> Drop for BlockVec<T, A> {
    fn drop(&mut self) {
        self.clear();

        if self.capacity == 0 {
            return;
        }

        // SAFETY: The storage came from this allocator with this capacity and holds no items
        // anymore.
        unsafe { self.allocator.deallocate(self.storage, self.capacity) }
            .expect("storage was obtained from this allocator with this exact capacity");
    }
}

// SAFETY: The array owns its items and its allocator, so it can move between threads as long
// as they can.
unsafe impl<T: Send, A: SlotAllocator<T> + Send> Send for BlockVec<T, A> {}
