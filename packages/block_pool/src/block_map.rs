use std::cmp::Ordering;
use std::fmt;
use std::iter::FusedIterator;
use std::marker::PhantomData;
use std::mem;
use std::ptr::NonNull;

use crate::{Result, SlotAllocator, SystemAllocator};

/// One entry of a [`BlockMap`], the unit of storage the map obtains from its allocator.
///
/// Each node is stored in its own single-slot allocation, so an allocator for a map is an
/// allocator of `MapNode<K, V>`.
#[derive(Debug)]
pub struct MapNode<K, V> {
    key: K,
    value: V,
    next: Option<NonNull<MapNode<K, V>>>,
}

// SAFETY: A node is only reachable through the map that owns it, so its link does not allow
// sharing anything across threads. It can move between threads if its key and value can.
unsafe impl<K: Send, V: Send> Send for MapNode<K, V> {}

/// An ordered map that obtains the storage for every entry separately from a [`SlotAllocator`].
///
/// Entries are kept in a singly linked list sorted by key, which makes lookups and insertions
/// linear in the number of entries. The point of the map is its storage pattern: every insert
/// allocates exactly one node and every removal releases exactly one node, which is the usage a
/// [`BlockAllocator`][crate::BlockAllocator] is built for.
///
/// Like [`BlockVec`][crate::BlockVec], the map relies on the storage guarantees of the `unsafe`
/// [`SlotAllocator`] trait when it accesses its nodes.
///
/// # Example
///
/// ```
/// use block_pool::{BlockAllocator, BlockMap, MapNode};
///
/// let mut squares = BlockMap::<u32, u64, BlockAllocator<MapNode<u32, u64>, 5>>::new();
///
/// for i in (0..10).rev() {
///     squares.insert(i, u64::from(i * i));
/// }
///
/// assert_eq!(squares.get(&7), Some(&49));
/// assert_eq!(squares.remove(&7), Some(49));
/// assert_eq!(squares.get(&7), None);
///
/// // Iteration is in key order, whatever the insertion order was.
/// assert_eq!(squares.keys().copied().take(3).collect::<Vec<_>>(), [0, 1, 2]);
///
/// // Ten single-node allocations at a granularity of 5 created two blocks.
/// assert_eq!(squares.allocator().memory().block_count(), 2);
/// ```
pub struct BlockMap<K, V, A: SlotAllocator<MapNode<K, V>> = SystemAllocator<MapNode<K, V>>> {
    /// The node with the smallest key.
    head: Option<NonNull<MapNode<K, V>>>,

    len: usize,

    allocator: A,
}

impl<K, V, A: SlotAllocator<MapNode<K, V>> + Default> BlockMap<K, V, A> {
    /// Creates an empty map with a default-constructed allocator.
    #[must_use]
    pub fn new() -> Self {
        Self::new_in(A::default())
    }
}

impl<K, V, A: SlotAllocator<MapNode<K, V>>> BlockMap<K, V, A> {
    /// Creates an empty map that obtains the storage for its entries from `allocator`.
    #[must_use]
    pub fn new_in(allocator: A) -> Self {
        Self {
            head: None,
            len: 0,
            allocator,
        }
    }

    /// The number of entries in the map.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the map has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The allocator the map obtains its node storage from.
    #[must_use]
    pub fn allocator(&self) -> &A {
        &self.allocator
    }

    /// Iterates over the entries in ascending key order.
    pub fn iter(&self) -> BlockMapIter<'_, K, V> {
        BlockMapIter {
            next: self.head,
            remaining: self.len,
            _map: PhantomData,
        }
    }

    /// Iterates over the keys in ascending order.
    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.iter().map(|(key, _)| key)
    }

    /// Iterates over the values in ascending key order.
    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.iter().map(|(_, value)| value)
    }

    /// Removes all entries and returns the storage of every node to the allocator.
    pub fn clear(&mut self) {
        let mut next = self.head.take();

        while let Some(node) = next {
            // SAFETY: The node is part of the list, so it is initialized and owned by the map.
            next = unsafe { node.as_ref().next };

            self.len = self
                .len
                .checked_sub(1)
                .expect("every node in the list is counted in len");

            // SAFETY: The node is no longer reachable from the list, so nothing uses it again.
            unsafe {
                self.allocator.destroy(node);
            }

            self.release_node(node);
        }
    }

    fn release_node(&mut self, node: NonNull<MapNode<K, V>>) {
        // SAFETY: Every node was obtained from this allocator with a count of 1 and its value
        // has been dropped or moved out by the caller.
        unsafe { self.allocator.deallocate(node, 1) }
            .expect("node storage was obtained from this allocator as a single slot");
    }
}

impl<K: Ord, V, A: SlotAllocator<MapNode<K, V>>> BlockMap<K, V, A> {
    /// Inserts an entry, returning the previous value if the key was already present.
    ///
    /// A new key takes one node from the allocator. An existing key keeps its node.
    ///
    /// # Panics
    ///
    /// Panics if the allocator cannot provide storage for a new node.
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        self.try_insert(key, value)
            .expect("allocator failed to provide storage for a BlockMap node")
    }

    /// Inserts an entry, returning the previous value if the key was already present.
    ///
    /// # Errors
    ///
    /// Returns the allocator error if the key is new and the storage for its node could not be
    /// obtained. The map is unchanged in that case.
    pub fn try_insert(&mut self, key: K, value: V) -> Result<Option<V>> {
        let mut link = &raw mut self.head;

        // SAFETY: `link` points either at `head` or at the `next` field of a node in the list,
        // and we hold an exclusive reference to the map.
        while let Some(mut node) = unsafe { *link } {
            // SAFETY: The node is part of the list, so it is initialized and owned by the map.
            let node = unsafe { node.as_mut() };

            match node.key.cmp(&key) {
                Ordering::Less => link = &raw mut node.next,
                Ordering::Equal => return Ok(Some(mem::replace(&mut node.value, value))),
                Ordering::Greater => break,
            }
        }

        let new_node = self.allocator.allocate(1)?;

        // SAFETY: The slot was just obtained from the allocator and holds no value. `link` is
        // still valid because allocating does not touch the list.
        unsafe {
            self.allocator.construct(
                new_node,
                MapNode {
                    key,
                    value,
                    next: *link,
                },
            );
            *link = Some(new_node);
        }

        self.len = self
            .len
            .checked_add(1)
            .expect("cannot hold more nodes than fit in the address space");

        Ok(None)
    }

    /// Whether the map has an entry for `key`.
    #[must_use]
    pub fn contains_key(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    /// The value for `key`, if any.
    #[must_use]
    pub fn get(&self, key: &K) -> Option<&V> {
        for (candidate, value) in self {
            match candidate.cmp(key) {
                Ordering::Less => {}
                Ordering::Equal => return Some(value),
                Ordering::Greater => return None,
            }
        }

        None
    }

    /// The value for `key`, if any, for modification in place.
    #[must_use]
    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        let mut next = self.head;

        while let Some(mut node) = next {
            // SAFETY: The node is part of the list and we hold an exclusive reference to the
            // map, so no other reference to the node exists.
            let node = unsafe { node.as_mut() };

            match node.key.cmp(key) {
                Ordering::Less => next = node.next,
                Ordering::Equal => return Some(&mut node.value),
                Ordering::Greater => return None,
            }
        }

        None
    }

    /// Removes the entry for `key` and returns its value, releasing the node to the allocator.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let mut link = &raw mut self.head;

        // SAFETY: `link` points either at `head` or at the `next` field of a node in the list,
        // and we hold an exclusive reference to the map.
        while let Some(mut node) = unsafe { *link } {
            // SAFETY: The node is part of the list, so it is initialized and owned by the map.
            let node_ref = unsafe { node.as_mut() };

            match node_ref.key.cmp(key) {
                Ordering::Less => link = &raw mut node_ref.next,
                Ordering::Equal => {
                    // SAFETY: We unlink the node right below, so the moved-out value is never
                    // read through the list again.
                    let removed = unsafe { node.read() };

                    // SAFETY: See the loop condition.
                    unsafe {
                        *link = removed.next;
                    }

                    self.len = self
                        .len
                        .checked_sub(1)
                        .expect("every node in the list is counted in len");

                    self.release_node(node);

                    return Some(removed.value);
                }
                Ordering::Greater => return None,
            }
        }

        None
    }
}

impl<K, V, A: SlotAllocator<MapNode<K, V>> + Default> Default for BlockMap<K, V, A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a, K, V, A: SlotAllocator<MapNode<K, V>>> IntoIterator for &'a BlockMap<K, V, A> {
    type Item = (&'a K, &'a V);
    type IntoIter = BlockMapIter<'a, K, V>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<K: fmt::Debug, V: fmt::Debug, A: SlotAllocator<MapNode<K, V>>> fmt::Debug
    for BlockMap<K, V, A>
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

impl<K, V, A: SlotAllocator<MapNode<K, V>>> Drop for BlockMap<K, V, A> {
    fn drop(&mut self) {
        self.clear();
    }
}

// SAFETY: The map owns its nodes and its allocator, so it can move between threads as long as
// they can.
unsafe impl<K: Send, V: Send, A: SlotAllocator<MapNode<K, V>> + Send> Send for BlockMap<K, V, A> {}

/// Iterator over the entries of a [`BlockMap`] in ascending key order.
pub struct BlockMapIter<'a, K, V> {
    next: Option<NonNull<MapNode<K, V>>>,
    remaining: usize,

    _map: PhantomData<&'a MapNode<K, V>>,
}

impl<'a, K, V> Iterator for BlockMapIter<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.next?;

        // SAFETY: The map is borrowed for 'a, so its nodes stay alive and unmodified.
        let node = unsafe { node.as_ref() };

        self.next = node.next;
        self.remaining = self
            .remaining
            .checked_sub(1)
            .expect("the list cannot be longer than len");

        Some((&node.key, &node.value))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<K, V> ExactSizeIterator for BlockMapIter<'_, K, V> {}

impl<K, V> FusedIterator for BlockMapIter<'_, K, V> {}

impl<K, V> fmt::Debug for BlockMapIter<'_, K, V> {
    #[cfg_attr(test, mutants::skip)] // No API contract to test.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockMapIter")
            .field("remaining", &self.remaining)
            .finish_non_exhaustive()
    }
}
