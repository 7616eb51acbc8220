use std::marker::PhantomData;
use std::num::NonZero;

use crate::{DEFAULT_BASE_BLOCK_SIZE, Memory, ReleasePolicy};

/// Builder for creating an instance of [`Memory`].
///
/// You only need to use this builder if you want to customize the pool configuration.
/// The default configuration used by [`Memory::new()`][1] is sufficient for many use cases.
///
/// # Examples
///
/// ```
/// use block_pool::{Memory, ReleasePolicy};
/// use new_zealand::nz;
///
/// let memory = Memory::<u32>::builder()
///     .base_block_size(nz!(256))
///     .release_policy(ReleasePolicy::MayReleaseReserved)
///     .build();
/// ```
///
/// [1]: Memory::new
#[must_use]
pub struct MemoryBuilder<T> {
    base_block_size: NonZero<usize>,
    release_policy: ReleasePolicy,

    _item: PhantomData<T>,
}

impl<T> std::fmt::Debug for MemoryBuilder<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBuilder")
            .field(
                "item_type",
                &std::format_args!("{}", std::any::type_name::<T>()),
            )
            .field("base_block_size", &self.base_block_size)
            .field("release_policy", &self.release_policy)
            .finish()
    }
}

impl<T> MemoryBuilder<T> {
    pub(crate) fn new() -> Self {
        Self {
            base_block_size: DEFAULT_BASE_BLOCK_SIZE,
            release_policy: ReleasePolicy::default(),
            _item: PhantomData,
        }
    }

    /// Sets the granularity of new blocks. Every block the pool creates holds a multiple of this
    /// many items, the smallest multiple that fits the request that caused the block to be
    /// created.
    ///
    /// Larger values mean fewer blocks (and fewer system allocations) at the cost of more unused
    /// capacity.
    ///
    /// # Examples
    ///
    /// ```
    /// use block_pool::Memory;
    /// use new_zealand::nz;
    ///
    /// let mut memory = Memory::<u64>::builder().base_block_size(nz!(8)).build();
    ///
    /// let ptr = memory.allocate(9)?;
    /// assert_eq!(memory.capacity(), 16);
    /// # memory.deallocate(ptr, 9)?;
    /// # Ok::<(), block_pool::Error>(())
    /// ```
    pub fn base_block_size(mut self, base_block_size: NonZero<usize>) -> Self {
        self.base_block_size = base_block_size;
        self
    }

    /// Sets the [release policy][ReleasePolicy] for the pool. This governs how to treat
    /// slots that are still reserved when the pool is dropped.
    ///
    /// # Examples
    ///
    /// ```
    /// use block_pool::{Memory, ReleasePolicy};
    ///
    /// let memory = Memory::<u32>::builder()
    ///     .release_policy(ReleasePolicy::MustNotReleaseReserved)
    ///     .build();
    /// ```
    pub fn release_policy(mut self, policy: ReleasePolicy) -> Self {
        self.release_policy = policy;
        self
    }

    /// Builds the pool with the specified configuration.
    ///
    /// No blocks are created until the first allocation.
    ///
    /// # Panics
    ///
    /// Panics if `T` is zero-sized.
    ///
    /// # Examples
    ///
    /// ```
    /// use block_pool::Memory;
    ///
    /// let memory = Memory::<u32>::builder().build();
    /// assert_eq!(memory.block_count(), 0);
    /// ```
    #[must_use]
    pub fn build(self) -> Memory<T> {
        Memory::new_inner(self.base_block_size, self.release_policy)
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use new_zealand::nz;

    use super::*;

    #[test]
    fn defaults() {
        let memory = MemoryBuilder::<u8>::new().build();

        assert_eq!(memory.base_block_size(), DEFAULT_BASE_BLOCK_SIZE);
    }

    #[test]
    fn debug_names_item_type() {
        let builder = Memory::<u16>::builder().base_block_size(nz!(3));

        let debug = format!("{builder:?}");
        assert!(debug.contains("u16"));
        assert!(debug.contains("base_block_size: 3"));
    }
}
