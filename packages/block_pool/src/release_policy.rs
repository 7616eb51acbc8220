/// Determines what happens when a pool is dropped while some of its slots are still reserved.
///
/// The pool only tracks slots, not the values stored in them, so it never drops values on its
/// own. Dropping the pool always releases the block storage. The policy only decides whether
/// doing so with outstanding reservations is considered a bug.
///
/// # Examples
///
/// ```
/// use block_pool::{Memory, ReleasePolicy};
///
/// let memory = Memory::<u64>::builder()
///     .release_policy(ReleasePolicy::MustNotReleaseReserved)
///     .build();
/// ```
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub enum ReleasePolicy {
    /// The pool releases its storage even if slots are still reserved. Any pointers the caller
    /// still holds become dangling. This is the default.
    #[default]
    MayReleaseReserved,

    /// The pool will panic if it still has reserved slots when it is dropped.
    ///
    /// This may be valuable when the caller wants to catch leaked or forgotten allocations,
    /// e.g. a container that failed to return its storage before the pool went away.
    MustNotReleaseReserved,
}
