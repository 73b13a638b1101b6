use std::num::NonZero;
use std::ptr::NonNull;
use std::thread;

use new_zealand::nz;
use tracing::{debug, trace, warn};

use crate::{ChunkAllocatorBuilder, ChunkSlab, DropPolicy, Error, Result, SlabStats};

/// Alignment of every slab buffer when the chunk size is given as a plain byte count.
///
/// This matches the fundamental alignment of the common system allocators, so chunks whose
/// size is a multiple of 16 are suitable for any ordinary type.
pub(crate) const DEFAULT_CHUNK_ALIGN: usize = 16;

/// Number of chunks in the first slab if the builder is not told otherwise.
#[cfg(not(miri))]
pub(crate) const DEFAULT_INITIAL_CAPACITY: NonZero<usize> = nz!(128);

// Under Miri, we use a smaller slab capacity because Miri test runtime scales by memory usage.
#[cfg(miri)]
pub(crate) const DEFAULT_INITIAL_CAPACITY: NonZero<usize> = nz!(16);

pub(crate) const DEFAULT_GROWTH_FACTOR: NonZero<usize> = nz!(2);

/// A pool of fixed-size memory chunks backed by a chain of slabs.
///
/// The allocator reserves memory for many chunks of one size at a time and hands out the
/// individual chunks as raw pointers, avoiding a trip to the system allocator for every object.
/// It is intended for programs that create and destroy many records of the same size, such as
/// list nodes, hash table buckets or tree nodes.
///
/// # Growth
///
/// The allocator starts with a single slab. When every slab in the chain is exhausted, a new
/// slab is appended whose capacity is the capacity of the previous last slab multiplied by the
/// [growth factor][ChunkAllocatorBuilder::growth_factor] (2 by default), so the chain holds
/// `c`, `2c`, `4c`, … chunks. Slabs are never removed individually; all memory is returned to
/// the system when the allocator is [destroyed][Self::destroy] or dropped.
///
/// Acquiring prefers the earliest slab in the chain that has a free chunk, concentrating traffic
/// near the head of the chain.
///
/// # Out of band access
///
/// The allocator never reads or writes chunk memory. Chunks are plain bytes and the caller is
/// responsible for initializing them before use and for any cleanup of the values stored in
/// them. A chunk pointer remains valid until the chunk is [released][Self::release], the
/// allocator is [reset][Self::reset] or the allocator is destroyed.
///
/// # Destroyed state
///
/// After [`destroy()`](Self::destroy) the allocator owns no memory. Acquiring from it yields no
/// chunk and releasing to it, resetting it or destroying it again does nothing.
///
/// # Examples
///
/// ```
/// use chunk_pool::ChunkAllocator;
/// use new_zealand::nz;
///
/// let mut allocator = ChunkAllocator::new(nz!(100), nz!(size_of::<u64>())).unwrap();
///
/// let chunk = allocator.acquire().unwrap().cast::<u64>();
///
/// // SAFETY: Chunks are 8 bytes apart in a 16-byte aligned buffer, so this one fits a u64.
/// unsafe {
///     chunk.write(42);
///     assert_eq!(chunk.read(), 42);
/// }
///
/// // SAFETY: The chunk came from this allocator and is not used after this call.
/// unsafe {
///     allocator.release(chunk.cast());
/// }
///
/// allocator.destroy();
/// assert!(allocator.acquire().is_none());
/// ```
///
/// # Thread safety
///
/// The allocator is thread-mobile ([`Send`]) and can be moved between threads, but it is not
/// thread-safe ([`Sync`]). There is no internal locking; sharing an allocator between threads
/// requires external synchronization such as a `Mutex`.
#[derive(Debug)]
pub struct ChunkAllocator {
    /// The chain of slabs, head first. Appended to when every slab is exhausted.
    ///
    /// This is empty if and only if the allocator has been destroyed.
    slabs: Vec<ChunkSlab>,

    chunk_size: NonZero<usize>,
    chunk_align: usize,
    growth_factor: NonZero<usize>,
    drop_policy: DropPolicy,
}

impl ChunkAllocator {
    /// Creates an allocator whose first slab holds `capacity` chunks of `chunk_size` bytes.
    ///
    /// Uses the default growth factor and drop policy. Use [`builder()`](Self::builder) to
    /// configure these or to derive the chunk size from a type.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfMemory`] if the first slab cannot be reserved and
    /// [`Error::CapacityOverflow`] if its size exceeds the addressable memory.
    /// No memory remains reserved in either case.
    ///
    /// # Examples
    ///
    /// ```
    /// use chunk_pool::ChunkAllocator;
    /// use new_zealand::nz;
    ///
    /// let allocator = ChunkAllocator::new(nz!(100), nz!(24)).unwrap();
    ///
    /// assert_eq!(allocator.slab_count(), 1);
    /// assert_eq!(allocator.capacity(), 100);
    /// assert!(allocator.is_empty());
    /// ```
    pub fn new(capacity: NonZero<usize>, chunk_size: NonZero<usize>) -> Result<Self> {
        Self::builder()
            .chunk_size(chunk_size)
            .initial_capacity(capacity)
            .build()
    }

    /// Creates a builder for configuring and constructing a [`ChunkAllocator`].
    #[inline]
    pub fn builder() -> ChunkAllocatorBuilder {
        ChunkAllocatorBuilder::new()
    }

    pub(crate) fn new_inner(
        initial_capacity: NonZero<usize>,
        chunk_size: NonZero<usize>,
        chunk_align: usize,
        growth_factor: NonZero<usize>,
        drop_policy: DropPolicy,
    ) -> Result<Self> {
        let head = ChunkSlab::new(initial_capacity, chunk_size, chunk_align).inspect_err(|e| {
            warn!(
                capacity = initial_capacity.get(),
                chunk_size = chunk_size.get(),
                error = %e,
                "failed to reserve first slab of chunk allocator"
            );
        })?;

        debug!(
            capacity = initial_capacity.get(),
            chunk_size = chunk_size.get(),
            chunk_align,
            growth_factor = growth_factor.get(),
            "created chunk allocator"
        );

        Ok(Self {
            slabs: vec![head],
            chunk_size,
            chunk_align,
            growth_factor,
            drop_policy,
        })
    }

    /// Size in bytes of every chunk handed out by this allocator.
    #[must_use]
    #[inline]
    pub fn chunk_size(&self) -> usize {
        self.chunk_size.get()
    }

    /// Alignment in bytes of every slab buffer.
    ///
    /// Chunks are aligned to this value if the chunk size is a multiple of it, which is always
    /// the case when the allocator was configured from a layout.
    #[must_use]
    #[inline]
    pub fn chunk_align(&self) -> usize {
        self.chunk_align
    }

    /// Factor by which each appended slab is larger than the slab before it.
    #[must_use]
    #[inline]
    pub fn growth_factor(&self) -> usize {
        self.growth_factor.get()
    }

    /// What happens when the allocator is destroyed with chunks still outstanding.
    #[must_use]
    #[inline]
    pub fn drop_policy(&self) -> DropPolicy {
        self.drop_policy
    }

    /// Whether [`destroy()`](Self::destroy) has been called on this allocator.
    #[must_use]
    #[inline]
    pub fn is_destroyed(&self) -> bool {
        self.slabs.is_empty()
    }

    /// Number of slabs in the chain. Zero after the allocator has been destroyed.
    #[must_use]
    #[inline]
    pub fn slab_count(&self) -> usize {
        self.slabs.len()
    }

    /// Snapshots of every slab in the chain, head first.
    ///
    /// # Examples
    ///
    /// ```
    /// use chunk_pool::ChunkAllocator;
    /// use new_zealand::nz;
    ///
    /// let mut allocator = ChunkAllocator::new(nz!(2), nz!(8)).unwrap();
    ///
    /// for _ in 0..3 {
    ///     allocator.acquire().unwrap();
    /// }
    ///
    /// let slabs = allocator
    ///     .slabs()
    ///     .map(|s| (s.capacity(), s.free_count()))
    ///     .collect::<Vec<_>>();
    ///
    /// assert_eq!(slabs, vec![(2, 0), (4, 3)]);
    /// ```
    pub fn slabs(&self) -> impl Iterator<Item = SlabStats> + '_ {
        self.slabs.iter().map(ChunkSlab::stats)
    }

    /// Total number of chunks across all slabs, whether outstanding or available.
    #[must_use]
    pub fn capacity(&self) -> usize {
        // Overflow would imply the chain is larger than virtual memory.
        self.slabs
            .iter()
            .fold(0_usize, |total, slab| total.wrapping_add(slab.capacity().get()))
    }

    /// Number of chunks currently handed out to the caller.
    #[must_use]
    #[cfg_attr(test, mutants::skip)] // Can be mutated to infinitely growing memory use and/or infinite loop.
    pub fn len(&self) -> usize {
        self.slabs
            .iter()
            .fold(0_usize, |total, slab| total.wrapping_add(slab.used_count()))
    }

    /// Whether no chunks are currently handed out to the caller.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slabs.iter().all(ChunkSlab::is_fully_stocked)
    }

    /// Acquires a chunk, appending a new slab to the chain if every slab is exhausted.
    ///
    /// Returns `None` if the allocator has been destroyed or if a new slab was needed but
    /// could not be reserved. Use [`try_acquire()`](Self::try_acquire) to tell these apart.
    ///
    /// The chunk contents are unspecified: a chunk may still hold bytes written before it
    /// was last released or before the allocator was reset.
    #[must_use]
    pub fn acquire(&mut self) -> Option<NonNull<u8>> {
        self.try_acquire().ok()
    }

    /// Acquires a chunk, appending a new slab to the chain if every slab is exhausted.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Destroyed`] if the allocator has been destroyed. Returns
    /// [`Error::OutOfMemory`], [`Error::CapacityOverflow`] or [`Error::GrowthOverflow`] if a
    /// new slab was needed but could not be reserved, in which case the chain is left
    /// unchanged.
    ///
    /// # Examples
    ///
    /// ```
    /// use chunk_pool::{ChunkAllocator, Error};
    /// use new_zealand::nz;
    ///
    /// let mut allocator = ChunkAllocator::new(nz!(1), nz!(64)).unwrap();
    ///
    /// let first = allocator.try_acquire().unwrap();
    /// let second = allocator.try_acquire().unwrap();
    /// assert_ne!(first, second);
    /// assert_eq!(allocator.slab_count(), 2);
    ///
    /// allocator.destroy();
    /// assert!(matches!(allocator.try_acquire(), Err(Error::Destroyed)));
    /// ```
    pub fn try_acquire(&mut self) -> Result<NonNull<u8>> {
        if self.is_destroyed() {
            return Err(Error::Destroyed);
        }

        let slab_index = match self.slabs.iter().position(|slab| !slab.is_exhausted()) {
            Some(index) => index,
            None => self.grow()?,
        };

        let slab = self
            .slabs
            .get_mut(slab_index)
            .expect("we just found or appended a slab with a free chunk at this index");

        Ok(slab.pop())
    }

    /// Appends a slab to the tail of the chain and returns its index.
    ///
    /// The new capacity is derived from the current tail slab, not from the chain as a whole.
    #[cfg_attr(test, mutants::skip)] // Can be mutated to infinitely growing memory use.
    fn grow(&mut self) -> Result<usize> {
        let tail_capacity = self
            .slabs
            .last()
            .ok_or(Error::Destroyed)?
            .capacity();

        let capacity = tail_capacity.checked_mul(self.growth_factor).ok_or(
            Error::GrowthOverflow {
                tail_capacity: tail_capacity.get(),
                growth_factor: self.growth_factor.get(),
            },
        )?;

        // Reserve the chain entry first so that a failure cannot leave an unlinked slab behind.
        let slab = self
            .slabs
            .try_reserve(1)
            .map_err(|_e| Error::OutOfMemory {
                bytes: size_of::<ChunkSlab>(),
            })
            .and_then(|()| ChunkSlab::new(capacity, self.chunk_size, self.chunk_align))
            .inspect_err(|e| {
                warn!(
                    capacity = capacity.get(),
                    chunk_size = self.chunk_size.get(),
                    error = %e,
                    "failed to grow chunk allocator"
                );
            })?;

        // Never reallocates, we reserved room for it above.
        self.slabs.push(slab);

        // Cannot underflow, we just pushed a slab.
        let slab_index = self.slabs.len().wrapping_sub(1);

        debug!(
            slab_index,
            capacity = capacity.get(),
            chunk_size = self.chunk_size.get(),
            "appended slab to chunk allocator"
        );

        Ok(slab_index)
    }

    /// Returns a chunk to the allocator, making it available to future acquisitions.
    ///
    /// The chunk is parked in the first slab of the chain that has room for it, which is not
    /// necessarily the slab whose buffer contains it. Does nothing if the allocator has been
    /// destroyed.
    ///
    /// The pointer is not validated in any way.
    ///
    /// # Panics
    ///
    /// Panics if every slab is already fully stocked, which means more chunks were released
    /// than were ever acquired.
    ///
    /// # Safety
    ///
    /// The caller must ensure that:
    /// - `chunk` was returned by an acquisition from this allocator after its most recent reset.
    /// - `chunk` has not been released since it was acquired.
    /// - `chunk` is not accessed after this call.
    pub unsafe fn release(&mut self, chunk: NonNull<u8>) {
        if self.is_destroyed() {
            return;
        }

        let slab = self
            .slabs
            .iter_mut()
            .find(|slab| !slab.is_fully_stocked())
            .expect("released more chunks than were acquired - every slab in the chain is fully stocked");

        slab.push(chunk);

        #[cfg(debug_assertions)]
        self.integrity_check();
    }

    /// Marks every chunk of every slab as available again.
    ///
    /// No memory is returned to the system and the chunk contents are not modified. Every
    /// chunk pointer previously handed out becomes invalid to use, as its chunk may be handed
    /// out again. Does nothing if the allocator has been destroyed.
    ///
    /// # Examples
    ///
    /// ```
    /// use chunk_pool::ChunkAllocator;
    /// use new_zealand::nz;
    ///
    /// let mut allocator = ChunkAllocator::new(nz!(10), nz!(16)).unwrap();
    ///
    /// for _ in 0..25 {
    ///     allocator.acquire().unwrap();
    /// }
    /// assert_eq!(allocator.len(), 25);
    ///
    /// allocator.reset();
    ///
    /// assert!(allocator.is_empty());
    /// assert_eq!(allocator.capacity(), 30);
    /// ```
    pub fn reset(&mut self) {
        for slab in &mut self.slabs {
            slab.reset();
        }

        #[cfg(debug_assertions)]
        self.integrity_check();

        trace!(slab_count = self.slabs.len(), "reset chunk allocator");
    }

    /// Returns all memory of the allocator to the system.
    ///
    /// Every chunk pointer previously handed out becomes dangling. Afterwards the allocator is
    /// in the destroyed state. Does nothing if the allocator has already been destroyed.
    ///
    /// Dropping the allocator destroys it, so calling this is only necessary to release the
    /// memory before the allocator itself goes away.
    ///
    /// # Panics
    ///
    /// Panics if chunks are still outstanding and the [drop policy][DropPolicy] is
    /// [`DropPolicy::MustNotDropChunks`]. The memory is released before panicking.
    pub fn destroy(&mut self) {
        if self.is_destroyed() {
            return;
        }

        let outstanding = self.len();
        let slab_count = self.slabs.len();

        self.slabs = Vec::new();

        trace!(slab_count, outstanding, "destroyed chunk allocator");

        // If we are already panicking, we do not want to panic again because that will
        // simply obscure whatever the original panic was, leading to debug difficulties.
        if !thread::panicking() && matches!(self.drop_policy, DropPolicy::MustNotDropChunks) {
            assert!(
                outstanding == 0,
                "destroyed a ChunkAllocator with {outstanding} outstanding chunks - this is forbidden by DropPolicy::MustNotDropChunks"
            );
        }
    }

    /// Verifies that no chunk is parked twice anywhere in the chain and that every parked
    /// address is the start of a chunk owned by one of the slabs.
    ///
    /// # Panics
    ///
    /// Panics if the bookkeeping of the chain is inconsistent, which can only happen if a
    /// caller broke the safety contract of [`release()`](Self::release).
    #[cfg(any(debug_assertions, test))]
    pub(crate) fn integrity_check(&self) {
        use std::collections::HashSet;

        let mut parked = HashSet::new();

        for slab in &self.slabs {
            assert!(
                slab.free_count() <= slab.capacity().get(),
                "slab {slab:?} has more free chunks than its capacity"
            );

            for ptr in slab.parked() {
                assert!(
                    parked.insert(ptr),
                    "chunk {ptr:?} is parked more than once in the chain"
                );

                assert!(
                    self.slabs.iter().any(|owner| owner.contains_chunk(ptr)),
                    "parked chunk {ptr:?} does not belong to any slab in the chain"
                );
            }
        }
    }
}

impl Drop for ChunkAllocator {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
#[allow(
    clippy::undocumented_unsafe_blocks,
    clippy::indexing_slicing,
    reason = "test code doesn't need the same safety rigor as production code"
)]
mod tests {
    use std::collections::HashSet;
    use std::fmt::Debug;
    use std::sync::Mutex;

    use static_assertions::{assert_impl_all, assert_not_impl_any};

    use super::*;

    assert_impl_all!(ChunkAllocator: Send, Debug);
    assert_not_impl_any!(ChunkAllocator: Sync);

    fn stats(allocator: &ChunkAllocator) -> Vec<(usize, usize)> {
        allocator
            .slabs()
            .map(|s| (s.capacity(), s.free_count()))
            .collect()
    }

    #[test]
    fn smoke_test() {
        let mut allocator = ChunkAllocator::new(nz!(3), nz!(8)).unwrap();

        let a = allocator.acquire().unwrap();
        let b = allocator.acquire().unwrap();
        let c = allocator.acquire().unwrap();

        unsafe {
            a.cast::<u64>().write(1);
            b.cast::<u64>().write(2);
            c.cast::<u64>().write(3);
        }

        assert_eq!(allocator.len(), 3);

        unsafe {
            allocator.release(b);
        }

        let d = allocator.acquire().unwrap();
        assert_eq!(d, b);

        unsafe {
            assert_eq!(a.cast::<u64>().read(), 1);
            assert_eq!(c.cast::<u64>().read(), 3);
        }

        allocator.integrity_check();
    }

    #[test]
    fn create_yields_single_full_slab() {
        for (capacity, chunk_size) in [(1, 1), (1, 100), (7, 3), (100, 24)] {
            let allocator = ChunkAllocator::new(
                NonZero::new(capacity).unwrap(),
                NonZero::new(chunk_size).unwrap(),
            )
            .unwrap();

            assert_eq!(allocator.slab_count(), 1);
            assert_eq!(stats(&allocator), vec![(capacity, capacity)]);
            assert_eq!(allocator.chunk_size(), chunk_size);
            assert!(allocator.is_empty());
            assert!(!allocator.is_destroyed());
        }
    }

    #[test]
    fn draining_first_slab_yields_every_chunk() {
        const CAPACITY: usize = 10;
        const CHUNK_SIZE: usize = 12;

        let mut allocator = ChunkAllocator::new(nz!(CAPACITY), nz!(CHUNK_SIZE)).unwrap();

        let chunks = (0..CAPACITY)
            .map(|_| allocator.acquire().unwrap().addr().get())
            .collect::<Vec<_>>();

        let base = *chunks.iter().min().unwrap();
        let mut offsets = chunks.iter().map(|addr| addr - base).collect::<Vec<_>>();
        offsets.sort_unstable();

        let expected = (0..CAPACITY).map(|i| i * CHUNK_SIZE).collect::<Vec<_>>();
        assert_eq!(offsets, expected);

        assert_eq!(base % DEFAULT_CHUNK_ALIGN, 0);
        assert_eq!(stats(&allocator), vec![(CAPACITY, 0)]);
    }

    #[test]
    fn exhausted_chain_doubles_tail() {
        let mut allocator = ChunkAllocator::new(nz!(4), nz!(8)).unwrap();

        for _ in 0..5 {
            allocator.acquire().unwrap();
        }
        assert_eq!(stats(&allocator), vec![(4, 0), (8, 7)]);

        for _ in 0..7 {
            allocator.acquire().unwrap();
        }
        assert_eq!(stats(&allocator), vec![(4, 0), (8, 0)]);

        allocator.acquire().unwrap();
        assert_eq!(stats(&allocator), vec![(4, 0), (8, 0), (16, 15)]);
    }

    #[test]
    fn growth_is_relative_to_tail_not_total() {
        let mut allocator = ChunkAllocator::new(nz!(1), nz!(8)).unwrap();

        // 1 + 2 + 4 + 1
        for _ in 0..8 {
            allocator.acquire().unwrap();
        }

        let capacities = allocator.slabs().map(|s| s.capacity()).collect::<Vec<_>>();
        assert_eq!(capacities, vec![1, 2, 4, 8]);
    }

    #[test]
    fn custom_growth_factor_is_applied() {
        let mut allocator = ChunkAllocator::builder()
            .chunk_size(nz!(8))
            .initial_capacity(nz!(2))
            .growth_factor(nz!(3))
            .build()
            .unwrap();

        for _ in 0..9 {
            allocator.acquire().unwrap();
        }

        assert_eq!(stats(&allocator), vec![(2, 0), (6, 0), (18, 17)]);
    }

    #[test]
    fn growth_factor_of_one_keeps_slab_size() {
        let mut allocator = ChunkAllocator::builder()
            .chunk_size(nz!(8))
            .initial_capacity(nz!(3))
            .growth_factor(nz!(1))
            .build()
            .unwrap();

        for _ in 0..7 {
            allocator.acquire().unwrap();
        }

        assert_eq!(stats(&allocator), vec![(3, 0), (3, 0), (3, 2)]);
    }

    #[test]
    fn acquire_prefers_head_of_chain() {
        let mut allocator = ChunkAllocator::new(nz!(2), nz!(8)).unwrap();

        let first = allocator.acquire().unwrap();
        for _ in 0..2 {
            allocator.acquire().unwrap();
        }
        assert_eq!(stats(&allocator), vec![(2, 0), (4, 3)]);

        unsafe {
            allocator.release(first);
        }
        assert_eq!(stats(&allocator), vec![(2, 1), (4, 3)]);

        // The head has a free chunk again, so it is used before the second slab.
        assert_eq!(allocator.acquire().unwrap(), first);
        assert_eq!(stats(&allocator), vec![(2, 0), (4, 3)]);
    }

    #[test]
    fn release_parks_in_first_slab_with_room() {
        let mut allocator = ChunkAllocator::new(nz!(1), nz!(8)).unwrap();

        let a = allocator.acquire().unwrap();
        let b = allocator.acquire().unwrap();
        let c = allocator.acquire().unwrap();
        assert_eq!(stats(&allocator), vec![(1, 0), (2, 0)]);

        // b was carved from the second slab but is parked in the head.
        unsafe {
            allocator.release(b);
        }
        assert_eq!(stats(&allocator), vec![(1, 1), (2, 0)]);

        unsafe {
            allocator.release(a);
            allocator.release(c);
        }
        assert_eq!(stats(&allocator), vec![(1, 1), (2, 2)]);

        allocator.integrity_check();

        let again = (0..3)
            .map(|_| allocator.acquire().unwrap())
            .collect::<HashSet<_>>();
        assert_eq!(again, HashSet::from([a, b, c]));
        assert_eq!(allocator.slab_count(), 2);
    }

    #[test]
    fn release_then_acquire_is_lifo() {
        let mut allocator = ChunkAllocator::new(nz!(8), nz!(16)).unwrap();

        let chunks = (0..5)
            .map(|_| allocator.acquire().unwrap())
            .collect::<Vec<_>>();

        for chunk in chunks {
            unsafe {
                allocator.release(chunk);
            }
            assert_eq!(allocator.acquire().unwrap(), chunk);
        }
    }

    #[test]
    #[should_panic]
    fn over_release_panics() {
        let mut allocator = ChunkAllocator::new(nz!(2), nz!(8)).unwrap();

        let chunk = allocator.acquire().unwrap();

        unsafe {
            allocator.release(chunk);
            allocator.release(chunk);
        }
    }

    #[test]
    fn reset_restores_every_slab() {
        let mut allocator = ChunkAllocator::new(nz!(3), nz!(8)).unwrap();

        let chunks = (0..7)
            .map(|_| allocator.acquire().unwrap())
            .collect::<Vec<_>>();
        assert_eq!(stats(&allocator), vec![(3, 0), (6, 2)]);

        // Shuffle some chunks into foreign slabs before resetting.
        unsafe {
            allocator.release(chunks[5]);
            allocator.release(chunks[0]);
        }

        allocator.reset();

        assert_eq!(stats(&allocator), vec![(3, 3), (6, 6)]);
        assert_eq!(allocator.slab_count(), 2);
        allocator.integrity_check();

        let again = (0..9)
            .map(|_| allocator.acquire().unwrap())
            .collect::<HashSet<_>>();
        assert_eq!(again.len(), 9);
        assert_eq!(allocator.slab_count(), 2);
    }

    #[test]
    fn reset_keeps_chunk_contents() {
        let mut allocator = ChunkAllocator::new(nz!(1), nz!(8)).unwrap();

        let chunk = allocator.acquire().unwrap().cast::<u64>();
        unsafe {
            chunk.write(0x1234_5678);
        }

        allocator.reset();

        let again = allocator.acquire().unwrap().cast::<u64>();
        assert_eq!(again, chunk);
        assert_eq!(unsafe { again.read() }, 0x1234_5678);
    }

    #[test]
    fn destroy_empties_allocator() {
        let mut allocator = ChunkAllocator::new(nz!(2), nz!(8)).unwrap();

        for _ in 0..5 {
            allocator.acquire().unwrap();
        }

        allocator.destroy();

        assert!(allocator.is_destroyed());
        assert_eq!(allocator.slab_count(), 0);
        assert_eq!(allocator.capacity(), 0);
        assert_eq!(allocator.len(), 0);
        assert!(allocator.acquire().is_none());
        assert!(matches!(allocator.try_acquire(), Err(Error::Destroyed)));
    }

    #[test]
    fn destroyed_allocator_ignores_operations() {
        let mut allocator = ChunkAllocator::new(nz!(2), nz!(8)).unwrap();
        let chunk = allocator.acquire().unwrap();

        allocator.destroy();

        unsafe {
            allocator.release(chunk);
        }
        allocator.reset();
        allocator.destroy();

        assert!(allocator.is_destroyed());
        assert!(allocator.acquire().is_none());
    }

    #[test]
    fn concrete_scenario_with_nodes() {
        #[allow(dead_code, reason = "only the size matters")]
        struct Node {
            value: u64,
            prev: *mut Node,
            next: *mut Node,
        }

        let mut allocator = ChunkAllocator::new(nz!(100), nz!(size_of::<Node>())).unwrap();

        for _ in 0..101 {
            allocator.acquire().unwrap();
        }

        assert_eq!(stats(&allocator), vec![(100, 0), (200, 199)]);

        allocator.destroy();
        assert!(allocator.acquire().is_none());
    }

    #[test]
    fn capacity_overflow_leaves_chain_unchanged() {
        let mut allocator = ChunkAllocator::builder()
            .chunk_size(nz!(1))
            .initial_capacity(nz!(1))
            .growth_factor(nz!(usize::MAX))
            .build()
            .unwrap();

        let _first = allocator.acquire().unwrap();

        // The second slab would need usize::MAX bytes, which no layout can describe.
        assert!(matches!(
            allocator.try_acquire(),
            Err(Error::CapacityOverflow { .. })
        ));
        assert_eq!(stats(&allocator), vec![(1, 0)]);

        assert!(allocator.acquire().is_none());
        assert_eq!(allocator.slab_count(), 1);
    }

    #[test]
    fn growth_overflow_reports_tail_and_factor() {
        let mut allocator = ChunkAllocator::builder()
            .chunk_size(nz!(1))
            .initial_capacity(nz!(2))
            .growth_factor(nz!(usize::MAX))
            .build()
            .unwrap();

        let _first = allocator.acquire().unwrap();
        let _second = allocator.acquire().unwrap();

        assert!(matches!(
            allocator.try_acquire(),
            Err(Error::GrowthOverflow {
                tail_capacity: 2,
                growth_factor: usize::MAX,
            })
        ));
        assert_eq!(stats(&allocator), vec![(2, 0)]);
    }

    #[test]
    #[cfg_attr(miri, ignore)] // Miri aborts on huge allocations instead of failing them.
    fn out_of_memory_on_growth_leaves_chain_unchanged() {
        // The first slab holds one page, the second one asks for almost the entire address space.
        let growth_factor = NonZero::new(isize::MAX as usize / 4096 - 1).unwrap();

        let mut allocator = ChunkAllocator::builder()
            .chunk_size(nz!(4096))
            .initial_capacity(nz!(1))
            .growth_factor(growth_factor)
            .build()
            .unwrap();

        let first = allocator.acquire().unwrap();

        assert!(matches!(
            allocator.try_acquire(),
            Err(Error::OutOfMemory { .. })
        ));
        assert_eq!(stats(&allocator), vec![(1, 0)]);
        assert!(allocator.acquire().is_none());

        // The chain still works after the failed growth.
        unsafe {
            allocator.release(first);
        }
        assert_eq!(allocator.acquire(), Some(first));
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic]
    fn chunk_parked_twice_fails_integrity_check() {
        let mut allocator = ChunkAllocator::new(nz!(3), nz!(8)).unwrap();
        let chunk = allocator.acquire().unwrap();
        let _other = allocator.acquire().unwrap();

        unsafe {
            allocator.release(chunk);
            allocator.release(chunk);
        }
    }

    #[test]
    fn oversized_first_slab_is_error() {
        let result = ChunkAllocator::new(nz!(usize::MAX / 2), nz!(4));

        assert!(matches!(result, Err(Error::CapacityOverflow { .. })));
    }

    #[test]
    fn layout_based_chunks_are_aligned() {
        #[allow(dead_code, reason = "only the layout matters")]
        #[repr(align(64))]
        struct CacheLine([u8; 40]);

        let mut allocator = ChunkAllocator::builder()
            .layout_of::<CacheLine>()
            .initial_capacity(nz!(4))
            .build()
            .unwrap();

        assert_eq!(allocator.chunk_size(), 64);
        assert_eq!(allocator.chunk_align(), 64);

        for _ in 0..12 {
            let chunk = allocator.acquire().unwrap();
            assert_eq!(chunk.addr().get() % 64, 0);

            unsafe {
                chunk.cast::<CacheLine>().write(CacheLine([7; 40]));
            }
        }
    }

    #[test]
    fn len_and_capacity_track_outstanding_chunks() {
        let mut allocator = ChunkAllocator::new(nz!(2), nz!(8)).unwrap();
        assert_eq!(allocator.len(), 0);
        assert_eq!(allocator.capacity(), 2);

        let chunks = (0..3)
            .map(|_| allocator.acquire().unwrap())
            .collect::<Vec<_>>();
        assert_eq!(allocator.len(), 3);
        assert_eq!(allocator.capacity(), 6);
        assert!(!allocator.is_empty());

        for chunk in chunks {
            unsafe {
                allocator.release(chunk);
            }
        }
        assert_eq!(allocator.len(), 0);
        assert_eq!(allocator.capacity(), 6);
        assert!(allocator.is_empty());
    }

    #[test]
    fn interleaved_use_keeps_invariants() {
        let mut allocator = ChunkAllocator::new(nz!(3), nz!(16)).unwrap();
        let mut held = Vec::new();

        for round in 0..50_usize {
            for _ in 0..(round % 7) {
                held.push(allocator.acquire().unwrap());
            }

            for _ in 0..(round % 5) {
                if let Some(chunk) = held.pop() {
                    unsafe {
                        allocator.release(chunk);
                    }
                }
            }

            assert_eq!(allocator.len(), held.len());
            assert_eq!(
                held.iter().copied().collect::<HashSet<_>>().len(),
                held.len()
            );
            allocator.integrity_check();
        }
    }

    #[test]
    #[should_panic]
    fn must_not_drop_chunks_panics_with_outstanding() {
        let mut allocator = ChunkAllocator::builder()
            .chunk_size(nz!(8))
            .drop_policy(DropPolicy::MustNotDropChunks)
            .build()
            .unwrap();

        let _chunk = allocator.acquire().unwrap();

        drop(allocator);
    }

    #[test]
    fn must_not_drop_chunks_allows_empty_destroy() {
        let mut allocator = ChunkAllocator::builder()
            .chunk_size(nz!(8))
            .drop_policy(DropPolicy::MustNotDropChunks)
            .build()
            .unwrap();

        let chunk = allocator.acquire().unwrap();
        unsafe {
            allocator.release(chunk);
        }

        allocator.destroy();
        assert!(allocator.is_destroyed());
    }

    #[test]
    fn must_not_drop_chunks_allows_destroy_after_reset() {
        let mut allocator = ChunkAllocator::builder()
            .chunk_size(nz!(8))
            .drop_policy(DropPolicy::MustNotDropChunks)
            .build()
            .unwrap();

        for _ in 0..10 {
            allocator.acquire().unwrap();
        }

        allocator.reset();
        drop(allocator);
    }

    #[test]
    fn default_initial_capacity_is_used() {
        let allocator = ChunkAllocator::builder()
            .layout_of::<u32>()
            .build()
            .unwrap();

        assert_eq!(allocator.capacity(), DEFAULT_INITIAL_CAPACITY.get());
        assert_eq!(allocator.growth_factor(), DEFAULT_GROWTH_FACTOR.get());
    }

    #[test]
    fn usable_behind_mutex() {
        let allocator = Mutex::new(ChunkAllocator::new(nz!(4), nz!(8)).unwrap());

        thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..10 {
                        let chunk = allocator.lock().unwrap().acquire().unwrap();
                        unsafe {
                            chunk.cast::<u64>().write(99);
                            allocator.lock().unwrap().release(chunk);
                        }
                    }
                });
            }
        });

        let allocator = allocator.into_inner().unwrap();
        assert!(allocator.is_empty());
        allocator.integrity_check();
    }

    #[test]
    fn moved_to_another_thread() {
        let mut allocator = ChunkAllocator::new(nz!(4), nz!(8)).unwrap();
        let _held = allocator.acquire().unwrap();

        let handle = thread::spawn(move || {
            allocator.acquire().unwrap();
            allocator.len()
        });

        assert_eq!(handle.join().unwrap(), 2);
    }
}
