/// A snapshot of the bookkeeping of one slab in a [`ChunkAllocator`][crate::ChunkAllocator].
///
/// Obtained from [`ChunkAllocator::slabs()`][crate::ChunkAllocator::slabs], in chain order.
///
/// # Examples
///
/// ```
/// use chunk_pool::ChunkAllocator;
/// use new_zealand::nz;
///
/// let mut allocator = ChunkAllocator::new(nz!(4), nz!(32)).unwrap();
/// let _chunk = allocator.acquire().unwrap();
///
/// let head = allocator.slabs().next().unwrap();
/// assert_eq!(head.capacity(), 4);
/// assert_eq!(head.free_count(), 3);
/// ```
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SlabStats {
    capacity: usize,
    free_count: usize,
}

impl SlabStats {
    #[must_use]
    pub(crate) fn new(capacity: usize, free_count: usize) -> Self {
        debug_assert!(free_count <= capacity);

        Self {
            capacity,
            free_count,
        }
    }

    /// Number of chunks the slab was created for.
    #[must_use]
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of available chunk addresses parked in the slab's free stack.
    #[must_use]
    #[inline]
    pub fn free_count(&self) -> usize {
        self.free_count
    }
}
