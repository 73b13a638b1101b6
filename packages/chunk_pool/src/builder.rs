use std::alloc::Layout;
use std::cell::Cell;
use std::marker::PhantomData;
use std::num::NonZero;

use crate::{
    ChunkAllocator, DEFAULT_CHUNK_ALIGN, DEFAULT_GROWTH_FACTOR, DEFAULT_INITIAL_CAPACITY,
    DropPolicy, Result,
};

/// Builder for creating an instance of [`ChunkAllocator`].
///
/// The chunk size is mandatory and is specified either as a raw byte count via
/// [`chunk_size()`](Self::chunk_size) or derived from a memory layout via
/// [`chunk_layout()`](Self::chunk_layout) or [`layout_of::<T>()`](Self::layout_of).
/// All other settings are optional.
///
/// # Examples
///
/// Using a type-based layout:
///
/// ```
/// use chunk_pool::ChunkAllocator;
/// use new_zealand::nz;
///
/// let allocator = ChunkAllocator::builder()
///     .layout_of::<[u64; 4]>()
///     .initial_capacity(nz!(64))
///     .build()
///     .unwrap();
///
/// assert_eq!(allocator.chunk_size(), 32);
/// assert_eq!(allocator.capacity(), 64);
/// ```
///
/// Using a raw chunk size with a custom growth factor:
///
/// ```
/// use chunk_pool::ChunkAllocator;
/// use new_zealand::nz;
///
/// let allocator = ChunkAllocator::builder()
///     .chunk_size(nz!(48))
///     .initial_capacity(nz!(10))
///     .growth_factor(nz!(3))
///     .build()
///     .unwrap();
///
/// assert_eq!(allocator.growth_factor(), 3);
/// ```
///
/// # Thread safety
///
/// The builder is thread-mobile ([`Send`]) but not thread-safe ([`Sync`]).
#[derive(Debug)]
#[must_use]
pub struct ChunkAllocatorBuilder {
    chunk_size: Option<NonZero<usize>>,
    chunk_align: usize,
    initial_capacity: NonZero<usize>,
    growth_factor: NonZero<usize>,
    drop_policy: DropPolicy,

    _not_sync: PhantomData<Cell<()>>,
}

impl ChunkAllocatorBuilder {
    #[inline]
    pub(crate) fn new() -> Self {
        Self {
            chunk_size: None,
            chunk_align: DEFAULT_CHUNK_ALIGN,
            initial_capacity: DEFAULT_INITIAL_CAPACITY,
            growth_factor: DEFAULT_GROWTH_FACTOR,
            drop_policy: DropPolicy::default(),
            _not_sync: PhantomData,
        }
    }

    /// Sets the chunk size in bytes.
    ///
    /// The buffers of the allocator are aligned to 16 bytes. Chunk `i` of a slab starts
    /// exactly `i * size` bytes after the start of its buffer, so every chunk is only as
    /// aligned as `size` allows. Use [`chunk_layout()`](Self::chunk_layout) when the chunks
    /// must satisfy a specific alignment.
    #[inline]
    pub fn chunk_size(mut self, size: NonZero<usize>) -> Self {
        self.chunk_size = Some(size);
        self.chunk_align = DEFAULT_CHUNK_ALIGN;
        self
    }

    /// Sets the chunk size and alignment from a memory layout.
    ///
    /// The size is padded up to a multiple of the alignment so every chunk is aligned.
    ///
    /// # Panics
    ///
    /// Panics if the layout has zero size.
    #[inline]
    pub fn chunk_layout(mut self, layout: Layout) -> Self {
        let padded = layout.pad_to_align();

        self.chunk_size = Some(
            NonZero::new(padded.size()).expect("ChunkAllocator must have non-zero chunk size"),
        );
        self.chunk_align = padded.align();
        self
    }

    /// Sets the chunk size and alignment to fit values of type `T`.
    ///
    /// # Panics
    ///
    /// Panics if `T` is zero-sized.
    #[inline]
    pub fn layout_of<T>(self) -> Self {
        self.chunk_layout(Layout::new::<T>())
    }

    /// Sets the number of chunks in the first slab of the chain.
    #[inline]
    pub fn initial_capacity(mut self, capacity: NonZero<usize>) -> Self {
        self.initial_capacity = capacity;
        self
    }

    /// Sets the factor by which each appended slab is larger than the slab before it.
    ///
    /// The default of 2 doubles the capacity of the chain's last slab whenever the chain
    /// is exhausted. A factor of 1 keeps every slab at the initial capacity.
    #[inline]
    pub fn growth_factor(mut self, factor: NonZero<usize>) -> Self {
        self.growth_factor = factor;
        self
    }

    /// Sets the [drop policy][DropPolicy] for the allocator. This governs how to treat
    /// outstanding chunks when the allocator is destroyed.
    #[inline]
    pub fn drop_policy(mut self, policy: DropPolicy) -> Self {
        self.drop_policy = policy;
        self
    }

    /// Builds the allocator, reserving the memory for its first slab.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfMemory`][crate::Error::OutOfMemory] if the first slab cannot be
    /// reserved and [`Error::CapacityOverflow`][crate::Error::CapacityOverflow] if its size
    /// exceeds the addressable memory. No memory remains reserved in either case.
    ///
    /// # Panics
    ///
    /// Panics if no chunk size has been set.
    pub fn build(self) -> Result<ChunkAllocator> {
        let chunk_size = self.chunk_size.expect(
            "chunk size must be set using .chunk_size(), .chunk_layout() or .layout_of::<T>() before calling .build()",
        );

        ChunkAllocator::new_inner(
            self.initial_capacity,
            chunk_size,
            self.chunk_align,
            self.growth_factor,
            self.drop_policy,
        )
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use new_zealand::nz;
    use static_assertions::{assert_impl_all, assert_not_impl_any};

    use super::*;

    assert_impl_all!(ChunkAllocatorBuilder: Send, std::fmt::Debug);
    assert_not_impl_any!(ChunkAllocatorBuilder: Sync);

    #[test]
    fn builder_new_creates_default_state() {
        let builder = ChunkAllocatorBuilder::new();

        assert!(builder.chunk_size.is_none());
        assert_eq!(builder.chunk_align, DEFAULT_CHUNK_ALIGN);
        assert_eq!(builder.initial_capacity, DEFAULT_INITIAL_CAPACITY);
        assert_eq!(builder.growth_factor, DEFAULT_GROWTH_FACTOR);
        assert_eq!(builder.drop_policy, DropPolicy::default());
    }

    #[test]
    fn chunk_size_uses_default_alignment() {
        let builder = ChunkAllocatorBuilder::new().chunk_size(nz!(5));

        assert_eq!(builder.chunk_size, Some(nz!(5)));
        assert_eq!(builder.chunk_align, DEFAULT_CHUNK_ALIGN);
    }

    #[test]
    fn chunk_layout_pads_to_alignment() {
        let layout = Layout::from_size_align(20, 8).unwrap();
        let builder = ChunkAllocatorBuilder::new().chunk_layout(layout);

        assert_eq!(builder.chunk_size, Some(nz!(24)));
        assert_eq!(builder.chunk_align, 8);
    }

    #[test]
    fn layout_of_matches_type() {
        let builder = ChunkAllocatorBuilder::new().layout_of::<u128>();

        assert_eq!(builder.chunk_size, Some(nz!(size_of::<u128>())));
        assert_eq!(builder.chunk_align, align_of::<u128>());
    }

    #[test]
    fn chunk_size_after_layout_resets_alignment() {
        let builder = ChunkAllocatorBuilder::new()
            .layout_of::<u8>()
            .chunk_size(nz!(64));

        assert_eq!(builder.chunk_size, Some(nz!(64)));
        assert_eq!(builder.chunk_align, DEFAULT_CHUNK_ALIGN);
    }

    #[test]
    #[should_panic]
    fn zero_sized_layout_panics() {
        let _builder = ChunkAllocatorBuilder::new().layout_of::<()>();
    }

    #[test]
    #[should_panic]
    fn build_without_chunk_size_panics() {
        let _allocator = ChunkAllocatorBuilder::new().build();
    }

    #[test]
    fn settings_are_applied() {
        let allocator = ChunkAllocatorBuilder::new()
            .chunk_size(nz!(40))
            .initial_capacity(nz!(7))
            .growth_factor(nz!(4))
            .drop_policy(DropPolicy::MustNotDropChunks)
            .build()
            .unwrap();

        assert_eq!(allocator.chunk_size(), 40);
        assert_eq!(allocator.capacity(), 7);
        assert_eq!(allocator.growth_factor(), 4);
        assert_eq!(allocator.drop_policy(), DropPolicy::MustNotDropChunks);
    }

    #[test]
    fn settings_can_be_overridden() {
        let builder = ChunkAllocatorBuilder::new()
            .initial_capacity(nz!(3))
            .initial_capacity(nz!(9))
            .growth_factor(nz!(5))
            .growth_factor(nz!(2))
            .drop_policy(DropPolicy::MustNotDropChunks)
            .drop_policy(DropPolicy::MayDropChunks);

        assert_eq!(builder.initial_capacity, nz!(9));
        assert_eq!(builder.growth_factor, nz!(2));
        assert_eq!(builder.drop_policy, DropPolicy::MayDropChunks);
    }

    #[test]
    fn builder_is_thread_mobile() {
        let builder = ChunkAllocatorBuilder::new().layout_of::<u64>();

        let handle = std::thread::spawn(move || builder.build().unwrap().chunk_size());
        assert_eq!(handle.join().unwrap(), 8);
    }
}
