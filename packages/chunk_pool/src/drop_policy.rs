/// Determines what happens when a [`ChunkAllocator`][crate::ChunkAllocator] is destroyed
/// while some of its chunks are still held by the caller.
///
/// By default, outstanding chunks are silently invalidated.
///
/// # Examples
///
/// ```
/// use chunk_pool::{ChunkAllocator, DropPolicy};
///
/// // The drop policy is set at allocator creation time.
/// let allocator = ChunkAllocator::builder()
///     .layout_of::<u64>()
///     .drop_policy(DropPolicy::MustNotDropChunks)
///     .build()
///     .unwrap();
/// ```
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub enum DropPolicy {
    /// The allocator releases its memory even if chunks are still outstanding. Any address
    /// previously handed out becomes dangling. This is the default.
    #[default]
    MayDropChunks,

    /// The allocator will panic if chunks are still outstanding when it is destroyed.
    ///
    /// This may be valuable when the chunks back objects whose lifetime is managed elsewhere
    /// and every object is expected to be released before the allocator goes away.
    MustNotDropChunks,
}
