use std::alloc::{Layout, alloc, dealloc};
use std::any::type_name;
use std::fmt;
use std::num::NonZero;
use std::ptr::NonNull;

use crate::{Error, Result, SlabStats};

/// One contiguous buffer of equally sized chunks plus a stack of the chunk addresses that
/// are currently available.
///
/// # Out of band access
///
/// The slab never reads or writes the chunk memory itself, so it is valid to access chunks via
/// pointers from unsafe code even when not holding an exclusive reference to the slab.
///
/// # Free stack
///
/// The free stack is pure bookkeeping: an address parked in it does not have to point into this
/// slab's own buffer. Any slab of the same chain may hold any chunk address of the chain because
/// all of them share the chunk size.
pub(crate) struct ChunkSlab {
    /// Number of chunks in the buffer and number of entries the free stack can hold.
    capacity: NonZero<usize>,

    /// Distance in bytes between the starts of two neighboring chunks.
    chunk_size: NonZero<usize>,

    /// Layout used to allocate `buffer`, required again when deallocating it.
    buffer_layout: Layout,

    /// Start of the buffer holding `capacity * chunk_size` bytes.
    buffer: NonNull<u8>,

    /// Always holds exactly `capacity` entries. Only `free_stack[..free_count]` are valid.
    free_stack: Vec<NonNull<u8>>,

    /// Number of valid entries at the bottom of `free_stack`.
    free_count: usize,
}

impl ChunkSlab {
    /// Creates a new slab with every chunk available.
    ///
    /// If the free stack was already reserved when reserving the buffer fails, the free
    /// stack is released again before the error is returned.
    pub(crate) fn new(
        capacity: NonZero<usize>,
        chunk_size: NonZero<usize>,
        chunk_align: usize,
    ) -> Result<Self> {
        let overflow = || Error::CapacityOverflow {
            capacity: capacity.get(),
            chunk_size: chunk_size.get(),
        };

        let buffer_size = chunk_size.checked_mul(capacity).ok_or_else(overflow)?;
        let buffer_layout =
            Layout::from_size_align(buffer_size.get(), chunk_align).map_err(|_e| overflow())?;

        let mut free_stack: Vec<NonNull<u8>> = Vec::new();
        free_stack
            .try_reserve_exact(capacity.get())
            .map_err(|_e| Error::OutOfMemory {
                bytes: capacity.get().saturating_mul(size_of::<NonNull<u8>>()),
            })?;

        // SAFETY: The layout has a non-zero size because both factors are non-zero.
        let buffer = NonNull::new(unsafe { alloc(buffer_layout) }).ok_or(Error::OutOfMemory {
            bytes: buffer_size.get(),
        })?;

        let mut slab = Self {
            capacity,
            chunk_size,
            buffer_layout,
            buffer,
            free_stack,
            free_count: 0,
        };

        slab.reset();

        Ok(slab)
    }

    #[must_use]
    pub(crate) fn capacity(&self) -> NonZero<usize> {
        self.capacity
    }

    #[must_use]
    #[cfg_attr(
        not(any(debug_assertions, test)),
        expect(dead_code, reason = "only used by debug integrity checks")
    )]
    pub(crate) fn free_count(&self) -> usize {
        self.free_count
    }

    /// Number of chunks of this slab's capacity that are accounted as handed out.
    #[must_use]
    pub(crate) fn used_count(&self) -> usize {
        // Cannot underflow, free_count never exceeds capacity.
        self.capacity.get().wrapping_sub(self.free_count)
    }

    /// Whether the free stack is empty, i.e. `pop()` is not allowed.
    #[must_use]
    pub(crate) fn is_exhausted(&self) -> bool {
        self.free_count == 0
    }

    /// Whether the free stack is full, i.e. `push()` is not allowed.
    #[must_use]
    pub(crate) fn is_fully_stocked(&self) -> bool {
        self.free_count == self.capacity.get()
    }

    #[must_use]
    pub(crate) fn stats(&self) -> SlabStats {
        SlabStats::new(self.capacity.get(), self.free_count)
    }

    /// Whether `ptr` points to the start of a chunk in this slab's buffer.
    #[must_use]
    #[cfg_attr(
        not(any(debug_assertions, test)),
        expect(dead_code, reason = "only used by debug integrity checks")
    )]
    pub(crate) fn contains_chunk(&self, ptr: NonNull<u8>) -> bool {
        let base = self.buffer.addr().get();
        let addr = ptr.addr().get();

        let Some(offset) = addr.checked_sub(base) else {
            return false;
        };

        offset < self.buffer_layout.size() && offset % self.chunk_size == 0
    }

    /// Takes the most recently parked address off the free stack.
    ///
    /// # Panics
    ///
    /// Panics if the slab is exhausted.
    #[must_use]
    pub(crate) fn pop(&mut self) -> NonNull<u8> {
        assert!(
            !self.is_exhausted(),
            "cannot pop a chunk from an exhausted slab of capacity {}",
            self.capacity
        );

        // Cannot underflow, we just checked that there is at least one free entry.
        self.free_count = self.free_count.wrapping_sub(1);

        *self
            .free_stack
            .get(self.free_count)
            .expect("free_stack always holds capacity entries and free_count < capacity")
    }

    /// Parks an address on top of the free stack.
    ///
    /// The address is not validated. Pushing an address that is already parked somewhere in
    /// the chain breaks the uniqueness of handed out chunks.
    ///
    /// # Panics
    ///
    /// Panics if the slab is fully stocked.
    pub(crate) fn push(&mut self, ptr: NonNull<u8>) {
        assert!(
            !self.is_fully_stocked(),
            "cannot push a chunk onto a fully stocked slab of capacity {}",
            self.capacity
        );

        *self
            .free_stack
            .get_mut(self.free_count)
            .expect("free_stack always holds capacity entries and free_count < capacity") = ptr;

        // Cannot overflow, we just checked that free_count < capacity.
        self.free_count = self.free_count.wrapping_add(1);
    }

    /// Marks every chunk of this slab as available, refilling the free stack with the slab's
    /// own chunk addresses. The buffer contents are left as they are.
    pub(crate) fn reset(&mut self) {
        self.free_stack.clear();

        for index in 0..self.capacity.get() {
            // Cannot overflow because that would imply the buffer is larger than virtual memory.
            let offset = index.wrapping_mul(self.chunk_size.get());

            // SAFETY: index < capacity, so the offset stays within the buffer we allocated.
            let chunk = unsafe { self.buffer.add(offset) };

            // Never reallocates, the stack was reserved for capacity entries in new().
            self.free_stack.push(chunk);
        }

        self.free_count = self.capacity.get();
    }

    /// Iterates over the addresses currently parked on the free stack, bottom to top.
    #[cfg_attr(
        not(any(debug_assertions, test)),
        expect(dead_code, reason = "only used by debug integrity checks")
    )]
    pub(crate) fn parked(&self) -> impl Iterator<Item = NonNull<u8>> + '_ {
        self.free_stack.iter().take(self.free_count).copied()
    }
}

impl fmt::Debug for ChunkSlab {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("capacity", &self.capacity)
            .field("chunk_size", &self.chunk_size)
            .field("free_count", &self.free_count)
            .field("buffer", &self.buffer)
            .finish_non_exhaustive()
    }
}

impl Drop for ChunkSlab {
    fn drop(&mut self) {
        // SAFETY: The buffer was allocated in new() with exactly this layout
        // and is deallocated only here.
        unsafe {
            dealloc(self.buffer.as_ptr(), self.buffer_layout);
        }
    }
}

// SAFETY: The slab exclusively owns its buffer and never dereferences the chunk pointers it
// stores, so moving it to another thread cannot create shared access to anything.
unsafe impl Send for ChunkSlab {}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
#[allow(
    clippy::undocumented_unsafe_blocks,
    clippy::indexing_slicing,
    reason = "test code doesn't need the same safety rigor as production code"
)]
mod tests {
    use std::collections::HashSet;

    use new_zealand::nz;
    use static_assertions::{assert_impl_all, assert_not_impl_any};

    use super::*;

    assert_impl_all!(ChunkSlab: Send, fmt::Debug);
    assert_not_impl_any!(ChunkSlab: Sync);

    #[test]
    fn new_slab_is_fully_stocked() {
        let slab = ChunkSlab::new(nz!(5), nz!(8), 8).unwrap();

        assert_eq!(slab.capacity().get(), 5);
        assert_eq!(slab.free_count(), 5);
        assert_eq!(slab.used_count(), 0);
        assert!(slab.is_fully_stocked());
        assert!(!slab.is_exhausted());
    }

    #[test]
    fn pop_hands_out_every_chunk_once() {
        let mut slab = ChunkSlab::new(nz!(4), nz!(12), 4).unwrap();
        let base = slab.buffer.addr().get();

        let mut offsets = (0..4)
            .map(|_| slab.pop().addr().get() - base)
            .collect::<Vec<_>>();
        offsets.sort_unstable();

        assert_eq!(offsets, vec![0, 12, 24, 36]);
        assert!(slab.is_exhausted());
        assert_eq!(slab.used_count(), 4);
    }

    #[test]
    fn pop_takes_from_top_of_stack() {
        let mut slab = ChunkSlab::new(nz!(3), nz!(16), 16).unwrap();
        let base = slab.buffer.addr().get();

        // The stack is filled bottom to top in buffer order, so the last chunk comes out first.
        assert_eq!(slab.pop().addr().get(), base + 32);
        assert_eq!(slab.pop().addr().get(), base + 16);
        assert_eq!(slab.pop().addr().get(), base);
    }

    #[test]
    fn push_then_pop_is_lifo() {
        let mut slab = ChunkSlab::new(nz!(3), nz!(8), 8).unwrap();

        let a = slab.pop();
        let b = slab.pop();

        slab.push(a);
        assert_eq!(slab.pop(), a);

        slab.push(b);
        slab.push(a);
        assert_eq!(slab.pop(), a);
        assert_eq!(slab.pop(), b);
    }

    #[test]
    #[should_panic]
    fn pop_from_exhausted_panics() {
        let mut slab = ChunkSlab::new(nz!(1), nz!(8), 8).unwrap();

        _ = slab.pop();
        _ = slab.pop();
    }

    #[test]
    #[should_panic]
    fn push_onto_fully_stocked_panics() {
        let mut slab = ChunkSlab::new(nz!(2), nz!(8), 8).unwrap();
        let ptr = slab.free_stack[0];

        slab.push(ptr);
    }

    #[test]
    fn reset_restores_own_addresses() {
        let mut slab = ChunkSlab::new(nz!(3), nz!(8), 8).unwrap();
        let original = slab.parked().collect::<Vec<_>>();

        let a = slab.pop();
        let _b = slab.pop();
        let _c = slab.pop();

        // Park the same address twice in different positions, as a misbehaving chain might.
        slab.push(a);
        slab.push(a);

        slab.reset();

        assert!(slab.is_fully_stocked());
        assert_eq!(slab.parked().collect::<Vec<_>>(), original);
    }

    #[test]
    fn reset_leaves_buffer_contents_alone() {
        let mut slab = ChunkSlab::new(nz!(2), nz!(8), 8).unwrap();

        let chunk = slab.pop().cast::<u64>();
        unsafe {
            chunk.write(0xdead_beef);
        }

        slab.reset();

        assert_eq!(unsafe { chunk.read() }, 0xdead_beef);
    }

    #[test]
    fn chunks_are_aligned() {
        let mut slab = ChunkSlab::new(nz!(10), nz!(64), 64).unwrap();

        for _ in 0..10 {
            assert_eq!(slab.pop().addr().get() % 64, 0);
        }
    }

    #[test]
    fn contains_chunk_recognizes_own_chunks_only() {
        let slab_a = ChunkSlab::new(nz!(4), nz!(8), 8).unwrap();
        let slab_b = ChunkSlab::new(nz!(4), nz!(8), 8).unwrap();

        for ptr in slab_a.parked() {
            assert!(slab_a.contains_chunk(ptr));
            assert!(!slab_b.contains_chunk(ptr));
        }

        // Inside the buffer but not at a chunk boundary.
        let misaligned = unsafe { slab_a.buffer.add(3) };
        assert!(!slab_a.contains_chunk(misaligned));

        // One past the end.
        let past_end = unsafe { slab_a.buffer.add(32) };
        assert!(!slab_a.contains_chunk(past_end));
    }

    #[test]
    fn chunks_do_not_overlap() {
        let mut slab = ChunkSlab::new(nz!(100), nz!(24), 8).unwrap();

        let mut seen = HashSet::new();
        while !slab.is_exhausted() {
            let ptr = slab.pop();
            unsafe {
                ptr.cast::<[u8; 24]>().write([0xAB; 24]);
            }
            assert!(seen.insert(ptr));
        }

        assert_eq!(seen.len(), 100);
    }

    #[test]
    fn capacity_overflow_is_error() {
        let result = ChunkSlab::new(nz!(usize::MAX), nz!(2), 1);

        assert!(matches!(
            result,
            Err(Error::CapacityOverflow {
                capacity: usize::MAX,
                chunk_size: 2
            })
        ));
    }

    #[test]
    fn unsatisfiable_buffer_is_error() {
        // Fits in usize but exceeds isize::MAX, which no layout can describe.
        let result = ChunkSlab::new(nz!(2), nz!(usize::MAX / 4 + 1), 1);

        assert!(matches!(result, Err(Error::CapacityOverflow { .. })));
    }

    #[test]
    #[cfg_attr(miri, ignore)] // Miri aborts on huge allocations instead of failing them.
    fn unavailable_buffer_is_out_of_memory() {
        // A valid layout, but far larger than any system can provide.
        let chunk_size = NonZero::new(isize::MAX as usize - 4096).unwrap();

        let result = ChunkSlab::new(nz!(1), chunk_size, 1);

        assert!(matches!(
            result,
            Err(Error::OutOfMemory { bytes }) if bytes == chunk_size.get()
        ));
    }

    #[test]
    fn stats_reflect_state() {
        let mut slab = ChunkSlab::new(nz!(6), nz!(8), 8).unwrap();
        _ = slab.pop();
        _ = slab.pop();

        let stats = slab.stats();
        assert_eq!(stats.capacity(), 6);
        assert_eq!(stats.free_count(), 4);
    }

    #[test]
    fn debug_output_names_type() {
        let slab = ChunkSlab::new(nz!(2), nz!(8), 8).unwrap();

        let output = format!("{slab:?}");
        assert!(output.contains("ChunkSlab"));
        assert!(output.contains("free_count"));
    }
}
