use thiserror::Error;

/// Errors that can occur when reserving memory for a [`ChunkAllocator`][crate::ChunkAllocator].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The system allocator could not provide the memory needed for a new slab.
    ///
    /// The allocator is left unchanged when this is returned from growth, so the caller
    /// may retry later or fail the higher-level operation.
    #[error("out of memory: failed to reserve {bytes} bytes for a slab")]
    OutOfMemory {
        /// Number of bytes requested from the system allocator.
        bytes: usize,
    },

    /// The memory needed for a slab of the requested capacity cannot be expressed
    /// as a valid memory layout.
    #[error("a slab of {capacity} chunks of {chunk_size} bytes exceeds the addressable memory")]
    CapacityOverflow {
        /// Number of chunks the slab was supposed to hold.
        capacity: usize,

        /// Size of each chunk in bytes.
        chunk_size: usize,
    },

    /// The capacity of the next slab in the chain does not fit in `usize`.
    #[error("growing a slab of {tail_capacity} chunks by a factor of {growth_factor} overflows")]
    GrowthOverflow {
        /// Capacity of the slab at the tail of the chain.
        tail_capacity: usize,

        /// Factor the tail capacity was multiplied by.
        growth_factor: usize,
    },

    /// The allocator has been destroyed and can no longer hand out chunks.
    #[error("the chunk allocator has been destroyed")]
    Destroyed,
}

/// A specialized `Result` type for chunk allocator operations, returning the crate's
/// [`Error`] type as the error value.
pub(crate) type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::fmt::Debug;

    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(Error: Send, Sync, Debug);

    #[test]
    fn out_of_memory_mentions_size() {
        let error = Error::OutOfMemory { bytes: 4096 };

        assert!(error.to_string().contains("4096"));
    }

    #[test]
    fn capacity_overflow_mentions_dimensions() {
        let error = Error::CapacityOverflow {
            capacity: usize::MAX,
            chunk_size: 16,
        };

        let message = error.to_string();
        assert!(message.contains(&usize::MAX.to_string()));
        assert!(message.contains("16 bytes"));
    }

    #[test]
    fn growth_overflow_mentions_tail_and_factor() {
        let error = Error::GrowthOverflow {
            tail_capacity: 3,
            growth_factor: 7,
        };

        let message = error.to_string();
        assert!(message.contains("3 chunks"));
        assert!(message.contains("factor of 7"));
    }

    #[test]
    fn destroyed_is_error() {
        let result: Result<()> = Err(Error::Destroyed);
        assert!(matches!(result, Err(Error::Destroyed)));
    }
}
