#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! A fixed-size chunk allocator backed by a chain of geometrically growing slabs.
//!
//! This crate provides [`ChunkAllocator`], which reserves memory for many objects of one uniform
//! size up front and hands out individual chunks of that memory without a trip to the system
//! allocator for every object. It targets programs that create and destroy large numbers of
//! same-sized records, such as list nodes, hash table buckets or tree nodes, reducing heap
//! fragmentation and per-object allocation overhead while keeping related objects close together.
//!
//! # Key Features
//!
//! - **One chunk size per allocator**: Given as a byte count or derived from a type's layout
//! - **Stack-based reuse**: A released chunk is the next one handed out
//! - **Chained growth**: When all slabs are exhausted, a new slab with double the capacity of the
//!   last one is appended, so the chain stays short
//! - **Bulk reset**: [`reset()`](ChunkAllocator::reset) makes every chunk available again without
//!   returning memory to the system
//! - **Explicit destruction**: [`destroy()`](ChunkAllocator::destroy) returns all memory at once
//!   and leaves the allocator in an inert state
//! - **Fallible reservation**: Running out of memory is reported as an [`Error`], never a panic
//!
//! The allocator does not detect double releases or foreign pointers and provides no internal
//! synchronization.
//!
//! # Examples
//!
//! ```rust
//! use std::ptr::NonNull;
//!
//! use chunk_pool::ChunkAllocator;
//!
//! struct Node {
//!     value: u32,
//!     next: Option<NonNull<Node>>,
//! }
//!
//! let mut allocator = ChunkAllocator::builder()
//!     .layout_of::<Node>()
//!     .build()
//!     .unwrap();
//!
//! let mut head: Option<NonNull<Node>> = None;
//!
//! for value in 0..1000 {
//!     let node = allocator.acquire().unwrap().cast::<Node>();
//!
//!     // SAFETY: The chunk is sized and aligned for a Node and exclusively ours.
//!     unsafe { node.write(Node { value, next: head }) };
//!     head = Some(node);
//! }
//!
//! assert_eq!(allocator.len(), 1000);
//!
//! // Walk the list back, returning every node to the allocator.
//! let mut sum = 0;
//! while let Some(node) = head {
//!     // SAFETY: Every node in the list was initialized above and is still outstanding.
//!     let Node { value, next } = unsafe { node.read() };
//!     sum += value;
//!     head = next;
//!
//!     // SAFETY: The node came from this allocator and is not accessed again.
//!     unsafe { allocator.release(node.cast()) };
//! }
//!
//! assert_eq!(sum, (0..1000).sum::<u32>());
//! assert!(allocator.is_empty());
//! ```

mod allocator;
mod builder;
mod drop_policy;
mod error;
mod slab;
mod slab_stats;

pub(crate) use allocator::{DEFAULT_CHUNK_ALIGN, DEFAULT_GROWTH_FACTOR, DEFAULT_INITIAL_CAPACITY};
pub use allocator::ChunkAllocator;
pub use builder::*;
pub use drop_policy::*;
pub use error::Error;
pub(crate) use error::Result;
pub(crate) use slab::*;
pub use slab_stats::*;
