//! Builds and tears down a doubly linked list whose nodes live in a `ChunkAllocator`.
#![allow(
    clippy::undocumented_unsafe_blocks,
    clippy::multiple_unsafe_ops_per_block,
    reason = "test code doesn't need the same safety rigor as production code"
)]

use std::ptr::{self, NonNull};

use chunk_pool::{ChunkAllocator, DropPolicy};
use new_zealand::nz;

struct Node {
    value: u64,
    prev: *mut Node,
    next: *mut Node,
}

/// A minimal doubly linked list that takes its nodes from a caller-supplied allocator.
struct List {
    head: *mut Node,
    tail: *mut Node,
    len: usize,
}

impl List {
    fn new() -> Self {
        Self {
            head: ptr::null_mut(),
            tail: ptr::null_mut(),
            len: 0,
        }
    }

    fn push_back(&mut self, allocator: &mut ChunkAllocator, value: u64) -> bool {
        let Some(chunk) = allocator.acquire() else {
            return false;
        };

        let node = chunk.cast::<Node>().as_ptr();

        unsafe {
            node.write(Node {
                value,
                prev: self.tail,
                next: ptr::null_mut(),
            });

            if self.tail.is_null() {
                self.head = node;
            } else {
                (*self.tail).next = node;
            }
        }

        self.tail = node;
        self.len += 1;
        true
    }

    fn pop_front(&mut self, allocator: &mut ChunkAllocator) -> Option<u64> {
        let node = NonNull::new(self.head)?;

        let Node { value, next, .. } = unsafe { node.read() };

        self.head = next;
        if next.is_null() {
            self.tail = ptr::null_mut();
        } else {
            unsafe {
                (*next).prev = ptr::null_mut();
            }
        }
        self.len -= 1;

        unsafe {
            allocator.release(node.cast());
        }

        Some(value)
    }

    fn values_forward(&self) -> Vec<u64> {
        let mut values = Vec::with_capacity(self.len);
        let mut current = self.head;

        while !current.is_null() {
            unsafe {
                values.push((*current).value);
                current = (*current).next;
            }
        }

        values
    }

    fn values_backward(&self) -> Vec<u64> {
        let mut values = Vec::with_capacity(self.len);
        let mut current = self.tail;

        while !current.is_null() {
            unsafe {
                values.push((*current).value);
                current = (*current).prev;
            }
        }

        values
    }
}

fn node_allocator(capacity: usize) -> ChunkAllocator {
    ChunkAllocator::builder()
        .layout_of::<Node>()
        .initial_capacity(capacity.try_into().unwrap())
        .build()
        .unwrap()
}

#[test]
fn build_list_past_first_slab() {
    let mut allocator = node_allocator(100);
    let mut list = List::new();

    for value in 0..101 {
        assert!(list.push_back(&mut allocator, value));
    }

    let slabs = allocator
        .slabs()
        .map(|s| (s.capacity(), s.free_count()))
        .collect::<Vec<_>>();
    assert_eq!(slabs, vec![(100, 0), (200, 199)]);

    assert_eq!(list.values_forward(), (0..101).collect::<Vec<_>>());
    assert_eq!(list.values_backward(), (0..101).rev().collect::<Vec<_>>());

    allocator.destroy();

    assert!(allocator.is_destroyed());
    assert!(allocator.acquire().is_none());
}

#[test]
fn drain_and_refill_reuses_memory() {
    let mut allocator = node_allocator(16);
    let mut list = List::new();

    for value in 0..50 {
        assert!(list.push_back(&mut allocator, value));
    }
    let capacity_after_fill = allocator.capacity();

    let mut drained = Vec::new();
    while let Some(value) = list.pop_front(&mut allocator) {
        drained.push(value);
    }
    assert_eq!(drained, (0..50).collect::<Vec<_>>());
    assert!(allocator.is_empty());

    for value in 100..150 {
        assert!(list.push_back(&mut allocator, value));
    }

    // Refilling to the same size never needs another slab.
    assert_eq!(allocator.capacity(), capacity_after_fill);
    assert_eq!(list.values_forward(), (100..150).collect::<Vec<_>>());
}

#[test]
fn reset_discards_whole_list() {
    let mut allocator = ChunkAllocator::builder()
        .layout_of::<Node>()
        .initial_capacity(nz!(10))
        .drop_policy(DropPolicy::MustNotDropChunks)
        .build()
        .unwrap();

    let mut list = List::new();
    for value in 0..25 {
        assert!(list.push_back(&mut allocator, value));
    }
    assert_eq!(allocator.len(), 25);

    // The nodes are plain data, so forgetting the list and resetting the allocator is enough.
    allocator.reset();
    let mut list = List::new();

    assert!(allocator.is_empty());
    assert_eq!(allocator.slab_count(), 2);

    for value in 0..30 {
        assert!(list.push_back(&mut allocator, value));
    }
    assert_eq!(allocator.slab_count(), 2);
    assert_eq!(list.values_backward(), (0..30).rev().collect::<Vec<_>>());

    while list.pop_front(&mut allocator).is_some() {}

    // Nothing is outstanding, so the strict drop policy is satisfied.
    drop(allocator);
}

#[test]
fn push_to_destroyed_allocator_fails_gracefully() {
    let mut allocator = node_allocator(4);
    allocator.destroy();

    let mut list = List::new();
    assert!(!list.push_back(&mut allocator, 1));
    assert!(list.values_forward().is_empty());
}
